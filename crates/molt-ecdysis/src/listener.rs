//! The service listener: bound fresh on cold start, adopted on relay.
//!
//! Adoption never calls `bind()`. The inherited descriptor must already be a
//! listening socket; anything else fails hard instead of falling back.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tokio::net::{TcpListener, TcpSocket};
use tracing::info;

use crate::error::HandshakeError;

/// Accept backlog used when no explicit value is configured.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// How a [`ListenerHandle`] came to exist in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOrigin {
    /// Bound by this process.
    Bound,
    /// Inherited from the parent process.
    Inherited,
}

/// A bound, listening TCP socket that can be shared across generations.
#[derive(Debug)]
pub struct ListenerHandle {
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    backlog: Option<u32>,
    origin: ListenerOrigin,
}

impl ListenerHandle {
    /// Bind a fresh listener with address reuse and a bounded backlog.
    ///
    /// Must run inside a Tokio runtime.
    pub async fn bind(addr: SocketAddr, backlog: u32) -> io::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;

        let listener = socket.listen(backlog)?.into_std()?;
        let local_addr = listener.local_addr()?;
        info!(requested = %addr, addr = %local_addr, backlog, "Bound new listener");

        Ok(Self {
            listener,
            local_addr,
            backlog: Some(backlog),
            origin: ListenerOrigin::Bound,
        })
    }

    /// Adopt an inherited descriptor that is already bound and listening.
    pub fn adopt(fd: OwnedFd) -> Result<Self, HandshakeError> {
        let raw = fd.as_raw_fd();
        if !validate_fd(raw) {
            return Err(HandshakeError::InvalidDescriptor { fd: raw });
        }
        if !is_listening(raw) {
            return Err(HandshakeError::NotListening { fd: raw });
        }

        let listener = std::net::TcpListener::from(fd);
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(fd = raw, addr = %local_addr, "Adopted inherited listener");

        Ok(Self {
            listener,
            local_addr,
            backlog: None,
            origin: ListenerOrigin::Inherited,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Backlog requested at bind time. Unknown for inherited listeners.
    pub fn backlog(&self) -> Option<u32> {
        self.backlog
    }

    pub fn origin(&self) -> ListenerOrigin {
        self.origin
    }

    /// Convert into a Tokio listener ready to accept.
    ///
    /// Must run inside a Tokio runtime.
    pub fn into_tokio(self) -> io::Result<TcpListener> {
        self.listener.set_nonblocking(true)?;
        TcpListener::from_std(self.listener)
    }
}

impl AsFd for ListenerHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

/// Take ownership of an inherited descriptor after checking it is a socket.
///
/// The caller guarantees this happens at most once per descriptor.
pub(crate) fn claim_fd(fd: RawFd) -> Result<OwnedFd, HandshakeError> {
    if !validate_fd(fd) {
        return Err(HandshakeError::InvalidDescriptor { fd });
    }
    // SAFETY: fstat confirmed the descriptor is open and a socket, and the
    // caller hands out each inherited descriptor exactly once.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Validate that a file descriptor is a valid socket using fstat.
pub(crate) fn validate_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// Whether the socket has had `listen()` called on it.
fn is_listening(fd: RawFd) -> bool {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    result == 0 && value != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dup_owned(fd: BorrowedFd<'_>) -> OwnedFd {
        fd.try_clone_to_owned().unwrap()
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let handle = ListenerHandle::bind("127.0.0.1:0".parse().unwrap(), 16)
            .await
            .unwrap();
        assert_eq!(handle.origin(), ListenerOrigin::Bound);
        assert_eq!(handle.backlog(), Some(16));
        assert_ne!(handle.local_addr().port(), 0);

        let addr = handle.local_addr();
        let listener = handle.into_tokio().unwrap();
        let (client, accepted) =
            tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
        assert!(client.is_ok());
        assert!(accepted.is_ok());
    }

    /// fd inheritance round-trip: bind → dup → adopt → connect.
    #[tokio::test]
    async fn test_fd_inheritance_round_trip() {
        let original = ListenerHandle::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_BACKLOG)
            .await
            .unwrap();
        let addr = original.local_addr();

        let adopted = ListenerHandle::adopt(dup_owned(original.as_fd())).unwrap();
        assert_eq!(adopted.origin(), ListenerOrigin::Inherited);
        assert_eq!(adopted.local_addr(), addr);
        assert!(adopted.backlog().is_none());

        let listener = adopted.into_tokio().unwrap();
        let (client, accepted) =
            tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
        assert!(client.is_ok());
        assert!(accepted.is_ok());

        drop(original);
    }

    /// Both copies accept on the same kernel queue.
    #[tokio::test]
    async fn test_shared_listener_accepts_on_both_copies() {
        let original = ListenerHandle::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_BACKLOG)
            .await
            .unwrap();
        let addr = original.local_addr();
        let copy = ListenerHandle::adopt(dup_owned(original.as_fd())).unwrap();

        let first = original.into_tokio().unwrap();
        let second = copy.into_tokio().unwrap();

        let _c1 = tokio::net::TcpStream::connect(addr).await.unwrap();
        let _c2 = tokio::net::TcpStream::connect(addr).await.unwrap();

        assert!(first.accept().await.is_ok());
        assert!(second.accept().await.is_ok());
    }

    /// Invalid fd is detected.
    #[test]
    fn test_invalid_fd_detection() {
        assert!(!validate_fd(9999));
        assert!(!validate_fd(-1));
    }

    #[test]
    fn test_claim_rejects_closed_descriptor() {
        let err = claim_fd(9999).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidDescriptor { fd: 9999 }));
    }

    #[test]
    fn test_adopt_rejects_non_listening_socket() {
        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(raw >= 0);
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let err = ListenerHandle::adopt(fd).unwrap_err();
        assert!(matches!(err, HandshakeError::NotListening { .. }));
    }

    #[test]
    fn test_adopt_rejects_non_socket() {
        let file = tempfile::tempfile().unwrap();
        let err = ListenerHandle::adopt(OwnedFd::from(file)).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidDescriptor { .. }));
    }
}
