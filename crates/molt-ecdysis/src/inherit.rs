//! Descriptor hand-over into a child process.
//!
//! Each descriptor is first duplicated to a high slot with `CLOEXEC` set, so
//! installing several targets (3, 4, ...) can never clobber a source. Between
//! fork and exec the child `dup2`s every staged copy onto its target; `dup2`
//! clears `CLOEXEC` on the target, and the high copies vanish at exec.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tokio::process::Command;
use tracing::debug;

/// Lowest descriptor used for staging copies.
const STAGING_FLOOR: RawFd = 100;

/// Descriptors staged for installation at fixed indices in a child.
#[derive(Debug, Default)]
pub struct HandleTransfer {
    staged: Vec<(RawFd, OwnedFd)>,
}

impl HandleTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `source` to appear as `target` in the child.
    pub fn stage(&mut self, source: BorrowedFd<'_>, target: RawFd) -> io::Result<()> {
        if self.staged.iter().any(|(t, _)| *t == target) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("fd {target} is already staged"),
            ));
        }

        // F_DUPFD_CLOEXEC gives us a new fd >= the hint, with CLOEXEC set.
        let staged = unsafe { libc::fcntl(source.as_raw_fd(), libc::F_DUPFD_CLOEXEC, STAGING_FLOOR) };
        if staged < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(source = source.as_raw_fd(), staged, target, "Staged descriptor for child");

        // SAFETY: fcntl just returned a fresh descriptor we exclusively own.
        self.staged.push((target, unsafe { OwnedFd::from_raw_fd(staged) }));
        Ok(())
    }

    /// Target indices, in staging order.
    pub fn targets(&self) -> Vec<RawFd> {
        self.staged.iter().map(|(target, _)| *target).collect()
    }

    /// Arrange for the staged descriptors to be installed when `cmd` spawns.
    ///
    /// `self` must outlive the spawn call; the staged copies are closed when
    /// it is dropped.
    pub fn install(&self, cmd: &mut Command) {
        let pairs: Vec<(RawFd, RawFd)> = self
            .staged
            .iter()
            .map(|(target, fd)| (fd.as_raw_fd(), *target))
            .collect();

        // SAFETY: the closure only calls dup2, which is async-signal-safe,
        // and does not allocate.
        unsafe {
            cmd.pre_exec(move || {
                for &(source, target) in &pairs {
                    if libc::dup2(source, target) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }
}
