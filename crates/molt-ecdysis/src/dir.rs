//! Directories that hold relay and control sockets.

use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use tracing::debug;

/// Mode applied to socket directories this crate creates.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

const STICKY: u32 = 0o1000;
const SHARED_WRITE: u32 = 0o022;

/// Make sure `path` is a directory fit to hold sockets.
///
/// A missing directory is created and restricted to its owner. An existing
/// one is never chmodded: it must be a real directory owned by this user or
/// root, and if group or others may write to it the sticky bit must be set
/// so nobody else can unlink or replace our sockets.
pub fn ensure_socket_dir(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => check_existing(path, &metadata),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(PRIVATE_DIR_MODE))?;
            debug!(path = %path.display(), "Created socket directory");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn check_existing(path: &Path, metadata: &std::fs::Metadata) -> io::Result<()> {
    if metadata.file_type().is_symlink() {
        return Err(refuse(path, "is a symlink"));
    }
    if !metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a directory", path.display()),
        ));
    }

    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if metadata.uid() != euid && metadata.uid() != 0 {
        return Err(refuse(path, &format!("is owned by uid {}", metadata.uid())));
    }

    let mode = metadata.mode();
    if mode & SHARED_WRITE != 0 && mode & STICKY == 0 {
        return Err(refuse(
            path,
            &format!("is writable by other users without the sticky bit (mode {:04o})", mode & 0o7777),
        ));
    }
    Ok(())
}

fn refuse(path: &Path, why: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("refusing socket directory {}: {why}", path.display()),
    )
}
