//! Exclusive, non-blocking advisory lock scoped to the backup volume.
//!
//! Overlapping runs would double-count projected usage, so a second run must
//! fail immediately instead of waiting. The lock is released when the
//! [`VolumeLock`] is dropped (or the process dies).

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::core::errors::{GuardError, Result};

/// Held guard lock. Drop to release.
#[derive(Debug)]
pub struct VolumeLock {
    path: PathBuf,
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl VolumeLock {
    /// Try to take the lock without blocking.
    ///
    /// Returns [`GuardError::LockHeld`] when another run owns it.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
        }

        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        opts.mode(0o600);
        let file = opts.open(path).map_err(|e| GuardError::io(path, e))?;

        Self::lock_file(path, file)
    }

    #[cfg(unix)]
    fn lock_file(path: &Path, file: File) -> Result<Self> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(mut flock) => {
                record_owner(&mut flock);
                Ok(Self {
                    path: path.to_path_buf(),
                    _flock: flock,
                })
            }
            Err((_file, Errno::EWOULDBLOCK)) => Err(GuardError::LockHeld {
                path: path.to_path_buf(),
            }),
            Err((_file, errno)) => Err(GuardError::io(path, std::io::Error::from(errno))),
        }
    }

    #[cfg(not(unix))]
    fn lock_file(path: &Path, file: File) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Best-effort pid stamp so an operator can see who holds the lock.
#[cfg(unix)]
fn record_owner(file: &mut File) {
    use std::io::{Seek, SeekFrom, Write};
    let _ = file.set_len(0);
    let _ = file.seek(SeekFrom::Start(0));
    let _ = writeln!(file, "{}", std::process::id());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_lock_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("guard.lock");
        let lock = VolumeLock::try_acquire(&path).unwrap();
        assert!(path.exists());
        assert_eq!(lock.path(), path.as_path());
    }

    #[cfg(unix)]
    #[test]
    fn second_acquire_fails_fast_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.lock");
        let _held = VolumeLock::try_acquire(&path).unwrap();

        let started = std::time::Instant::now();
        let err = VolumeLock::try_acquire(&path).unwrap_err();
        assert!(matches!(err, GuardError::LockHeld { .. }), "{err}");
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.lock");
        drop(VolumeLock::try_acquire(&path).unwrap());
        assert!(VolumeLock::try_acquire(&path).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn lock_file_records_owner_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.lock");
        let _held = VolumeLock::try_acquire(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
