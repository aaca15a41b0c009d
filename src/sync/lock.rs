use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Exclusive lock on `sync.lock`, held for the duration of a run. The OS
/// releases it when the file handle is dropped or the process exits.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without waiting. A held lock is `AlreadyRunning`.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(Error::AlreadyRunning(path.display().to_string()));
            }
            Err(TryLockError::Error(e)) => return Err(Error::Io(e)),
        }

        // Holder's pid, for humans inspecting a stuck lock.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        log::debug!("Acquired run lock {}", path.display());

        Ok(Self { file, path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            log::warn!("Failed to release run lock {}: {e}", self.path.display());
        }
    }
}
