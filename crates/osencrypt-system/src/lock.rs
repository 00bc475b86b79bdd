//! Presence lock for the daemon lock file. The file holds the owner's PID and
//! is removed when the guard drops. The deferred cleanup job scheduled during
//! mount reclaim may remove it first, which the guard tolerates.

use log::{info, warn};
use osencrypt_core::error::{OsEncryptError, OsEncryptResult};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct DaemonLock {
    path: PathBuf,
    pid: u32,
}

impl DaemonLock {
    pub fn acquire(path: impl Into<PathBuf>) -> OsEncryptResult<Self> {
        Self::acquire_as(path, std::process::id())
    }

    /// Take the lock on behalf of `pid`.
    pub fn acquire_as(path: impl Into<PathBuf>, pid: u32) -> OsEncryptResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(OsEncryptError::LockHeld {
                    path,
                    holder: holder.trim().to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        writeln!(file, "{pid}")?;
        info!("acquired {} for pid {pid}", path.display());
        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim() == self.pid.to_string() => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!("failed to remove {}: {err}", self.path.display());
                }
            }
            Ok(_) => warn!("{} was taken over; leaving it", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to read {}: {err}", self.path.display()),
        }
    }
}
