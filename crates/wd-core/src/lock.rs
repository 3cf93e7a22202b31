//! File-backed per-workspace lock.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::EngineError;

/// Single-writer guard for one workspace. Held for the whole command; a
/// concurrent acquire fails fast instead of queueing.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
}

impl WorkspaceLock {
    /// Acquire the lock for `key` under `locks_dir`, failing with `Busy`
    /// when another operation holds it.
    pub fn acquire(locks_dir: &Path, key: &str) -> crate::Result<Self> {
        std::fs::create_dir_all(locks_dir).map_err(|e| {
            EngineError::Validation(format!("cannot create lock directory: {}", e))
        })?;
        let path = locks_dir.join(format!("ws-{}.lock", key));

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(EngineError::Busy(key.to_string()))
            }
            Err(e) => Err(EngineError::Validation(format!(
                "cannot acquire lock {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release workspace lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_busy() {
        let dir = tempfile::tempdir().unwrap();
        let _held = WorkspaceLock::acquire(dir.path(), "7").unwrap();
        assert!(matches!(
            WorkspaceLock::acquire(dir.path(), "7"),
            Err(EngineError::Busy(_))
        ));
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _held = WorkspaceLock::acquire(dir.path(), "7").unwrap();
        }
        assert!(WorkspaceLock::acquire(dir.path(), "7").is_ok());
    }

    #[test]
    fn different_keys_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let _a = WorkspaceLock::acquire(dir.path(), "1").unwrap();
        let _b = WorkspaceLock::acquire(dir.path(), "2").unwrap();
    }
}
