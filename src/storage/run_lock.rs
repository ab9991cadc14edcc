use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{info, warn};

use crate::errors::{PipelineError, Result};

/// Exclusive single-writer lock. The OS releases it when the holder exits,
/// including on a crash, so a stale lock file never blocks later runs.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(PipelineError::LockHeld(path));
            }
            return Err(e.into());
        }

        // Holder pid, for operators only.
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;

        info!("Acquired run lock {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // The file stays; removing it would race a waiter that already opened it.
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release run lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warehouse.lock");

        let lock = RunLock::acquire(&path).unwrap();
        assert!(matches!(RunLock::acquire(&path), Err(PipelineError::LockHeld(_))));
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );

        drop(lock);
        assert!(RunLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_leftover_lock_file_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warehouse.lock");
        // What a killed holder leaves behind: the file, but no OS lock.
        fs::write(&path, "4242\n").unwrap();

        let lock = RunLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
    }
}
