use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

/// Advisory lock errors for the position store file.
#[derive(Debug)]
pub enum LockError {
    Timeout { path: PathBuf, waited: Duration },
    IoError(io::Error),
}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl LockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::IoError(_) => ErrorCode::SincedbWriteFailed,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { path, waited } => {
                write!(
                    f,
                    "{}: lock timed out after {:?} at {}",
                    self.code().code(),
                    waited,
                    path.display()
                )
            }
            Self::IoError(err) => write!(f, "{}: {}", self.code().code(), err),
        }
    }
}

impl std::error::Error for LockError {}

/// RAII guard holding an exclusive advisory lock next to a store file.
///
/// The lock lives in a sibling `<store>.lock` file so that atomic
/// rename-replacement of the store itself never drops it.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Lock path used for a given store file.
    #[must_use]
    pub fn lock_path_for(store_path: &Path) -> PathBuf {
        let mut name = store_path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Acquire the exclusive lock, polling until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if another holder keeps the lock past
    /// `timeout`, or [`LockError::IoError`] if the lock file cannot be opened.
    pub fn acquire(store_path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let path = Self::lock_path_for(store_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;

            if file.try_lock_exclusive().is_ok() {
                return Ok(Self { file, path });
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path,
                    waited: start.elapsed(),
                });
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Explicitly release the lock. Release also happens automatically on drop.
    pub fn release(self) {
        let _ = self.file.unlock();
    }

    /// Return the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::{LockError, StoreLock};
    use crate::error::ErrorCode;
    use std::{path::PathBuf, time::Duration};
    use tempfile::TempDir;

    #[test]
    fn lock_path_is_a_sibling() {
        let path = StoreLock::lock_path_for(&PathBuf::from("/var/lib/tail/.sincedb"));
        assert_eq!(path, PathBuf::from("/var/lib/tail/.sincedb.lock"));
    }

    #[test]
    fn store_lock_allows_acquire_and_release() -> Result<(), LockError> {
        let dir = TempDir::new()?;
        let store = dir.path().join("sincedb");
        let lock = StoreLock::acquire(&store, Duration::from_millis(50))?;
        assert_eq!(lock.path(), StoreLock::lock_path_for(&store).as_path());
        lock.release();
        Ok(())
    }

    #[test]
    fn store_lock_times_out_when_held() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("sincedb");
        let _guard = StoreLock::acquire(&store, Duration::from_millis(50)).unwrap();
        let err = StoreLock::acquire(&store, Duration::from_millis(20)).unwrap_err();

        assert!(matches!(err, LockError::Timeout { .. }));
        assert_eq!(err.code(), ErrorCode::LockContention);
        assert!(err.hint().is_some());
    }

    #[test]
    fn release_allows_follow_up_lock() -> Result<(), LockError> {
        let dir = TempDir::new()?;
        let store = dir.path().join("sincedb");
        {
            let _first = StoreLock::acquire(&store, Duration::from_millis(50))?;
        }

        let _second = StoreLock::acquire(&store, Duration::from_millis(50))?;
        Ok(())
    }
}
