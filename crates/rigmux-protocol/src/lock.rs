use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {timeout_ms}ms waiting for lock {path}")]
    Timeout { path: PathBuf, timeout_ms: u64 },
    #[error("lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive advisory lock on `<data file>.lock`, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn lock_path_for(data: &Path) -> PathBuf {
        let mut name = data
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        data.with_file_name(name)
    }

    /// Acquire the lock guarding `data`, retrying every 100ms until `timeout`.
    pub fn acquire(data: &Path, timeout: Duration) -> Result<Self, LockError> {
        let path = Self::lock_path_for(data);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        let contended = fs2::lock_contended_error().raw_os_error();
        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(lock = %path.display(), "lock acquired");
                    return Ok(Self { file, path });
                }
                Err(err) if err.raw_os_error() != contended => return Err(io_err(err)),
                Err(_) if start.elapsed() >= timeout => {
                    return Err(LockError::Timeout {
                        path,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Err(_) => std::thread::sleep(RETRY_INTERVAL.min(timeout)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(lock = %self.path.display(), error = %err, "unlock failed");
        }
    }
}

/// Run `f` while holding the lock for `data`. The lock is released on every path.
pub fn with_lock<T, E>(data: &Path, timeout: Duration, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
where
    E: From<LockError>,
{
    let _guard = FileLock::acquire(data, timeout)?;
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_sits_beside_data() {
        let p = FileLock::lock_path_for(Path::new("/tmp/x/sessions-index.json"));
        assert_eq!(p, PathBuf::from("/tmp/x/sessions-index.json.lock"));
    }

    #[test]
    fn second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("index.json");
        let first = FileLock::acquire(&data, DEFAULT_LOCK_TIMEOUT).unwrap();
        let err = FileLock::acquire(&data, Duration::from_millis(150)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        drop(first);
        FileLock::acquire(&data, Duration::from_millis(150)).unwrap();
    }

    #[test]
    fn with_lock_releases_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("index.json");
        let res: anyhow::Result<()> = with_lock(&data, DEFAULT_LOCK_TIMEOUT, || {
            anyhow::bail!("boom")
        });
        assert!(res.is_err());
        FileLock::acquire(&data, Duration::from_millis(150)).unwrap();
    }
}
