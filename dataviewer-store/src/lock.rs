use crate::error::{Error, Result};
use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive lock on one table name, held until dropped.
///
/// The lock is an OS advisory lock on `<name>.lock`, so it also excludes
/// other processes sharing the store directory. The kernel releases it when
/// the holder exits, so a file left behind by a killed process does not
/// block the next indexer. The file itself is never removed.
#[derive(Debug)]
pub struct TableLock {
    path: PathBuf,
    file: File,
}

impl TableLock {
    pub(crate) fn acquire(path: &Path, name: &str, timeout: Duration) -> Result<Self> {
        let started = Instant::now();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        loop {
            match file.try_lock() {
                Ok(()) => break,
                Err(TryLockError::WouldBlock) => {
                    if started.elapsed() >= timeout {
                        warn!(table = %name, lock = %path.display(), "gave up waiting for table lock");
                        return Err(Error::LockTimeout(name.to_string()));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(TryLockError::Error(e)) => return Err(Error::Io(e)),
            }
        }

        // Owner pid is informational only
        if file.set_len(0).is_ok() {
            let _ = writeln!(&file, "{}", std::process::id());
        }
        debug!(table = %name, "acquired table lock");

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(lock = %self.path.display(), error = %e, "failed to release table lock");
        }
    }
}
