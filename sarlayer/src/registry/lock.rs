//! Writer exclusion for the registry document.
//!
//! Two layers are needed. Threads of one process share a mutex keyed by the
//! canonical registry path, so every store handle pointing at the same file
//! serializes through the same lock. Separate processes take an exclusive
//! advisory lock (`flock`) on a lock file next to the registry. The kernel
//! drops that lock when its holder exits or crashes, so a leftover lock file
//! never blocks anyone and is never deleted.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::error::{RegistryError, RegistryResult};

/// Interval between attempts to take the advisory lock.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

type PathLocks = Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>;

static PROCESS_LOCKS: OnceLock<PathLocks> = OnceLock::new();

/// The in-process writer mutex shared by all handles on `registry_path`.
pub(crate) fn process_lock(registry_path: &Path) -> Arc<Mutex<()>> {
    let key = canonical_key(registry_path);
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    locks
        .lock()
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Canonicalize the parent directory (the file itself may not exist yet).
fn canonical_key(path: &Path) -> PathBuf {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let file_name = path.file_name();
    match (parent.map(fs::canonicalize), file_name) {
        (Some(Ok(dir)), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

/// Held cross-process registry lock. Released on drop.
#[derive(Debug)]
pub(crate) struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Take an exclusive advisory lock on `path`, waiting up to `timeout`.
    ///
    /// The file is created if needed and records the holder's pid.
    pub(crate) fn acquire(path: &Path, timeout: Duration) -> RegistryResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| RegistryError::io(path, e))?;

        let started = Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => break,
                Err(TryLockError::WouldBlock) => {
                    if started.elapsed() >= timeout {
                        return Err(RegistryError::LockTimeout {
                            path: path.to_path_buf(),
                            waited_secs: started.elapsed().as_secs(),
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(TryLockError::Error(e)) => return Err(RegistryError::io(path, e)),
            }
        }

        let mut lock = Self {
            file,
            path: path.to_path_buf(),
        };
        lock.record_holder();
        debug!(lock = %path.display(), "Acquired registry lock");
        Ok(lock)
    }

    fn record_holder(&mut self) {
        let pid = std::process::id();
        let result = self
            .file
            .set_len(0)
            .and_then(|()| writeln!(self.file, "{}", pid));
        if let Err(e) = result {
            debug!(lock = %self.path.display(), error = %e, "Could not record lock holder");
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(lock = %self.path.display(), error = %e, "Failed to release registry lock");
        }
    }
}
