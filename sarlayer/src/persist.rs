//! Crash-safe file replacement.
//!
//! Documents that other processes read concurrently (the scene registry, the
//! batch summary, chip sidecars) are never written in place. The new content
//! goes to a temporary file in the same directory, is flushed to stable
//! storage, and is then renamed over the target. The rename is the only
//! externally visible transition, so a reader sees either the old document
//! or the new one, never a partial write.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::Serialize;

/// Distinguishes temp files written concurrently by threads of one process.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Atomically replace `path` with `contents`.
///
/// The parent directory is created if missing. On failure the temporary
/// file is removed and the previous content of `path` is left untouched.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let temp_path = temp_path_for(path, &parent);
    let result = write_then_rename(&temp_path, path, contents);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    // Persist the directory entry of the rename as well.
    if let Ok(dir) = File::open(&parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and atomically write it to `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    write_atomic(path, &bytes)
}

/// Copy `path` to `<path>.<label>.<unix_secs>` and return the backup path.
///
/// If a backup with the same name already exists (two backups within one
/// second), a numeric suffix is appended rather than overwriting it.
pub fn backup_file(path: &Path, label: &str) -> io::Result<PathBuf> {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let base = format!("{}.{}.{}", path.display(), label, secs);
    let mut backup = PathBuf::from(&base);
    let mut n = 1;
    while backup.exists() {
        backup = PathBuf::from(format!("{}.{}", base, n));
        n += 1;
    }

    fs::copy(path, &backup)?;
    Ok(backup)
}

/// Like [`backup_file`], but skips the copy when an earlier
/// `<path>.<label>.*` backup already holds exactly `contents`.
///
/// Returns the new backup, or `None` if an identical one exists.
pub fn backup_file_once(
    path: &Path,
    label: &str,
    contents: &[u8],
) -> io::Result<Option<PathBuf>> {
    if find_backup_with(path, label, contents)?.is_some() {
        return Ok(None);
    }
    backup_file(path, label).map(Some)
}

fn find_backup_with(path: &Path, label: &str, contents: &[u8]) -> io::Result<Option<PathBuf>> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(None);
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    let prefix = format!("{}.{}.", name.to_string_lossy(), label);

    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let candidate = entry.path();
        let same_size = entry
            .metadata()
            .map(|m| m.is_file() && m.len() == contents.len() as u64)
            .unwrap_or(false);
        if same_size && fs::read(&candidate).map(|b| b == contents).unwrap_or(false) {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn temp_path_for(path: &Path, parent: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    parent.join(format!(".{}.{}.{}.tmp", name, std::process::id(), counter))
}

fn write_then_rename(temp_path: &Path, target: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)?;
    file.write_all(contents)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);

    fs::rename(temp_path, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_parent_and_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/dir/doc.json");

        write_atomic(&path, b"{}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_failed_rename_keeps_previous_content() {
        let temp = TempDir::new().unwrap();
        // A directory at the target path makes the rename fail.
        let path = temp.path().join("occupied");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        assert!(write_atomic(&path, b"new").is_err());
        assert!(path.join("keep").exists());
        let leftovers = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_write_json_atomic() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("value.json");

        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();

        let back: Vec<i32> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn test_backup_file_never_overwrites() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.json");
        fs::write(&path, b"v1").unwrap();

        let first = backup_file(&path, "bak").unwrap();
        let second = backup_file(&path, "bak").unwrap();

        assert_ne!(first, second);
        assert_eq!(fs::read_to_string(&first).unwrap(), "v1");
        assert_eq!(fs::read_to_string(&second).unwrap(), "v1");
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("registry.json.bak."));
    }

    #[test]
    fn test_backup_once_skips_identical_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.json");
        fs::write(&path, b"{broken").unwrap();

        let first = backup_file_once(&path, "bak", b"{broken").unwrap();
        let repeat = backup_file_once(&path, "bak", b"{broken").unwrap();
        fs::write(&path, b"{broken differently").unwrap();
        let changed = backup_file_once(&path, "bak", b"{broken differently").unwrap();

        assert!(first.is_some());
        assert_eq!(repeat, None);
        assert!(changed.is_some());
        assert_ne!(first, changed);
    }
}
