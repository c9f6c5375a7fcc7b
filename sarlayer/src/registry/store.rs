//! Durable, concurrency-safe registry persistence.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::error::{RegistryError, RegistryResult};
use super::lock::{process_lock, LockFile};
use super::model::{Registry, RegisterEffect, SceneUpdate};
use crate::config::StoreConfig;
use crate::layout::OutputLayout;
use crate::persist;

/// Record that must be present after an update is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheck {
    /// Scene that must exist.
    pub scene_id: String,
    /// Chip that must exist under the scene, if any.
    pub chip_id: Option<String>,
}

impl UpdateCheck {
    /// Require only the scene.
    pub fn scene(scene_id: impl Into<String>) -> Self {
        Self {
            scene_id: scene_id.into(),
            chip_id: None,
        }
    }

    /// Require a chip under a scene.
    pub fn chip(scene_id: impl Into<String>, chip_id: impl Into<String>) -> Self {
        Self {
            scene_id: scene_id.into(),
            chip_id: Some(chip_id.into()),
        }
    }

    fn holds(&self, registry: &Registry) -> bool {
        match (registry.get(&self.scene_id), &self.chip_id) {
            (Some(scene), Some(chip_id)) => scene.chip(chip_id).is_some(),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Handle on one registry document.
///
/// Cheap to clone; all clones (and all other handles opened on the same
/// canonical path within this process) share one writer mutex.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    lock_path: PathBuf,
    config: StoreConfig,
    writer: Arc<Mutex<()>>,
}

impl RegistryStore {
    /// Open the registry at an explicit path.
    pub fn new(path: impl Into<PathBuf>, config: StoreConfig) -> Self {
        let path = path.into();
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        let writer = process_lock(&path);
        Self {
            path,
            lock_path,
            config,
            writer,
        }
    }

    /// Open the registry of an output root.
    pub fn for_layout(layout: &OutputLayout, config: StoreConfig) -> Self {
        Self::new(layout.registry_path(), config)
    }

    /// Path of the registry document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Read the current registry. Never fails.
    ///
    /// A missing document is initialized to an empty one. A document that
    /// cannot be parsed is copied to `<path>.bak.<secs>` and an empty
    /// registry is returned; the corrupt file stays in place until the next
    /// successful update replaces it.
    pub fn load(&self) -> Registry {
        match self.read_current() {
            Ok(Some(registry)) => registry,
            Ok(None) => {
                if let Err(e) = self.initialize_empty() {
                    warn!(path = %self.path.display(), error = %e, "Failed to initialize registry");
                }
                Registry::new()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Registry unreadable; using empty registry");
                Registry::new()
            }
        }
    }

    /// Atomically replace the document with `registry`.
    ///
    /// This bypasses the writer lock; callers that read-modify-write must use
    /// [`RegistryStore::atomic_update`] instead.
    pub fn persist(&self, registry: &Registry) -> RegistryResult<()> {
        let bytes = serde_json::to_vec_pretty(registry)?;
        persist::write_atomic(&self.path, &bytes).map_err(|e| RegistryError::io(&self.path, e))
    }

    /// Apply `mutator` to the latest registry and write the result.
    ///
    /// Each attempt runs under the writer mutex and the lock file: read the
    /// latest document, apply the mutator, write atomically, read back and
    /// check the record named by the returned [`UpdateCheck`]. Failed attempts
    /// are retried up to `max_retries` times with `retry_delay` between them.
    /// A non-retryable mutator error ends the update at once.
    ///
    /// Returns `true` if an attempt succeeded.
    pub fn atomic_update<F>(&self, mut mutator: F) -> bool
    where
        F: FnMut(&mut Registry) -> RegistryResult<Option<UpdateCheck>>,
    {
        let max_retries = self.config.max_retries().max(1);
        let _writer = self.writer.lock();

        for attempt in 1..=max_retries {
            match self.update_once(&mut mutator) {
                Ok(()) => {
                    debug!(attempt, path = %self.path.display(), "Registry update written");
                    return true;
                }
                Err(e) if !e.is_retryable() => {
                    warn!(error = %e, "Registry update rejected");
                    return false;
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_retries,
                        error = %e,
                        "Registry update attempt failed"
                    );
                    if attempt < max_retries {
                        thread::sleep(self.config.retry_delay());
                    }
                }
            }
        }

        warn!(
            path = %self.path.display(),
            attempts = max_retries,
            "Registry update failed after all attempts"
        );
        false
    }

    /// Register a chip against a scene, creating the scene if needed.
    ///
    /// Every path the update would add to the document must be a non-empty
    /// file at write time; otherwise nothing is written and `false` is
    /// returned. Registering a chip id that already exists is a successful
    /// no-op.
    pub fn register(&self, update: &SceneUpdate) -> bool {
        let precision = self.config.bounds_precision();
        let mut effect = None;

        let written = self.atomic_update(|registry| {
            ensure_outputs_present(registry, update)?;
            effect = Some(registry.register(update, Utc::now(), precision));
            Ok(Some(UpdateCheck::chip(
                update.scene_id.clone(),
                update.chip.chip_id.clone(),
            )))
        });

        if written {
            match effect {
                Some(RegisterEffect::SceneCreated) => info!(
                    scene_id = %update.scene_id,
                    chip_id = %update.chip.chip_id,
                    "Registered new scene"
                ),
                Some(RegisterEffect::ChipAdded) => info!(
                    scene_id = %update.scene_id,
                    chip_id = %update.chip.chip_id,
                    "Registered chip on existing scene"
                ),
                _ => debug!(
                    scene_id = %update.scene_id,
                    chip_id = %update.chip.chip_id,
                    "Chip already registered"
                ),
            }
        }
        written
    }

    /// Run `f` inside the writer critical section.
    pub(crate) fn with_write_lock<T>(
        &self,
        f: impl FnOnce() -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let _writer = self.writer.lock();
        let _file = self.acquire_lock_file()?;
        f()
    }

    /// Read and parse the document; corrupt content is backed up (once per
    /// distinct content) and treated as empty. `Ok(None)` means the file does not exist.
    pub(crate) fn read_current(&self) -> RegistryResult<Option<Registry>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RegistryError::io(&self.path, e)),
        };

        match serde_json::from_slice::<Registry>(&bytes) {
            Ok(registry) => Ok(Some(registry)),
            Err(parse_error) => {
                match persist::backup_file_once(&self.path, "bak", &bytes) {
                    Ok(Some(backup)) => warn!(
                        path = %self.path.display(),
                        backup = %backup.display(),
                        error = %parse_error,
                        "Corrupt registry backed up; starting empty"
                    ),
                    Ok(None) => debug!(
                        path = %self.path.display(),
                        "Corrupt registry already backed up; treating as empty"
                    ),
                    Err(e) => warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Corrupt registry could not be backed up"
                    ),
                }
                Ok(Some(Registry::new()))
            }
        }
    }

    fn update_once<F>(&self, mutator: &mut F) -> RegistryResult<()>
    where
        F: FnMut(&mut Registry) -> RegistryResult<Option<UpdateCheck>>,
    {
        let _file = self.acquire_lock_file()?;

        let mut registry = self.read_current()?.unwrap_or_default();
        let check = mutator(&mut registry)?;
        self.persist(&registry)?;

        if let Some(check) = check {
            let written = self.read_strict()?;
            if !check.holds(&written) {
                return Err(RegistryError::VerificationFailed {
                    scene_id: check.scene_id,
                });
            }
        }
        Ok(())
    }

    /// Read without any recovery: parse errors are reported as corruption.
    fn read_strict(&self) -> RegistryResult<Registry> {
        let bytes = fs::read(&self.path).map_err(|e| RegistryError::io(&self.path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| RegistryError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn initialize_empty(&self) -> RegistryResult<()> {
        self.with_write_lock(|| {
            if self.path.exists() {
                return Ok(());
            }
            info!(path = %self.path.display(), "Initializing empty registry");
            self.persist(&Registry::new())
        })
    }

    fn acquire_lock_file(&self) -> RegistryResult<LockFile> {
        LockFile::acquire(&self.lock_path, self.config.lock_timeout())
    }
}

/// Fail with [`RegistryError::MissingOutput`] if a path the update would add
/// is not a non-empty regular file.
fn ensure_outputs_present(registry: &Registry, update: &SceneUpdate) -> RegistryResult<()> {
    let new_paths: Vec<&PathBuf> = match registry.get(&update.scene_id) {
        None => update.new_paths().collect(),
        Some(scene) if scene.chip(&update.chip.chip_id).is_none() => {
            update.chip.outputs.values().collect()
        }
        Some(_) => Vec::new(),
    };

    for path in new_paths {
        let present = fs::metadata(path)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if !present {
            return Err(RegistryError::MissingOutput { path: path.clone() });
        }
    }
    Ok(())
}
