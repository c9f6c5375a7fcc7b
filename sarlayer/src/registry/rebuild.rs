//! Reconstructing the registry from products on disk.
//!
//! The clipped chip products in `final/` are the ground truth. Each one is
//! written together with a JSON sidecar that records what the registry
//! needs (scene id, chip bounds, scene footprint, phase), so a rebuild does
//! not have to read georeferencing out of the rasters themselves.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::{RegistryError, RegistryResult};
use super::model::{
    ChipUpdate, DisasterPhase, OutputMap, Registry, SceneUpdate, OUTPUT_CLIPPED,
};
use super::store::RegistryStore;
use crate::geo::BoundingBox;
use crate::layout::{find_polarization_outputs, request_id_from_clipped, OutputLayout};
use crate::persist;

/// Degrees added around a chip when the scene footprint is unknown.
const UNKNOWN_FOOTPRINT_MARGIN: f64 = 1.0;

/// Metadata written next to every clipped chip product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipSidecar {
    pub chip_id: String,
    pub scene_id: String,
    pub chip_bounds: BoundingBox,
    #[serde(default)]
    pub scene_footprint: Option<BoundingBox>,
    #[serde(default)]
    pub acquisition_date: Option<DateTime<Utc>>,
    pub disaster_phase: DisasterPhase,
    #[serde(default)]
    pub base_outputs: OutputMap,
    pub created_at: DateTime<Utc>,
}

impl ChipSidecar {
    /// Atomically write the sidecar as pretty JSON.
    pub fn write(&self, path: &Path) -> RegistryResult<()> {
        persist::write_json_atomic(path, self).map_err(|e| RegistryError::io(path, e))
    }

    /// Read a sidecar.
    pub fn read(path: &Path) -> RegistryResult<Self> {
        let bytes = fs::read(path).map_err(|e| RegistryError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| RegistryError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// One finalized chip as found by an [`EvidenceSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct Evidence {
    pub chip_id: String,
    pub chip_bounds: BoundingBox,
    pub clipped_path: PathBuf,
    pub scene_id: String,
    pub scene_footprint: BoundingBox,
    pub acquisition_date: Option<DateTime<Utc>>,
    pub phase: DisasterPhase,
    pub base_outputs: OutputMap,
    pub created_at: Option<DateTime<Utc>>,
}

/// Inventory of finalized products used to rebuild a registry.
///
/// Implementations must return evidence in a deterministic order so that
/// repeated rebuilds produce the same registry.
pub trait EvidenceSource {
    fn inventory(&self) -> RegistryResult<Vec<Evidence>>;
}

/// Evidence from an output root: `final/*_clipped.tif` plus sidecars, with
/// base outputs from the sidecar or from `rtc/<request>/`.
#[derive(Debug, Clone)]
pub struct FilesystemEvidence {
    layout: OutputLayout,
}

impl FilesystemEvidence {
    pub fn new(layout: OutputLayout) -> Self {
        Self { layout }
    }

    fn evidence_for(&self, clipped: &Path) -> Option<Evidence> {
        let request_id = request_id_from_clipped(clipped)?;
        let sidecar_path = OutputLayout::sidecar_path(clipped);
        let sidecar = match ChipSidecar::read(&sidecar_path) {
            Ok(sidecar) => sidecar,
            Err(e) => {
                warn!(chip = %clipped.display(), error = %e, "Skipping chip without usable sidecar");
                return None;
            }
        };

        let phase = match sidecar.disaster_phase {
            DisasterPhase::Unknown => {
                DisasterPhase::infer_from_name(&request_id).unwrap_or(DisasterPhase::Unknown)
            }
            known => known,
        };

        let mut base_outputs: OutputMap = sidecar
            .base_outputs
            .into_iter()
            .filter(|(_, path)| path.is_file())
            .collect();
        if base_outputs.is_empty() {
            base_outputs = find_polarization_outputs(&self.layout.rtc_dir(&request_id));
        }

        let scene_footprint = sidecar
            .scene_footprint
            .unwrap_or_else(|| sidecar.chip_bounds.expanded(UNKNOWN_FOOTPRINT_MARGIN));

        Some(Evidence {
            chip_id: sidecar.chip_id,
            chip_bounds: sidecar.chip_bounds,
            clipped_path: clipped.to_path_buf(),
            scene_id: sidecar.scene_id,
            scene_footprint,
            acquisition_date: sidecar.acquisition_date,
            phase,
            base_outputs,
            created_at: Some(sidecar.created_at),
        })
    }
}

impl EvidenceSource for FilesystemEvidence {
    fn inventory(&self) -> RegistryResult<Vec<Evidence>> {
        let clipped = sorted_glob(&self.layout.clipped_glob())?;
        debug!(count = clipped.len(), "Found finalized chip products");
        Ok(clipped
            .iter()
            .filter_map(|path| self.evidence_for(path))
            .collect())
    }
}

/// Expand a glob pattern into a sorted list of paths.
pub(crate) fn sorted_glob(pattern: &str) -> RegistryResult<Vec<PathBuf>> {
    let entries = glob::glob(pattern).map_err(|e| RegistryError::Evidence(e.to_string()))?;
    let mut paths: Vec<PathBuf> = entries.filter_map(Result::ok).collect();
    paths.sort();
    Ok(paths)
}

/// Build a registry from evidence, in evidence order.
pub fn registry_from_evidence(evidence: &[Evidence], precision: u32) -> Registry {
    let mut registry = Registry::new();
    for item in evidence {
        let update = SceneUpdate {
            scene_id: item.scene_id.clone(),
            footprint: item.scene_footprint,
            acquisition_date: item.acquisition_date,
            phase: item.phase,
            base_outputs: item.base_outputs.clone(),
            chip: ChipUpdate {
                chip_id: item.chip_id.clone(),
                bounds: item.chip_bounds,
                outputs: OutputMap::from([(OUTPUT_CLIPPED.to_string(), item.clipped_path.clone())]),
            },
        };
        registry.register(&update, item.created_at.unwrap_or_else(Utc::now), precision);
    }
    registry
}

impl RegistryStore {
    /// Replace the registry with one reconstructed from `source`.
    ///
    /// An existing document is first copied to `<path>.backup.<secs>`.
    /// Rebuilding twice from unchanged evidence yields the same scenes and
    /// chips.
    pub fn rebuild(&self, source: &dyn EvidenceSource) -> RegistryResult<Registry> {
        let evidence = source.inventory()?;
        let registry = registry_from_evidence(&evidence, self.config().bounds_precision());

        self.with_write_lock(|| {
            if self.path().exists() {
                let backup = persist::backup_file(self.path(), "backup")
                    .map_err(|e| RegistryError::io(self.path(), e))?;
                info!(backup = %backup.display(), "Backed up registry before rebuild");
            }
            self.persist(&registry)
        })?;

        info!(
            scenes = registry.len(),
            chips = registry.chip_count(),
            "Registry rebuilt from finalized outputs"
        );
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::registry::model::OUTPUT_VV;
    use tempfile::TempDir;

    fn bbox(w: f64, s: f64, e: f64, n: f64) -> BoundingBox {
        BoundingBox::new(w, s, e, n).unwrap()
    }

    fn finalize_chip(layout: &OutputLayout, chip_id: &str, sidecar: Option<ChipSidecar>) {
        let clipped = layout.clipped_path(chip_id);
        fs::create_dir_all(clipped.parent().unwrap()).unwrap();
        fs::write(&clipped, b"tif").unwrap();
        if let Some(sidecar) = sidecar {
            sidecar.write(&OutputLayout::sidecar_path(&clipped)).unwrap();
        }
    }

    fn sidecar(chip_id: &str, scene_id: &str) -> ChipSidecar {
        ChipSidecar {
            chip_id: chip_id.to_string(),
            scene_id: scene_id.to_string(),
            chip_bounds: bbox(10.5, 10.5, 11.0, 11.0),
            scene_footprint: Some(bbox(10.0, 10.0, 12.0, 12.0)),
            acquisition_date: None,
            disaster_phase: DisasterPhase::Pre,
            base_outputs: OutputMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_collect_skips_chips_without_sidecar() {
        let temp = TempDir::new().unwrap();
        let layout = OutputLayout::new(temp.path());
        finalize_chip(&layout, "b_chip", Some(sidecar("b_chip", "S1")));
        finalize_chip(&layout, "a_orphan", None);

        let evidence = FilesystemEvidence::new(layout).inventory().unwrap();

        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].chip_id, "b_chip");
    }

    #[test]
    fn test_collect_scans_rtc_dir_and_defaults_footprint() {
        let temp = TempDir::new().unwrap();
        let layout = OutputLayout::new(temp.path());
        let mut sc = sidecar("c1", "S1");
        sc.scene_footprint = None;
        finalize_chip(&layout, "c1", Some(sc));
        let rtc = layout.rtc_dir("c1");
        fs::create_dir_all(&rtc).unwrap();
        fs::write(rtc.join("S1_VV.tif"), b"vv").unwrap();
        fs::write(rtc.join("S1_VH.tif"), b"vh").unwrap();

        let evidence = FilesystemEvidence::new(layout).inventory().unwrap();

        assert_eq!(evidence[0].base_outputs.len(), 2);
        assert_eq!(evidence[0].base_outputs[OUTPUT_VV], rtc.join("S1_VV.tif"));
        assert_eq!(evidence[0].scene_footprint, bbox(9.5, 9.5, 12.0, 12.0));
    }

    #[test]
    fn test_registry_from_evidence_groups_by_scene() {
        let temp = TempDir::new().unwrap();
        let layout = OutputLayout::new(temp.path());
        finalize_chip(&layout, "c1", Some(sidecar("c1", "S1")));
        finalize_chip(&layout, "c2", Some(sidecar("c2", "S1")));
        finalize_chip(&layout, "c3", Some(sidecar("c3", "S2")));

        let evidence = FilesystemEvidence::new(layout).inventory().unwrap();
        let registry = registry_from_evidence(&evidence, 6);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("S1").unwrap().chips.len(), 2);
        assert_eq!(registry.chip_count(), 3);
    }

    #[test]
    fn test_rebuild_backs_up_existing_registry() {
        let temp = TempDir::new().unwrap();
        let layout = OutputLayout::new(temp.path());
        finalize_chip(&layout, "c1", Some(sidecar("c1", "S1")));
        let store = RegistryStore::for_layout(&layout, StoreConfig::default());
        fs::write(store.path(), b"{}").unwrap();

        let registry = store.rebuild(&FilesystemEvidence::new(layout)).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(store.load(), registry);
        let backups = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("scene_registry.json.backup.")
            })
            .count();
        assert_eq!(backups, 1);
    }
}
