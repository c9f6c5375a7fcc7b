//! Finalized-output audit.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;

use tracing::{info, warn};

use super::error::RegistryResult;
use super::model::OUTPUT_CLIPPED;
use super::rebuild::sorted_glob;
use super::store::RegistryStore;
use crate::layout::OutputLayout;

/// Maximum number of unregistered file names listed in the warning.
const MAX_LISTED: usize = 10;

/// Result of comparing `final/` against the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Number of clipped products found in `final/`.
    pub finalized: usize,
    /// Products that are not the clipped output of any registered chip.
    pub unregistered: Vec<PathBuf>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.unregistered.is_empty()
    }
}

impl RegistryStore {
    /// Layout of the output root containing this registry.
    pub fn layout(&self) -> OutputLayout {
        OutputLayout::new(
            self.path()
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default(),
        )
    }

    /// Report finalized products that the registry does not know about.
    ///
    /// Products are matched by file name against every chip's clipped
    /// output. The registry is not modified.
    pub fn validate_registry(&self) -> RegistryResult<AuditReport> {
        let registry = self.load();
        let registered: HashSet<OsString> = registry
            .scenes()
            .flat_map(|scene| scene.chips.iter())
            .filter_map(|chip| chip.outputs.get(OUTPUT_CLIPPED))
            .filter_map(|path| path.file_name().map(|n| n.to_os_string()))
            .collect();

        let finalized = sorted_glob(&self.layout().clipped_glob())?;
        let unregistered: Vec<PathBuf> = finalized
            .iter()
            .filter(|path| {
                path.file_name()
                    .map(|name| !registered.contains(name))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let report = AuditReport {
            finalized: finalized.len(),
            unregistered,
        };

        if report.is_clean() {
            info!(finalized = report.finalized, "All finalized outputs are registered");
        } else {
            let listed: Vec<String> = report
                .unregistered
                .iter()
                .take(MAX_LISTED)
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();
            warn!(
                count = report.unregistered.len(),
                finalized = report.finalized,
                files = %listed.join(", "),
                "Finalized outputs missing from registry"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::geo::BoundingBox;
    use crate::registry::model::{ChipUpdate, DisasterPhase, OutputMap, SceneUpdate};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_reports_unregistered_products() {
        let temp = TempDir::new().unwrap();
        let layout = OutputLayout::new(temp.path());
        layout.create_dirs().unwrap();
        let registered = layout.clipped_path("c1");
        let stray = layout.clipped_path("c2");
        fs::write(&registered, b"tif").unwrap();
        fs::write(&stray, b"tif").unwrap();
        let vv = temp.path().join("vv.tif");
        fs::write(&vv, b"vv").unwrap();

        let store = RegistryStore::for_layout(&layout, StoreConfig::default());
        assert!(store.register(&SceneUpdate {
            scene_id: "S1".to_string(),
            footprint: BoundingBox::new(10.0, 10.0, 12.0, 12.0).unwrap(),
            acquisition_date: None,
            phase: DisasterPhase::Unknown,
            base_outputs: OutputMap::from([("vv".to_string(), vv)]),
            chip: ChipUpdate {
                chip_id: "c1".to_string(),
                bounds: BoundingBox::new(10.5, 10.5, 11.0, 11.0).unwrap(),
                outputs: OutputMap::from([(OUTPUT_CLIPPED.to_string(), registered)]),
            },
        }));

        let report = store.validate_registry().unwrap();

        assert_eq!(report.finalized, 2);
        assert_eq!(report.unregistered, vec![stray]);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_empty_output_root_is_clean() {
        let temp = TempDir::new().unwrap();
        let store =
            RegistryStore::for_layout(&OutputLayout::new(temp.path()), StoreConfig::default());
        let report = store.validate_registry().unwrap();
        assert_eq!(report, AuditReport::default());
    }
}
