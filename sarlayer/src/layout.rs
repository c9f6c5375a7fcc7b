//! On-disk layout of an output root.
//!
//! ```text
//! <output_dir>/
//! ├── scene_registry.json      registry document
//! ├── scene_registry.json.lock advisory writer lock
//! ├── processing_log.json      running batch summary
//! ├── final/                   clipped chip products + sidecars
//! ├── rtc/<request>/           correction outputs per request
//! ├── raw/<request>/           acquired source scenes
//! ├── dem/<request>/           ancillary elevation data
//! └── logs/                    log files
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::registry::{OutputMap, OUTPUT_VH, OUTPUT_VV};

/// Registry document file name.
pub const REGISTRY_FILE_NAME: &str = "scene_registry.json";

/// Batch summary file name.
pub const SUMMARY_FILE_NAME: &str = "processing_log.json";

/// Suffix of clipped chip products (before the extension).
pub const CLIPPED_SUFFIX: &str = "_clipped";

/// Extension of clipped chip products.
pub const CLIPPED_EXTENSION: &str = "tif";

/// Extension of chip sidecar metadata.
pub const SIDECAR_EXTENSION: &str = "json";

/// Paths inside one output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    /// Create a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The output root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the registry document.
    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE_NAME)
    }

    /// Path of the running batch summary.
    pub fn summary_path(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE_NAME)
    }

    /// Directory of finalized chip products.
    pub fn final_dir(&self) -> PathBuf {
        self.root.join("final")
    }

    /// Correction outputs for one request.
    pub fn rtc_dir(&self, request_id: &str) -> PathBuf {
        self.root.join("rtc").join(request_id)
    }

    /// Acquired source data for one request.
    pub fn raw_dir(&self, request_id: &str) -> PathBuf {
        self.root.join("raw").join(request_id)
    }

    /// Ancillary elevation data for one request.
    pub fn dem_dir(&self, request_id: &str) -> PathBuf {
        self.root.join("dem").join(request_id)
    }

    /// Log directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Clipped product path for a request.
    pub fn clipped_path(&self, request_id: &str) -> PathBuf {
        self.final_dir().join(format!(
            "{}{}.{}",
            request_id, CLIPPED_SUFFIX, CLIPPED_EXTENSION
        ))
    }

    /// Sidecar metadata path for a clipped product.
    pub fn sidecar_path(clipped: &Path) -> PathBuf {
        clipped.with_extension(SIDECAR_EXTENSION)
    }

    /// Glob pattern matching every clipped product in `final/`.
    pub fn clipped_glob(&self) -> String {
        self.final_dir()
            .join(format!("*{}.{}", CLIPPED_SUFFIX, CLIPPED_EXTENSION))
            .to_string_lossy()
            .into_owned()
    }

    /// Create the shared directories (`final/`, `logs/`).
    pub fn create_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.final_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

/// Strip the clipped suffix from a product file name, yielding the request id.
pub fn request_id_from_clipped(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy();
    stem.strip_suffix(CLIPPED_SUFFIX).map(str::to_string)
}

/// First `*VV*.tif` and `*VH*.tif` (sorted by name) in a correction output
/// directory. Kinds that are not found are absent from the map.
pub fn find_polarization_outputs(dir: &Path) -> OutputMap {
    let mut outputs = OutputMap::new();
    for (kind, pattern) in [(OUTPUT_VV, "*VV*.tif"), (OUTPUT_VH, "*VH*.tif")] {
        let pattern = dir.join(pattern).to_string_lossy().into_owned();
        let Ok(entries) = glob::glob(&pattern) else {
            continue;
        };
        let mut matches: Vec<PathBuf> = entries.filter_map(Result::ok).collect();
        matches.sort();
        if let Some(first) = matches.into_iter().next() {
            outputs.insert(kind.to_string(), first);
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = OutputLayout::new("/out");
        assert_eq!(
            layout.registry_path(),
            PathBuf::from("/out/scene_registry.json")
        );
        assert_eq!(
            layout.clipped_path("chip_7"),
            PathBuf::from("/out/final/chip_7_clipped.tif")
        );
        assert_eq!(
            OutputLayout::sidecar_path(&layout.clipped_path("chip_7")),
            PathBuf::from("/out/final/chip_7_clipped.json")
        );
        assert_eq!(layout.rtc_dir("chip_7"), PathBuf::from("/out/rtc/chip_7"));
    }

    #[test]
    fn test_request_id_from_clipped() {
        assert_eq!(
            request_id_from_clipped(Path::new("/out/final/chip_7_clipped.tif")),
            Some("chip_7".to_string())
        );
        assert_eq!(request_id_from_clipped(Path::new("/out/final/other.tif")), None);
    }

    #[test]
    fn test_find_polarization_outputs() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("OPERA_B_VV.tif"), b"b").unwrap();
        std::fs::write(temp.path().join("OPERA_A_VV.tif"), b"a").unwrap();
        std::fs::write(temp.path().join("OPERA_A_mask.tif"), b"m").unwrap();

        let outputs = find_polarization_outputs(temp.path());

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[OUTPUT_VV], temp.path().join("OPERA_A_VV.tif"));
    }

    #[test]
    fn test_create_dirs() {
        let temp = tempfile::TempDir::new().unwrap();
        let layout = OutputLayout::new(temp.path());
        layout.create_dirs().unwrap();
        assert!(layout.final_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
    }
}
