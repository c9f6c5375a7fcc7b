//! Processing requests and their discovery from an input directory.
//!
//! A request is one optical chip (`<stem>.tif` / `<stem>.tiff`) plus its
//! label document `<label_dir>/<stem>.json`:
//!
//! ```json
//! { "metadata": { "capture_date": "2023-01-20T10:00:00Z" } }
//! ```
//!
//! The chip footprint comes from the chip's GeoTIFF georeferencing. A
//! `metadata.bounds` array (`[west, south, east, north]`) in the label
//! overrides it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::dates::parse_timestamp;
use crate::geo::BoundingBox;
use crate::raster::{RasterError, RasterHeader};
use crate::registry::DisasterPhase;

/// Errors raised while discovering requests.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("label file not found: {0}")]
    MissingLabel(PathBuf),

    #[error("invalid label {path}: {reason}")]
    InvalidLabel { path: PathBuf, reason: String },

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error("chip {0} is not georeferenced and its label has no bounds")]
    NotGeoreferenced(PathBuf),
}

/// One chip to process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRequest {
    /// Chip file stem; names every per-request output.
    pub request_id: String,
    pub chip_path: PathBuf,
    pub bounds: BoundingBox,
    /// Capture date of the chip, if known.
    pub date: Option<DateTime<Utc>>,
    pub phase: DisasterPhase,
}

impl ProcessingRequest {
    /// Build a request for `chip_path`, inferring id and phase from the path.
    pub fn new(
        chip_path: impl Into<PathBuf>,
        bounds: BoundingBox,
        date: Option<DateTime<Utc>>,
    ) -> Self {
        let chip_path = chip_path.into();
        let request_id = chip_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let phase = DisasterPhase::infer_from_path(&chip_path);
        Self {
            request_id,
            chip_path,
            bounds,
            date,
            phase,
        }
    }

    /// Override the inferred phase.
    pub fn with_phase(mut self, phase: DisasterPhase) -> Self {
        self.phase = phase;
        self
    }
}

#[derive(Deserialize)]
struct LabelFile {
    metadata: LabelMetadata,
}

#[derive(Deserialize)]
struct LabelMetadata {
    #[serde(default)]
    capture_date: Option<String>,
    #[serde(default)]
    bounds: Option<BoundingBox>,
}

/// Build requests for every chip in `chip_dir`, sorted by path.
///
/// Chips whose label is missing or invalid are logged and skipped. Only an
/// unreadable `chip_dir` is an error.
pub fn discover_requests(
    chip_dir: &Path,
    label_dir: &Path,
) -> Result<Vec<ProcessingRequest>, InputError> {
    let entries = fs::read_dir(chip_dir).map_err(|source| InputError::Io {
        path: chip_dir.to_path_buf(),
        source,
    })?;

    let mut chips: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_chip_file(path))
        .collect();
    chips.sort();

    let mut requests = Vec::with_capacity(chips.len());
    for chip in chips {
        match load_request(&chip, label_dir) {
            Ok(request) => requests.push(request),
            Err(e) => warn!(chip = %chip.display(), error = %e, "Skipping chip"),
        }
    }

    info!(
        chip_dir = %chip_dir.display(),
        requests = requests.len(),
        "Discovered processing requests"
    );
    Ok(requests)
}

/// Build the request for one chip from its label document and raster header.
pub fn load_request(chip_path: &Path, label_dir: &Path) -> Result<ProcessingRequest, InputError> {
    let stem = chip_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let label_path = label_dir.join(format!("{}.json", stem));

    let bytes = match fs::read(&label_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(InputError::MissingLabel(label_path))
        }
        Err(source) => {
            return Err(InputError::Io {
                path: label_path,
                source,
            })
        }
    };

    let label: LabelFile =
        serde_json::from_slice(&bytes).map_err(|e| InputError::InvalidLabel {
            path: label_path.clone(),
            reason: e.to_string(),
        })?;

    let date = match label.metadata.capture_date.as_deref() {
        None => None,
        Some(raw) => Some(parse_timestamp(raw).ok_or_else(|| InputError::InvalidLabel {
            path: label_path.clone(),
            reason: format!("unparseable capture_date '{}'", raw),
        })?),
    };

    let bounds = match label.metadata.bounds {
        Some(bounds) => bounds,
        None => chip_bounds(chip_path)?,
    };

    Ok(ProcessingRequest::new(chip_path, bounds, date))
}

/// Footprint of a chip from its GeoTIFF georeferencing.
pub fn chip_bounds(chip_path: &Path) -> Result<BoundingBox, InputError> {
    RasterHeader::read(chip_path)?
        .bounds(chip_path)?
        .ok_or_else(|| InputError::NotGeoreferenced(chip_path.to_path_buf()))
}

fn is_chip_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            ext == "tif" || ext == "tiff"
        })
        .unwrap_or(false)
}
