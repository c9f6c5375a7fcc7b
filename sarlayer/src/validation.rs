//! Validation gate for registry-referenced outputs.
//!
//! Registry entries can outlive the files they point at (manual cleanup,
//! disk pressure), so every reuse candidate is checked before it is trusted.
//! A failed check is a miss, never an error.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::raster::{self, RasterHeader};
use crate::registry::OutputMap;

/// Decides whether an output map can be trusted for reuse.
pub trait OutputValidator: Send + Sync {
    /// `true` only if every referenced output is usable.
    fn validate(&self, outputs: &OutputMap) -> bool;
}

pub use crate::raster::RasterInfo;

/// Reads raster headers.
pub trait RasterInspector: Send + Sync {
    fn inspect(&self, path: &Path) -> io::Result<RasterInfo>;
}

/// Header-only raster inspector.
///
/// TIFFs are read straight from the image file directory, so any sample
/// format works (the correction stage writes Float32). Other formats fall
/// back to the `image` crate decoders.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderRasterInspector;

impl RasterInspector for HeaderRasterInspector {
    fn inspect(&self, path: &Path) -> io::Result<RasterInfo> {
        use image::ImageDecoder;

        if raster::is_tiff(path)? {
            return RasterHeader::read(path)
                .map(|header| header.info)
                .map_err(io::Error::other);
        }

        let decoder = image::ImageReader::open(path)?
            .with_guessed_format()?
            .into_decoder()
            .map_err(io::Error::other)?;
        let (width, height) = decoder.dimensions();
        Ok(RasterInfo {
            width,
            height,
            bands: u32::from(decoder.color_type().channel_count()),
        })
    }
}

/// Production validator: every file must exist and be non-empty; outputs of
/// a raster kind must also open as a well-formed raster.
#[derive(Clone)]
pub struct FileValidator {
    inspector: Arc<dyn RasterInspector>,
    raster_kinds: HashSet<String>,
}

impl FileValidator {
    /// Create a validator that raster-checks the given output kinds.
    pub fn new<I, S>(inspector: Arc<dyn RasterInspector>, raster_kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inspector,
            raster_kinds: raster_kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// Validator using [`HeaderRasterInspector`].
    pub fn with_header_inspector<I, S>(raster_kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Arc::new(HeaderRasterInspector), raster_kinds)
    }

    fn check(&self, kind: &str, path: &Path) -> Result<(), String> {
        let metadata = fs::metadata(path).map_err(|e| e.to_string())?;
        if !metadata.is_file() {
            return Err("not a regular file".to_string());
        }
        if metadata.len() == 0 {
            return Err("empty file".to_string());
        }
        if self.raster_kinds.contains(kind) {
            let info = self.inspector.inspect(path).map_err(|e| e.to_string())?;
            if !info.is_well_formed() {
                return Err(format!(
                    "degenerate raster {}x{} with {} bands",
                    info.width, info.height, info.bands
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileValidator")
            .field("raster_kinds", &self.raster_kinds)
            .finish_non_exhaustive()
    }
}

impl OutputValidator for FileValidator {
    fn validate(&self, outputs: &OutputMap) -> bool {
        if outputs.is_empty() {
            debug!("Rejecting empty output map");
            return false;
        }
        for (kind, path) in outputs {
            if let Err(reason) = self.check(kind, path) {
                debug!(kind = %kind, path = %path.display(), reason = %reason, "Output failed validation");
                return false;
            }
        }
        true
    }
}
