//! TIFF header and GeoTIFF georeferencing.
//!
//! Only the first image file directory is read; pixel data is never decoded.
//! This works for any sample format, including the Float32 rasters the
//! correction and clipping stages write.
//!
//! Georeferencing follows the GeoTIFF model tags:
//!
//! - `ModelTiepointTag` + `ModelPixelScaleTag` (north-up rasters)
//! - `ModelTransformationTag` (general affine)
//!
//! Coordinates are taken as-is, so chips must be in a geographic CRS.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tiff::decoder::Decoder;
use tiff::tags::Tag;

use crate::geo::{BoundingBox, GeoError};

/// `GTRasterTypeGeoKey` in the GeoKey directory.
const RASTER_TYPE_GEO_KEY: u16 = 1025;

/// `RasterPixelIsPoint` value of [`RASTER_TYPE_GEO_KEY`].
const RASTER_PIXEL_IS_POINT: u16 = 2;

/// Errors raised while reading a raster header.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read TIFF header of {path}: {source}")]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },

    #[error("malformed georeferencing in {path}: {reason}")]
    Georeference { path: PathBuf, reason: String },

    #[error("raster {path} has invalid bounds: {source}")]
    Bounds {
        path: PathBuf,
        #[source]
        source: GeoError,
    },
}

/// Basic structure of a raster file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterInfo {
    pub width: u32,
    pub height: u32,
    pub bands: u32,
}

impl RasterInfo {
    /// Non-zero width, height and band count.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.bands > 0
    }
}

/// Affine pixel-to-model transform.
///
/// `x = top_left_x + col * pixel_width + row * rotation_x`
/// `y = top_left_y + col * rotation_y + row * pixel_height`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Model coordinates of the pixel corner at (`col`, `row`).
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Envelope of a `width` x `height` raster under this transform.
    pub fn bounds(&self, width: u32, height: u32) -> Result<BoundingBox, GeoError> {
        let (w, h) = (f64::from(width), f64::from(height));
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(w, 0.0),
            self.apply(0.0, h),
            self.apply(w, h),
        ];
        let (mut west, mut south) = (f64::INFINITY, f64::INFINITY);
        let (mut east, mut north) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in corners {
            west = west.min(x);
            east = east.max(x);
            south = south.min(y);
            north = north.max(y);
        }
        BoundingBox::new(west, south, east, north)
    }
}

/// Header of the first image in a TIFF file.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterHeader {
    pub info: RasterInfo,
    /// `None` when the file carries no GeoTIFF model tags.
    pub transform: Option<GeoTransform>,
}

impl RasterHeader {
    /// Read the header of the TIFF at `path`.
    pub fn read(path: &Path) -> Result<Self, RasterError> {
        let file = File::open(path).map_err(|source| RasterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let tiff_err = |source: tiff::TiffError| RasterError::Tiff {
            path: path.to_path_buf(),
            source,
        };

        let mut decoder = Decoder::new(BufReader::new(file)).map_err(tiff_err)?;
        let (width, height) = decoder.dimensions().map_err(tiff_err)?;
        let bands = decoder
            .find_tag_unsigned::<u32>(Tag::SamplesPerPixel)
            .map_err(tiff_err)?
            .unwrap_or(1);

        let scale = find_f64_vec(&mut decoder, Tag::ModelPixelScaleTag).map_err(tiff_err)?;
        let tiepoints = find_f64_vec(&mut decoder, Tag::ModelTiepointTag).map_err(tiff_err)?;
        let matrix = find_f64_vec(&mut decoder, Tag::ModelTransformationTag).map_err(tiff_err)?;
        let pixel_is_point = decoder
            .find_tag_unsigned_vec::<u16>(Tag::GeoKeyDirectoryTag)
            .map_err(tiff_err)?
            .map(|keys| geo_key(&keys, RASTER_TYPE_GEO_KEY) == Some(RASTER_PIXEL_IS_POINT))
            .unwrap_or(false);

        let transform = georeference(scale, tiepoints, matrix, pixel_is_point).map_err(
            |reason| RasterError::Georeference {
                path: path.to_path_buf(),
                reason,
            },
        )?;

        Ok(Self {
            info: RasterInfo {
                width,
                height,
                bands,
            },
            transform,
        })
    }

    /// Geographic envelope, if the raster is georeferenced.
    pub fn bounds(&self, path: &Path) -> Result<Option<BoundingBox>, RasterError> {
        self.transform
            .map(|t| t.bounds(self.info.width, self.info.height))
            .transpose()
            .map_err(|source| RasterError::Bounds {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Whether the file starts with a TIFF or BigTIFF signature.
pub fn is_tiff(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }
    Ok(matches!(&magic, b"II*\0" | b"MM\0*" | b"II+\0" | b"MM\0+"))
}

fn find_f64_vec<R: io::Read + io::Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
) -> tiff::TiffResult<Option<Vec<f64>>> {
    decoder.find_tag(tag)?.map(|v| v.into_f64_vec()).transpose()
}

/// Look up `key` in a GeoKey directory (`[version, rev, minor, count, entries..]`).
fn geo_key(directory: &[u16], key: u16) -> Option<u16> {
    let count = usize::from(*directory.get(3)?);
    directory
        .get(4..)?
        .chunks_exact(4)
        .take(count)
        .find(|entry| entry[0] == key && entry[1] == 0)
        .map(|entry| entry[3])
}

fn georeference(
    scale: Option<Vec<f64>>,
    tiepoints: Option<Vec<f64>>,
    matrix: Option<Vec<f64>>,
    pixel_is_point: bool,
) -> Result<Option<GeoTransform>, String> {
    let mut transform = match (scale, tiepoints, matrix) {
        (Some(scale), Some(tiepoints), _) => {
            if scale.len() < 2 {
                return Err(format!("ModelPixelScale has {} values", scale.len()));
            }
            if tiepoints.len() < 6 {
                return Err(format!("ModelTiepoint has {} values", tiepoints.len()));
            }
            let (sx, sy) = (scale[0], scale[1]);
            let (i, j, x, y) = (tiepoints[0], tiepoints[1], tiepoints[3], tiepoints[4]);
            GeoTransform {
                top_left_x: x - i * sx,
                pixel_width: sx,
                rotation_x: 0.0,
                top_left_y: y + j * sy,
                rotation_y: 0.0,
                pixel_height: -sy,
            }
        }
        (_, _, Some(m)) => {
            if m.len() < 8 {
                return Err(format!("ModelTransformation has {} values", m.len()));
            }
            GeoTransform {
                top_left_x: m[3],
                pixel_width: m[0],
                rotation_x: m[1],
                top_left_y: m[7],
                rotation_y: m[4],
                pixel_height: m[5],
            }
        }
        (None, None, None) => return Ok(None),
        _ => return Err("incomplete model tags".to_string()),
    };

    if pixel_is_point {
        let (x, y) = transform.apply(-0.5, -0.5);
        transform.top_left_x = x;
        transform.top_left_y = y;
    }
    Ok(Some(transform))
}
