//! Geographic bounding boxes.
//!
//! Every footprint in the system (scene extents, requested chips, search
//! windows) is an axis-aligned box in WGS84 degrees, stored in
//! `(west, south, east, north)` order.
//!
//! # Serialization
//!
//! Boxes serialize as a four-element array so the registry document stays
//! compact and readable:
//!
//! ```text
//! "bounds": [10.5, 10.5, 11.0, 11.0]
//! ```

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced when constructing a bounding box.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    /// A coordinate is NaN or infinite.
    #[error("non-finite coordinate in bounds [{west}, {south}, {east}, {north}]")]
    NonFinite {
        west: f64,
        south: f64,
        east: f64,
        north: f64,
    },

    /// West edge is not strictly west of the east edge.
    #[error("invalid bounds: west {west} must be less than east {east}")]
    InvertedLongitude { west: f64, east: f64 },

    /// South edge is not strictly south of the north edge.
    #[error("invalid bounds: south {south} must be less than north {north}")]
    InvertedLatitude { south: f64, north: f64 },

    /// Wrong number of components in a bounds array.
    #[error("bounds must have exactly 4 components, got {0}")]
    WrongArity(usize),
}

/// Axis-aligned geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Westernmost longitude
    pub west: f64,
    /// Southernmost latitude
    pub south: f64,
    /// Easternmost longitude
    pub east: f64,
    /// Northernmost latitude
    pub north: f64,
}

impl BoundingBox {
    /// Create a validated bounding box.
    ///
    /// # Errors
    ///
    /// Returns [`GeoError`] if any coordinate is non-finite or the box is
    /// empty or inverted along either axis.
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self, GeoError> {
        if ![west, south, east, north].iter().all(|c| c.is_finite()) {
            return Err(GeoError::NonFinite {
                west,
                south,
                east,
                north,
            });
        }
        if west >= east {
            return Err(GeoError::InvertedLongitude { west, east });
        }
        if south >= north {
            return Err(GeoError::InvertedLatitude { south, north });
        }
        Ok(Self {
            west,
            south,
            east,
            north,
        })
    }

    /// Build a box from a slice in `[west, south, east, north]` order.
    pub fn from_slice(values: &[f64]) -> Result<Self, GeoError> {
        match values {
            [w, s, e, n] => Self::new(*w, *s, *e, *n),
            other => Err(GeoError::WrongArity(other.len())),
        }
    }

    /// Components as an array in `[west, south, east, north]` order.
    pub fn to_array(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }

    /// Grow the box by `buffer` degrees on every side.
    pub fn expanded(&self, buffer: f64) -> Self {
        Self {
            west: self.west - buffer,
            south: self.south - buffer,
            east: self.east + buffer,
            north: self.north + buffer,
        }
    }

    /// True if `other` lies entirely inside this box (edges inclusive).
    pub fn contains(&self, other: &BoundingBox) -> bool {
        other.west >= self.west
            && other.east <= self.east
            && other.south >= self.south
            && other.north <= self.north
    }

    /// True if every component differs from `other` by at most `tolerance`.
    pub fn within_tolerance(&self, other: &BoundingBox, tolerance: f64) -> bool {
        self.to_array()
            .iter()
            .zip(other.to_array().iter())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }

    /// Round every component to `decimals` decimal places.
    ///
    /// Stored chip bounds are rounded so that equality comparisons are stable
    /// across serialization round trips.
    pub fn rounded(&self, decimals: u32) -> Self {
        let factor = 10f64.powi(decimals as i32);
        let round = |v: f64| (v * factor).round() / factor;
        Self {
            west: round(self.west),
            south: round(self.south),
            east: round(self.east),
            north: round(self.north),
        }
    }

    /// Width in degrees of longitude.
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    /// Height in degrees of latitude.
    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    /// Closed WKT polygon, counter-clockwise from the south-west corner.
    pub fn to_wkt(&self) -> String {
        format!(
            "POLYGON (({w} {s}, {w} {n}, {e} {n}, {e} {s}, {w} {s}))",
            w = self.west,
            s = self.south,
            e = self.east,
            n = self.north
        )
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.6}, {:.6}, {:.6}, {:.6}]",
            self.west, self.south, self.east, self.north
        )
    }
}

impl Serialize for BoundingBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_array().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BoundingBox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<f64>::deserialize(deserializer)?;
        BoundingBox::from_slice(&values).map_err(serde::de::Error::custom)
    }
}
