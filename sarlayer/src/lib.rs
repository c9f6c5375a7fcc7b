//! SARLayer - reuse-aware SAR processing of optical imagery chips
//!
//! For every requested optical chip, SARLayer decides whether an already
//! processed radar scene covers it and reuses those outputs; otherwise it
//! schedules acquisition and correction over a fixed number of execution
//! slots and records the result in a crash-safe scene registry.
//!
//! # Modules
//!
//! - [`registry`]: the persistent scene registry and its store
//! - [`matcher`]: spatial/temporal reuse matching
//! - [`validation`]: the gate deciding whether registered files are still usable
//! - [`raster`]: TIFF headers and GeoTIFF chip footprints
//! - [`dispatch`]: slot-bounded scheduling of requests
//! - [`collaborators`]: interfaces to the external processing stages
//! - [`config`]: INI configuration

pub mod collaborators;
pub mod config;
pub mod dates;
pub mod dispatch;
pub mod geo;
pub mod layout;
pub mod logging;
pub mod matcher;
pub mod persist;
pub mod raster;
pub mod registry;
pub mod validation;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
