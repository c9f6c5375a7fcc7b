//! External processing collaborators.
//!
//! The scheduler never talks to search APIs, downloaders, the correction
//! executable or the clipping tool directly. It drives them through four
//! narrow traits:
//!
//! | Stage       | Trait                 | Produces                       |
//! |-------------|-----------------------|--------------------------------|
//! | acquire     | [`AcquisitionSource`] | an [`AcquiredScene`]           |
//! | ancillary   | [`AncillarySource`]   | elevation data path            |
//! | correction  | [`CorrectionRunner`]  | base [`OutputMap`] (vv, vh, …) |
//! | clip        | [`Clipper`]           | clipped chip product path      |
//!
//! Collaborators own their intermediate files: on failure they clean up
//! after themselves and report a [`CollaboratorError`].
//!
//! All traits are dyn-compatible (`Pin<Box<dyn Future>>` returns) so the
//! dispatcher can hold them as `Arc<dyn …>`.

mod command;

use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::dates::extract_scene_date;
use crate::geo::BoundingBox;
use crate::registry::{DisasterPhase, OutputMap};

pub use command::{CommandCollaborators, CommandSet};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Processing stage, used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Acquire,
    Ancillary,
    Correction,
    Clip,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Ancillary => "ancillary",
            Stage::Correction => "correction",
            Stage::Clip => "clip",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// No implementation is configured for the stage.
    #[error("{stage} stage is not configured")]
    NotConfigured { stage: Stage },

    /// The external command could not be started.
    #[error("failed to start {stage} command: {source}")]
    Spawn {
        stage: Stage,
        #[source]
        source: io::Error,
    },

    /// The external command exited unsuccessfully.
    #[error("{stage} command failed ({status}): {stderr}")]
    Failed {
        stage: Stage,
        status: String,
        stderr: String,
    },

    /// The stage ran but its result could not be interpreted.
    #[error("{stage} produced invalid output: {reason}")]
    InvalidOutput { stage: Stage, reason: String },

    /// Nothing suitable was found (e.g. no scene in the search window).
    #[error("{stage}: {message}")]
    NotFound { stage: Stage, message: String },
}

impl CollaboratorError {
    /// The stage that failed.
    pub fn stage(&self) -> Stage {
        match self {
            CollaboratorError::NotConfigured { stage }
            | CollaboratorError::Spawn { stage, .. }
            | CollaboratorError::Failed { stage, .. }
            | CollaboratorError::InvalidOutput { stage, .. }
            | CollaboratorError::NotFound { stage, .. } => *stage,
        }
    }

    /// Failures worth retrying: the command could not start or exited
    /// non-zero.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Spawn { .. } | CollaboratorError::Failed { .. }
        )
    }
}

/// Result type for collaborator calls.
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Closed time interval for scene search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// `center ± half_width`.
    pub fn around(center: DateTime<Utc>, half_width: TimeDelta) -> Self {
        Self {
            start: center - half_width,
            end: center + half_width,
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }
}

/// A source scene made available locally by an [`AcquisitionSource`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AcquiredScene {
    pub scene_id: String,
    pub footprint: BoundingBox,
    #[serde(default)]
    pub acquisition_date: Option<DateTime<Utc>>,
    pub local_path: PathBuf,
}

impl AcquiredScene {
    /// The reported acquisition date, or the one embedded in the scene id.
    pub fn effective_date(&self) -> Option<DateTime<Utc>> {
        self.acquisition_date
            .or_else(|| extract_scene_date(&self.scene_id))
    }
}

/// Input to [`AcquisitionSource::acquire`].
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireInput {
    pub request_id: String,
    pub footprint: BoundingBox,
    pub window: TimeWindow,
    /// Date of the requesting chip; the closest scene in time is preferred.
    pub reference_date: Option<DateTime<Utc>>,
    pub phase: DisasterPhase,
    pub dest_dir: PathBuf,
}

/// Input to [`AncillarySource::fetch_ancillary`].
#[derive(Debug, Clone, PartialEq)]
pub struct AncillaryInput {
    pub request_id: String,
    pub footprint: BoundingBox,
    pub dest_dir: PathBuf,
}

/// Input to [`CorrectionRunner::run_correction`].
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionInput {
    pub request_id: String,
    pub scene: AcquiredScene,
    pub ancillary: PathBuf,
    pub output_dir: PathBuf,
    /// Execution slot (accelerator index) the run is bound to.
    pub slot: usize,
}

/// Input to [`Clipper::produce_clipped`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClipInput {
    pub request_id: String,
    /// Base outputs to clip (polarization rasters).
    pub outputs: OutputMap,
    /// The requesting chip, used as the spatial reference grid.
    pub reference: PathBuf,
    pub footprint: BoundingBox,
    pub destination: PathBuf,
}

/// Finds and downloads a source scene covering a footprint.
pub trait AcquisitionSource: Send + Sync {
    fn acquire(&self, input: AcquireInput) -> BoxFuture<'_, CollaboratorResult<AcquiredScene>>;
}

/// Fetches ancillary elevation data for a footprint.
pub trait AncillarySource: Send + Sync {
    fn fetch_ancillary(&self, input: AncillaryInput) -> BoxFuture<'_, CollaboratorResult<PathBuf>>;
}

/// Runs the external correction on an acquired scene.
pub trait CorrectionRunner: Send + Sync {
    fn run_correction(&self, input: CorrectionInput)
        -> BoxFuture<'_, CollaboratorResult<OutputMap>>;
}

/// Clips and merges base outputs onto a chip footprint.
pub trait Clipper: Send + Sync {
    fn produce_clipped(&self, input: ClipInput) -> BoxFuture<'_, CollaboratorResult<PathBuf>>;
}

/// The four collaborators used by the dispatcher.
#[derive(Clone)]
pub struct Collaborators {
    pub acquisition: Arc<dyn AcquisitionSource>,
    pub ancillary: Arc<dyn AncillarySource>,
    pub correction: Arc<dyn CorrectionRunner>,
    pub clipper: Arc<dyn Clipper>,
}

impl Collaborators {
    pub fn new(
        acquisition: Arc<dyn AcquisitionSource>,
        ancillary: Arc<dyn AncillarySource>,
        correction: Arc<dyn CorrectionRunner>,
        clipper: Arc<dyn Clipper>,
    ) -> Self {
        Self {
            acquisition,
            ancillary,
            correction,
            clipper,
        }
    }

    /// Use one value implementing all four traits for every stage.
    pub fn from_shared<T>(all: Arc<T>) -> Self
    where
        T: AcquisitionSource + AncillarySource + CorrectionRunner + Clipper + 'static,
    {
        Self {
            acquisition: all.clone(),
            ancillary: all.clone(),
            correction: all.clone(),
            clipper: all,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
