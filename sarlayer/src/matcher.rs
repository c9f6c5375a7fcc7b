//! Spatial/temporal reuse matching.
//!
//! Given a request footprint, date and phase, the matcher looks for
//! previously processed results that can be reused instead of processing
//! again. Two passes are made over the registry in insertion order:
//!
//! 1. **Exact chip**: a registered chip whose bounds match the request
//!    within `coordinate_tolerance` on every component. Its outputs are
//!    returned as is.
//! 2. **Containment**: a scene whose footprint, grown by `footprint_buffer`,
//!    contains the request and whose acquisition date is within
//!    `date_tolerance` of the request date. Its base outputs are returned for
//!    clipping.
//!
//! Scenes of the opposite disaster phase are never considered. Every
//! candidate goes through the validation gate; a candidate whose files are
//! gone is skipped and the scan continues.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::MatchConfig;
use crate::geo::BoundingBox;
use crate::registry::{DisasterPhase, OutputMap, Registry, SceneRecord};
use crate::validation::OutputValidator;

/// How a match was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKind {
    /// A registered chip with (nearly) identical bounds.
    ExactChip { chip_id: String },
    /// The request lies inside a registered scene footprint.
    Containment,
}

/// A reusable result.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchHit {
    pub scene_id: String,
    pub kind: MatchKind,
    /// Chip outputs for an exact hit, scene base outputs for containment.
    pub outputs: OutputMap,
}

impl MatchHit {
    pub fn is_exact(&self) -> bool {
        matches!(self.kind, MatchKind::ExactChip { .. })
    }
}

/// The reuse matcher.
#[derive(Clone)]
pub struct Matcher {
    config: MatchConfig,
    validator: Arc<dyn OutputValidator>,
}

impl Matcher {
    pub fn new(config: MatchConfig, validator: Arc<dyn OutputValidator>) -> Self {
        Self { config, validator }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Find a reusable result for the request, or `None`.
    pub fn find_match(
        &self,
        bounds: &BoundingBox,
        date: Option<DateTime<Utc>>,
        phase: DisasterPhase,
        registry: &Registry,
    ) -> Option<MatchHit> {
        self.exact_chip_pass(bounds, phase, registry)
            .or_else(|| self.containment_pass(bounds, date, phase, registry))
    }

    fn exact_chip_pass(
        &self,
        bounds: &BoundingBox,
        phase: DisasterPhase,
        registry: &Registry,
    ) -> Option<MatchHit> {
        let tolerance = self.config.coordinate_tolerance();

        for scene in registry.scenes() {
            if self.phase_excluded(scene, phase) {
                continue;
            }
            for chip in &scene.chips {
                if !chip.bounds.within_tolerance(bounds, tolerance) {
                    continue;
                }
                if !self.validator.validate(&chip.outputs) {
                    debug!(
                        scene_id = %scene.scene_id,
                        chip_id = %chip.chip_id,
                        "Exact chip candidate failed validation"
                    );
                    continue;
                }
                debug!(scene_id = %scene.scene_id, chip_id = %chip.chip_id, "Exact chip match");
                return Some(MatchHit {
                    scene_id: scene.scene_id.clone(),
                    kind: MatchKind::ExactChip {
                        chip_id: chip.chip_id.clone(),
                    },
                    outputs: chip.outputs.clone(),
                });
            }
        }
        None
    }

    fn containment_pass(
        &self,
        bounds: &BoundingBox,
        date: Option<DateTime<Utc>>,
        phase: DisasterPhase,
        registry: &Registry,
    ) -> Option<MatchHit> {
        let buffer = self.config.footprint_buffer();

        for scene in registry.scenes() {
            if self.phase_excluded(scene, phase) {
                continue;
            }
            if !self.date_compatible(scene.acquisition_date, date) {
                continue;
            }
            if !scene.footprint.expanded(buffer).contains(bounds) {
                continue;
            }
            if !self.validator.validate(&scene.base_outputs) {
                debug!(scene_id = %scene.scene_id, "Containing scene failed validation");
                continue;
            }
            debug!(scene_id = %scene.scene_id, "Containment match");
            return Some(MatchHit {
                scene_id: scene.scene_id.clone(),
                kind: MatchKind::Containment,
                outputs: scene.base_outputs.clone(),
            });
        }
        None
    }

    fn phase_excluded(&self, scene: &SceneRecord, phase: DisasterPhase) -> bool {
        if scene.phase_conflicts_with(phase) {
            return true;
        }
        match (phase, scene.disaster_phase.and_then(DisasterPhase::known)) {
            (DisasterPhase::Unknown, Some(scene_phase)) => {
                if self.config.strict_phase() {
                    return true;
                }
                debug!(
                    scene_id = %scene.scene_id,
                    scene_phase = %scene_phase,
                    "Request phase unknown; considering phased scene"
                );
                false
            }
            _ => false,
        }
    }

    /// Unknown dates on either side never exclude.
    fn date_compatible(
        &self,
        scene_date: Option<DateTime<Utc>>,
        request_date: Option<DateTime<Utc>>,
    ) -> bool {
        match (scene_date, request_date) {
            (Some(a), Some(b)) => (a - b).abs() <= self.config.date_tolerance(),
            _ => true,
        }
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
