//! The reuse-aware job dispatcher.
//!
//! # Flow of one request
//!
//! ```text
//! admit ──► ticket for slot (sequence % N)
//!   │
//!   ▼
//! load registry + match ──► exact chip ──► register chip id ──► Reused
//!   │                   └─► containment ─► clip ─► register ──► Reused
//!   │ miss
//!   ▼
//! wait for slot ──► match again (a slot peer may have produced the scene)
//!   │
//!   ▼
//! ┌──────────── slot ────────────┐
//! │ acquire ─► ancillary ─► correction │
//! └──────────────────────────────┘
//!   │
//!   ▼
//! clip ──► sidecar ──► register scene + chip ──► Completed
//! ```
//!
//! Collaborator failures end the request as `Failed` without touching the
//! registry. A registry update that fails after successful processing is
//! logged and recorded (`registered: false`); the outcome stays successful.

use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::request::ProcessingRequest;
use super::slots::{SlotPool, SlotTicket};
use super::summary::{BatchReport, JobRecord, Outcome, SummaryWriter};
use crate::collaborators::{
    AcquireInput, AcquiredScene, AncillaryInput, ClipInput, CollaboratorError, CollaboratorResult,
    Collaborators, CorrectionInput, TimeWindow,
};
use crate::config::DispatchConfig;
use crate::layout::OutputLayout;
use crate::matcher::{MatchHit, MatchKind, Matcher};
use crate::registry::{
    ChipSidecar, ChipUpdate, OutputMap, RegistryStore, SceneRecord, SceneUpdate, OUTPUT_CLIPPED,
};

/// Reason recorded for requests never started because the batch was cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

// =============================================================================
// Errors
// =============================================================================

/// Errors that prevent a dispatcher from accepting requests.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid dispatch configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a single request failed.
#[derive(Debug, Error)]
enum JobError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// =============================================================================
// Dispatcher
// =============================================================================

/// A registry entry found reusable for a request.
struct Reusable {
    hit: MatchHit,
    scene: SceneRecord,
}

/// A successfully finished request.
struct Finished {
    outcome: Outcome,
    output: Option<PathBuf>,
    registered: bool,
}

/// Schedules requests over a fixed set of execution slots and records
/// results in the registry.
#[derive(Clone)]
pub struct Dispatcher {
    store: RegistryStore,
    matcher: Arc<Matcher>,
    collaborators: Collaborators,
    layout: OutputLayout,
    config: DispatchConfig,
    slots: SlotPool,
    sequence: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Create a dispatcher writing to the output root of `store`.
    ///
    /// # Errors
    ///
    /// Fails before any request is accepted if `slots` or `workers` is zero
    /// or the shared output directories cannot be created.
    pub fn new(
        store: RegistryStore,
        matcher: Matcher,
        collaborators: Collaborators,
        config: DispatchConfig,
    ) -> Result<Self, DispatchError> {
        if config.slots() == 0 {
            return Err(DispatchError::InvalidConfig(
                "slots must be at least 1".to_string(),
            ));
        }
        if config.workers() == 0 {
            return Err(DispatchError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }

        let layout = store.layout();
        layout.create_dirs().map_err(|source| DispatchError::OutputDir {
            path: layout.root().to_path_buf(),
            source,
        })?;

        info!(
            slots = config.slots(),
            workers = config.workers(),
            output_dir = %layout.root().display(),
            "Dispatcher ready"
        );

        Ok(Self {
            store,
            matcher: Arc::new(matcher),
            collaborators,
            layout,
            slots: SlotPool::new(config.slots()),
            config,
            sequence: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The execution slots, for occupancy inspection.
    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    /// Process one request and return its outcome.
    ///
    /// The request takes the next sequence number, which determines its slot.
    pub async fn submit(&self, request: ProcessingRequest) -> Outcome {
        let ticket = self.admit();
        self.process(request, ticket).await.outcome
    }

    /// Process a batch; see [`Dispatcher::run_batch_with_progress`].
    pub async fn run_batch(
        &self,
        requests: Vec<ProcessingRequest>,
        cancel: CancellationToken,
    ) -> BatchReport {
        self.run_batch_with_progress(requests, cancel, |_| {}).await
    }

    /// Process a batch with at most `workers` requests in flight.
    ///
    /// Requests are admitted in order. After each request finishes,
    /// `on_finished` is called and the summary file is rewritten. Once
    /// `cancel` fires no further requests are admitted; requests already in
    /// flight run to completion and the rest are recorded as failed.
    pub async fn run_batch_with_progress<F>(
        &self,
        requests: Vec<ProcessingRequest>,
        cancel: CancellationToken,
        mut on_finished: F,
    ) -> BatchReport
    where
        F: FnMut(&JobRecord),
    {
        let total = requests.len();
        let mut summary = SummaryWriter::new(self.layout.summary_path(), total);
        if let Err(e) = summary.flush() {
            warn!(path = %summary.path().display(), error = %e, "Failed to write batch summary");
        }
        info!(requests = total, "Starting batch");

        let admission = Arc::new(Semaphore::new(self.config.workers()));
        let mut pending = requests.into_iter().enumerate();
        let mut next = pending.next();
        let mut tasks: JoinSet<JobRecord> = JoinSet::new();

        let mut finish = |summary: &mut SummaryWriter, job: JobRecord| {
            on_finished(&job);
            if let Err(e) = summary.record(job) {
                warn!(path = %summary.path().display(), error = %e, "Failed to write batch summary");
            }
        };

        loop {
            tokio::select! {
                biased;

                Some(joined) = tasks.join_next() => match joined {
                    Ok(job) => finish(&mut summary, job),
                    Err(e) => error!(error = %e, "Request task ended abnormally"),
                },

                _ = cancel.cancelled(), if next.is_some() => {
                    let remaining: Vec<_> = next.take().into_iter().chain(pending.by_ref()).collect();
                    warn!(remaining = remaining.len(), "Batch cancelled; not starting remaining requests");
                    for (index, request) in remaining {
                        finish(&mut summary, self.cancelled_record(request, index));
                    }
                }

                permit = Arc::clone(&admission).acquire_owned(), if next.is_some() && !cancel.is_cancelled() => {
                    let Ok(permit) = permit else { break };
                    let Some((_, request)) = next.take() else { continue };
                    next = pending.next();

                    let ticket = self.admit();
                    let dispatcher = self.clone();
                    tasks.spawn(async move {
                        let record = dispatcher.process_guarded(request, ticket).await;
                        drop(permit);
                        record
                    });
                }

                else => break,
            }
        }

        let report = summary.into_report();
        info!(
            total = report.total_requests,
            completed = report.completed,
            reused = report.reused,
            failed = report.failed,
            high_water = self.slots.high_water_mark(),
            "Batch finished"
        );
        report
    }

    fn admit(&self) -> SlotTicket {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.slots.issue(self.slots.slot_for(sequence))
    }

    fn cancelled_record(&self, request: ProcessingRequest, index: usize) -> JobRecord {
        JobRecord {
            request_id: request.request_id,
            chip_path: request.chip_path,
            outcome: Outcome::failed(CANCELLED_REASON),
            slot: self.slots.slot_for(index),
            duration_ms: 0,
            output: None,
            registered: false,
        }
    }

    /// [`Dispatcher::process`] with a panic turned into a failed record.
    async fn process_guarded(&self, request: ProcessingRequest, ticket: SlotTicket) -> JobRecord {
        let request_id = request.request_id.clone();
        let chip_path = request.chip_path.clone();
        let slot = ticket.slot();

        match AssertUnwindSafe(self.process(request, ticket))
            .catch_unwind()
            .await
        {
            Ok(record) => record,
            Err(_) => {
                error!(request_id = %request_id, "Request processing panicked");
                JobRecord {
                    request_id,
                    chip_path,
                    outcome: Outcome::failed("processing panicked"),
                    slot,
                    duration_ms: 0,
                    output: None,
                    registered: false,
                }
            }
        }
    }

    async fn process(&self, request: ProcessingRequest, ticket: SlotTicket) -> JobRecord {
        let started = Instant::now();
        let slot = ticket.slot();
        let span = info_span!("request", request_id = %request.request_id, slot);

        let result = self
            .execute(&request, ticket)
            .instrument(span.clone())
            .await;

        let record = match result {
            Ok(finished) => JobRecord {
                request_id: request.request_id,
                chip_path: request.chip_path,
                outcome: finished.outcome,
                slot,
                duration_ms: elapsed_ms(started),
                output: finished.output,
                registered: finished.registered,
            },
            Err(e) => JobRecord {
                request_id: request.request_id,
                chip_path: request.chip_path,
                outcome: Outcome::failed(e.to_string()),
                slot,
                duration_ms: elapsed_ms(started),
                output: None,
                registered: false,
            },
        };

        span.in_scope(|| log_outcome(&record));
        record
    }

    async fn execute(
        &self,
        request: &ProcessingRequest,
        ticket: SlotTicket,
    ) -> Result<Finished, JobError> {
        debug!(phase = %request.phase, bounds = %request.bounds, "Looking up registry");
        if let Some(found) = self.lookup(request).await? {
            drop(ticket);
            return self.reuse(request, found).await;
        }

        let guard = ticket.acquire().await;
        debug!("Slot acquired");

        if let Some(found) = self.lookup(request).await? {
            drop(guard);
            return self.reuse(request, found).await;
        }

        let (scene, base_outputs) = self.process_scene(request, guard.slot()).await?;
        drop(guard);

        let clipped = self.clip(request, &base_outputs).await?;
        let update = SceneUpdate {
            scene_id: scene.scene_id.clone(),
            footprint: scene.footprint,
            acquisition_date: scene.effective_date(),
            phase: request.phase,
            base_outputs,
            chip: chip_update(request, &clipped),
        };
        let registered = self.register(update, Some(clipped.clone())).await;

        Ok(Finished {
            outcome: Outcome::Completed {
                scene_id: scene.scene_id,
            },
            output: Some(clipped),
            registered,
        })
    }

    /// Load the latest registry and match the request against it.
    async fn lookup(&self, request: &ProcessingRequest) -> Result<Option<Reusable>, JobError> {
        let store = self.store.clone();
        let matcher = Arc::clone(&self.matcher);
        let (bounds, date, phase) = (request.bounds, request.date, request.phase);

        let found = tokio::task::spawn_blocking(move || {
            let registry = store.load();
            let hit = matcher.find_match(&bounds, date, phase, &registry)?;
            let scene = registry.get(&hit.scene_id)?.clone();
            Some(Reusable { hit, scene })
        })
        .await?;
        Ok(found)
    }

    async fn reuse(
        &self,
        request: &ProcessingRequest,
        found: Reusable,
    ) -> Result<Finished, JobError> {
        let Reusable { hit, scene } = found;
        let scene_id = hit.scene_id.clone();

        match &hit.kind {
            MatchKind::ExactChip { chip_id } => {
                info!(scene_id = %scene_id, chip_id = %chip_id, "Reusing existing chip product");
                let output = hit.outputs.get(OUTPUT_CLIPPED).cloned();
                let registered = if *chip_id == request.request_id {
                    true
                } else {
                    let update = scene_update(request, &scene, hit.outputs.clone());
                    self.register(update, None).await
                };
                Ok(Finished {
                    outcome: Outcome::Reused { scene_id },
                    output,
                    registered,
                })
            }
            MatchKind::Containment => {
                info!(scene_id = %scene_id, "Reusing scene outputs");
                let clipped = self.clip(request, &hit.outputs).await?;
                let mut outputs = OutputMap::new();
                outputs.insert(OUTPUT_CLIPPED.to_string(), clipped.clone());
                let update = scene_update(request, &scene, outputs);
                let registered = self.register(update, Some(clipped.clone())).await;
                Ok(Finished {
                    outcome: Outcome::Reused { scene_id },
                    output: Some(clipped),
                    registered,
                })
            }
        }
    }

    /// Acquire, fetch ancillary data and run the correction. Runs inside a slot.
    async fn process_scene(
        &self,
        request: &ProcessingRequest,
        slot: usize,
    ) -> Result<(AcquiredScene, OutputMap), JobError> {
        let id = &request.request_id;
        let raw_dir = self.layout.raw_dir(id);
        let dem_dir = self.layout.dem_dir(id);
        let rtc_dir = self.layout.rtc_dir(id);
        for dir in [&raw_dir, &dem_dir, &rtc_dir] {
            create_dir(dir).await?;
        }

        let center = request.date.unwrap_or_else(Utc::now);
        let acquisition = &self.collaborators.acquisition;
        let acquire = AcquireInput {
            request_id: id.clone(),
            footprint: request.bounds,
            window: TimeWindow::around(center, self.config.search_window()),
            reference_date: request.date,
            phase: request.phase,
            dest_dir: raw_dir,
        };
        let scene = self
            .with_stage_retry(move || acquisition.acquire(acquire.clone()))
            .await?;
        info!(scene_id = %scene.scene_id, footprint = %scene.footprint, "Acquired source scene");

        let ancillary_source = &self.collaborators.ancillary;
        let fetch = AncillaryInput {
            request_id: id.clone(),
            footprint: scene.footprint,
            dest_dir: dem_dir,
        };
        let ancillary = self
            .with_stage_retry(move || ancillary_source.fetch_ancillary(fetch.clone()))
            .await?;
        debug!(path = %ancillary.display(), "Ancillary data ready");

        let base_outputs = self
            .collaborators
            .correction
            .run_correction(CorrectionInput {
                request_id: id.clone(),
                scene: scene.clone(),
                ancillary,
                output_dir: rtc_dir,
                slot,
            })
            .await?;
        info!(scene_id = %scene.scene_id, outputs = base_outputs.len(), "Correction finished");

        Ok((scene, base_outputs))
    }

    /// Call a collaborator stage, retrying transient failures with the
    /// configured backoff.
    async fn with_stage_retry<T, F, Fut>(&self, mut call: F) -> CollaboratorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CollaboratorResult<T>>,
    {
        let policy = self.config.stage_retry();
        let mut attempt = 1;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let delay = match policy.delay_for_attempt(attempt) {
                Some(delay) if err.is_transient() => delay,
                _ => return Err(err),
            };
            warn!(
                stage = %err.stage(),
                attempt,
                max_attempts = policy.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Stage failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn clip(
        &self,
        request: &ProcessingRequest,
        outputs: &OutputMap,
    ) -> Result<PathBuf, JobError> {
        let destination = self.layout.clipped_path(&request.request_id);
        let clipped = self
            .collaborators
            .clipper
            .produce_clipped(ClipInput {
                request_id: request.request_id.clone(),
                outputs: outputs.clone(),
                reference: request.chip_path.clone(),
                footprint: request.bounds,
                destination,
            })
            .await?;
        debug!(path = %clipped.display(), "Clipped product written");
        Ok(clipped)
    }

    /// Write the chip sidecar (when a clipped product was produced) and
    /// register the update. Returns whether the registry now holds the chip.
    async fn register(&self, update: SceneUpdate, clipped: Option<PathBuf>) -> bool {
        let store = self.store.clone();
        let scene_id = update.scene_id.clone();

        let written = tokio::task::spawn_blocking(move || {
            if let Some(clipped) = clipped {
                write_sidecar(&update, &clipped);
            }
            store.register(&update)
        })
        .await;

        match written {
            Ok(true) => true,
            Ok(false) => {
                warn!(scene_id = %scene_id, "Processing succeeded but the registry update failed");
                false
            }
            Err(e) => {
                warn!(scene_id = %scene_id, error = %e, "Registry update task failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("store", &self.store)
            .field("layout", &self.layout)
            .field("config", &self.config)
            .field("slots", &self.slots.len())
            .finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn chip_update(request: &ProcessingRequest, clipped: &Path) -> ChipUpdate {
    let mut outputs = OutputMap::new();
    outputs.insert(OUTPUT_CLIPPED.to_string(), clipped.to_path_buf());
    ChipUpdate {
        chip_id: request.request_id.clone(),
        bounds: request.bounds,
        outputs,
    }
}

/// Update adding the request as a chip of an existing scene.
fn scene_update(
    request: &ProcessingRequest,
    scene: &SceneRecord,
    chip_outputs: OutputMap,
) -> SceneUpdate {
    SceneUpdate {
        scene_id: scene.scene_id.clone(),
        footprint: scene.footprint,
        acquisition_date: scene.acquisition_date,
        phase: request.phase,
        base_outputs: scene.base_outputs.clone(),
        chip: ChipUpdate {
            chip_id: request.request_id.clone(),
            bounds: request.bounds,
            outputs: chip_outputs,
        },
    }
}

fn write_sidecar(update: &SceneUpdate, clipped: &Path) {
    let sidecar = ChipSidecar {
        chip_id: update.chip.chip_id.clone(),
        scene_id: update.scene_id.clone(),
        chip_bounds: update.chip.bounds,
        scene_footprint: Some(update.footprint),
        acquisition_date: update.acquisition_date,
        disaster_phase: update.phase,
        base_outputs: update.base_outputs.clone(),
        created_at: Utc::now(),
    };
    let path = OutputLayout::sidecar_path(clipped);
    if let Err(e) = sidecar.write(&path) {
        warn!(path = %path.display(), error = %e, "Failed to write chip sidecar");
    }
}

async fn create_dir(path: &Path) -> Result<(), JobError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| JobError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// The per-request outcome event.
fn log_outcome(record: &JobRecord) {
    match &record.outcome {
        Outcome::Failed { reason } => info!(
            request_id = %record.request_id,
            outcome = record.outcome.label(),
            duration_ms = record.duration_ms,
            slot = record.slot,
            reason = %reason,
            "Request finished"
        ),
        Outcome::Reused { scene_id } | Outcome::Completed { scene_id } => info!(
            request_id = %record.request_id,
            outcome = record.outcome.label(),
            duration_ms = record.duration_ms,
            slot = record.slot,
            scene_id = %scene_id,
            registered = record.registered,
            "Request finished"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CommandCollaborators, CommandSet};
    use crate::config::{MatchConfig, StoreConfig};
    use crate::geo::BoundingBox;
    use crate::validation::FileValidator;
    use tempfile::TempDir;

    fn dispatcher(root: &Path, config: DispatchConfig) -> Result<Dispatcher, DispatchError> {
        let layout = OutputLayout::new(root);
        let store = RegistryStore::for_layout(&layout, StoreConfig::default());
        let matcher = Matcher::new(
            MatchConfig::default(),
            Arc::new(FileValidator::with_header_inspector(["clipped"])),
        );
        let collaborators =
            Collaborators::from_shared(Arc::new(CommandCollaborators::new(CommandSet::default())));
        Dispatcher::new(store, matcher, collaborators, config)
    }

    fn request(id: &str) -> ProcessingRequest {
        ProcessingRequest::new(
            format!("/chips/{}.tif", id),
            BoundingBox::new(10.5, 10.5, 11.0, 11.0).unwrap(),
            None,
        )
    }

    #[test]
    fn test_zero_slots_rejected() {
        let temp = TempDir::new().unwrap();
        let result = dispatcher(temp.path(), DispatchConfig::new().with_slots(0));
        assert!(matches!(result, Err(DispatchError::InvalidConfig(_))));

        let result = dispatcher(
            temp.path(),
            DispatchConfig::new().with_slots(2).with_workers(0),
        );
        assert!(matches!(result, Err(DispatchError::InvalidConfig(_))));
    }

    #[test]
    fn test_new_creates_shared_directories() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(temp.path(), DispatchConfig::default()).unwrap();
        assert!(dispatcher.layout().final_dir().is_dir());
        assert!(dispatcher.layout().logs_dir().is_dir());
    }

    #[tokio::test]
    async fn test_collaborator_failure_leaves_registry_untouched() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(temp.path(), DispatchConfig::default()).unwrap();

        let outcome = dispatcher.submit(request("chip_a")).await;

        match outcome {
            Outcome::Failed { reason } => assert!(reason.contains("acquire")),
            other => panic!("unexpected outcome: {other}"),
        }
        assert!(dispatcher.store().load().is_empty());
        assert_eq!(dispatcher.slots().occupied(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_batch_records_every_request() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(temp.path(), DispatchConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = dispatcher
            .run_batch(vec![request("a"), request("b"), request("c")], cancel)
            .await;

        assert_eq!(report.failed, 3);
        assert!(report
            .jobs
            .iter()
            .all(|j| j.outcome == Outcome::failed(CANCELLED_REASON)));
        assert_eq!(
            report.jobs.iter().map(|j| j.slot).collect::<Vec<_>>(),
            vec![0, 1, 0]
        );
        assert!(dispatcher.layout().summary_path().is_file());
    }
}
