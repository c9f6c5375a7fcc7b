//! Integration tests for the job dispatcher.
//!
//! A mock pipeline stands in for the external collaborators. It writes tiny
//! Float32 rasters, like the real correction and clipping stages, so the
//! validation gate runs against actual files, records
//! every stage it is asked to run, and measures how many correction runs
//! overlap.
//!
//! Run with: `cargo test --test dispatcher_integration`

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tempfile::TempDir;
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::TiffEncoder;
use tiff::tags::{PhotometricInterpretation, SampleFormat};
use tokio_util::sync::CancellationToken;

use sarlayer::collaborators::{
    AcquireInput, AcquiredScene, AcquisitionSource, AncillaryInput, AncillarySource, BoxFuture,
    ClipInput, Clipper, CollaboratorError, CollaboratorResult, Collaborators, CorrectionInput,
    CorrectionRunner, Stage,
};
use sarlayer::config::{DispatchConfig, MatchConfig, StageRetry, StoreConfig};
use sarlayer::dispatch::{BatchReport, Dispatcher, Outcome, ProcessingRequest};
use sarlayer::geo::BoundingBox;
use sarlayer::layout::OutputLayout;
use sarlayer::matcher::Matcher;
use sarlayer::registry::{
    ChipSidecar, DisasterPhase, OutputMap, RegistryStore, OUTPUT_CLIPPED, OUTPUT_VH, OUTPUT_VV,
};
use sarlayer::validation::FileValidator;

// ============================================================================
// Mock Pipeline
// ============================================================================

/// VV and VH stacked as two Float32 bands.
struct DualBandFloat;

impl ColorType for DualBandFloat {
    type Inner = f32;
    const TIFF_VALUE: PhotometricInterpretation = PhotometricInterpretation::BlackIsZero;
    const BITS_PER_SAMPLE: &'static [u16] = &[32, 32];
    const SAMPLE_FORMAT: &'static [SampleFormat] = &[SampleFormat::IEEEFP; 2];

    fn horizontal_predict(_: &[f32], _: &mut Vec<f32>) {
        unreachable!()
    }
}

fn write_raster(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    TiffEncoder::new(File::create(path).unwrap())
        .unwrap()
        .write_image::<colortype::Gray32Float>(4, 4, &[0.07f32; 16])
        .unwrap();
}

fn write_dual_band_raster(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    TiffEncoder::new(File::create(path).unwrap())
        .unwrap()
        .write_image::<DualBandFloat>(4, 4, &[0.07f32; 32])
        .unwrap();
}

#[derive(Default)]
struct MockPipeline {
    calls: Mutex<Vec<(Stage, String)>>,
    /// Stage to fail per request, and how many more times to fail it.
    failing: Mutex<HashMap<String, (Stage, usize)>>,
    correction_delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockPipeline {
    fn with_delay(delay: Duration) -> Self {
        Self {
            correction_delay: delay,
            ..Default::default()
        }
    }

    fn fail(&self, request_id: &str, stage: Stage) {
        self.fail_times(request_id, stage, usize::MAX);
    }

    fn fail_times(&self, request_id: &str, stage: Stage, times: usize) {
        self.failing
            .lock()
            .unwrap()
            .insert(request_id.to_string(), (stage, times));
    }

    fn enter(&self, stage: Stage, request_id: &str) -> CollaboratorResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((stage, request_id.to_string()));
        match self.failing.lock().unwrap().get_mut(request_id) {
            Some((failing, remaining)) if *failing == stage && *remaining > 0 => {
                *remaining -= 1;
                Err(CollaboratorError::Failed {
                    stage,
                    status: "exit status: 1".to_string(),
                    stderr: "mock failure".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn calls_for(&self, stage: Stage) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == stage)
            .count()
    }
}

impl AcquisitionSource for MockPipeline {
    fn acquire(&self, input: AcquireInput) -> BoxFuture<'_, CollaboratorResult<AcquiredScene>> {
        Box::pin(async move {
            self.enter(Stage::Acquire, &input.request_id)?;
            let local_path = input.dest_dir.join("scene.zip");
            fs::write(&local_path, b"zip").unwrap();
            Ok(AcquiredScene {
                scene_id: format!("scene_{}", input.request_id),
                footprint: input.footprint.expanded(1.0),
                acquisition_date: input.reference_date.map(|d| d - TimeDelta::days(19)),
                local_path,
            })
        })
    }
}

impl AncillarySource for MockPipeline {
    fn fetch_ancillary(&self, input: AncillaryInput) -> BoxFuture<'_, CollaboratorResult<PathBuf>> {
        Box::pin(async move {
            self.enter(Stage::Ancillary, &input.request_id)?;
            let path = input.dest_dir.join("dem.tif");
            write_raster(&path);
            Ok(path)
        })
    }
}

impl CorrectionRunner for MockPipeline {
    fn run_correction(
        &self,
        input: CorrectionInput,
    ) -> BoxFuture<'_, CollaboratorResult<OutputMap>> {
        Box::pin(async move {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.correction_delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            self.enter(Stage::Correction, &input.request_id)?;
            let vv = input.output_dir.join("OPERA_L2_RTC_VV.tif");
            let vh = input.output_dir.join("OPERA_L2_RTC_VH.tif");
            write_raster(&vv);
            write_raster(&vh);
            Ok(OutputMap::from([
                (OUTPUT_VV.to_string(), vv),
                (OUTPUT_VH.to_string(), vh),
            ]))
        })
    }
}

impl Clipper for MockPipeline {
    fn produce_clipped(&self, input: ClipInput) -> BoxFuture<'_, CollaboratorResult<PathBuf>> {
        Box::pin(async move {
            self.enter(Stage::Clip, &input.request_id)?;
            assert!(input.outputs.contains_key(OUTPUT_VV));
            write_dual_band_raster(&input.destination);
            Ok(input.destination)
        })
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    _temp: TempDir,
    chips: PathBuf,
    layout: OutputLayout,
    mock: Arc<MockPipeline>,
    dispatcher: Dispatcher,
}

fn fixture(slots: usize, workers: usize, mock: MockPipeline) -> Fixture {
    let temp = TempDir::new().unwrap();
    let chips = temp.path().join("chips");
    let layout = OutputLayout::new(temp.path().join("output"));

    let store = RegistryStore::for_layout(
        &layout,
        StoreConfig::new().with_retry_delay(Duration::from_millis(5)),
    );
    let matcher = Matcher::new(
        MatchConfig::default(),
        Arc::new(FileValidator::with_header_inspector([
            OUTPUT_VV,
            OUTPUT_VH,
            OUTPUT_CLIPPED,
        ])),
    );
    let mock = Arc::new(mock);
    let collaborators = Collaborators::from_shared(Arc::clone(&mock));
    let config = DispatchConfig::new()
        .with_slots(slots)
        .with_workers(workers)
        .with_stage_retry(StageRetry::new(3, Duration::from_millis(1)));
    let dispatcher = Dispatcher::new(store, matcher, collaborators, config).unwrap();

    Fixture {
        _temp: temp,
        chips,
        layout,
        mock,
        dispatcher,
    }
}

fn date(y: i32, m: u32, d: u32) -> Option<DateTime<Utc>> {
    Some(Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap())
}

impl Fixture {
    fn request(&self, id: &str, bounds: [f64; 4], phase: DisasterPhase) -> ProcessingRequest {
        let chip_path = self.chips.join(format!("{}.tif", id));
        write_raster(&chip_path);
        ProcessingRequest::new(
            chip_path,
            BoundingBox::from_slice(&bounds).unwrap(),
            date(2023, 1, 20),
        )
        .with_phase(phase)
    }
}

const CHIP_A: [f64; 4] = [10.5, 10.5, 11.0, 11.0];

// ============================================================================
// Reuse
// ============================================================================

#[tokio::test]
async fn test_miss_processes_then_exact_chip_reuses_without_collaborators() {
    let f = fixture(2, 2, MockPipeline::default());

    let first = f
        .dispatcher
        .submit(f.request("chip_a", CHIP_A, DisasterPhase::Pre))
        .await;
    assert_eq!(
        first,
        Outcome::Completed {
            scene_id: "scene_chip_a".to_string()
        }
    );
    let calls_after_first = f.mock.calls.lock().unwrap().len();
    assert_eq!(calls_after_first, 4);

    let near = [10.505, 10.495, 11.004, 11.0];
    let second = f
        .dispatcher
        .submit(f.request("chip_b", near, DisasterPhase::Pre))
        .await;
    assert_eq!(
        second,
        Outcome::Reused {
            scene_id: "scene_chip_a".to_string()
        }
    );
    assert_eq!(f.mock.calls.lock().unwrap().len(), calls_after_first);

    let registry = f.dispatcher.store().load();
    let scene = registry.get("scene_chip_a").unwrap();
    assert_eq!(scene.chips.len(), 2);
    assert_eq!(
        scene.chip("chip_b").unwrap().outputs,
        scene.chip("chip_a").unwrap().outputs
    );
}

#[tokio::test]
async fn test_containment_reuse_only_clips() {
    let f = fixture(2, 2, MockPipeline::default());
    f.dispatcher
        .submit(f.request("chip_a", CHIP_A, DisasterPhase::Pre))
        .await;

    let inside = [11.2, 11.2, 11.6, 11.6];
    let outcome = f
        .dispatcher
        .submit(f.request("chip_c", inside, DisasterPhase::Unknown))
        .await;

    assert_eq!(
        outcome,
        Outcome::Reused {
            scene_id: "scene_chip_a".to_string()
        }
    );
    assert_eq!(f.mock.calls_for(Stage::Acquire), 1);
    assert_eq!(f.mock.calls_for(Stage::Clip), 2);

    let clipped = f.layout.clipped_path("chip_c");
    assert!(clipped.is_file());
    let sidecar = ChipSidecar::read(&OutputLayout::sidecar_path(&clipped)).unwrap();
    assert_eq!(sidecar.scene_id, "scene_chip_a");
    assert_eq!(sidecar.chip_id, "chip_c");
}

#[tokio::test]
async fn test_opposite_phase_is_never_reused() {
    let f = fixture(2, 2, MockPipeline::default());
    f.dispatcher
        .submit(f.request("chip_pre", CHIP_A, DisasterPhase::Pre))
        .await;

    let outcome = f
        .dispatcher
        .submit(f.request("chip_post", CHIP_A, DisasterPhase::Post))
        .await;

    assert_eq!(
        outcome,
        Outcome::Completed {
            scene_id: "scene_chip_post".to_string()
        }
    );
    assert_eq!(f.mock.calls_for(Stage::Acquire), 2);

    let registry = f.dispatcher.store().load();
    assert_eq!(
        registry.get("scene_chip_post").unwrap().disaster_phase,
        Some(DisasterPhase::Post)
    );
}

#[tokio::test]
async fn test_stale_entries_fall_back_to_processing() {
    let f = fixture(2, 2, MockPipeline::default());
    f.dispatcher
        .submit(f.request("chip_a", CHIP_A, DisasterPhase::Pre))
        .await;

    // Clipped product gone: the scene still covers the chip.
    fs::remove_file(f.layout.clipped_path("chip_a")).unwrap();
    let outcome = f
        .dispatcher
        .submit(f.request("chip_b", CHIP_A, DisasterPhase::Pre))
        .await;
    assert_eq!(
        outcome,
        Outcome::Reused {
            scene_id: "scene_chip_a".to_string()
        }
    );
    assert_eq!(f.mock.calls_for(Stage::Acquire), 1);

    // Base outputs gone as well: nothing reusable is left.
    fs::remove_dir_all(f.layout.rtc_dir("chip_a")).unwrap();
    fs::remove_file(f.layout.clipped_path("chip_b")).unwrap();
    let outcome = f
        .dispatcher
        .submit(f.request("chip_c", CHIP_A, DisasterPhase::Pre))
        .await;
    assert_eq!(
        outcome,
        Outcome::Completed {
            scene_id: "scene_chip_c".to_string()
        }
    );
    assert_eq!(f.mock.calls_for(Stage::Acquire), 2);
}

// ============================================================================
// Batches
// ============================================================================

fn far_apart(f: &Fixture, count: usize) -> Vec<ProcessingRequest> {
    (0..count)
        .map(|i| {
            let west = -170.0 + 20.0 * i as f64;
            f.request(
                &format!("chip_{:02}", i),
                [west, 0.0, west + 0.5, 0.5],
                DisasterPhase::Pre,
            )
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slot_exclusivity_under_load() {
    let f = fixture(2, 6, MockPipeline::with_delay(Duration::from_millis(30)));
    let requests = far_apart(&f, 8);

    let report = f
        .dispatcher
        .run_batch(requests, CancellationToken::new())
        .await;

    assert_eq!(report.completed, 8);
    assert_eq!(f.mock.max_active.load(Ordering::SeqCst), 2);
    assert_eq!(f.dispatcher.slots().high_water_mark(), 2);
    assert_eq!(f.dispatcher.slots().occupied(), 0);
    assert_eq!(f.dispatcher.store().load().len(), 8);
}

#[tokio::test]
async fn test_failure_is_isolated_and_summarized() {
    let mock = MockPipeline::default();
    mock.fail("chip_01", Stage::Correction);
    let f = fixture(2, 2, mock);
    let requests = far_apart(&f, 3);

    let mut finished = Vec::new();
    let report = f
        .dispatcher
        .run_batch_with_progress(requests, CancellationToken::new(), |job| {
            finished.push(job.request_id.clone())
        })
        .await;

    assert_eq!((report.completed, report.reused, report.failed), (2, 0, 1));
    assert_eq!(finished.len(), 3);
    assert_eq!(f.mock.calls_for(Stage::Correction), 3);

    let failed = report.job("chip_01").unwrap();
    match &failed.outcome {
        Outcome::Failed { reason } => assert!(reason.contains("correction")),
        other => panic!("unexpected outcome: {other}"),
    }
    assert!(!failed.registered);

    let registry = f.dispatcher.store().load();
    assert!(!registry.contains("scene_chip_01"));
    assert!(registry.contains("scene_chip_00"));
    assert!(registry.contains("scene_chip_02"));

    let on_disk: BatchReport =
        serde_json::from_slice(&fs::read(f.layout.summary_path()).unwrap()).unwrap();
    assert_eq!(on_disk.total_requests, 3);
    assert_eq!(on_disk.jobs.len(), 3);
    assert_eq!(on_disk.failed, 1);
}

#[tokio::test]
async fn test_requests_of_one_batch_reuse_each_other() {
    let f = fixture(1, 1, MockPipeline::default());
    let requests = vec![
        f.request("chip_a", CHIP_A, DisasterPhase::Pre),
        f.request("chip_b", [10.6, 10.6, 10.9, 10.9], DisasterPhase::Pre),
    ];

    let report = f
        .dispatcher
        .run_batch(requests, CancellationToken::new())
        .await;

    assert_eq!((report.completed, report.reused), (1, 1));
    assert_eq!(f.mock.calls_for(Stage::Acquire), 1);
    assert!(report.jobs.iter().all(|job| job.registered));
}

// ============================================================================
// Stage retries
// ============================================================================

#[tokio::test]
async fn test_transient_acquire_failure_is_retried() {
    let mock = MockPipeline::default();
    mock.fail_times("chip_a", Stage::Acquire, 1);
    let f = fixture(1, 1, mock);

    let outcome = f
        .dispatcher
        .submit(f.request("chip_a", CHIP_A, DisasterPhase::Pre))
        .await;

    assert_eq!(
        outcome,
        Outcome::Completed {
            scene_id: "scene_chip_a".to_string()
        }
    );
    assert_eq!(f.mock.calls_for(Stage::Acquire), 2);
    assert_eq!(f.mock.calls_for(Stage::Ancillary), 1);
    assert!(f.dispatcher.store().load().contains("scene_chip_a"));
}

#[tokio::test]
async fn test_ancillary_gives_up_after_configured_attempts() {
    let mock = MockPipeline::default();
    mock.fail("chip_a", Stage::Ancillary);
    let f = fixture(1, 1, mock);

    let outcome = f
        .dispatcher
        .submit(f.request("chip_a", CHIP_A, DisasterPhase::Pre))
        .await;

    match outcome {
        Outcome::Failed { reason } => assert!(reason.contains("ancillary")),
        other => panic!("unexpected outcome: {other}"),
    }
    assert_eq!(f.mock.calls_for(Stage::Ancillary), 3);
    assert_eq!(f.mock.calls_for(Stage::Correction), 0);
    assert_eq!(f.dispatcher.slots().occupied(), 0);
}
