//! Per-request outcomes and the running batch summary.
//!
//! The summary (`processing_log.json`) is rewritten atomically after every
//! finished request, so a crash mid-batch leaves a consistent record of
//! everything completed so far:
//!
//! ```json
//! {
//!   "start_time": "2024-05-01T10:00:00Z",
//!   "total_requests": 3,
//!   "completed": 1, "reused": 1, "failed": 1,
//!   "jobs": [
//!     { "request_id": "chip_a", "status": "reused", "scene_id": "S1...", "slot": 0, ... },
//!     { "request_id": "chip_b", "status": "failed", "reason": "acquire: ...", "slot": 1, ... }
//!   ]
//! }
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persist;

/// Result of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// An existing result was reused.
    Reused { scene_id: String },
    /// The request was processed from scratch.
    Completed { scene_id: String },
    /// The request failed; nothing was registered.
    Failed { reason: String },
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
        }
    }

    /// `reused`, `completed` or `failed`.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Reused { .. } => "reused",
            Outcome::Completed { .. } => "completed",
            Outcome::Failed { .. } => "failed",
        }
    }

    pub fn scene_id(&self) -> Option<&str> {
        match self {
            Outcome::Reused { scene_id } | Outcome::Completed { scene_id } => Some(scene_id),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Failed { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Reused { scene_id } => write!(f, "reused {}", scene_id),
            Outcome::Completed { scene_id } => write!(f, "completed {}", scene_id),
            Outcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Record of one finished request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub request_id: String,
    pub chip_path: PathBuf,
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Slot the request was assigned to.
    pub slot: usize,
    pub duration_ms: u64,
    /// The chip product, when one was produced or reused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// Whether the registry holds this chip; false for failures and for
    /// successful processing whose registry update did not go through.
    #[serde(default = "default_true")]
    pub registered: bool,
}

fn default_true() -> bool {
    true
}

/// Outcomes of a batch, in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub start_time: DateTime<Utc>,
    pub total_requests: usize,
    pub completed: usize,
    pub reused: usize,
    pub failed: usize,
    pub jobs: Vec<JobRecord>,
}

impl BatchReport {
    pub fn new(total_requests: usize) -> Self {
        Self {
            start_time: Utc::now(),
            total_requests,
            completed: 0,
            reused: 0,
            failed: 0,
            jobs: Vec::with_capacity(total_requests),
        }
    }

    /// Add a finished request and update the counts.
    pub fn record(&mut self, job: JobRecord) {
        match job.outcome {
            Outcome::Reused { .. } => self.reused += 1,
            Outcome::Completed { .. } => self.completed += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
        self.jobs.push(job);
    }

    /// Requests that finished successfully (completed or reused).
    pub fn succeeded(&self) -> usize {
        self.completed + self.reused
    }

    /// Record for a request id.
    pub fn job(&self, request_id: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.request_id == request_id)
    }
}

/// Keeps a [`BatchReport`] mirrored to disk.
#[derive(Debug)]
pub struct SummaryWriter {
    path: PathBuf,
    report: BatchReport,
}

impl SummaryWriter {
    pub fn new(path: impl Into<PathBuf>, total_requests: usize) -> Self {
        Self {
            path: path.into(),
            report: BatchReport::new(total_requests),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn report(&self) -> &BatchReport {
        &self.report
    }

    /// Record a job and atomically rewrite the summary file.
    ///
    /// The job is kept in memory even if the write fails.
    pub fn record(&mut self, job: JobRecord) -> io::Result<()> {
        self.report.record(job);
        self.flush()
    }

    /// Atomically write the current summary.
    pub fn flush(&self) -> io::Result<()> {
        persist::write_json_atomic(&self.path, &self.report)
    }

    pub fn into_report(self) -> BatchReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn job(id: &str, outcome: Outcome) -> JobRecord {
        JobRecord {
            request_id: id.to_string(),
            chip_path: PathBuf::from(format!("/chips/{}.tif", id)),
            outcome,
            slot: 0,
            duration_ms: 12,
            output: None,
            registered: true,
        }
    }

    #[test]
    fn test_counts() {
        let mut report = BatchReport::new(3);
        report.record(job("a", Outcome::Reused { scene_id: "S1".into() }));
        report.record(job("b", Outcome::Completed { scene_id: "S2".into() }));
        report.record(job("c", Outcome::failed("boom")));

        assert_eq!((report.reused, report.completed, report.failed), (1, 1, 1));
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.job("c").unwrap().outcome.label(), "failed");
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let value = serde_json::to_value(job("a", Outcome::failed("no scene"))).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["reason"], "no scene");
        assert_eq!(value["request_id"], "a");
        assert!(value.get("output").is_none());
    }

    #[test]
    fn test_writer_rewrites_file_after_each_record() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("processing_log.json");
        let mut writer = SummaryWriter::new(&path, 2);

        writer
            .record(job("a", Outcome::Completed { scene_id: "S1".into() }))
            .unwrap();
        let first: BatchReport = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(first.jobs.len(), 1);
        assert_eq!(first.total_requests, 2);

        writer
            .record(job("b", Outcome::Reused { scene_id: "S1".into() }))
            .unwrap();
        let second: BatchReport = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(second, *writer.report());
    }
}
