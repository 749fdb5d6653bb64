#![forbid(unsafe_code)]

//! In-memory registry mapping job ids to their latest progress snapshot.
//!
//! The registry is deliberately not a module-level global: the server builds
//! one and shares it via `Arc`, and tests build their own. Nothing persists;
//! a restart loses in-flight jobs, which is fine for short-lived downloads
//! polled promptly by the UI.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FetchError;

/// Lifecycle of a download job. `starting` and repeated `downloading` writes
/// are normal; `completed` and `error` are terminal sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Downloading,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// Latest known state of one job, serialized verbatim by the polling
/// endpoint. The artifact path never leaves the process.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub percentage: f64,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed: f64,
    pub eta: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub artifact: Option<PathBuf>,
}

impl JobSnapshot {
    /// State every job is born in, before the transfer task reports anything.
    pub fn starting() -> Self {
        Self {
            status: JobStatus::Starting,
            percentage: 0.0,
            downloaded: 0,
            total: None,
            speed: 0.0,
            eta: None,
            speed_formatted: None,
            eta_formatted: None,
            error: None,
            artifact: None,
        }
    }
}

/// Process-wide job table. Writers are the per-job transfer tasks, readers
/// are the polling handlers; one lock guards the map so readers never see a
/// half-written snapshot. Jobs never touch each other's entries.
pub struct ProgressRegistry {
    jobs: RwLock<HashMap<String, JobSnapshot>>,
    counter: AtomicU64,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        // Seeding from the clock keeps ids from a restarted process distinct
        // from artifacts a previous run may have left on disk.
        let seed = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self {
            jobs: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(seed << 12),
        }
    }

    /// Fresh, never-reused job identifier.
    pub fn next_job_id(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("dl-{id:x}")
    }

    /// Registers a new job. Ids come from [`Self::next_job_id`], so an
    /// existing entry under the same id would be a bug; it is replaced.
    pub fn create(&self, id: &str, snapshot: JobSnapshot) {
        self.jobs.write().insert(id.to_owned(), snapshot);
    }

    /// Applies `f` to the job's snapshot. Writes after a terminal state are
    /// ignored, and the percentage never decreases while downloading.
    /// Returns whether the update was applied.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut JobSnapshot)) -> bool {
        let mut jobs = self.jobs.write();
        let Some(snapshot) = jobs.get_mut(id) else {
            return false;
        };
        if snapshot.status.is_terminal() {
            return false;
        }
        let floor = snapshot.percentage;
        let was_downloading = snapshot.status == JobStatus::Downloading;
        f(snapshot);
        if was_downloading
            && snapshot.status == JobStatus::Downloading
            && snapshot.percentage < floor
        {
            snapshot.percentage = floor;
        }
        true
    }

    pub fn get(&self, id: &str) -> Result<JobSnapshot, FetchError> {
        self.jobs.read().get(id).cloned().ok_or(FetchError::NotFound)
    }

    /// Purges a job record, e.g. after its artifact has been delivered.
    pub fn remove(&self, id: &str) -> Option<JobSnapshot> {
        self.jobs.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Scales bytes/second into the `B/s` / `KB/s` / `MB/s` strings the UI shows.
pub fn format_speed(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    if bytes_per_sec >= MB {
        format!("{:.1} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.1} KB/s", bytes_per_sec / KB)
    } else {
        format!("{:.0} B/s", bytes_per_sec.max(0.0))
    }
}

/// Renders seconds remaining as `Xm Ys`, or just `Xs` under a minute.
pub fn format_eta(seconds: u64) -> String {
    if seconds >= 60 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{seconds}s")
    }
}
