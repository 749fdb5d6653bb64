#![forbid(unsafe_code)]

//! Boundary around the `yt-dlp` executable: command construction, the raw
//! JSON shapes it emits, progress-line parsing, and failure classification.
//!
//! Everything that knows yt-dlp's calling convention lives here so the
//! resolver and the job runner stay testable against a stub binary.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::FetchError;

#[cfg(test)]
use std::sync::{Mutex, MutexGuard};

#[cfg(test)]
static YT_DLP_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = Mutex::new(());

/// Template handed to `--progress-template`; each progress line becomes one
/// JSON object on stdout.
pub const PROGRESS_TEMPLATE: &str = "download:%(progress)j";

pub fn command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = YT_DLP_STUB.lock().unwrap().clone() {
            return Command::new(path);
        }
    }
    Command::new("yt-dlp")
}

/// Swaps the real binary for a stub script. The returned guard serializes
/// stub users and restores the real binary on drop.
#[cfg(test)]
pub fn set_stub_path(path: PathBuf) -> StubGuard {
    let guard = STUB_USE_LOCK.lock().unwrap();
    *YT_DLP_STUB.lock().unwrap() = Some(path);
    StubGuard { lock: Some(guard) }
}

#[cfg(test)]
pub struct StubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for StubGuard {
    fn drop(&mut self) {
        *YT_DLP_STUB.lock().unwrap() = None;
        self.lock.take();
    }
}

/// Runs `yt-dlp --version` to fail loudly at startup when the tool is absent.
pub async fn ensure_available() -> anyhow::Result<()> {
    let status = command()
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => anyhow::bail!("yt-dlp is installed but returned a failure status"),
        Err(err) => anyhow::bail!("yt-dlp is not installed or not in PATH: {err}"),
    }
}

/// Subset of `yt-dlp --dump-single-json` the resolver reads. Everything is
/// optional because older or gated videos may lack fields.
#[derive(Debug, Deserialize)]
pub struct RawVideoInfo {
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub upload_date: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
    #[serde(default)]
    pub subtitles: Option<HashMap<String, Vec<RawSubtitle>>>,
}

#[derive(Debug, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub format_note: Option<String>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub abr: Option<f64>,
    pub filesize: Option<i64>,
    #[serde(rename = "filesize_approx")]
    pub filesize_approx: Option<i64>,
}

impl RawFormat {
    pub fn has_video(&self) -> bool {
        self.vcodec
            .as_deref()
            .is_some_and(|codec| !codec.eq_ignore_ascii_case("none"))
    }

    pub fn has_audio(&self) -> bool {
        self.acodec
            .as_deref()
            .is_some_and(|codec| !codec.eq_ignore_ascii_case("none"))
    }

    pub fn size(&self) -> Option<i64> {
        self.filesize.or(self.filesize_approx)
    }
}

#[derive(Debug, Deserialize)]
pub struct RawSubtitle {
    pub ext: Option<String>,
    pub name: Option<String>,
}

/// One event parsed from the transfer's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Periodic data event while bytes are moving.
    Data {
        downloaded: u64,
        total: Option<u64>,
        speed: Option<f64>,
        eta: Option<u64>,
    },
    /// The stream finished downloading; post-processing may follow.
    Finished,
}

#[derive(Deserialize)]
struct RawProgress {
    status: Option<String>,
    downloaded_bytes: Option<f64>,
    total_bytes: Option<f64>,
    total_bytes_estimate: Option<f64>,
    speed: Option<f64>,
    eta: Option<f64>,
}

/// Parses one stdout line produced under [`PROGRESS_TEMPLATE`]. Non-progress
/// lines (mux banners, warnings) yield `None`.
pub fn parse_progress_line(line: &str) -> Option<TransferEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let raw: RawProgress = serde_json::from_str(trimmed).ok()?;
    match raw.status.as_deref() {
        Some("finished") => Some(TransferEvent::Finished),
        Some("downloading") => Some(TransferEvent::Data {
            downloaded: raw.downloaded_bytes.unwrap_or(0.0).max(0.0) as u64,
            total: raw
                .total_bytes
                .or(raw.total_bytes_estimate)
                .filter(|total| *total > 0.0)
                .map(|total| total as u64),
            speed: raw.speed.filter(|speed| *speed > 0.0),
            eta: raw.eta.filter(|eta| *eta >= 0.0).map(|eta| eta as u64),
        }),
        _ => None,
    }
}

/// Post-processing banners yt-dlp prints between "finished" and exit: muxing,
/// audio extraction, container fixups.
pub fn is_postprocess_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("[Merger]")
        || trimmed.starts_with("[ExtractAudio]")
        || trimmed.starts_with("[VideoConvertor]")
        || trimmed.starts_with("[Fixup")
}

/// Gated-content phrases yt-dlp prints for sign-in, age, and region checks.
/// Classifying them here gives the API a typed `AccessDenied` instead of
/// leaving clients to match message substrings.
fn gated_reason(stderr: &str) -> Option<String> {
    let lower = stderr.to_lowercase();
    const MARKERS: &[&str] = &[
        "sign in to confirm",
        "age-restricted",
        "age restricted",
        "private video",
        "not available in your country",
        "geo restricted",
        "login required",
    ];
    MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
        .then(|| first_error_line(stderr))
}

/// yt-dlp prefixes fatal messages with `ERROR:`; prefer that line over the
/// whole stderr blob when building user-facing details.
fn first_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .find_map(|line| line.trim().strip_prefix("ERROR:"))
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| stderr.trim().to_string())
}

/// Maps a failed metadata fetch to the error taxonomy.
pub fn classify_resolve_failure(stderr: &str) -> FetchError {
    if let Some(reason) = gated_reason(stderr) {
        return FetchError::AccessDenied(reason);
    }
    FetchError::Resolution(first_error_line(stderr))
}

/// Maps a failed transfer to the error taxonomy. Stale format selections are
/// the common case worth distinguishing.
pub fn classify_transfer_failure(stderr: &str) -> FetchError {
    let lower = stderr.to_lowercase();
    if lower.contains("requested format is not available") || lower.contains("format not available")
    {
        return FetchError::UnsupportedFormat(first_error_line(stderr));
    }
    if let Some(reason) = gated_reason(stderr) {
        return FetchError::AccessDenied(reason);
    }
    FetchError::Transfer(first_error_line(stderr))
}
