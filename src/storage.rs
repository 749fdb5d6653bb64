#![forbid(unsafe_code)]

//! Temporary artifact storage under the download root.
//!
//! yt-dlp names output files itself (the title is only known server-side), so
//! every path it writes for a job starts with the job id. Lookup and cleanup
//! key off that prefix.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::FetchError;

/// Extensions yt-dlp leaves behind mid-transfer or for sidecar files; never
/// candidates for delivery.
const TRANSIENT_EXTENSIONS: &[&str] = &["part", "ytdl", "temp", "aria2", "json"];
const SIDECAR_EXTENSIONS: &[&str] = &["vtt", "srt", "ttml", "srv1", "srv2", "srv3"];

/// Artifacts are short-lived; anything older than this is swept.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating download root {}", self.root.display()))
    }

    /// Output template handed to yt-dlp so artifacts carry the job id prefix.
    pub fn output_template(&self, job_id: &str) -> String {
        self.root
            .join(format!("{job_id}_%(title)s.%(ext)s"))
            .to_string_lossy()
            .into_owned()
    }

    /// Locates the media artifact for a job. Subtitle sidecars share the id
    /// prefix, so when several files match the largest one wins.
    pub fn find(&self, job_id: &str) -> Result<PathBuf, FetchError> {
        let prefix = format!("{job_id}_");
        let entries = fs::read_dir(&self.root).map_err(|_| FetchError::NotFound)?;

        let mut best: Option<(u64, bool, PathBuf)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) {
                continue;
            }
            let ext = path
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            if TRANSIENT_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            let is_media = !SIDECAR_EXTENSIONS.contains(&ext.as_str());
            let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            let candidate = (size, is_media, path);
            best = match best {
                Some(current)
                    if (current.1, current.0) >= (candidate.1, candidate.0) =>
                {
                    Some(current)
                }
                _ => Some(candidate),
            };
        }

        best.map(|(_, _, path)| path).ok_or(FetchError::NotFound)
    }

    /// Removes every file belonging to a job, sidecars included.
    pub fn remove_job_files(&self, job_id: &str) {
        let prefix = format!("{job_id}_");
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix));
            if matches && path.is_file()
                && let Err(err) = fs::remove_file(&path)
            {
                tracing::warn!("could not remove {}: {err}", path.display());
            }
        }
    }

    /// Deletes artifacts whose modification time is older than `max_age`.
    /// Runs at startup and periodically; returns how many files went away.
    pub fn sweep_older_than(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("reading download root {}", self.root.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age >= max_age {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        tracing::info!("swept stale artifact {}", path.display());
                        removed += 1;
                    }
                    Err(err) => tracing::warn!("could not sweep {}: {err}", path.display()),
                }
            }
        }
        Ok(removed)
    }
}
