#![forbid(unsafe_code)]

//! Download job execution: turns an accepted request into a background
//! yt-dlp transfer whose progress lands in the registry.
//!
//! Submission is synchronous and cheap; everything slow happens in a spawned
//! task. Each job gets its own channel with a single consumer writing to the
//! registry, so snapshot updates for a job are applied in order.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;

use crate::error::FetchError;
use crate::progress::{JobSnapshot, JobStatus, ProgressRegistry, format_eta, format_speed};
use crate::resolver::validate_url;
use crate::storage::ArtifactStore;
use crate::ytdlp::{self, TransferEvent};

/// What a client asked to download. The `format_id` must come from a prior
/// resolution of the same URL.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format_id: String,
    pub audio_only: bool,
    pub include_subtitles: bool,
    pub subtitle_lang: Option<String>,
}

/// One stage update flowing from the transfer's stdout to the registry.
enum JobEvent {
    Transfer(TransferEvent),
    Postprocessing,
}

#[derive(Clone)]
pub struct JobRunner {
    registry: Arc<ProgressRegistry>,
    store: ArtifactStore,
    cookies_file: Option<PathBuf>,
}

impl JobRunner {
    pub fn new(
        registry: Arc<ProgressRegistry>,
        store: ArtifactStore,
        cookies_file: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            store,
            cookies_file,
        }
    }

    /// Validates the request, registers the job, and spawns the transfer.
    /// Returns the job id immediately; progress arrives via the registry.
    pub fn submit(&self, request: DownloadRequest) -> Result<String, FetchError> {
        validate_url(&request.url)?;
        if request.format_id.trim().is_empty() {
            return Err(FetchError::UnsupportedFormat(
                "no format was selected".into(),
            ));
        }

        let id = self.registry.next_job_id();
        self.registry.create(&id, JobSnapshot::starting());
        tracing::info!("job {id}: accepted download of {}", request.url);

        let runner = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            runner.run(&job_id, request).await;
        });

        Ok(id)
    }

    async fn run(&self, id: &str, request: DownloadRequest) {
        match self.transfer(id, &request).await {
            Ok(artifact) => {
                tracing::info!("job {id}: completed, artifact {}", artifact.display());
                self.registry.update(id, |snap| {
                    snap.status = JobStatus::Completed;
                    snap.percentage = 100.0;
                    snap.artifact = Some(artifact);
                });
            }
            Err(err) => {
                tracing::warn!("job {id}: failed: {err}");
                self.registry.update(id, |snap| {
                    snap.status = JobStatus::Error;
                    snap.error = Some(err.to_string());
                });
            }
        }
    }

    /// Runs yt-dlp to completion, streaming its stdout into registry updates,
    /// and resolves the artifact path afterwards.
    async fn transfer(&self, id: &str, request: &DownloadRequest) -> Result<PathBuf, FetchError> {
        let mut command = ytdlp::command();
        command
            .arg("-f")
            .arg(&request.format_id)
            .arg("-o")
            .arg(self.store.output_template(id))
            .arg("--newline")
            .arg("--no-warnings")
            .arg("--progress-template")
            .arg(ytdlp::PROGRESS_TEMPLATE);

        if request.audio_only {
            command
                .arg("-x")
                .arg("--audio-format")
                .arg("mp3")
                .arg("--audio-quality")
                .arg("192K");
        }
        if request.include_subtitles
            && let Some(lang) = request.subtitle_lang.as_deref().filter(|l| !l.is_empty())
        {
            command
                .arg("--write-subs")
                .arg("--sub-langs")
                .arg(lang)
                .arg("--sub-format")
                .arg("vtt");
        }
        if let Some(cookies) = &self.cookies_file
            && cookies.exists()
        {
            command.arg("--cookies").arg(cookies);
        }

        let mut child = command
            .arg(&request.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| FetchError::Transfer(format!("could not launch yt-dlp: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Transfer("yt-dlp stdout was not captured".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::Transfer("yt-dlp stderr was not captured".into()))?;

        // Drain stderr concurrently so a chatty extractor cannot block on a
        // full pipe while we read stdout.
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let _ = stderr.read_to_string(&mut buffer).await;
            buffer
        });

        let (events_tx, mut events_rx) = mpsc::channel::<JobEvent>(64);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let event = if let Some(event) = ytdlp::parse_progress_line(&line) {
                    JobEvent::Transfer(event)
                } else if ytdlp::is_postprocess_line(&line) {
                    JobEvent::Postprocessing
                } else {
                    continue;
                };
                if events_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        while let Some(event) = events_rx.recv().await {
            self.apply(id, event);
        }
        let _ = reader_task.await;

        let status = child
            .wait()
            .await
            .map_err(|err| FetchError::Transfer(format!("waiting for yt-dlp failed: {err}")))?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(ytdlp::classify_transfer_failure(&stderr_text));
        }

        self.store.find(id).map_err(|_| {
            FetchError::Transfer("the transfer finished but produced no file".into())
        })
    }

    fn apply(&self, id: &str, event: JobEvent) {
        match event {
            JobEvent::Transfer(TransferEvent::Data {
                downloaded,
                total,
                speed,
                eta,
            }) => {
                self.registry.update(id, |snap| {
                    snap.status = JobStatus::Downloading;
                    snap.downloaded = downloaded;
                    snap.total = total;
                    if let Some(total) = total.filter(|total| *total > 0) {
                        snap.percentage = (downloaded as f64 / total as f64 * 100.0).min(100.0);
                    }
                    snap.speed = speed.unwrap_or(0.0);
                    snap.speed_formatted = speed.map(format_speed);
                    snap.eta = eta;
                    snap.eta_formatted = eta.map(format_eta);
                });
            }
            JobEvent::Transfer(TransferEvent::Finished) | JobEvent::Postprocessing => {
                self.registry.update(id, |snap| {
                    snap.status = JobStatus::Processing;
                    snap.speed = 0.0;
                    snap.speed_formatted = None;
                    snap.eta = None;
                    snap.eta_formatted = None;
                });
            }
        }
    }
}
