#![forbid(unsafe_code)]

//! Cookie-file lifecycle for the extractor. The file itself is opaque; the
//! server only reports its presence/age and can trigger an out-of-band
//! refresh command (e.g. a headless browser export script).

use anyhow::{Result, bail};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};

/// Cookies exported from a browser session tend to go stale within a day.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Serialize)]
pub struct CookieStatus {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<u64>,
    pub needs_refresh: bool,
}

#[derive(Debug, Clone)]
pub struct CookieStore {
    path: PathBuf,
    max_age: Duration,
    refresh_cmd: Option<String>,
}

impl CookieStore {
    pub fn new(path: impl Into<PathBuf>, refresh_cmd: Option<String>) -> Self {
        Self {
            path: path.into(),
            max_age: DEFAULT_MAX_AGE,
            refresh_cmd,
        }
    }

    #[cfg(test)]
    fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Existence/age snapshot for the UI. A missing file always needs a
    /// refresh; an existing one only once it exceeds the maximum age.
    pub fn status(&self) -> CookieStatus {
        let age = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());

        match age {
            Some(age) => CookieStatus {
                exists: true,
                age_seconds: Some(age.as_secs()),
                needs_refresh: age >= self.max_age,
            },
            None => CookieStatus {
                exists: false,
                age_seconds: None,
                needs_refresh: true,
            },
        }
    }

    /// Kicks off the configured refresh command and returns immediately; the
    /// acquisition process runs detached and rewrites the cookie file on its
    /// own schedule. Clients re-poll `status()` to observe the result.
    pub fn refresh(&self) -> Result<()> {
        let Some(cmd) = &self.refresh_cmd else {
            bail!("no cookie refresh command configured (TUBEFETCH_COOKIE_REFRESH_CMD)");
        };

        tracing::info!("starting cookie refresh: {cmd}");
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .env("TUBEFETCH_COOKIES_FILE", &self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|err| anyhow::anyhow!("could not start cookie refresh command: {err}"))
    }
}
