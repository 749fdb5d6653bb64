#![forbid(unsafe_code)]

//! Error taxonomy shared by the resolver, the job runner, and the HTTP layer.

use thiserror::Error;

/// Everything that can go wrong between receiving a URL and handing the
/// finished file back. Validation failures surface synchronously; transfer
/// failures are captured into the job's terminal `error` state and only show
/// up via polling.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The URL failed the local shape check. No subprocess was launched.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// yt-dlp could not resolve metadata (network failure, malformed
    /// response, unsupported site).
    #[error("could not resolve video: {0}")]
    Resolution(String),

    /// The extractor reported gated content (sign-in, age or region checks).
    /// Typed here so the UI can prompt a cookie refresh without matching on
    /// message substrings.
    #[error("access denied by the source site: {0}")]
    AccessDenied(String),

    /// The selected format id was rejected at download time, e.g. a stale
    /// selection from an earlier resolution.
    #[error("requested format is not available: {0}")]
    UnsupportedFormat(String),

    /// Network or disk failure mid-download.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// File retrieval was attempted before the job completed.
    #[error("download is not finished yet")]
    NotReady,

    /// Unknown job id, purged record, or missing artifact.
    #[error("download not found")]
    NotFound,
}

impl FetchError {
    /// Short machine-readable tag carried next to the human detail in API
    /// error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl(_) => "invalid_url",
            FetchError::Resolution(_) => "resolution_error",
            FetchError::AccessDenied(_) => "access_denied",
            FetchError::UnsupportedFormat(_) => "unsupported_format",
            FetchError::Transfer(_) => "transfer_error",
            FetchError::NotReady => "not_ready",
            FetchError::NotFound => "not_found",
        }
    }
}
