#![forbid(unsafe_code)]

//! Shared library for the tubefetch binaries.
//!
//! The backend delegates all site parsing and media transfer to `yt-dlp`; the
//! modules here are the glue around it: URL validation and metadata
//! normalization, a progress registry polled by the HTTP layer, the background
//! job runner, temporary artifact storage, and the cookie-file lifecycle.

pub mod config;
pub mod cookies;
pub mod error;
pub mod logging;
pub mod progress;
pub mod resolver;
pub mod runner;
pub mod security;
pub mod storage;
pub mod ytdlp;
