#![forbid(unsafe_code)]

//! Format resolution: validate a submitted URL locally, then ask yt-dlp for
//! metadata and normalize it into the fixed schema the UI consumes.

use chrono::NaiveDate;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use crate::error::FetchError;
use crate::ytdlp::{self, RawVideoInfo};

/// Hosts we accept URLs for. The extractor supports far more sites, but this
/// deployment only fronts YouTube.
const ALLOWED_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
    "youtube-nocookie.com",
    "www.youtube-nocookie.com",
];

/// Resolution blocks the HTTP response, so it carries a bounded timeout.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(45);

const MIN_VIDEO_HEIGHT: i64 = 144;
const MIN_AUDIO_BITRATE: f64 = 64.0;
const MAX_VIDEO_FORMATS: usize = 10;
const MAX_AUDIO_FORMATS: usize = 5;
const MAX_SUBTITLES: usize = 10;
const MAX_DESCRIPTION_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    Video,
    Audio,
}

/// One selectable rendition. The `format_id` is opaque to clients and must be
/// passed back verbatim when starting a download.
#[derive(Debug, Clone, Serialize)]
pub struct VideoFormat {
    pub format_id: String,
    pub quality: String,
    pub ext: String,
    /// 0 when the extractor does not know the size.
    pub filesize: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abr: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub note: String,
    #[serde(rename = "type")]
    pub kind: FormatKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtitleTrack {
    pub lang: String,
    pub name: String,
    pub formats: Vec<String>,
}

/// Resolved description of one source URL. Owned by the requesting client;
/// nothing here is persisted server-side.
#[derive(Debug, Clone, Serialize)]
pub struct VideoInfo {
    pub title: String,
    pub duration: u64,
    pub thumbnail: String,
    pub uploader: String,
    pub view_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub formats: Vec<VideoFormat>,
    pub audio_formats: Vec<VideoFormat>,
    pub subtitles: Vec<SubtitleTrack>,
}

/// Fast local shape check, performed before any subprocess is launched:
/// http(s) scheme, allow-listed host, and a non-empty path or query.
pub fn validate_url(url: &str) -> Result<(), FetchError> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| FetchError::InvalidUrl("URL must start with http:// or https://".into()))?;

    let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (host, tail) = rest.split_at(host_end);
    // Reject embedded credentials outright rather than trying to parse them.
    if host.contains('@') || host.is_empty() {
        return Err(FetchError::InvalidUrl("URL has no usable host".into()));
    }
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    if !ALLOWED_HOSTS.contains(&host.as_str()) {
        return Err(FetchError::InvalidUrl(format!(
            "host {host} is not a recognized video site"
        )));
    }

    let meaningful_tail = tail.trim_start_matches('/');
    if meaningful_tail.is_empty() || meaningful_tail.starts_with('#') {
        return Err(FetchError::InvalidUrl(
            "URL does not point at a video".into(),
        ));
    }

    Ok(())
}

/// Queries yt-dlp for metadata. Stateless apart from the optional cookie
/// file; never writes to disk.
pub struct Resolver {
    cookies_file: Option<PathBuf>,
    timeout: Duration,
}

impl Resolver {
    pub fn new(cookies_file: Option<PathBuf>) -> Self {
        Self {
            cookies_file,
            timeout: RESOLVE_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(cookies_file: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            cookies_file,
            timeout,
        }
    }

    pub async fn resolve(&self, url: &str) -> Result<VideoInfo, FetchError> {
        validate_url(url)?;

        let mut command = ytdlp::command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress");
        if let Some(cookies) = &self.cookies_file
            && cookies.exists()
        {
            command.arg("--cookies").arg(cookies);
        }
        command
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| FetchError::Resolution("metadata fetch timed out".into()))?
            .map_err(|err| FetchError::Resolution(format!("could not launch yt-dlp: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ytdlp::classify_resolve_failure(&stderr));
        }

        let raw: RawVideoInfo = serde_json::from_slice(&output.stdout)
            .map_err(|err| FetchError::Resolution(format!("malformed metadata response: {err}")))?;
        Ok(normalize(raw))
    }
}

/// Turns the raw extractor payload into the fixed response schema: formats
/// partitioned into video vs audio-only, deduplicated, and ordered so the
/// first entry is a sensible default selection.
fn normalize(raw: RawVideoInfo) -> VideoInfo {
    let mut video_formats = Vec::new();
    let mut audio_formats = Vec::new();
    let mut seen_video = Vec::new();
    let mut seen_audio = Vec::new();

    for format in &raw.formats {
        let Some(format_id) = format.format_id.as_deref().filter(|id| !id.is_empty()) else {
            continue;
        };
        let ext = format.ext.as_deref().unwrap_or("mp4");

        if format.has_video() {
            let Some(height) = format.height.filter(|h| *h >= MIN_VIDEO_HEIGHT) else {
                continue;
            };
            let fps_key = format.fps.unwrap_or(0.0).round() as i64;
            let key = (height, ext.to_owned(), fps_key);
            if seen_video.contains(&key) {
                continue;
            }
            seen_video.push(key);
            video_formats.push(VideoFormat {
                format_id: format_id.to_owned(),
                quality: format!("{height}p"),
                ext: ext.to_owned(),
                filesize: format.size().unwrap_or(0),
                fps: format.fps,
                vcodec: format.vcodec.clone(),
                acodec: format.acodec.clone(),
                abr: None,
                note: format.format_note.clone().unwrap_or_default(),
                kind: FormatKind::Video,
            });
        } else if format.has_audio() {
            let Some(abr) = format.abr.filter(|abr| *abr >= MIN_AUDIO_BITRATE) else {
                continue;
            };
            let key = (abr.round() as i64, ext.to_owned());
            if seen_audio.contains(&key) {
                continue;
            }
            seen_audio.push(key);
            audio_formats.push(VideoFormat {
                format_id: format_id.to_owned(),
                quality: format!("{}kbps", abr.round() as i64),
                ext: ext.to_owned(),
                filesize: format.size().unwrap_or(0),
                fps: None,
                vcodec: None,
                acodec: format.acodec.clone(),
                abr: Some(abr),
                note: format.format_note.clone().unwrap_or_default(),
                kind: FormatKind::Audio,
            });
        }
    }

    // Descending quality so index zero is the default the UI preselects.
    video_formats.sort_by(|a, b| {
        let height = |f: &VideoFormat| {
            f.quality
                .trim_end_matches('p')
                .parse::<i64>()
                .unwrap_or(0)
        };
        height(b)
            .cmp(&height(a))
            .then_with(|| b.fps.unwrap_or(0.0).total_cmp(&a.fps.unwrap_or(0.0)))
    });
    audio_formats.sort_by(|a, b| b.abr.unwrap_or(0.0).total_cmp(&a.abr.unwrap_or(0.0)));
    video_formats.truncate(MAX_VIDEO_FORMATS);
    audio_formats.truncate(MAX_AUDIO_FORMATS);

    let mut subtitles: Vec<SubtitleTrack> = raw
        .subtitles
        .iter()
        .flatten()
        .filter(|(_, entries)| !entries.is_empty())
        .map(|(lang, entries)| {
            let name = entries
                .iter()
                .find_map(|entry| entry.name.clone())
                .unwrap_or_else(|| lang.to_uppercase());
            let mut formats = Vec::new();
            for entry in entries {
                let ext = entry.ext.clone().unwrap_or_else(|| "vtt".to_string());
                if !formats.contains(&ext) {
                    formats.push(ext);
                }
            }
            SubtitleTrack {
                lang: lang.clone(),
                name,
                formats,
            }
        })
        .collect();
    // The extractor hands subtitles back as a map; sort for a stable response.
    subtitles.sort_by(|a, b| a.lang.cmp(&b.lang));
    subtitles.truncate(MAX_SUBTITLES);

    VideoInfo {
        title: raw.title.filter(|t| !t.is_empty()).unwrap_or_else(|| "Untitled".into()),
        duration: raw.duration.unwrap_or(0.0).max(0.0).round() as u64,
        thumbnail: raw.thumbnail.unwrap_or_default(),
        uploader: raw
            .uploader
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "Unknown".into()),
        view_count: raw.view_count.unwrap_or(0),
        like_count: raw.like_count,
        upload_date: raw.upload_date.as_deref().and_then(upload_date_to_iso),
        description: raw
            .description
            .filter(|text| !text.is_empty())
            .map(|text| truncate_chars(&text, MAX_DESCRIPTION_CHARS)),
        formats: video_formats,
        audio_formats,
        subtitles,
    }
}

/// yt-dlp reports upload dates as `YYYYMMDD`.
fn upload_date_to_iso(raw: &str) -> Option<String> {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::tempdir;

    fn raw_info(value: serde_json::Value) -> RawVideoInfo {
        serde_json::from_value(value).unwrap()
    }

    /// Writes an executable stand-in for yt-dlp and routes commands to it.
    fn install_stub(dir: &Path, body: &str) -> ytdlp::StubGuard {
        let path = dir.join("yt-dlp-stub");
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        ytdlp::set_stub_path(path)
    }

    #[test]
    fn validate_url_accepts_watch_urls() {
        assert!(validate_url("https://www.youtube.com/watch?v=abc123").is_ok());
        assert!(validate_url("http://youtu.be/abc123").is_ok());
        assert!(validate_url("https://music.youtube.com/watch?v=abc").is_ok());
        assert!(validate_url("https://www.youtube.com:443/watch?v=abc").is_ok());
    }

    #[test]
    fn validate_url_rejects_bad_shapes() {
        // Wrong scheme, foreign host, empty path, embedded credentials.
        assert!(validate_url("ftp://www.youtube.com/watch?v=abc").is_err());
        assert!(validate_url("https://example.com/watch?v=abc").is_err());
        assert!(validate_url("https://www.youtube.com/").is_err());
        assert!(validate_url("https://www.youtube.com").is_err());
        assert!(validate_url("https://evil@www.youtube.com/watch?v=abc").is_err());
        assert!(validate_url("watch?v=abc").is_err());
    }

    #[test]
    fn validate_url_failures_are_invalid_url() {
        let err = validate_url("https://example.com/watch").unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[test]
    fn normalize_partitions_and_orders_formats() {
        let raw = raw_info(json!({
            "title": "Demo",
            "duration": 61.4,
            "formats": [
                {"format_id": "18", "height": 360, "fps": 30.0, "ext": "mp4",
                 "vcodec": "avc1", "acodec": "mp4a", "filesize": 1000},
                {"format_id": "137", "height": 1080, "fps": 30.0, "ext": "mp4",
                 "vcodec": "avc1", "acodec": "none", "filesize_approx": 9000},
                {"format_id": "302", "height": 720, "fps": 60.0, "ext": "webm",
                 "vcodec": "vp9", "acodec": "none"},
                {"format_id": "140", "ext": "m4a", "vcodec": "none",
                 "acodec": "mp4a", "abr": 128.0},
                {"format_id": "249", "ext": "webm", "vcodec": "none",
                 "acodec": "opus", "abr": 50.0},
                {"format_id": "251", "ext": "webm", "vcodec": "none",
                 "acodec": "opus", "abr": 160.0}
            ]
        }));
        let info = normalize(raw);

        let qualities: Vec<&str> = info.formats.iter().map(|f| f.quality.as_str()).collect();
        assert_eq!(qualities, vec!["1080p", "720p", "360p"]);
        assert_eq!(info.formats[0].filesize, 9000);
        assert!(info.formats.iter().all(|f| f.kind == FormatKind::Video));

        // 50 kbps falls under the floor; the rest is sorted by bitrate.
        let audio_ids: Vec<&str> = info
            .audio_formats
            .iter()
            .map(|f| f.format_id.as_str())
            .collect();
        assert_eq!(audio_ids, vec!["251", "140"]);
        assert_eq!(info.duration, 61);
    }

    #[test]
    fn normalize_skips_tiny_heights_and_dedupes() {
        let raw = raw_info(json!({
            "formats": [
                {"format_id": "sb0", "height": 90, "ext": "mhtml", "vcodec": "images"},
                {"format_id": "a", "height": 720, "fps": 30.0, "ext": "mp4", "vcodec": "avc1"},
                {"format_id": "b", "height": 720, "fps": 30.0, "ext": "mp4", "vcodec": "avc1"}
            ]
        }));
        let info = normalize(raw);
        assert_eq!(info.formats.len(), 1);
        assert_eq!(info.formats[0].format_id, "a");
    }

    #[test]
    fn normalize_caps_list_lengths() {
        let formats: Vec<serde_json::Value> = (0..30)
            .map(|i| {
                json!({"format_id": format!("f{i}"), "height": 144 + i * 10,
                       "ext": "mp4", "vcodec": "avc1"})
            })
            .collect();
        let info = normalize(raw_info(json!({"formats": formats})));
        assert_eq!(info.formats.len(), 10);
    }

    #[test]
    fn normalize_truncates_description_and_defaults() {
        let raw = raw_info(json!({
            "description": "x".repeat(600),
            "formats": []
        }));
        let info = normalize(raw);
        assert_eq!(info.title, "Untitled");
        assert_eq!(info.uploader, "Unknown");
        let description = info.description.unwrap();
        assert_eq!(description.chars().count(), 503);
        assert!(description.ends_with("..."));
    }

    #[test]
    fn normalize_converts_upload_date() {
        let raw = raw_info(json!({"upload_date": "20240131", "formats": []}));
        assert_eq!(normalize(raw).upload_date.as_deref(), Some("2024-01-31"));

        let raw = raw_info(json!({"upload_date": "notadate", "formats": []}));
        assert_eq!(normalize(raw).upload_date, None);
    }

    #[tokio::test]
    async fn resolve_returns_normalized_info_from_the_extractor() {
        let dir = tempdir().unwrap();
        let payload = json!({
            "title": "Stub Video",
            "duration": 30.0,
            "uploader": "Stub Channel",
            "formats": [
                {"format_id": "22", "height": 720, "ext": "mp4",
                 "vcodec": "avc1", "acodec": "mp4a", "filesize": 4096}
            ]
        });
        let _guard = install_stub(dir.path(), &format!("printf '%s' '{payload}'\n"));

        let info = Resolver::new(None)
            .resolve("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap();
        assert_eq!(info.title, "Stub Video");
        assert_eq!(info.uploader, "Stub Channel");
        assert_eq!(info.formats[0].quality, "720p");
        assert_eq!(info.formats[0].format_id, "22");
    }

    #[tokio::test]
    async fn resolve_classifies_gated_content_from_stderr() {
        let dir = tempdir().unwrap();
        let _guard = install_stub(
            dir.path(),
            r#"echo "ERROR: [youtube] abc: Sign in to confirm you're not a bot." >&2
exit 1
"#,
        );

        let err = Resolver::new(None)
            .resolve("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn resolve_surfaces_plain_extractor_failures() {
        let dir = tempdir().unwrap();
        let _guard = install_stub(
            dir.path(),
            "echo 'ERROR: Unable to download webpage' >&2\nexit 1\n",
        );

        let err = Resolver::new(None)
            .resolve("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::Resolution("Unable to download webpage".into())
        );
    }

    #[tokio::test]
    async fn resolve_rejects_malformed_metadata() {
        let dir = tempdir().unwrap();
        let _guard = install_stub(dir.path(), "printf '%s' 'not json at all'\n");

        let err = Resolver::new(None)
            .resolve("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap_err();
        match err {
            FetchError::Resolution(detail) => {
                assert!(detail.contains("malformed metadata response"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_times_out_on_a_stalled_extractor() {
        let dir = tempdir().unwrap();
        let _guard = install_stub(dir.path(), "sleep 5\n");

        let resolver = Resolver::with_timeout(None, Duration::from_millis(100));
        let err = resolver
            .resolve("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Resolution("metadata fetch timed out".into()));
    }

    #[tokio::test]
    async fn resolve_passes_cookies_only_when_the_file_exists() {
        let dir = tempdir().unwrap();
        let args_file = dir.path().join("args");
        let body = format!(
            "printf '%s\n' \"$@\" > {args}\nprintf '%s' '{{\"formats\": []}}'\n",
            args = args_file.display()
        );
        let _guard = install_stub(dir.path(), &body);

        let cookies = dir.path().join("cookies.txt");
        fs::write(&cookies, "# Netscape HTTP Cookie File\n").unwrap();
        Resolver::new(Some(cookies.clone()))
            .resolve("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap();
        let args: Vec<String> = fs::read_to_string(&args_file)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect();
        assert!(
            args.windows(2)
                .any(|w| w[0] == "--cookies" && w[1] == cookies.to_string_lossy())
        );

        // A configured but missing file must not reach the command line.
        Resolver::new(Some(dir.path().join("missing.txt")))
            .resolve("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap();
        let args = fs::read_to_string(&args_file).unwrap();
        assert!(!args.contains("--cookies"));
    }

    #[test]
    fn normalize_collects_subtitles_sorted() {
        let raw = raw_info(json!({
            "formats": [],
            "subtitles": {
                "es": [{"ext": "vtt", "name": "Spanish"}, {"ext": "srt"}],
                "en": [{"ext": "vtt"}],
                "de": []
            }
        }));
        let info = normalize(raw);
        let langs: Vec<&str> = info.subtitles.iter().map(|s| s.lang.as_str()).collect();
        assert_eq!(langs, vec!["en", "es"]);
        assert_eq!(info.subtitles[0].name, "EN");
        assert_eq!(info.subtitles[1].name, "Spanish");
        assert_eq!(info.subtitles[1].formats, vec!["vtt", "srt"]);
    }
}
