#![forbid(unsafe_code)]

//! Axum backend for on-demand video downloads.
//!
//! The server never stores a library: a client resolves a URL, picks a
//! format, polls the job, and fetches the finished file exactly once. Files
//! left unclaimed are swept after an hour.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use mime_guess::MimeGuess;
use serde::Deserialize;
use serde_json::json;
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tubefetch::config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings};
use tubefetch::cookies::CookieStore;
use tubefetch::error::FetchError;
use tubefetch::progress::{JobSnapshot, JobStatus, ProgressRegistry};
use tubefetch::resolver::{Resolver, VideoInfo};
use tubefetch::runner::{DownloadRequest, JobRunner};
use tubefetch::security::ensure_not_root;
use tubefetch::storage::{ArtifactStore, DEFAULT_RETENTION};
use tubefetch::{logging, ytdlp};

/// How often the background task looks for unclaimed artifacts.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct ServerArgs {
    settings: RuntimeSettings,
    listen_host: IpAddr,
}

impl ServerArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut download_root_override: Option<PathBuf> = None;
        let mut www_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--download-root=") {
                download_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                www_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--download-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--download-root requires a value"))?;
                    download_root_override = Some(PathBuf::from(value));
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    www_root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let settings = resolve_runtime_settings(RuntimeOverrides {
            download_root: download_root_override,
            www_root: www_root_override,
            port: port_override,
            host: host_override.map(|host| host.to_string()),
            ..RuntimeOverrides::default()
        })?;
        let listen_host = parse_host_arg(&settings.host)?;

        Ok(Self {
            settings,
            listen_host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEFETCH_HOST")
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    registry: Arc<ProgressRegistry>,
    runner: JobRunner,
    resolver: Arc<Resolver>,
    store: ArtifactStore,
    cookies: Arc<CookieStore>,
    www_root: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            kind: "unavailable",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let status = match &err {
            FetchError::InvalidUrl(_)
            | FetchError::Resolution(_)
            | FetchError::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
            FetchError::AccessDenied(_) => StatusCode::FORBIDDEN,
            FetchError::Transfer(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FetchError::NotReady => StatusCode::CONFLICT,
            FetchError::NotFound => StatusCode::NOT_FOUND,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = json!({
            "error": self.message,
            "kind": self.kind,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct VideoInfoRequest {
    url: String,
}

#[derive(Deserialize)]
struct StartDownloadRequest {
    url: String,
    format_id: String,
    #[serde(default)]
    audio_only: bool,
    #[serde(default)]
    include_subtitles: bool,
    #[serde(default)]
    subtitle_lang: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let ServerArgs {
        settings,
        listen_host,
    } = ServerArgs::parse()?;

    ensure_not_root("server")?;
    logging::init();

    ytdlp::ensure_available()
        .await
        .context("checking for yt-dlp")?;

    let store = ArtifactStore::new(settings.download_root.clone());
    store.prepare()?;
    match store.sweep_older_than(DEFAULT_RETENTION) {
        Ok(0) => {}
        Ok(removed) => tracing::info!("startup sweep removed {removed} stale artifacts"),
        Err(err) => tracing::warn!("startup sweep failed: {err}"),
    }

    let registry = Arc::new(ProgressRegistry::new());
    let runner = JobRunner::new(
        Arc::clone(&registry),
        store.clone(),
        settings.cookies_file.clone(),
    );
    let resolver = Arc::new(Resolver::new(settings.cookies_file.clone()));
    let cookies = Arc::new(CookieStore::new(
        settings
            .cookies_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("cookies.txt")),
        settings.cookie_refresh_cmd.clone(),
    ));

    let sweeper_store = store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = sweeper_store.sweep_older_than(DEFAULT_RETENTION) {
                tracing::warn!("artifact sweep failed: {err}");
            }
        }
    });

    let state = AppState {
        registry,
        runner,
        resolver,
        store,
        cookies,
        www_root: Arc::new(settings.www_root.clone()),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/video-info", post(video_info))
        .route("/api/download", post(start_download))
        .route("/api/download-progress/{id}", get(download_progress))
        .route("/api/download-file/{id}", get(download_file))
        .route("/api/cookies/status", get(cookies_status))
        .route("/api/cookies/refresh", post(cookies_refresh))
        .route("/api/cleanup", delete(cleanup))
        .fallback(static_fallback)
        .with_state(state);

    let addr = SocketAddr::new(listen_host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; the process still terminates
    // when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {err}");
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn video_info(
    State(state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> ApiResult<Json<VideoInfo>> {
    let info = state.resolver.resolve(&payload.url).await?;
    Ok(Json(info))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<StartDownloadRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = state.runner.submit(DownloadRequest {
        url: payload.url,
        format_id: payload.format_id,
        audio_only: payload.audio_only,
        include_subtitles: payload.include_subtitles,
        subtitle_lang: payload.subtitle_lang,
    })?;
    Ok(Json(json!({ "download_id": id })))
}

async fn download_progress(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<JobSnapshot>> {
    let snapshot = state.registry.get(&id)?;
    Ok(Json(snapshot))
}

/// Delivers a finished artifact exactly once. The file is unlinked right
/// after it is opened; the open handle keeps the bytes alive for this one
/// response, and the job record goes away with it.
async fn download_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let snapshot = state.registry.get(&id)?;
    match snapshot.status {
        JobStatus::Completed => {}
        JobStatus::Error => {
            return Err(ApiError::not_found("the download failed; there is no file"));
        }
        _ => return Err(FetchError::NotReady.into()),
    }

    // remove() claims the record under the registry lock; when two fetches
    // race, exactly one gets the snapshot and the other sees NotFound.
    let Some(snapshot) = state.registry.remove(&id) else {
        return Err(FetchError::NotFound.into());
    };

    let path = match snapshot.artifact {
        Some(path) => path,
        None => state.store.find(&id)?,
    };
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("download file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("download file not found"))?
        .len();

    state.store.remove_job_files(&id);

    let filename = delivery_filename(&path, &id);
    let mime = MimeGuess::from_path(&path).first();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = size.to_string().parse() {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Ok(value) = format!("attachment; filename=\"{filename}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    let content_type = mime
        .map(|mime| mime.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    if let Ok(value) = content_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

/// The on-disk name carries the job id prefix; clients get the title back.
fn delivery_filename(path: &Path, job_id: &str) -> String {
    let prefix = format!("{job_id}_");
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.strip_prefix(&prefix).unwrap_or(name))
        .unwrap_or("download")
        .replace(['"', '\\', '\r', '\n'], "_")
}

/// On-demand sweep of unclaimed artifacts, same retention as the background
/// task.
async fn cleanup(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let removed = state
        .store
        .sweep_older_than(DEFAULT_RETENTION)
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(json!({ "removed": removed })))
}

async fn cookies_status(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let status = state.cookies.status();
    Ok(Json(serde_json::to_value(status).unwrap_or(json!({}))))
}

async fn cookies_refresh(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    state
        .cookies
        .refresh()
        .map_err(|err| ApiError::unavailable(err.to_string()))?;
    Ok(Json(json!({ "started": true })))
}

async fn static_fallback(
    State(state): State<AppState>,
    req: axum::http::Request<Body>,
) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        // A deployment without a bundled UI still answers the root path.
        Err(_) if path == "/" => Json(json!({
            "service": "tubefetch",
            "status": "ok",
        }))
        .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => serve_static_file(root.join("index.html")).await,
        Ok(_) => serve_static_file(target).await,
        Err(_) => {
            if should_fallback_to_index(request_path) {
                serve_static_file(root.join("index.html")).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    Path::new(trimmed).extension().is_none()
}

async fn serve_static_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mime = MimeGuess::from_path(&path).first();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = mime
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use std::time::SystemTime;
    use tempfile::{TempDir, tempdir};

    // Tests that touch the current working directory must not interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_file(vars: &[(&str, &str)], f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let mut contents = String::new();
        for (key, value) in vars {
            contents.push_str(&format!("{key}=\"{value}\"\n"));
        }
        std::fs::write(dir.path().join(".env"), contents).unwrap();
        let cwd = env::current_dir().unwrap();
        env::set_current_dir(dir.path()).unwrap();
        f();
        env::set_current_dir(cwd).unwrap();
    }

    fn parse_server_args(env_values: &[(&str, &str)], extra: &[&str]) -> ServerArgs {
        let argv = extra
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>();
        let mut parsed = None;
        with_env_file(env_values, || {
            parsed = Some(ServerArgs::from_iter(argv.clone()).expect("parsed args"));
        });
        parsed.expect("args set")
    }

    struct ServerTestContext {
        state: AppState,
        _temp: TempDir,
    }

    impl ServerTestContext {
        fn new() -> Self {
            let temp = tempdir().unwrap();
            let store = ArtifactStore::new(temp.path().join("downloads"));
            store.prepare().unwrap();
            let registry = Arc::new(ProgressRegistry::new());
            let runner = JobRunner::new(Arc::clone(&registry), store.clone(), None);
            let www_root = temp.path().join("www");
            std::fs::create_dir_all(&www_root).unwrap();

            Self {
                state: AppState {
                    registry,
                    runner,
                    resolver: Arc::new(Resolver::new(None)),
                    store,
                    cookies: Arc::new(CookieStore::new(temp.path().join("cookies.txt"), None)),
                    www_root: Arc::new(www_root),
                },
                _temp: temp,
            }
        }

        /// Registers a completed job whose artifact exists on disk.
        fn completed_job(&self, id: &str, filename: &str, bytes: &[u8]) -> PathBuf {
            let path = self.state.store.root().join(format!("{id}_{filename}"));
            std::fs::write(&path, bytes).unwrap();
            let mut snapshot = JobSnapshot::starting();
            snapshot.status = JobStatus::Completed;
            snapshot.percentage = 100.0;
            snapshot.artifact = Some(path.clone());
            self.state.registry.create(id, snapshot);
            path
        }
    }

    #[test]
    fn server_args_read_env_file() {
        let args = parse_server_args(
            &[
                ("TUBEFETCH_DOWNLOAD_ROOT", "/dl/test"),
                ("TUBEFETCH_WWW_ROOT", "/www/test"),
                ("TUBEFETCH_PORT", "4242"),
                ("TUBEFETCH_HOST", "127.0.0.1"),
            ],
            &[],
        );
        assert_eq!(args.settings.download_root, PathBuf::from("/dl/test"));
        assert_eq!(args.settings.www_root, PathBuf::from("/www/test"));
        assert_eq!(args.settings.port, 4242);
        assert_eq!(args.listen_host, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn server_args_flags_beat_env_file() {
        let args = parse_server_args(
            &[
                ("TUBEFETCH_DOWNLOAD_ROOT", "/dl/test"),
                ("TUBEFETCH_PORT", "4242"),
            ],
            &["--download-root", "/custom/dl", "--port=9000", "--host", "0.0.0.0"],
        );
        assert_eq!(args.settings.download_root, PathBuf::from("/custom/dl"));
        assert_eq!(args.settings.port, 9000);
        assert_eq!(args.listen_host, "0.0.0.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn server_args_reject_unknown_flags() {
        with_env_file(&[], || {
            assert!(ServerArgs::from_iter(vec!["--bogus".to_string()]).is_err());
        });
    }

    #[test]
    fn fetch_errors_map_to_expected_statuses() {
        let cases = [
            (
                FetchError::InvalidUrl("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                FetchError::UnsupportedFormat("gone".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                FetchError::AccessDenied("gated".into()),
                StatusCode::FORBIDDEN,
            ),
            (
                FetchError::Transfer("broke".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (FetchError::NotReady, StatusCode::CONFLICT),
            (FetchError::NotFound, StatusCode::NOT_FOUND),
        ];
        for (err, expected) in cases {
            let kind = err.kind();
            let api: ApiError = err.into();
            assert_eq!(api.status, expected);
            assert_eq!(api.kind, kind);
        }
    }

    #[tokio::test]
    async fn progress_endpoint_reports_unknown_jobs_as_404() {
        let ctx = ServerTestContext::new();
        let err = download_progress(State(ctx.state.clone()), AxumPath("dl-ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn progress_endpoint_returns_the_snapshot() {
        let ctx = ServerTestContext::new();
        ctx.state.registry.create("dl-1", JobSnapshot::starting());
        let Json(snapshot) = download_progress(State(ctx.state.clone()), AxumPath("dl-1".into()))
            .await
            .unwrap();
        assert_eq!(snapshot.status, JobStatus::Starting);
    }

    #[tokio::test]
    async fn file_endpoint_rejects_unfinished_jobs() {
        let ctx = ServerTestContext::new();
        ctx.state.registry.create("dl-1", JobSnapshot::starting());
        let err = download_file(State(ctx.state.clone()), AxumPath("dl-1".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn file_endpoint_rejects_failed_jobs() {
        let ctx = ServerTestContext::new();
        let mut snapshot = JobSnapshot::starting();
        snapshot.status = JobStatus::Error;
        snapshot.error = Some("boom".into());
        ctx.state.registry.create("dl-1", snapshot);
        let err = download_file(State(ctx.state.clone()), AxumPath("dl-1".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn file_endpoint_delivers_exactly_once() {
        let ctx = ServerTestContext::new();
        let path = ctx.completed_job("dl-1", "My Video.mp4", b"media-bytes");

        let response = download_file(State(ctx.state.clone()), AxumPath("dl-1".into()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(disposition.contains("My Video.mp4"));
        assert!(!disposition.contains("dl-1_"));

        // The artifact and the job record are both gone.
        assert!(!path.exists());
        assert!(ctx.state.registry.get("dl-1").is_err());

        let err = download_file(State(ctx.state.clone()), AxumPath("dl-1".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn racing_fetches_deliver_at_most_once() {
        let ctx = ServerTestContext::new();
        ctx.completed_job("dl-1", "Clip.mp4", b"media");

        let (first, second) = tokio::join!(
            download_file(State(ctx.state.clone()), AxumPath("dl-1".into())),
            download_file(State(ctx.state.clone()), AxumPath("dl-1".into())),
        );
        let delivered = [first.is_ok(), second.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        assert_eq!(delivered, 1);

        let loser = if first.is_ok() { second } else { first };
        assert_eq!(loser.unwrap_err().status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cleanup_endpoint_sweeps_only_stale_files() {
        let ctx = ServerTestContext::new();
        let stale = ctx.state.store.root().join("dl-old_Clip.mp4");
        std::fs::write(&stale, "old").unwrap();
        let handle = std::fs::OpenOptions::new()
            .write(true)
            .open(&stale)
            .unwrap();
        handle
            .set_modified(SystemTime::now() - Duration::from_secs(2 * 3600))
            .unwrap();
        let fresh = ctx.state.store.root().join("dl-new_Clip.mp4");
        std::fs::write(&fresh, "new").unwrap();

        let Json(value) = cleanup(State(ctx.state.clone())).await.unwrap();
        assert_eq!(value["removed"], json!(1));
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn file_delivery_removes_subtitle_sidecars() {
        let ctx = ServerTestContext::new();
        ctx.completed_job("dl-1", "Clip.mp4", b"media");
        let sidecar = ctx.state.store.root().join("dl-1_Clip.en.vtt");
        std::fs::write(&sidecar, "WEBVTT").unwrap();

        download_file(State(ctx.state.clone()), AxumPath("dl-1".into()))
            .await
            .unwrap();
        assert!(!sidecar.exists());
    }

    #[tokio::test]
    async fn cookie_refresh_without_command_is_unavailable() {
        let ctx = ServerTestContext::new();
        let err = cookies_refresh(State(ctx.state.clone())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn cookie_status_reports_missing_file() {
        let ctx = ServerTestContext::new();
        let Json(value) = cookies_status(State(ctx.state.clone())).await.unwrap();
        assert_eq!(value["exists"], json!(false));
        assert_eq!(value["needs_refresh"], json!(true));
    }

    #[test]
    fn www_paths_never_escape_the_root() {
        let root = Path::new("/srv/www");
        assert!(resolve_www_path(root, "/../etc/passwd").is_err());
        assert!(resolve_www_path(root, "/a/../../b").is_err());
        assert_eq!(
            resolve_www_path(root, "/app.js").unwrap(),
            PathBuf::from("/srv/www/app.js")
        );
        assert_eq!(
            resolve_www_path(root, "/").unwrap(),
            PathBuf::from("/srv/www/index.html")
        );
    }

    #[test]
    fn spa_routes_fall_back_to_index() {
        assert!(should_fallback_to_index("/watch"));
        assert!(should_fallback_to_index("/"));
        assert!(!should_fallback_to_index("/missing.js"));
    }
}
