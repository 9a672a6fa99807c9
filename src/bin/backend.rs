#![forbid(unsafe_code)]

//! HTTP façade over the external `yt-dlp` tool.
//!
//! Every endpoint is stateless and maps one request to at most one yt-dlp
//! invocation or one direct upstream fetch. Buffered operations answer with
//! JSON envelopes; download operations stream bytes and clean up their
//! scratch files regardless of how the transfer ends. There is no queueing,
//! auth, or caching here on purpose.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tubefetch_tools::captions::parse_json3_captions;
use tubefetch_tools::config::{RuntimeOverrides, resolve_runtime_settings};
use tubefetch_tools::ytdlp::{
    self, BridgeError, MediaFormat, download_media, fetch_caption_document, fetch_thumbnail,
    fetch_video_info, stream_audio, strip_playlist,
};

#[derive(Debug, Clone)]
struct BackendArgs {
    yt_dlp_path: PathBuf,
    scratch_dir: PathBuf,
    port: u16,
    listen_host: IpAddr,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut yt_dlp_override: Option<PathBuf> = None;
        let mut scratch_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<String> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--yt-dlp=") {
                yt_dlp_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--scratch-dir=") {
                scratch_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(value.to_string());
                continue;
            }

            match arg.as_str() {
                "--yt-dlp" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--yt-dlp requires a value"))?;
                    yt_dlp_override = Some(PathBuf::from(value));
                }
                "--scratch-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--scratch-dir requires a value"))?;
                    scratch_override = Some(PathBuf::from(value));
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
                    host_override = Some(value);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let settings = resolve_runtime_settings(RuntimeOverrides {
            yt_dlp_path: yt_dlp_override,
            scratch_dir: scratch_override,
            port: port_override,
            host: host_override,
            ..RuntimeOverrides::default()
        })?;
        let listen_host = parse_host_arg(&settings.host)?;

        Ok(Self {
            yt_dlp_path: settings.yt_dlp_path,
            scratch_dir: settings.scratch_dir,
            port: settings.port,
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

/// Shared state injected into every handler.
///
/// * `yt_dlp` is the resolved tool executable.
/// * `scratch_dir` holds per-request temporary downloads; every request
///   allocates its own unique filename there.
/// * `http` is reused across requests for thumbnail and caption fetches.
#[derive(Clone)]
struct AppState {
    yt_dlp: Arc<PathBuf>,
    scratch_dir: Arc<PathBuf>,
    http: reqwest::Client,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Creates a 400 error for a missing or empty required parameter.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            eprintln!("request failed: {}", self.message);
        }
        let body = json!({
            "success": false,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let BackendArgs {
        yt_dlp_path,
        scratch_dir,
        port,
        listen_host,
    } = BackendArgs::parse()?;

    let state = AppState {
        yt_dlp: Arc::new(yt_dlp_path),
        scratch_dir: Arc::new(scratch_dir),
        http: reqwest::Client::new(),
    };

    let app = router(state);

    let addr = SocketAddr::new(listen_host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/v1/video/info", get(video_info))
        .route("/api/v1/video/thumbnail", get(download_thumbnail))
        .route("/api/v1/video/download", get(download_video))
        .route("/api/v1/video/audio", get(download_audio))
        .route("/api/v1/video/captions", get(raw_captions))
        .route("/api/v1/video/captions/parsed", get(parsed_captions))
        .fallback(route_not_found)
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown is affected by a failed handler install; the
    // process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "success": true,
        "message": "Server is running...",
    }))
}

async fn route_not_found() -> Response {
    ApiError::not_found("Route not found").into_response()
}

/// Rejects absent or whitespace-only required parameters before any process
/// or network activity happens.
fn require_param(value: Option<String>, name: &str) -> ApiResult<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ApiError::bad_request(format!(
            "{name} query param is required"
        ))),
    }
}

#[derive(Deserialize)]
struct UrlQuery {
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoUrlQuery {
    video_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptionUrlQuery {
    caption_url: Option<String>,
}

async fn video_info(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Json<Value>> {
    let url = require_param(query.url, "url")?;
    let info = fetch_video_info(&state.yt_dlp, &url).await?;
    Ok(Json(json!({
        "success": true,
        "info": info,
    })))
}

async fn download_thumbnail(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Response> {
    let url = require_param(query.url, "url")?;
    let bytes = fetch_thumbnail(&state.http, &url).await?;

    let mut response = bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, "image/webp".parse().unwrap());
    headers.insert(
        header::CONTENT_DISPOSITION,
        "attachment; filename=\"thumbnail.webp\"".parse().unwrap(),
    );
    Ok(response)
}

async fn download_video(
    State(state): State<AppState>,
    Query(query): Query<VideoUrlQuery>,
) -> ApiResult<Response> {
    let url = require_param(query.video_url, "videoUrl")?;
    let output = ytdlp::scratch_path(&state.scratch_dir, "video", "mp4");
    download_media(&state.yt_dlp, MediaFormat::Video, &url, &output).await?;
    serve_scratch_file(output, "video.mp4", "video/mp4").await
}

async fn download_audio(
    State(state): State<AppState>,
    Query(query): Query<VideoUrlQuery>,
) -> ApiResult<Response> {
    let raw_url = require_param(query.video_url, "videoUrl")?;
    // Target a single video even when the link came out of a playlist.
    let url = strip_playlist(&raw_url);

    let stream = stream_audio(&state.yt_dlp, url).await?;

    // Headers go out before the first media byte. From here on a tool
    // failure can only surface as an abruptly ended stream, and a client
    // disconnect drops the stream, which kills the child process.
    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, "audio/mp4".parse().unwrap());
    headers.insert(
        header::CONTENT_DISPOSITION,
        "attachment; filename=\"audio.m4a\"".parse().unwrap(),
    );
    Ok(response)
}

async fn raw_captions(
    State(state): State<AppState>,
    Query(query): Query<CaptionUrlQuery>,
) -> ApiResult<Response> {
    let url = require_param(query.caption_url, "captionUrl")?;
    let document = fetch_caption_document(&state.http, &url).await?;

    // Passed through verbatim; the upstream document is already JSON.
    let mut response = document.into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
    Ok(response)
}

async fn parsed_captions(
    State(state): State<AppState>,
    Query(query): Query<CaptionUrlQuery>,
) -> ApiResult<Response> {
    let url = require_param(query.caption_url, "captionUrl")?;
    let document = fetch_caption_document(&state.http, &url).await?;
    let value: Value = serde_json::from_str(&document)
        .map_err(|err| ApiError::internal(format!("caption document is not valid JSON: {err}")))?;
    Ok(Json(parse_json3_captions(&value)).into_response())
}

/// Streams a finished scratch file back as an attachment and removes it.
///
/// The file is unlinked before the first byte is sent: the open handle keeps
/// the data readable until the stream finishes, so cleanup happens even when
/// the transfer errors or the client goes away mid-download.
async fn serve_scratch_file(
    path: PathBuf,
    filename: &str,
    content_type: &str,
) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|err| ApiError::internal(format!("opening downloaded file: {err}")))?;
    let size = file
        .metadata()
        .await
        .map_err(|err| ApiError::internal(format!("reading downloaded file: {err}")))?
        .len();

    if let Err(err) = tokio::fs::remove_file(&path).await {
        eprintln!("failed to remove scratch file {}: {}", path.display(), err);
    }

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, size.to_string().parse().unwrap());
    if let Ok(value) = content_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = format!("attachment; filename=\"{filename}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::sync::Mutex;
    use std::{env, path::Path};
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_file(vars: &[(&str, &str)], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap();
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

    fn parse_backend_args(env_vars: &[(&str, &str)], argv: &[&str]) -> BackendArgs {
        let argv: Vec<String> = argv.iter().map(|arg| arg.to_string()).collect();
        let mut parsed = None;
        with_env_file(env_vars, || {
            parsed = Some(BackendArgs::from_iter(argv.clone()).expect("parsed args"));
        });
        parsed.expect("args set")
    }

    fn test_state() -> AppState {
        AppState {
            yt_dlp: Arc::new(PathBuf::from("/nonexistent/yt-dlp")),
            scratch_dir: Arc::new(PathBuf::from("/nonexistent/scratch")),
            http: reqwest::Client::new(),
        }
    }

    async fn envelope_of(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn backend_args_read_env_file_values() {
        let args = parse_backend_args(
            &[
                ("YT_DLP_PATH", "/opt/yt-dlp"),
                ("TUBEFETCH_SCRATCH_DIR", "/tmp/scratch"),
                ("TUBEFETCH_PORT", "4242"),
                ("TUBEFETCH_HOST", "127.0.0.1"),
            ],
            &[],
        );
        assert_eq!(args.yt_dlp_path, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(args.scratch_dir, PathBuf::from("/tmp/scratch"));
        assert_eq!(args.port, 4242);
    }

    #[test]
    fn backend_args_flags_override_env_file() {
        let args = parse_backend_args(
            &[("YT_DLP_PATH", "/opt/yt-dlp"), ("TUBEFETCH_PORT", "4242")],
            &["--yt-dlp", "/custom/yt-dlp", "--port=9000"],
        );
        assert_eq!(args.yt_dlp_path, PathBuf::from("/custom/yt-dlp"));
        assert_eq!(args.port, 9000);
    }

    #[test]
    fn backend_args_override_scratch_dir_and_host() {
        let args = parse_backend_args(
            &[],
            &["--scratch-dir", "/custom/scratch", "--host", "0.0.0.0"],
        );
        assert_eq!(args.scratch_dir, PathBuf::from("/custom/scratch"));
        assert_eq!(args.listen_host, "0.0.0.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn backend_args_reject_unknown_flags() {
        let mut result = None;
        with_env_file(&[], || {
            result = Some(BackendArgs::from_iter(vec!["--bogus".to_string()]));
        });
        let err = result.unwrap().unwrap_err();
        assert!(err.to_string().contains("unknown argument"));
    }

    #[test]
    fn backend_args_reject_missing_flag_value() {
        let mut result = None;
        with_env_file(&[], || {
            result = Some(BackendArgs::from_iter(vec!["--port".to_string()]));
        });
        assert!(result.unwrap().is_err());
    }

    #[test]
    fn require_param_rejects_missing_and_blank_values() {
        let err = require_param(None, "url").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "url query param is required");

        let err = require_param(Some("   ".to_string()), "videoUrl").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let value = require_param(Some("https://example.com".to_string()), "url").unwrap();
        assert_eq!(value, "https://example.com");
    }

    #[tokio::test]
    async fn api_errors_render_the_failure_envelope() {
        let response = ApiError::internal("yt-dlp failed: boom").into_response();
        let (status, body) = envelope_of(response).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "yt-dlp failed: boom");
    }

    #[tokio::test]
    async fn missing_url_yields_bad_request_envelope() {
        let result = video_info(State(test_state()), Query(UrlQuery { url: None })).await;
        let (status, body) = envelope_of(result.unwrap_err().into_response()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "url query param is required");
    }

    #[tokio::test]
    async fn missing_video_url_yields_bad_request_for_downloads() {
        for result in [
            download_video(State(test_state()), Query(VideoUrlQuery { video_url: None })).await,
            download_audio(State(test_state()), Query(VideoUrlQuery { video_url: None })).await,
        ] {
            let err = result.unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST);
            assert_eq!(err.message, "videoUrl query param is required");
        }
    }

    #[tokio::test]
    async fn missing_caption_url_yields_bad_request() {
        let result = parsed_captions(
            State(test_state()),
            Query(CaptionUrlQuery { caption_url: None }),
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "captionUrl query param is required");
    }

    #[tokio::test]
    async fn tool_failures_surface_in_the_envelope() {
        // The configured executable does not exist, so the bridge fails
        // before any tool output; the envelope still reports the cause.
        let result = video_info(
            State(test_state()),
            Query(UrlQuery {
                url: Some("https://example.com/v".to_string()),
            }),
        )
        .await;
        let (status, body) = envelope_of(result.unwrap_err().into_response()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn health_reports_running() {
        let Json(body) = health().await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Server is running...");
    }

    #[tokio::test]
    async fn unknown_routes_answer_with_the_json_envelope() {
        let (status, body) = envelope_of(route_not_found().await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Route not found");
    }

    #[tokio::test]
    async fn scratch_files_are_removed_after_serving() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("video-test.mp4");
        tokio::fs::write(&path, b"fake media").await.unwrap();

        let response = serve_scratch_file(path.clone(), "video.mp4", "video/mp4")
            .await
            .unwrap();
        assert!(!path.exists(), "scratch file should be unlinked up front");

        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"video.mp4\""
        );
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"fake media");
    }

    #[tokio::test]
    async fn serving_a_missing_scratch_file_is_an_internal_error() {
        let err = serve_scratch_file(
            Path::new("/nonexistent/video.mp4").to_path_buf(),
            "video.mp4",
            "video/mp4",
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
