#![forbid(unsafe_code)]

//! Bridge to the external `yt-dlp` executable and to direct upstream fetches.
//!
//! Every operation here is a single attempt scoped to one request: build the
//! argument list, run the tool (buffered for JSON answers, piped for
//! streaming ones) or perform one HTTP fetch, classify the outcome. Retry
//! policy, if any, belongs to the caller.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;
use thiserror::Error;
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::io::ReaderStream;

/// Upstream caption hosts reject requests without a browser-looking agent.
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Serial for per-request scratch filenames, combined with the process id so
/// concurrent requests (and concurrent server instances sharing a scratch
/// directory) never collide.
static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(1);

/// How a yt-dlp invocation or upstream fetch failed.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The tool exited non-zero. Carries whatever it wrote to stderr.
    #[error("yt-dlp failed: {stderr}")]
    ToolFailure { stderr: String },
    /// The tool exited zero but its stdout was not the JSON we asked for.
    #[error("yt-dlp produced invalid JSON: {0}")]
    ParseFailure(#[from] serde_json::Error),
    /// A direct HTTP fetch returned a non-success status or failed outright.
    #[error("upstream fetch failed: {0}")]
    FetchFailure(String),
    /// Spawning the tool or touching the scratch directory failed.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    fn tool_failure(stderr: &[u8]) -> Self {
        Self::ToolFailure {
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        Self::FetchFailure(err.to_string())
    }
}

/// Format-selection policy passed to yt-dlp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    /// Widely compatible mp4 video plus m4a audio, merged into one mp4.
    Video,
    /// Best available audio-only stream, m4a preferred.
    Audio,
}

impl MediaFormat {
    fn selector(self) -> &'static str {
        match self {
            Self::Video => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/mp4",
            Self::Audio => "bestaudio[ext=m4a]/bestaudio",
        }
    }

    /// Container to merge separately fetched streams into, when applicable.
    fn merge_container(self) -> Option<&'static str> {
        match self {
            Self::Video => Some("mp4"),
            Self::Audio => None,
        }
    }
}

fn base_command(program: &Path) -> Command {
    let mut command = Command::new(program);
    command.stdin(Stdio::null());
    command
}

/// Drops every trailing query component of a watch-page URL once a playlist
/// marker is present, so a single video is targeted even when it was reached
/// through a playlist.
pub fn strip_playlist(url: &str) -> &str {
    if url.contains("youtube.com/watch") && url.contains("list=") {
        url.split('&').next().unwrap_or(url)
    } else {
        url
    }
}

/// Allocates a scratch file path that is unique per request.
pub fn scratch_path(dir: &Path, prefix: &str, extension: &str) -> PathBuf {
    let serial = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(
        "{prefix}-{}-{serial}.{extension}",
        std::process::id()
    ))
}

/// Runs `yt-dlp --dump-single-json` for a single video and returns the parsed
/// metadata document. Output is buffered in full; parsing only happens after
/// the process has exited successfully.
pub async fn fetch_video_info(program: &Path, url: &str) -> Result<Value, BridgeError> {
    let output = base_command(program)
        .arg("--dump-single-json")
        .arg("--no-playlist")
        .arg(url)
        .output()
        .await?;

    if !output.status.success() {
        return Err(BridgeError::tool_failure(&output.stderr));
    }

    Ok(serde_json::from_slice(&output.stdout)?)
}

/// Downloads a single video or audio track into `output`.
///
/// The scratch directory is created when missing. On tool failure any partial
/// output file is removed best-effort before the error is returned.
pub async fn download_media(
    program: &Path,
    format: MediaFormat,
    url: &str,
    output: &Path,
) -> Result<(), BridgeError> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut command = base_command(program);
    command.arg("-f").arg(format.selector());
    if let Some(container) = format.merge_container() {
        command.arg("--merge-output-format").arg(container);
    }
    command.arg("--no-playlist").arg("-o").arg(output).arg(url);

    let result = command.output().await?;
    if !result.status.success() {
        let _ = tokio::fs::remove_file(output).await;
        return Err(BridgeError::tool_failure(&result.stderr));
    }

    Ok(())
}

/// A live yt-dlp process writing media to its stdout.
///
/// The stream yields stdout chunks in the order the tool produces them.
/// Dropping the stream, which is what happens when the HTTP client
/// disconnects mid-transfer, kills the child process so nothing is left
/// running behind an abandoned request.
pub struct AudioStream {
    child: Child,
    stdout: ReaderStream<ChildStdout>,
}

impl AudioStream {
    /// OS process id of the underlying tool, while it is still running.
    pub fn process_id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl Stream for AudioStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().stdout).poll_next(cx)
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        // Redundant with kill_on_drop, but makes the termination explicit
        // and immediate; the runtime reaps the child afterwards.
        let _ = self.child.start_kill();
    }
}

/// Spawns yt-dlp writing the best audio-only stream straight to stdout.
///
/// Only spawning can fail here. Once the stream is handed out, a mid-stream
/// tool failure surfaces as an abruptly ended stream; stderr is discarded
/// because it would otherwise interleave with media bytes in logs.
pub async fn stream_audio(program: &Path, url: &str) -> Result<AudioStream, BridgeError> {
    let mut child = base_command(program)
        .arg("-f")
        .arg(MediaFormat::Audio.selector())
        .arg("--no-playlist")
        .arg("-o")
        .arg("-")
        .arg(url)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take().ok_or_else(|| {
        std::io::Error::other("child process stdout was not captured")
    })?;

    Ok(AudioStream {
        child,
        stdout: ReaderStream::new(stdout),
    })
}

/// Fetches a thumbnail image directly, without involving yt-dlp.
pub async fn fetch_thumbnail(client: &reqwest::Client, url: &str) -> Result<Bytes, BridgeError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(BridgeError::FetchFailure(format!(
            "thumbnail host answered {}",
            response.status()
        )));
    }
    Ok(response.bytes().await?)
}

/// Fetches a caption document verbatim, with a browser user-agent.
pub async fn fetch_caption_document(
    client: &reqwest::Client,
    url: &str,
) -> Result<String, BridgeError> {
    let response = client
        .get(url)
        .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(BridgeError::FetchFailure(format!(
            "caption host answered {}",
            response.status()
        )));
    }
    Ok(response.text().await?)
}
