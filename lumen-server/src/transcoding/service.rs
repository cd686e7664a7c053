//! On-demand transcoding with a per-key single-writer cache.
//!
//! The first request for an uncached `(source, width)` wins the per-key lock,
//! spawns the encoder detached from the request, and receives a live
//! fragmented-MP4 stream teed into the cache. Every other request polls the
//! cache files until the winner publishes the final artifact or an error
//! marker. Client disconnection never aborts an encoder; shutdown kills them
//! all.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lumen_core::probe::VideoInfo;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cache::{TranscodeCache, TranscodeCacheStatus};
use super::hardware::{is_gpu_error, render_node, GpuBackend, HardwareAccel};
use crate::streamio::{self, StreamOptions};

/// How long a losing request waits for the winner to publish the cache.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Cache polling cadence for waiting requests.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Stderr tail kept for error classification and reporting.
const STDERR_TAIL_BYTES: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("transcoding failed: {0}")]
    Encoder(String),

    #[error("timed out waiting for transcode to finish")]
    WaitTimeout,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a stream request is satisfied.
#[derive(Debug)]
pub enum StreamSource {
    /// Complete cached file; serve with a Content-Length.
    Cached(PathBuf),
    /// Live fragmented MP4 from an encoder started for this request.
    Live(mpsc::Receiver<Bytes>),
}

/// Encoder choice for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodePlan {
    /// Compatible codec/container and no downscale: remux only.
    Copy,
    Gpu(GpuBackend),
    Cpu,
}

/// Copy when nothing needs to change, otherwise GPU when one is usable,
/// otherwise CPU.
pub fn select_plan(info: &VideoInfo, target_width: u32, gpu: Option<GpuBackend>) -> EncodePlan {
    let needs_scale = target_width > 0 && target_width < info.width;
    if !info.needs_transcode && !needs_scale {
        EncodePlan::Copy
    } else if let Some(backend) = gpu {
        EncodePlan::Gpu(backend)
    } else {
        EncodePlan::Cpu
    }
}

#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub stream: StreamOptions,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stream: StreamOptions::default(),
        }
    }
}

/// Operator status for the transcoder.
#[derive(Debug, Serialize)]
pub struct TranscodeStatus {
    pub cache: TranscodeCacheStatus,
    pub active: Vec<String>,
    #[serde(rename = "gpuAvailable")]
    pub gpu_available: bool,
}

struct EncodeRun {
    cache_bytes: u64,
    client_bytes: u64,
}

struct EncodeFailure {
    message: String,
    client_bytes: u64,
}

pub struct TranscodeService {
    ffmpeg_path: String,
    cache: TranscodeCache,
    hardware: HardwareAccel,
    options: TranscodeOptions,
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// key → encoder pid; inserted after spawn and removed on exit by the
    /// launching task. `cleanup` only reads.
    processes: std::sync::Mutex<HashMap<String, u32>>,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
}

impl TranscodeService {
    pub fn new(
        ffmpeg_path: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
        hardware: HardwareAccel,
        options: TranscodeOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            ffmpeg_path: ffmpeg_path.into(),
            cache: TranscodeCache::new(cache_dir),
            hardware,
            options,
            locks: tokio::sync::Mutex::new(HashMap::new()),
            processes: std::sync::Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn cache(&self) -> &TranscodeCache {
        &self.cache
    }

    async fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn status(&self) -> std::io::Result<TranscodeStatus> {
        let cache = self.cache.status().await?;
        let active = self.processes.lock().unwrap().keys().cloned().collect();
        let gpu_available = self.hardware.is_available().await;
        Ok(TranscodeStatus {
            cache,
            active,
            gpu_available,
        })
    }

    /// Serve `(source, width)` from the cache, or start the encoder and
    /// stream it live, or wait for the run another request already started.
    pub async fn get_or_start(
        self: &Arc<Self>,
        source: &Path,
        target_width: u32,
        info: &VideoInfo,
    ) -> Result<StreamSource, TranscodeError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(TranscodeError::ShuttingDown);
        }
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(TranscodeError::NotFound(source.display().to_string()));
        }

        if let Some(path) = self.cache.lookup(source, target_width).await {
            return Ok(StreamSource::Cached(path));
        }

        let key = TranscodeCache::key(source, target_width);
        let lock = self.lock_for(&key).await;
        match lock.try_lock_owned() {
            Ok(guard) => {
                // Another request may have published while we raced for the
                // lock.
                if let Some(path) = self.cache.lookup(source, target_width).await {
                    return Ok(StreamSource::Cached(path));
                }
                self.cache.ensure_dir().await?;
                self.cache.clear_error(&key).await;

                let (tx, rx) = mpsc::channel(16);
                let service = Arc::clone(self);
                let source = source.to_path_buf();
                let info = info.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    service
                        .run_transcode(&key, &source, target_width, &info, tx)
                        .await;
                });
                Ok(StreamSource::Live(rx))
            }
            Err(_) => {
                let path = self.wait_for_cache(&key).await?;
                Ok(StreamSource::Cached(path))
            }
        }
    }

    /// Poll the cache files until the in-flight run resolves. Dropping the
    /// future (client disconnect) abandons the wait, never the transcode.
    async fn wait_for_cache(&self, key: &str) -> Result<PathBuf, TranscodeError> {
        let deadline = tokio::time::Instant::now() + self.options.wait_timeout;
        let log_every = (Duration::from_secs(2).as_millis()
            / self.options.poll_interval.as_millis().max(1)) as u32;
        let mut ticks = 0u32;

        loop {
            if let Some(message) = self.cache.read_error(key).await {
                return Err(TranscodeError::Encoder(message));
            }
            let final_path = self.cache.final_path(key);
            let tmp_gone = !tokio::fs::try_exists(self.cache.tmp_path(key))
                .await
                .unwrap_or(false);
            if tmp_gone && tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
                return Ok(final_path);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(TranscodeError::WaitTimeout);
            }
            ticks += 1;
            if log_every > 0 && ticks % log_every == 0 {
                info!("still waiting on transcode {key}");
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// The winner's detached run: encode, tee to the client, publish the
    /// cache entry, falling back from GPU to CPU once on hardware failure.
    async fn run_transcode(
        self: &Arc<Self>,
        key: &str,
        source: &Path,
        target_width: u32,
        info: &VideoInfo,
        client: mpsc::Sender<Bytes>,
    ) {
        let plan = select_plan(info, target_width, self.hardware.backend().await);
        info!(
            key,
            plan = ?plan,
            width = target_width,
            "starting transcode of {}",
            source.display()
        );

        let attempt = self
            .run_encoder(plan, key, source, target_width, info, Some(client.clone()))
            .await;

        match attempt {
            Ok(run) => {
                self.finalize_success(key, &run).await;
            }
            Err(failure) => {
                let retry_eligible = matches!(plan, EncodePlan::Gpu(_))
                    && is_gpu_error(&failure.message)
                    && !self.shutting_down.load(Ordering::Acquire)
                    && !self.shutdown.is_cancelled();

                if retry_eligible {
                    warn!(key, "GPU encode failed, retrying on CPU: {}", failure.message);
                    self.hardware.disable().await;
                    let _ = tokio::fs::remove_file(self.cache.tmp_path(key)).await;

                    // The client can only be reattached if it never saw any
                    // bytes from the first attempt.
                    let retry_client = (failure.client_bytes == 0).then(|| client.clone());
                    match self
                        .run_encoder(EncodePlan::Cpu, key, source, target_width, info, retry_client)
                        .await
                    {
                        Ok(run) => self.finalize_success(key, &run).await,
                        Err(failure) => self.finalize_failure(key, &failure.message).await,
                    }
                } else {
                    self.finalize_failure(key, &failure.message).await;
                }
            }
        }
    }

    async fn finalize_success(&self, key: &str, run: &EncodeRun) {
        let tmp = self.cache.tmp_path(key);
        let final_path = self.cache.final_path(key);
        // The rename is the linearization point that publishes the entry.
        match tokio::fs::rename(&tmp, &final_path).await {
            Ok(()) => {
                self.cache.clear_error(key).await;
                info!(
                    key,
                    bytes = run.cache_bytes,
                    client_bytes = run.client_bytes,
                    "transcode complete"
                );
            }
            Err(e) => {
                error!(key, "could not publish transcode: {e}");
                let _ = tokio::fs::remove_file(&tmp).await;
                self.cache.write_error(key, &format!("publish failed: {e}")).await;
            }
        }
    }

    async fn finalize_failure(&self, key: &str, message: &str) {
        warn!(key, "transcode failed: {message}");
        self.cache.write_error(key, message).await;
        let _ = tokio::fs::remove_file(self.cache.tmp_path(key)).await;
        let _ = tokio::fs::remove_file(self.cache.final_path(key)).await;
    }

    /// Run one encoder process to completion. With a client attached the
    /// output is fragmented MP4 teed from stdout into the tmp file; without
    /// one, ffmpeg writes a fast-start MP4 to the tmp file directly.
    async fn run_encoder(
        &self,
        plan: EncodePlan,
        key: &str,
        source: &Path,
        target_width: u32,
        info: &VideoInfo,
        client: Option<mpsc::Sender<Bytes>>,
    ) -> Result<EncodeRun, EncodeFailure> {
        let tmp = self.cache.tmp_path(key);
        let live = client.is_some();
        let output_file = if live { None } else { Some(tmp.as_path()) };
        let args = build_ffmpeg_args(plan, source, info, target_width, output_file);

        debug!(key, "ffmpeg {}", args.join(" "));
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.stdout(if live { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd.spawn().map_err(|e| EncodeFailure {
            message: format!("failed to spawn {}: {e}", self.ffmpeg_path),
            client_bytes: 0,
        })?;

        let pid = child.id().unwrap_or(0);
        self.processes.lock().unwrap().insert(key.to_string(), pid);

        // Dropping the drive future on shutdown drops the child, which kills
        // the encoder (kill_on_drop).
        let result = tokio::select! {
            result = self.drive_encoder(&mut child, &tmp, client) => result,
            _ = self.shutdown.cancelled() => Err(EncodeFailure {
                message: "killed by shutdown".into(),
                client_bytes: 0,
            }),
        };

        if self.shutdown.is_cancelled() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.processes.lock().unwrap().remove(key);
        result
    }

    async fn drive_encoder(
        &self,
        child: &mut tokio::process::Child,
        tmp: &Path,
        client: Option<mpsc::Sender<Bytes>>,
    ) -> Result<EncodeRun, EncodeFailure> {
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut tail = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ffmpeg: {line}");
                    tail.push_str(&line);
                    tail.push('\n');
                    if tail.len() > STDERR_TAIL_BYTES {
                        let cut = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..cut);
                    }
                }
            }
            tail
        });

        let mut cache_bytes = 0u64;
        let mut client_bytes = 0u64;
        let mut tee_error: Option<String> = None;

        if let Some(client) = client {
            let stdout = child.stdout.take();
            match stdout {
                Some(stdout) => {
                    match tokio::fs::File::create(tmp).await {
                        Ok(mut tmp_file) => {
                            match streamio::tee_with_timeout(
                                stdout,
                                &mut tmp_file,
                                client,
                                &self.options.stream,
                            )
                            .await
                            {
                                Ok(outcome) => {
                                    cache_bytes = outcome.bytes;
                                    client_bytes = outcome.client_bytes;
                                    if let Err(e) = outcome.client {
                                        // The stream leg is expendable; the
                                        // cache leg already has everything.
                                        debug!("client leg ended early: {e}");
                                    }
                                }
                                Err(e) => tee_error = Some(format!("cache write failed: {e}")),
                            }
                        }
                        Err(e) => tee_error = Some(format!("could not create tmp file: {e}")),
                    }
                    if tee_error.is_some() {
                        let _ = child.start_kill();
                    }
                }
                None => tee_error = Some("encoder produced no stdout".into()),
            }
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                return Err(EncodeFailure {
                    message: format!("failed waiting on encoder: {e}"),
                    client_bytes,
                })
            }
        };
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if let Some(message) = tee_error {
            return Err(EncodeFailure {
                message,
                client_bytes,
            });
        }
        if !status.success() {
            return Err(EncodeFailure {
                message: format!(
                    "encoder exited with {}: {}",
                    status,
                    stderr_tail.trim().lines().last().unwrap_or("no output")
                ),
                client_bytes,
            });
        }

        Ok(EncodeRun {
            cache_bytes,
            client_bytes,
        })
    }

    /// Remove every cached artifact for `source`, all widths.
    pub async fn invalidate(&self, source: &Path) -> std::io::Result<u64> {
        self.cache.invalidate_source(source).await
    }

    pub async fn clear(&self) -> std::io::Result<u64> {
        self.cache.clear().await
    }

    /// Stop accepting work, suppress the GPU→CPU retry, and kill every
    /// tracked encoder. Ordered before server shutdown.
    pub async fn cleanup(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let remaining = self.processes.lock().unwrap().len();
            if remaining == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("{remaining} encoder(s) still winding down at shutdown");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("transcoder cleanup complete");
    }
}

impl std::fmt::Debug for TranscodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeService")
            .field("ffmpeg_path", &self.ffmpeg_path)
            .field("active", &self.processes.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

/// Assemble the ffmpeg invocation. With `output_file` set, ffmpeg writes a
/// seekable fast-start MP4 to that path; without it, output is fragmented
/// MP4 on stdout for the tee.
fn build_ffmpeg_args(
    plan: EncodePlan,
    source: &Path,
    info: &VideoInfo,
    target_width: u32,
    output_file: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
    ];

    if let EncodePlan::Gpu(GpuBackend::Vaapi) = plan {
        let device = render_node().unwrap_or_else(|| "/dev/dri/renderD128".to_string());
        args.extend(["-vaapi_device".into(), device]);
    }

    args.extend(["-i".into(), source.display().to_string()]);
    args.extend(["-map".into(), "0:v:0".into(), "-map".into(), "0:a:0?".into()]);

    // Re-encode paths always carry a scale filter: it forces the even
    // dimensions established at probe time even when no downscale happens.
    let width = effective_width(info, target_width);
    match plan {
        EncodePlan::Copy => {
            args.extend(["-c:v".into(), "copy".into()]);
        }
        EncodePlan::Gpu(GpuBackend::Vaapi) => {
            args.extend([
                "-vf".into(),
                format!("format=nv12,hwupload,scale_vaapi=w={width}:h=-2"),
                "-c:v".into(),
                "h264_vaapi".into(),
            ]);
        }
        EncodePlan::Gpu(GpuBackend::Nvenc) => {
            args.extend([
                "-vf".into(),
                format!("scale={width}:-2,format=yuv420p"),
                "-c:v".into(),
                "h264_nvenc".into(),
                "-preset".into(),
                "p4".into(),
            ]);
        }
        EncodePlan::Gpu(GpuBackend::VideoToolbox) => {
            args.extend([
                "-vf".into(),
                format!("scale={width}:-2,format=yuv420p"),
                "-c:v".into(),
                "h264_videotoolbox".into(),
                "-b:v".into(),
                "6M".into(),
            ]);
        }
        EncodePlan::Cpu => {
            args.extend([
                "-vf".into(),
                format!("scale={width}:-2,format=yuv420p"),
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "veryfast".into(),
                "-crf".into(),
                "23".into(),
            ]);
        }
    }

    // Uniform AAC audio regardless of path.
    args.extend(["-c:a".into(), "aac".into(), "-b:a".into(), "128k".into()]);

    match output_file {
        Some(path) => {
            args.extend([
                "-movflags".into(),
                "+faststart".into(),
                "-f".into(),
                "mp4".into(),
                path.display().to_string(),
            ]);
        }
        None => {
            args.extend([
                "-movflags".into(),
                "frag_keyframe+empty_moov".into(),
                "-f".into(),
                "mp4".into(),
                "pipe:1".into(),
            ]);
        }
    }
    args
}

fn effective_width(info: &VideoInfo, target_width: u32) -> u32 {
    if target_width > 0 && target_width < info.width {
        target_width + (target_width & 1)
    } else {
        info.width.max(2)
    }
}
