//! Thumbnail pipeline.
//!
//! Derived still images live under `<cache>/thumbnails/<fingerprint>.jpg`.
//! Per-path mutexes give each thumbnail a single writer; a semaphore caps
//! concurrent decode work so transcodes aren't starved of CPU. The sweep
//! pre-generates thumbnails after every index run; on-demand requests that
//! race a generation in flight report pending instead of blocking.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{MediaError, Result};
use crate::probe::Prober;
use crate::store::MediaStore;
use crate::types::{FileRecord, MediaKind};

/// Bounding box for generated thumbnails.
pub const THUMB_BOX: u32 = 320;

const JPEG_QUALITY: u8 = 80;

/// Outcome of a synchronous thumbnail lookup.
#[derive(Debug)]
pub enum ThumbnailOutcome {
    Ready(Vec<u8>),
    /// Another request is generating this thumbnail right now.
    Pending,
}

/// Operator-facing pipeline counters.
#[derive(Debug, Clone, Serialize)]
pub struct ThumbnailStatus {
    pub generated: u64,
    pub pending: u64,
    pub failed: u64,
    #[serde(rename = "lastSweepAt")]
    pub last_sweep_at: Option<DateTime<Utc>>,
}

pub struct ThumbnailService {
    store: MediaStore,
    media_root: PathBuf,
    cache_dir: PathBuf,
    ffmpeg_path: String,
    prober: Prober,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    permits: Arc<Semaphore>,
    generated: AtomicU64,
    pending: AtomicU64,
    failed: AtomicU64,
    last_sweep_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl ThumbnailService {
    pub fn new(
        store: MediaStore,
        media_root: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        ffmpeg_path: impl Into<String>,
        ffprobe_path: impl Into<String>,
        workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            media_root: media_root.into(),
            cache_dir: cache_dir.into(),
            ffmpeg_path: ffmpeg_path.into(),
            prober: Prober::new(ffprobe_path),
            locks: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            generated: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_sweep_at: std::sync::Mutex::new(None),
        })
    }

    fn thumb_path(&self, fingerprint: &str) -> PathBuf {
        self.cache_dir.join(format!("{fingerprint}.jpg"))
    }

    async fn lock_for(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn status(&self) -> ThumbnailStatus {
        ThumbnailStatus {
            generated: self.generated.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_sweep_at: *self.last_sweep_at.lock().unwrap(),
        }
    }

    /// Fetch the thumbnail for `rel_path`, generating it if absent or stale.
    /// Returns [`ThumbnailOutcome::Pending`] when another request already
    /// holds the generation lock.
    pub async fn get_or_generate(&self, rel_path: &str) -> Result<ThumbnailOutcome> {
        let record = self
            .store
            .get_file_by_path(rel_path)
            .await?
            .ok_or_else(|| MediaError::NotFound(rel_path.to_string()))?;

        if !matches!(record.kind, MediaKind::Image | MediaKind::Video) {
            return Err(MediaError::InvalidMedia(format!(
                "no thumbnail for {} entries",
                record.kind
            )));
        }

        let thumb = self.thumb_path(&record.fingerprint);
        let source = self.media_root.join(&record.path);

        if is_fresh(&thumb, &source).await {
            return Ok(ThumbnailOutcome::Ready(tokio::fs::read(&thumb).await?));
        }

        let lock = self.lock_for(&record.path).await;
        let Ok(_guard) = lock.try_lock() else {
            return Ok(ThumbnailOutcome::Pending);
        };

        // Re-check under the lock: the previous holder may have finished.
        if is_fresh(&thumb, &source).await {
            return Ok(ThumbnailOutcome::Ready(tokio::fs::read(&thumb).await?));
        }

        let bytes = self.generate(&record).await?;
        Ok(ThumbnailOutcome::Ready(bytes))
    }

    /// Pre-generate thumbnails for every image/video record whose thumbnail
    /// is absent or stale. Entries being generated on demand are skipped.
    pub async fn sweep(self: Arc<Self>) {
        *self.last_sweep_at.lock().unwrap() = Some(Utc::now());

        let records = match self
            .store
            .list_files_of_kinds(&[MediaKind::Image, MediaKind::Video])
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!("thumbnail sweep could not list records: {e}");
                return;
            }
        };

        info!("thumbnail sweep over {} records", records.len());
        let mut handles = Vec::new();
        let mut skipped = 0usize;

        for record in records {
            let thumb = self.thumb_path(&record.fingerprint);
            let source = self.media_root.join(&record.path);
            if is_fresh(&thumb, &source).await {
                skipped += 1;
                continue;
            }

            let service = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let lock = service.lock_for(&record.path).await;
                let Ok(_guard) = lock.try_lock() else {
                    // Being generated on demand; leave it alone.
                    return;
                };
                if let Err(e) = service.generate(&record).await {
                    debug!("thumbnail for {} failed: {e}", record.path);
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        debug!(skipped, "thumbnail sweep finished");
    }

    /// Remove the cached thumbnail for `rel_path`. Returns whether one existed.
    pub async fn invalidate(&self, rel_path: &str) -> Result<bool> {
        let record = self
            .store
            .get_file_by_path(rel_path)
            .await?
            .ok_or_else(|| MediaError::NotFound(rel_path.to_string()))?;
        match tokio::fs::remove_file(self.thumb_path(&record.fingerprint)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop every cached thumbnail; the next sweep rebuilds from scratch.
    pub async fn clear(&self) -> Result<u64> {
        let mut removed = 0u64;
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("jpg")
                && tokio::fs::remove_file(entry.path()).await.is_ok()
            {
                removed += 1;
            }
        }
        info!("cleared {removed} cached thumbnails");
        Ok(removed)
    }

    /// Generate, persist, and return the thumbnail for `record`. Caller must
    /// hold the per-path lock.
    async fn generate(&self, record: &FileRecord) -> Result<Vec<u8>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| MediaError::Cancelled("thumbnail pool closed".into()))?;
        self.pending.fetch_add(1, Ordering::Relaxed);

        let result = self.generate_inner(record).await;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        match &result {
            Ok(_) => {
                self.generated.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("thumbnail generation for {} failed: {e}", record.path);
            }
        }
        result
    }

    async fn generate_inner(&self, record: &FileRecord) -> Result<Vec<u8>> {
        let source = self.media_root.join(&record.path);
        let bytes = match record.kind {
            MediaKind::Image => {
                let source = source.clone();
                tokio::task::spawn_blocking(move || image_thumbnail(&source))
                    .await
                    .map_err(|e| MediaError::Internal(format!("thumbnail task: {e}")))??
            }
            MediaKind::Video => self.video_thumbnail(&source).await?,
            MediaKind::Folder | MediaKind::Playlist => {
                return Err(MediaError::InvalidMedia(format!(
                    "no thumbnail for {} entries",
                    record.kind
                )))
            }
        };

        let thumb = self.thumb_path(&record.fingerprint);
        if let Some(parent) = thumb.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never observe a half-written file.
        let tmp = thumb.with_extension("jpg.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &thumb).await?;
        debug!("thumbnail written for {}", record.path);
        Ok(bytes)
    }

    /// Grab a representative frame early in the stream: 10% into the
    /// duration, falling back to the one-second mark.
    async fn video_thumbnail(&self, source: &Path) -> Result<Vec<u8>> {
        let seek = match self.prober.probe(source).await {
            Ok(info) if info.duration > 0.0 => (info.duration * 0.1).max(1.0),
            _ => 1.0,
        };

        let frame = match self.extract_frame(source, seek).await {
            Ok(frame) => frame,
            Err(_) if seek > 1.0 => self.extract_frame(source, 1.0).await?,
            Err(e) => return Err(e),
        };

        tokio::task::spawn_blocking(move || {
            let img = image::load_from_memory(&frame)?;
            encode_jpeg(downscale(img))
        })
        .await
        .map_err(|e| MediaError::Internal(format!("thumbnail task: {e}")))?
    }

    async fn extract_frame(&self, source: &Path, seek: f64) -> Result<Vec<u8>> {
        let output = tokio::process::Command::new(&self.ffmpeg_path)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-ss")
            .arg(format!("{seek:.3}"))
            .arg("-i")
            .arg(source)
            .args(["-frames:v", "1", "-f", "image2pipe", "-c:v", "png", "pipe:1"])
            .output()
            .await
            .map_err(|e| MediaError::Probe(format!("failed to run {}: {e}", self.ffmpeg_path)))?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(MediaError::InvalidMedia(format!(
                "frame extraction at {seek:.1}s failed for {}",
                source.display()
            )));
        }
        Ok(output.stdout)
    }
}

impl std::fmt::Debug for ThumbnailService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailService")
            .field("cache_dir", &self.cache_dir)
            .field("generated", &self.generated.load(Ordering::Relaxed))
            .field("failed", &self.failed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A thumbnail is fresh when it exists and is no older than its source.
async fn is_fresh(thumb: &Path, source: &Path) -> bool {
    let Ok(thumb_meta) = tokio::fs::metadata(thumb).await else {
        return false;
    };
    let Ok(source_meta) = tokio::fs::metadata(source).await else {
        // Source vanished; serve the cached artifact until the index reaps it.
        return true;
    };
    match (thumb_meta.modified(), source_meta.modified()) {
        (Ok(t), Ok(s)) => t >= s,
        _ => false,
    }
}

fn image_thumbnail(source: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(source)?;
    let img = image::load_from_memory(&bytes)?;
    let img = apply_orientation(img, exif_orientation(&bytes).unwrap_or(1));
    encode_jpeg(downscale(img))
}

/// Downscale into the thumbnail box, preserving aspect ratio and never
/// upscaling.
fn downscale(img: DynamicImage) -> DynamicImage {
    if img.width() <= THUMB_BOX && img.height() <= THUMB_BOX {
        return img;
    }
    img.resize(THUMB_BOX, THUMB_BOX, FilterType::CatmullRom)
}

fn encode_jpeg(img: DynamicImage) -> Result<Vec<u8>> {
    use image::codecs::jpeg::JpegEncoder;

    let rgb = img.to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)?;
    Ok(buffer.into_inner())
}

/// Apply the standard EXIF orientation transform (values 1..=8).
fn apply_orientation(img: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate90().flipv(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Pull the orientation tag out of a JPEG APP1 segment or a bare TIFF
/// header. Returns `None` for formats without one.
fn exif_orientation(bytes: &[u8]) -> Option<u16> {
    if bytes.starts_with(&[0xFF, 0xD8]) {
        return jpeg_exif_segment(bytes).and_then(tiff_orientation);
    }
    if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        return tiff_orientation(bytes);
    }
    None
}

/// Walk JPEG markers to the Exif APP1 payload.
fn jpeg_exif_segment(bytes: &[u8]) -> Option<&[u8]> {
    let mut pos = 2usize;
    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            return None;
        }
        let marker = bytes[pos + 1];
        // Start-of-scan or end: no APP1 coming.
        if marker == 0xDA || marker == 0xD9 {
            return None;
        }
        let len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        if len < 2 || pos + 2 + len > bytes.len() {
            return None;
        }
        let payload = &bytes[pos + 4..pos + 2 + len];
        if marker == 0xE1 {
            if let Some(tiff) = payload.strip_prefix(b"Exif\0\0") {
                return Some(tiff);
            }
        }
        pos += 2 + len;
    }
    None
}

fn tiff_orientation(tiff: &[u8]) -> Option<u16> {
    if tiff.len() < 8 {
        return None;
    }
    let le = match &tiff[0..2] {
        b"II" => true,
        b"MM" => false,
        _ => return None,
    };
    let read_u16 = |offset: usize| -> Option<u16> {
        let raw: [u8; 2] = tiff.get(offset..offset + 2)?.try_into().ok()?;
        Some(if le {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        })
    };
    let read_u32 = |offset: usize| -> Option<u32> {
        let raw: [u8; 4] = tiff.get(offset..offset + 4)?.try_into().ok()?;
        Some(if le {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    };

    if read_u16(2)? != 42 {
        return None;
    }
    let ifd = read_u32(4)? as usize;
    let count = read_u16(ifd)? as usize;
    for i in 0..count {
        let entry = ifd + 2 + i * 12;
        if read_u16(entry)? == 0x0112 {
            let value = read_u16(entry + 8)?;
            if (1..=8).contains(&value) {
                return Some(value);
            }
        }
    }
    None
}
