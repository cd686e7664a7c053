//! Content-addressed transcode cache.
//!
//! One flat directory of MP4 files keyed by `basename(source)_w<width>.mp4`.
//! A `.tmp` sibling marks an in-flight transcode and an `.err` sibling
//! records the failure message for waiting requests. The tmp→final rename is
//! the single point that publishes an entry; anything observing the final
//! file may assume it is complete.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, info, warn};

/// Counts for the operator status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TranscodeCacheStatus {
    pub entries: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: u64,
    #[serde(rename = "inProgress")]
    pub in_progress: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct TranscodeCache {
    dir: PathBuf,
}

impl TranscodeCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Cache key for a source and target width.
    pub fn key(source: &Path, target_width: u32) -> String {
        let basename = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");
        format!("{basename}_w{target_width}.mp4")
    }

    pub fn final_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    pub fn tmp_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.tmp"))
    }

    pub fn err_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.err"))
    }

    /// Return the cached file for `(source, width)` if it exists and is at
    /// least as new as the source. A stale entry is unlinked on sight.
    pub async fn lookup(&self, source: &Path, target_width: u32) -> Option<PathBuf> {
        let path = self.final_path(&Self::key(source, target_width));
        let cached_mtime = tokio::fs::metadata(&path).await.ok()?.modified().ok()?;

        let source_mtime = tokio::fs::metadata(source)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        if cached_mtime >= source_mtime {
            debug!("transcode cache hit: {}", path.display());
            Some(path)
        } else {
            info!("transcode cache stale, unlinking {}", path.display());
            let _ = tokio::fs::remove_file(&path).await;
            None
        }
    }

    /// Record a failure for waiting requests to pick up.
    pub async fn write_error(&self, key: &str, message: &str) {
        if let Err(e) = tokio::fs::write(self.err_path(key), message).await {
            warn!("could not write error marker for {key}: {e}");
        }
    }

    pub async fn read_error(&self, key: &str) -> Option<String> {
        tokio::fs::read_to_string(self.err_path(key)).await.ok()
    }

    pub async fn clear_error(&self, key: &str) {
        let _ = tokio::fs::remove_file(self.err_path(key)).await;
    }

    /// Drop every artifact (final, tmp, err) for any width of `source`.
    pub async fn invalidate_source(&self, source: &Path) -> std::io::Result<u64> {
        let Some(basename) = source.file_name().and_then(|n| n.to_str()) else {
            return Ok(0);
        };
        let prefix = format!("{basename}_w");

        let mut removed = 0u64;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("invalidated {removed} transcode artifacts for {basename}");
        }
        Ok(removed)
    }

    /// Empty the cache directory.
    pub async fn clear(&self) -> std::io::Result<u64> {
        let mut removed = 0u64;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false)
                && tokio::fs::remove_file(entry.path()).await.is_ok()
            {
                removed += 1;
            }
        }
        info!("cleared {removed} transcode cache files");
        Ok(removed)
    }

    pub async fn status(&self) -> std::io::Result<TranscodeCacheStatus> {
        let mut status = TranscodeCacheStatus::default();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(status),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp") {
                status.in_progress += 1;
            } else if name.ends_with(".err") {
                status.failed += 1;
            } else if name.ends_with(".mp4") {
                status.entries += 1;
                if let Ok(meta) = entry.metadata().await {
                    status.total_bytes += meta.len();
                }
            }
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(path: &Path, mtime: SystemTime) {
        let file = File::create(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn key_matches_basename_and_width() {
        assert_eq!(TranscodeCache::key(Path::new("/media/videos/c.mp4"), 0), "c.mp4_w0.mp4");
        assert_eq!(
            TranscodeCache::key(Path::new("/media/videos/clip.mkv"), 1280),
            "clip.mkv_w1280.mp4"
        );
    }

    #[test]
    fn sibling_paths() {
        let cache = TranscodeCache::new("/cache/transcodes");
        assert_eq!(
            cache.final_path("c.mp4_w0.mp4"),
            PathBuf::from("/cache/transcodes/c.mp4_w0.mp4")
        );
        assert_eq!(
            cache.tmp_path("c.mp4_w0.mp4"),
            PathBuf::from("/cache/transcodes/c.mp4_w0.mp4.tmp")
        );
        assert_eq!(
            cache.err_path("c.mp4_w0.mp4"),
            PathBuf::from("/cache/transcodes/c.mp4_w0.mp4.err")
        );
    }

    #[tokio::test]
    async fn lookup_hits_fresh_entries() {
        let media = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let cache = TranscodeCache::new(dir.path());

        let source = media.path().join("c.mp4");
        let now = SystemTime::now();
        touch(&source, now - Duration::from_secs(60));
        touch(&cache.final_path("c.mp4_w0.mp4"), now);

        let hit = cache.lookup(&source, 0).await.unwrap();
        assert_eq!(hit, cache.final_path("c.mp4_w0.mp4"));
    }

    #[tokio::test]
    async fn lookup_unlinks_stale_entries() {
        let media = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let cache = TranscodeCache::new(dir.path());

        let source = media.path().join("c.mp4");
        let now = SystemTime::now();
        touch(&source, now);
        touch(&cache.final_path("c.mp4_w0.mp4"), now - Duration::from_secs(60));

        assert!(cache.lookup(&source, 0).await.is_none());
        assert!(!cache.final_path("c.mp4_w0.mp4").exists());
    }

    #[tokio::test]
    async fn lookup_misses_when_absent() {
        let media = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let cache = TranscodeCache::new(dir.path());
        assert!(cache.lookup(&media.path().join("c.mp4"), 0).await.is_none());
    }

    #[tokio::test]
    async fn error_marker_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = TranscodeCache::new(dir.path());

        assert!(cache.read_error("k.mp4").await.is_none());
        cache.write_error("k.mp4", "encoder exploded").await;
        assert_eq!(cache.read_error("k.mp4").await.unwrap(), "encoder exploded");
        cache.clear_error("k.mp4").await;
        assert!(cache.read_error("k.mp4").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_source_removes_all_widths() {
        let dir = TempDir::new().unwrap();
        let cache = TranscodeCache::new(dir.path());
        let now = SystemTime::now();
        touch(&cache.final_path("c.mp4_w0.mp4"), now);
        touch(&cache.final_path("c.mp4_w1280.mp4"), now);
        touch(&cache.err_path("c.mp4_w640.mp4"), now);
        touch(&cache.final_path("other.mp4_w0.mp4"), now);

        let removed = cache.invalidate_source(Path::new("videos/c.mp4")).await.unwrap();
        assert_eq!(removed, 3);
        assert!(cache.final_path("other.mp4_w0.mp4").exists());
    }

    #[tokio::test]
    async fn status_counts_by_kind() {
        let dir = TempDir::new().unwrap();
        let cache = TranscodeCache::new(dir.path());
        let now = SystemTime::now();
        std::fs::write(cache.final_path("a.mp4_w0.mp4"), vec![0u8; 100]).unwrap();
        std::fs::write(cache.final_path("b.mp4_w0.mp4"), vec![0u8; 50]).unwrap();
        touch(&cache.tmp_path("c.mp4_w0.mp4"), now);
        touch(&cache.err_path("d.mp4_w0.mp4"), now);

        let status = cache.status().await.unwrap();
        assert_eq!(status.entries, 2);
        assert_eq!(status.total_bytes, 150);
        assert_eq!(status.in_progress, 1);
        assert_eq!(status.failed, 1);

        let cleared = cache.clear().await.unwrap();
        assert_eq!(cleared, 4);
    }
}
