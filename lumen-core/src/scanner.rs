//! Parallel filesystem traversal.
//!
//! One blocking walker thread performs a depth-first traversal of the media
//! root and feeds per-entry jobs into a bounded channel; a small pool of
//! async workers filters entries and builds [`FileRecord`]s; a collector
//! gathers them for the indexer. Bounded channels give backpressure: a slow
//! collector throttles the walk, which matters on NFS-backed libraries.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{MediaError, Result};
use crate::types::{datetime_from_system, rel_path, FileRecord, MediaKind};

/// Default number of entries buffered between walker and workers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Scanner tuning knobs. `workers` defaults to the NFS-safe 3 and is raised
/// through `INDEX_WORKERS`.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub workers: usize,
    pub channel_capacity: usize,
    pub skip_hidden: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            workers: lumen_config::DEFAULT_INDEX_WORKERS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            skip_hidden: true,
        }
    }
}

/// Live counters the indexer exposes through its progress endpoint.
#[derive(Debug, Default)]
pub struct ScanCounters {
    pub files: AtomicU64,
    pub folders: AtomicU64,
    pub errors: AtomicU64,
}

impl ScanCounters {
    pub fn reset(&self) {
        self.files.store(0, Ordering::Relaxed);
        self.folders.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// Result of one traversal.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub records: Vec<FileRecord>,
    pub files: u64,
    pub folders: u64,
    pub errors: u64,
}

/// One walked entry, handed from the walker to the worker pool.
#[derive(Debug)]
struct FileJob {
    rel_path: String,
    is_dir: bool,
    size: u64,
    modified: SystemTime,
}

/// Walk `root` and build records for every entry that passes the filter.
///
/// Hidden entries (leading `.`) are pruned recursively when
/// `options.skip_hidden` is set. Files whose extension maps to no media kind
/// are discarded. Per-entry failures are counted and logged; only a missing
/// or unreadable root is fatal. On cancellation all tasks drain out and the
/// partial outcome is returned.
pub async fn scan(
    root: &Path,
    options: &ScanOptions,
    cancel: &CancellationToken,
    counters: Option<Arc<ScanCounters>>,
) -> Result<ScanOutcome> {
    let meta = tokio::fs::metadata(root).await.map_err(|e| {
        MediaError::NotFound(format!("media root {}: {e}", root.display()))
    })?;
    if !meta.is_dir() {
        return Err(MediaError::InvalidMedia(format!(
            "media root {} is not a directory",
            root.display()
        )));
    }

    let workers = options.workers.max(1);
    let capacity = options.channel_capacity.max(1);
    let (jobs_tx, jobs_rx) = flume::bounded::<FileJob>(capacity);
    let (results_tx, results_rx) = flume::bounded::<FileRecord>(capacity);
    let errors = Arc::new(AtomicU64::new(0));

    info!(
        root = %root.display(),
        workers,
        "starting media scan"
    );

    let walker = spawn_walker(
        root.to_path_buf(),
        options.skip_hidden,
        jobs_tx,
        cancel.clone(),
        errors.clone(),
    );

    let mut worker_handles = Vec::with_capacity(workers);
    for id in 0..workers {
        worker_handles.push(tokio::spawn(run_worker(
            id,
            jobs_rx.clone(),
            results_tx.clone(),
            cancel.clone(),
        )));
    }
    // Workers hold the only remaining result senders; the channel closes
    // when the last worker exits.
    drop(jobs_rx);
    drop(results_tx);

    let collector = tokio::spawn(run_collector(results_rx, counters));

    if let Err(e) = walker.await {
        warn!("scanner walker task failed: {e}");
        errors.fetch_add(1, Ordering::Relaxed);
    }
    for handle in worker_handles {
        let _ = handle.await;
    }
    let (records, files, folders) = collector.await.unwrap_or_default();

    let outcome = ScanOutcome {
        records,
        files,
        folders,
        errors: errors.load(Ordering::Relaxed),
    };
    info!(
        files = outcome.files,
        folders = outcome.folders,
        errors = outcome.errors,
        cancelled = cancel.is_cancelled(),
        "media scan finished"
    );
    Ok(outcome)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

fn spawn_walker(
    root: PathBuf,
    skip_hidden: bool,
    jobs_tx: flume::Sender<FileJob>,
    cancel: CancellationToken,
    errors: Arc<AtomicU64>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let walk = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !skip_hidden || !is_hidden(e.file_name()));

        for entry in walk {
            if cancel.is_cancelled() {
                debug!("walker cancelled");
                return;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("walk error: {e}");
                    errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            let Some(rel) = rel_path(&root, entry.path()) else {
                warn!("skipping non-UTF-8 path: {}", entry.path().display());
                errors.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("stat {} failed: {e}", entry.path().display());
                    errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let mut job = FileJob {
                rel_path: rel,
                is_dir: meta.is_dir(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            };

            // Bounded send with periodic cancellation checks so a stalled
            // pipeline can't wedge the walker thread.
            loop {
                match jobs_tx.send_timeout(job, Duration::from_millis(200)) {
                    Ok(()) => break,
                    Err(flume::SendTimeoutError::Timeout(returned)) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        job = returned;
                    }
                    Err(flume::SendTimeoutError::Disconnected(_)) => return,
                }
            }
        }
    })
}

async fn run_worker(
    id: usize,
    jobs_rx: flume::Receiver<FileJob>,
    results_tx: flume::Sender<FileRecord>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let job = match jobs_rx.recv_async().await {
            Ok(job) => job,
            Err(_) => break,
        };

        let record = if job.is_dir {
            FileRecord::new(
                job.rel_path,
                MediaKind::Folder,
                0,
                datetime_from_system(job.modified),
            )
        } else {
            match MediaKind::for_path(Path::new(&job.rel_path)) {
                Some(kind) => FileRecord::new(
                    job.rel_path,
                    kind,
                    job.size,
                    datetime_from_system(job.modified),
                ),
                // Unrecognized extension: not catalogued.
                None => continue,
            }
        };

        if cancel.is_cancelled() {
            break;
        }
        if results_tx.send_async(record).await.is_err() {
            break;
        }
    }
    debug!(worker = id, "scan worker done");
}

async fn run_collector(
    results_rx: flume::Receiver<FileRecord>,
    counters: Option<Arc<ScanCounters>>,
) -> (Vec<FileRecord>, u64, u64) {
    let mut records = Vec::new();
    let mut files = 0u64;
    let mut folders = 0u64;

    while let Ok(record) = results_rx.recv_async().await {
        match record.kind {
            MediaKind::Folder => {
                folders += 1;
                if let Some(c) = &counters {
                    c.folders.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {
                files += 1;
                if let Some(c) = &counters {
                    c.files.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        records.push(record);
    }

    (records, files, folders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("photos")).unwrap();
        fs::create_dir_all(dir.path().join("videos")).unwrap();
        fs::write(dir.path().join("photos/a.jpg"), vec![0u8; 1024]).unwrap();
        fs::write(dir.path().join("photos/b.png"), vec![0u8; 1024]).unwrap();
        fs::write(dir.path().join("videos/c.mp4"), b"not really mp4").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        dir
    }

    #[tokio::test]
    async fn scans_fixture_tree() {
        let dir = fixture_tree();
        let outcome = scan(
            dir.path(),
            &ScanOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.files, 3);
        assert_eq!(outcome.folders, 2);
        assert_eq!(outcome.errors, 0);
        assert_eq!(outcome.records.len(), 5);

        let mut paths: Vec<_> = outcome.records.iter().map(|r| r.path.as_str()).collect();
        paths.sort_unstable();
        assert_eq!(
            paths,
            vec!["photos", "photos/a.jpg", "photos/b.png", "videos", "videos/c.mp4"]
        );
    }

    #[tokio::test]
    async fn hidden_entries_are_pruned() {
        let dir = fixture_tree();
        fs::create_dir_all(dir.path().join("photos/.thumbs")).unwrap();
        fs::write(dir.path().join("photos/.thumbs/t.jpg"), b"x").unwrap();
        fs::write(dir.path().join("photos/.secret.png"), b"x").unwrap();

        let outcome = scan(
            dir.path(),
            &ScanOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.files, 3);
        assert_eq!(outcome.folders, 2);
        assert!(outcome.records.iter().all(|r| !r.path.contains(".thumbs")));
        assert!(outcome.records.iter().all(|r| !r.path.contains(".secret")));
    }

    #[tokio::test]
    async fn hidden_entries_kept_when_disabled() {
        let dir = fixture_tree();
        fs::write(dir.path().join("photos/.secret.png"), b"x").unwrap();

        let options = ScanOptions {
            skip_hidden: false,
            ..ScanOptions::default()
        };
        let outcome = scan(dir.path(), &options, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(outcome
            .records
            .iter()
            .any(|r| r.path == "photos/.secret.png"));
    }

    #[tokio::test]
    async fn records_carry_sizes_and_fingerprints() {
        let dir = fixture_tree();
        let outcome = scan(
            dir.path(),
            &ScanOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

        let a = outcome
            .records
            .iter()
            .find(|r| r.path == "photos/a.jpg")
            .unwrap();
        assert_eq!(a.kind, MediaKind::Image);
        assert_eq!(a.size, 1024);
        assert_eq!(a.mime, "image/jpeg");
        assert_eq!(a.fingerprint.len(), 32);
        assert_eq!(a.parent_path, "photos");

        let photos = outcome
            .records
            .iter()
            .find(|r| r.path == "photos")
            .unwrap();
        assert_eq!(photos.kind, MediaKind::Folder);
        assert_eq!(photos.size, 0);
    }

    #[tokio::test]
    async fn missing_root_is_fatal() {
        let err = scan(
            Path::new("/definitely/not/here"),
            &ScanOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MediaError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancellation_returns_partial_outcome() {
        let dir = fixture_tree();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = scan(dir.path(), &ScanOptions::default(), &cancel, None)
            .await
            .unwrap();
        // Everything wound down without hanging; whatever was in flight may
        // or may not have been collected.
        assert!(outcome.records.len() <= 5);
    }

    #[tokio::test]
    async fn counters_track_progress() {
        let dir = fixture_tree();
        let counters = Arc::new(ScanCounters::default());
        scan(
            dir.path(),
            &ScanOptions::default(),
            &CancellationToken::new(),
            Some(counters.clone()),
        )
        .await
        .unwrap();

        assert_eq!(counters.files.load(Ordering::Relaxed), 3);
        assert_eq!(counters.folders.load(Ordering::Relaxed), 2);
    }
}
