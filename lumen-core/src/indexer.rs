//! Index orchestration.
//!
//! Owns the background loops (initial index, change-detection polling,
//! periodic reindex), collapses concurrent triggers into one run, batches
//! scanner output into store transactions, reaps vanished records, and
//! notifies listeners when a run completes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::scanner::{self, ScanCounters, ScanOptions};
use crate::store::MediaStore;
use crate::watch::ChangeDetector;

/// The readiness probe flips once this many entries are indexed, so huge
/// libraries don't hold the server in "starting" for the whole first scan.
pub const READY_THRESHOLD: u64 = 100;

/// Records per write transaction.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Pause between batch commits, yielding the database to readers.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct IndexerOptions {
    pub scan: ScanOptions,
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Periodic full-reindex cadence.
    pub index_interval: Duration,
    /// Change-detector polling cadence.
    pub poll_interval: Duration,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
            index_interval: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of the current (or last) index run.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    #[serde(rename = "filesIndexed")]
    pub files_indexed: u64,
    #[serde(rename = "foldersIndexed")]
    pub folders_indexed: u64,
    pub errors: u64,
    #[serde(rename = "isIndexing")]
    pub is_indexing: bool,
    #[serde(rename = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
}

type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

pub struct Indexer {
    store: MediaStore,
    media_root: PathBuf,
    options: IndexerOptions,
    detector: ChangeDetector,
    counters: Arc<ScanCounters>,
    is_indexing: AtomicBool,
    completed_once: AtomicBool,
    run_errors: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    on_complete: RwLock<Option<CompletionCallback>>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    cancel: CancellationToken,
}

impl Indexer {
    pub fn new(store: MediaStore, media_root: impl Into<PathBuf>, options: IndexerOptions) -> Arc<Self> {
        let media_root = media_root.into();
        // Capacity 1: a trigger while a trigger is pending is the same trigger.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Arc::new(Self {
            detector: ChangeDetector::new(&media_root),
            store,
            media_root,
            options,
            counters: Arc::new(ScanCounters::default()),
            is_indexing: AtomicBool::new(false),
            completed_once: AtomicBool::new(false),
            run_errors: AtomicU64::new(0),
            started_at: Mutex::new(None),
            on_complete: RwLock::new(None),
            trigger_tx,
            trigger_rx: tokio::sync::Mutex::new(Some(trigger_rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Install the sink notified after every successful index run.
    pub fn set_on_index_complete(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_complete.write().unwrap() = Some(Arc::new(callback));
    }

    /// Launch the background loops: initial index, change polling, periodic
    /// reindex, and the trigger listener.
    pub fn start(self: &Arc<Self>) {
        let indexer = Arc::clone(self);
        tokio::spawn(async move {
            indexer.run_loop().await;
        });
    }

    /// Signal shutdown; loops exit at their next check. An in-flight batch
    /// finishes so the database stays consistent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Schedule an immediate run. No-op while a run is active or already
    /// scheduled.
    pub fn trigger_index(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// True once the initial index completed, or once it has catalogued
    /// enough entries to be useful.
    pub fn is_ready(&self) -> bool {
        if self.completed_once.load(Ordering::Acquire) {
            return true;
        }
        let seen = self.counters.files.load(Ordering::Relaxed)
            + self.counters.folders.load(Ordering::Relaxed);
        seen >= READY_THRESHOLD
    }

    pub fn progress(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            files_indexed: self.counters.files.load(Ordering::Relaxed),
            folders_indexed: self.counters.folders.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed)
                + self.run_errors.load(Ordering::Relaxed),
            is_indexing: self.is_indexing.load(Ordering::Acquire),
            started_at: *self.started_at.lock().unwrap(),
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let Some(mut trigger_rx) = self.trigger_rx.lock().await.take() else {
            warn!("indexer started twice, ignoring");
            return;
        };

        if let Err(e) = self.run_index().await {
            error!("initial index failed: {e}");
        }

        let start = tokio::time::Instant::now();
        let mut reindex = tokio::time::interval_at(
            start + self.options.index_interval,
            self.options.index_interval,
        );
        let mut poll =
            tokio::time::interval_at(start + self.options.poll_interval, self.options.poll_interval);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("indexer stopped");
                    break;
                }
                Some(()) = trigger_rx.recv() => {
                    // A trigger that lands while a run is active is a no-op;
                    // the active run already sees the current tree.
                    if self.is_indexing.load(Ordering::Acquire) {
                        debug!("trigger ignored, index already running");
                    } else if let Err(e) = self.run_index().await {
                        error!("triggered index failed: {e}");
                    }
                }
                _ = reindex.tick() => {
                    debug!("periodic reindex");
                    if let Err(e) = self.run_index().await {
                        error!("periodic index failed: {e}");
                    }
                }
                _ = poll.tick() => {
                    match self.detector.detect().await {
                        Ok(true) => {
                            info!("filesystem drift detected, scheduling reindex");
                            self.trigger_index();
                        }
                        Ok(false) => {}
                        Err(e) => warn!("change detection failed: {e}"),
                    }
                }
            }
        }
    }

    /// Execute one full index run. Concurrent calls collapse: the second
    /// caller returns immediately while the first run proceeds.
    pub async fn run_index(&self) -> Result<()> {
        if self
            .is_indexing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("index already running, skipping");
            return Ok(());
        }

        let result = self.run_index_inner().await;
        self.is_indexing.store(false, Ordering::Release);
        if result.is_err() {
            self.run_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn run_index_inner(&self) -> Result<()> {
        let started = std::time::Instant::now();
        let index_time = Utc::now();
        self.counters.reset();
        *self.started_at.lock().unwrap() = Some(index_time);

        let outcome = scanner::scan(
            &self.media_root,
            &self.options.scan,
            &self.cancel,
            Some(Arc::clone(&self.counters)),
        )
        .await?;

        if self.cancel.is_cancelled() {
            // Shutdown mid-scan: partial records are discarded, the next
            // run converges.
            debug!("index aborted by shutdown, discarding partial scan");
            return Ok(());
        }

        let total = outcome.records.len();
        let mut committed = 0usize;
        for batch in outcome.records.chunks(self.options.batch_size.max(1)) {
            match self.commit_batch(batch).await {
                Ok(()) => committed += batch.len(),
                Err(e) if e.is_transient() => {
                    // Keep what we have; the next run converges.
                    warn!("batch commit failed ({} records): {e}", batch.len());
                    self.run_errors.fetch_add(1, Ordering::Relaxed);
                }
                // Constraint or schema trouble is not going to get better
                // by writing more batches.
                Err(e) => return Err(e),
            }
            if self.cancel.is_cancelled() {
                debug!("index interrupted after {committed}/{total} records");
                return Ok(());
            }
            tokio::time::sleep(self.options.batch_delay).await;
        }

        match self.cleanup_missing(index_time).await {
            Ok(removed) if removed > 0 => info!("removed {removed} vanished records"),
            Ok(_) => {}
            Err(e) => warn!("cleanup pass failed, retrying next run: {e}"),
        }

        if let Err(e) = self.refresh_stats(index_time, started.elapsed()).await {
            warn!("stats refresh failed: {e}");
        }
        if let Err(e) = self.detector.refresh().await {
            warn!("change-detector refresh failed: {e}");
        }

        self.completed_once.store(true, Ordering::Release);

        let callback = self.on_complete.read().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }

        info!(
            files = outcome.files,
            folders = outcome.folders,
            errors = outcome.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index run complete"
        );
        Ok(())
    }

    async fn commit_batch(&self, batch: &[crate::types::FileRecord]) -> Result<()> {
        let mut tx = self.store.begin().await?;
        for record in batch {
            self.store.upsert_file(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cleanup_missing(&self, index_time: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.store.begin().await?;
        let removed = self.store.delete_missing_files(&mut tx, index_time).await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn refresh_stats(&self, index_time: DateTime<Utc>, elapsed: Duration) -> Result<()> {
        let mut snapshot = self.store.calculate_stats().await?;
        snapshot.last_index_at = Some(index_time);
        snapshot.last_index_duration_ms = elapsed.as_millis() as u64;
        self.store.update_stats(&snapshot).await
    }
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("media_root", &self.media_root)
            .field("is_indexing", &self.is_indexing.load(Ordering::Relaxed))
            .field("completed_once", &self.completed_once.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
