//! Cheap polling change detection for the media root.
//!
//! Native filesystem watchers are unreliable over network mounts and across
//! container boundaries, so drift is detected with three inexpensive probes:
//! the root mtime, the count of top-level entries, and the mtimes of the
//! top-level directories. Worst-case detection latency is one poll interval.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Default, PartialEq, Eq)]
struct RootState {
    root_mtime: Option<SystemTime>,
    top_entry_count: usize,
    dir_mtimes: HashMap<String, SystemTime>,
}

/// Tracks the last-known shape of the media root between polls.
#[derive(Debug)]
pub struct ChangeDetector {
    root: PathBuf,
    state: Mutex<Option<RootState>>,
}

impl ChangeDetector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(None),
        }
    }

    /// Compare the current root shape against the last snapshot. Returns
    /// `true` when a reindex should run. The snapshot itself is only updated
    /// by [`Self::refresh`], which the indexer calls after a successful run.
    pub async fn detect(&self) -> Result<bool> {
        let current = snapshot(&self.root).await?;
        let state = self.state.lock().await;

        let Some(last) = state.as_ref() else {
            // No baseline yet; the initial index has not completed.
            return Ok(false);
        };

        if current.root_mtime != last.root_mtime {
            debug!("change detected: root mtime moved");
            return Ok(true);
        }
        if current.top_entry_count != last.top_entry_count {
            debug!(
                old = last.top_entry_count,
                new = current.top_entry_count,
                "change detected: top-level entry count"
            );
            return Ok(true);
        }
        for (name, mtime) in &current.dir_mtimes {
            if last.dir_mtimes.get(name) != Some(mtime) {
                debug!(dir = %name, "change detected: directory mtime");
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Re-snapshot the root as the new baseline.
    pub async fn refresh(&self) -> Result<()> {
        let current = snapshot(&self.root).await?;
        *self.state.lock().await = Some(current);
        Ok(())
    }
}

async fn snapshot(root: &Path) -> Result<RootState> {
    let root_meta = tokio::fs::metadata(root).await?;
    let mut state = RootState {
        root_mtime: root_meta.modified().ok(),
        ..RootState::default()
    };

    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str().map(str::to_owned) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        state.top_entry_count += 1;

        if let Ok(meta) = entry.metadata().await {
            if meta.is_dir() {
                if let Ok(mtime) = meta.modified() {
                    state.dir_mtimes.insert(name, mtime);
                }
            }
        }
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn no_baseline_means_no_trigger() {
        let dir = TempDir::new().unwrap();
        let detector = ChangeDetector::new(dir.path());
        assert!(!detector.detect().await.unwrap());
    }

    #[tokio::test]
    async fn quiescent_tree_is_unchanged() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("photos")).unwrap();
        fs::write(dir.path().join("photos/a.jpg"), b"x").unwrap();

        let detector = ChangeDetector::new(dir.path());
        detector.refresh().await.unwrap();
        assert!(!detector.detect().await.unwrap());
    }

    #[tokio::test]
    async fn top_level_addition_is_detected() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("photos")).unwrap();

        let detector = ChangeDetector::new(dir.path());
        detector.refresh().await.unwrap();

        fs::create_dir(dir.path().join("videos")).unwrap();
        assert!(detector.detect().await.unwrap());

        // A refresh absorbs the change.
        detector.refresh().await.unwrap();
        assert!(!detector.detect().await.unwrap());
    }

    #[tokio::test]
    async fn subdirectory_churn_is_detected() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("photos")).unwrap();

        let detector = ChangeDetector::new(dir.path());
        detector.refresh().await.unwrap();

        fs::write(dir.path().join("photos/new.jpg"), b"x").unwrap();
        assert!(detector.detect().await.unwrap());
    }

    #[tokio::test]
    async fn hidden_entries_do_not_count() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("photos")).unwrap();

        let detector = ChangeDetector::new(dir.path());
        detector.refresh().await.unwrap();

        // Hidden top-level entries are invisible to the count check, though
        // the root mtime may still move; only the count assertion is stable
        // across filesystems, so compare snapshots directly.
        let before = snapshot(dir.path()).await.unwrap().top_entry_count;
        fs::create_dir(dir.path().join(".cache")).unwrap();
        let after = snapshot(dir.path()).await.unwrap().top_entry_count;
        assert_eq!(before, after);
    }
}
