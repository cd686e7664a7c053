//! End-to-end index runs against a temp media tree and a temp database.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lumen_core::indexer::{Indexer, IndexerOptions};
use lumen_core::store::MediaStore;
use lumen_core::types::MediaKind;
use tempfile::TempDir;

fn build_media_tree(root: &Path) {
    fs::create_dir_all(root.join("photos")).unwrap();
    fs::create_dir_all(root.join("videos")).unwrap();
    fs::write(root.join("photos/a.jpg"), vec![0u8; 1024]).unwrap();
    fs::write(root.join("photos/b.png"), vec![0u8; 1024]).unwrap();
    fs::write(root.join("videos/c.mp4"), vec![0u8; 2048]).unwrap();
}

async fn fixture() -> (TempDir, TempDir, MediaStore, Arc<Indexer>) {
    let media = TempDir::new().unwrap();
    let db = TempDir::new().unwrap();
    build_media_tree(media.path());

    let store = MediaStore::open(db.path()).await.unwrap();
    let indexer = Indexer::new(store.clone(), media.path(), IndexerOptions::default());
    (media, db, store, indexer)
}

#[tokio::test]
async fn fresh_index_catalogues_the_tree() {
    let (_media, _db, store, indexer) = fixture().await;

    indexer.run_index().await.unwrap();

    for path in ["photos", "videos", "photos/a.jpg", "photos/b.png", "videos/c.mp4"] {
        assert!(
            store.get_file_by_path(path).await.unwrap().is_some(),
            "missing record for {path}"
        );
    }

    let stats = store.get_stats().await.unwrap().unwrap();
    assert_eq!(stats.images, 2);
    assert_eq!(stats.videos, 1);
    assert_eq!(stats.folders, 2);
    assert_eq!(stats.total_bytes, 1024 + 1024 + 2048);
    assert!(stats.last_index_at.is_some());

    let progress = indexer.progress();
    assert_eq!(progress.files_indexed, 3);
    assert_eq!(progress.folders_indexed, 2);
    assert!(!progress.is_indexing);
    assert!(indexer.is_ready());
}

#[tokio::test]
async fn hidden_entries_are_never_indexed() {
    let (media, _db, store, indexer) = fixture().await;
    fs::create_dir_all(media.path().join("photos/.thumbs")).unwrap();
    fs::write(media.path().join("photos/.thumbs/t.jpg"), b"x").unwrap();

    indexer.run_index().await.unwrap();

    assert!(store
        .get_file_by_path("photos/.thumbs")
        .await
        .unwrap()
        .is_none());
    assert!(store
        .get_file_by_path("photos/.thumbs/t.jpg")
        .await
        .unwrap()
        .is_none());

    let stats = store.get_stats().await.unwrap().unwrap();
    assert_eq!(stats.images, 2);
}

#[tokio::test]
async fn removed_files_are_reaped_on_the_next_run() {
    let (media, _db, store, indexer) = fixture().await;
    indexer.run_index().await.unwrap();
    let before = store.get_stats().await.unwrap().unwrap();

    fs::remove_file(media.path().join("photos/a.jpg")).unwrap();
    // updated_at has whole-second resolution; the cutoff needs a later second.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    indexer.run_index().await.unwrap();

    assert!(store.get_file_by_path("photos/a.jpg").await.unwrap().is_none());
    assert!(store.get_file_by_path("photos/b.png").await.unwrap().is_some());
    assert!(store.get_file_by_path("videos/c.mp4").await.unwrap().is_some());

    let after = store.get_stats().await.unwrap().unwrap();
    assert_eq!(after.images, before.images - 1);
    assert_eq!(after.videos, before.videos);
}

#[tokio::test]
async fn unchanged_tree_indexes_identically() {
    let (_media, _db, store, indexer) = fixture().await;
    indexer.run_index().await.unwrap();
    let first: Vec<_> = store
        .list_directory("", 1, 100)
        .await
        .unwrap()
        .items
        .into_iter()
        .map(|r| (r.path, r.fingerprint))
        .collect();

    indexer.run_index().await.unwrap();
    let second: Vec<_> = store
        .list_directory("", 1, 100)
        .await
        .unwrap()
        .items
        .into_iter()
        .map(|r| (r.path, r.fingerprint))
        .collect();

    assert_eq!(first, second);
    let stats = store.get_stats().await.unwrap().unwrap();
    assert_eq!(stats.images + stats.videos + stats.folders, 5);
}

#[tokio::test]
async fn completion_callback_fires_per_run() {
    let (_media, _db, _store, indexer) = fixture().await;
    let fired = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&fired);
    indexer.set_on_index_complete(move || {
        observer.fetch_add(1, Ordering::SeqCst);
    });

    indexer.run_index().await.unwrap();
    indexer.run_index().await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn kinds_are_classified() {
    let (media, _db, store, indexer) = fixture().await;
    fs::write(media.path().join("mix.wpl"), b"<playlist/>").unwrap();
    fs::write(media.path().join("notes.txt"), b"skip me").unwrap();

    indexer.run_index().await.unwrap();

    let playlist = store.get_file_by_path("mix.wpl").await.unwrap().unwrap();
    assert_eq!(playlist.kind, MediaKind::Playlist);
    assert!(store.get_file_by_path("notes.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn background_loop_runs_initial_index() {
    let media = TempDir::new().unwrap();
    let db = TempDir::new().unwrap();
    build_media_tree(media.path());

    let store = MediaStore::open(db.path()).await.unwrap();
    let options = IndexerOptions {
        // Keep the periodic timers far away so only the initial run fires.
        index_interval: Duration::from_secs(3600),
        poll_interval: Duration::from_secs(3600),
        ..IndexerOptions::default()
    };
    let indexer = Indexer::new(store.clone(), media.path(), options);
    indexer.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while store.get_stats().await.unwrap().is_none() {
        assert!(tokio::time::Instant::now() < deadline, "initial index never completed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(indexer.is_ready());
    indexer.stop();
}
