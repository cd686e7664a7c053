//! Metadata store behavior against a real on-disk database file.

use chrono::Utc;
use lumen_core::store::MediaStore;
use lumen_core::types::{datetime_from_unix, FileRecord, MediaKind};
use tempfile::TempDir;

fn record(path: &str, kind: MediaKind, size: u64) -> FileRecord {
    FileRecord::new(path.to_string(), kind, size, datetime_from_unix(1_700_000_000))
}

async fn upsert_all(store: &MediaStore, records: &[FileRecord]) {
    let mut tx = store.begin().await.unwrap();
    for rec in records {
        store.upsert_file(&mut tx, rec).await.unwrap();
    }
    tx.commit().await.unwrap();
}

async fn seed(store: &MediaStore) {
    upsert_all(
        store,
        &[
            record("photos", MediaKind::Folder, 0),
            record("videos", MediaKind::Folder, 0),
            record("photos/a.jpg", MediaKind::Image, 1024),
            record("photos/b.png", MediaKind::Image, 1024),
            record("videos/c.mp4", MediaKind::Video, 4096),
        ],
    )
    .await;
}

#[tokio::test]
async fn upsert_and_get_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    seed(&store).await;

    let rec = store.get_file_by_path("photos/a.jpg").await.unwrap().unwrap();
    assert_eq!(rec.name, "a.jpg");
    assert_eq!(rec.parent_path, "photos");
    assert_eq!(rec.kind, MediaKind::Image);
    assert_eq!(rec.size, 1024);
    assert_eq!(rec.mime, "image/jpeg");
    assert!(!rec.favorite);

    assert!(store.get_file_by_path("photos/ghost.jpg").await.unwrap().is_none());
}

#[tokio::test]
async fn reopen_is_idempotent() {
    let dir = TempDir::new().unwrap();
    {
        let store = MediaStore::open(dir.path()).await.unwrap();
        seed(&store).await;
        store.close().await;
    }
    let store = MediaStore::open(dir.path()).await.unwrap();
    assert!(store.get_file_by_path("photos/a.jpg").await.unwrap().is_some());
}

#[tokio::test]
async fn listing_is_folders_first_then_name() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    upsert_all(
        &store,
        &[
            record("zoo.jpg", MediaKind::Image, 1),
            record("Alpha.jpg", MediaKind::Image, 1),
            record("beta", MediaKind::Folder, 0),
            record("Zebra", MediaKind::Folder, 0),
        ],
    )
    .await;

    let page = store.list_directory("", 1, 10).await.unwrap();
    assert_eq!(page.total, 4);
    let names: Vec<_> = page.items.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["beta", "Zebra", "Alpha.jpg", "zoo.jpg"]);
}

#[tokio::test]
async fn listing_paginates() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    let records: Vec<_> = (0..25)
        .map(|i| record(&format!("img_{i:02}.jpg"), MediaKind::Image, 1))
        .collect();
    upsert_all(&store, &records).await;

    let first = store.list_directory("", 1, 10).await.unwrap();
    assert_eq!(first.total, 25);
    assert_eq!(first.items.len(), 10);
    assert_eq!(first.items[0].name, "img_00.jpg");

    let last = store.list_directory("", 3, 10).await.unwrap();
    assert_eq!(last.items.len(), 5);
    assert_eq!(last.items[0].name, "img_20.jpg");
}

#[tokio::test]
async fn media_listing_excludes_folders_and_playlists() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    upsert_all(
        &store,
        &[
            record("sub", MediaKind::Folder, 0),
            record("a.jpg", MediaKind::Image, 1),
            record("c.mp4", MediaKind::Video, 1),
            record("mix.wpl", MediaKind::Playlist, 1),
        ],
    )
    .await;

    let page = store.list_media("", 1, 10).await.unwrap();
    assert_eq!(page.total, 2);
    assert!(page
        .items
        .iter()
        .all(|r| matches!(r.kind, MediaKind::Image | MediaKind::Video)));
}

#[tokio::test]
async fn delete_missing_reaps_stale_records() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    seed(&store).await;

    // Give the clock a tick so the refresh lands in a later second.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let cutoff = Utc::now();
    upsert_all(&store, &[record("photos/b.png", MediaKind::Image, 1024)]).await;

    let mut tx = store.begin().await.unwrap();
    let removed = store.delete_missing_files(&mut tx, cutoff).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(removed, 4);
    assert!(store.get_file_by_path("photos/b.png").await.unwrap().is_some());
    assert!(store.get_file_by_path("photos/a.jpg").await.unwrap().is_none());
}

#[tokio::test]
async fn favorite_survives_reindex_upsert() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    seed(&store).await;

    store.add_favorite("photos/a.jpg").await.unwrap();
    // The next index run replaces the record.
    upsert_all(&store, &[record("photos/a.jpg", MediaKind::Image, 2048)]).await;

    let rec = store.get_file_by_path("photos/a.jpg").await.unwrap().unwrap();
    assert!(rec.favorite);
    assert_eq!(rec.size, 2048);
}

#[tokio::test]
async fn favorites_are_idempotent_and_ordered() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    seed(&store).await;

    store.add_favorite("photos/a.jpg").await.unwrap();
    store.add_favorite("photos/a.jpg").await.unwrap();
    store.add_favorite("videos/c.mp4").await.unwrap();

    let favorites = store.list_favorites().await.unwrap();
    assert_eq!(favorites.len(), 2);
    assert_eq!(favorites[0].record.path, "photos/a.jpg");

    store.remove_favorite("photos/a.jpg").await.unwrap();
    let favorites = store.list_favorites().await.unwrap();
    assert_eq!(favorites.len(), 1);
    let rec = store.get_file_by_path("photos/a.jpg").await.unwrap().unwrap();
    assert!(!rec.favorite);
}

#[tokio::test]
async fn favorite_of_unknown_path_fails() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    assert!(store.add_favorite("nope.jpg").await.is_err());
}

#[tokio::test]
async fn set_file_tags_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    seed(&store).await;

    let tags = vec!["Holiday".to_string(), "beach ".to_string()];
    store.set_file_tags("photos/a.jpg", &tags).await.unwrap();
    store.set_file_tags("photos/a.jpg", &tags).await.unwrap();

    let stored = store.list_file_tags("photos/a.jpg").await.unwrap();
    assert_eq!(stored, vec!["beach".to_string(), "holiday".to_string()]);
}

#[tokio::test]
async fn tag_rename_is_atomic_across_associations() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    seed(&store).await;

    store.add_file_tag("photos/a.jpg", "trip").await.unwrap();
    store.add_file_tag("photos/b.png", "trip").await.unwrap();
    store.add_file_tag("photos/b.png", "vacation").await.unwrap();

    store.rename_tag("trip", "vacation").await.unwrap();

    let tags = store.list_tags().await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].tag, "vacation");
    assert_eq!(tags[0].count, 2);

    let tagged = store.list_files_with_tag("vacation").await.unwrap();
    assert_eq!(tagged.len(), 2);
}

#[tokio::test]
async fn deleting_a_record_cascades_tags() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    seed(&store).await;
    store.add_file_tag("photos/a.jpg", "trip").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let cutoff = Utc::now();
    upsert_all(&store, &[record("videos/c.mp4", MediaKind::Video, 4096)]).await;
    let mut tx = store.begin().await.unwrap();
    store.delete_missing_files(&mut tx, cutoff).await.unwrap();
    tx.commit().await.unwrap();

    assert!(store.list_tags().await.unwrap().is_empty());
}

#[tokio::test]
async fn search_covers_name_path_and_tags() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    seed(&store).await;

    // By name fragment, case-insensitive.
    let by_name = store.search("A.JPG", 50).await.unwrap();
    assert_eq!(by_name.len(), 1);
    assert_eq!(by_name[0].path, "photos/a.jpg");

    // By path segment.
    let by_path = store.search("videos", 50).await.unwrap();
    assert!(by_path.iter().any(|r| r.path == "videos/c.mp4"));

    // By tag, once the tag is attached.
    assert!(store.search("sunset", 50).await.unwrap().is_empty());
    store.add_file_tag("photos/b.png", "sunset").await.unwrap();
    let by_tag = store.search("sunset", 50).await.unwrap();
    assert_eq!(by_tag.len(), 1);
    assert_eq!(by_tag[0].path, "photos/b.png");

    // Removing the tag removes the hit.
    store.remove_file_tag("photos/b.png", "sunset").await.unwrap();
    assert!(store.search("sunset", 50).await.unwrap().is_empty());
}

#[tokio::test]
async fn search_escapes_like_wildcards() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    upsert_all(
        &store,
        &[
            record("100%_done.jpg", MediaKind::Image, 1),
            record("plain.jpg", MediaKind::Image, 1),
        ],
    )
    .await;

    let hits = store.search("100%_", 50).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "100%_done.jpg");
}

#[tokio::test]
async fn suggestions_return_names() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    seed(&store).await;

    let suggestions = store.search_suggestions("photos", 10).await.unwrap();
    assert!(suggestions.contains(&"a.jpg".to_string()));
    assert!(suggestions.contains(&"photos".to_string()));
}

#[tokio::test]
async fn stats_snapshot_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::open(dir.path()).await.unwrap();
    seed(&store).await;

    assert!(store.get_stats().await.unwrap().is_none());

    let mut snapshot = store.calculate_stats().await.unwrap();
    assert_eq!(snapshot.images, 2);
    assert_eq!(snapshot.videos, 1);
    assert_eq!(snapshot.folders, 2);
    assert_eq!(snapshot.playlists, 0);
    assert_eq!(snapshot.total_bytes, 1024 + 1024 + 4096);

    snapshot.last_index_at = Some(datetime_from_unix(1_700_000_500));
    snapshot.last_index_duration_ms = 1234;
    store.update_stats(&snapshot).await.unwrap();

    let loaded = store.get_stats().await.unwrap().unwrap();
    assert_eq!(loaded, snapshot);

    // Snapshots are overwritten, never accumulated.
    store.update_stats(&snapshot).await.unwrap();
    assert_eq!(store.get_stats().await.unwrap().unwrap(), snapshot);
}
