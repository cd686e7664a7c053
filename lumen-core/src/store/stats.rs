use chrono::{DateTime, Utc};
use serde::Serialize;

use super::MediaStore;
use crate::error::Result;
use crate::types::datetime_from_unix;

/// Library-wide counts, recomputed at the end of each successful index run
/// and overwritten in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub images: u64,
    pub videos: u64,
    pub folders: u64,
    pub playlists: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: u64,
    #[serde(rename = "lastIndexAt")]
    pub last_index_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastIndexDurationMs")]
    pub last_index_duration_ms: u64,
}

impl MediaStore {
    /// Recount the library from the file records. The duration/timestamp
    /// fields are the caller's to fill in before [`Self::update_stats`].
    pub async fn calculate_stats(&self) -> Result<StatsSnapshot> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT kind, COUNT(*), COALESCE(SUM(size), 0) FROM files GROUP BY kind",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = StatsSnapshot::default();
        for (kind, count, bytes) in rows {
            let count = count.max(0) as u64;
            match kind.as_str() {
                "image" => snapshot.images = count,
                "video" => snapshot.videos = count,
                "folder" => snapshot.folders = count,
                "playlist" => snapshot.playlists = count,
                _ => {}
            }
            snapshot.total_bytes += bytes.max(0) as u64;
        }
        Ok(snapshot)
    }

    /// Overwrite the stats projection in one transaction.
    pub async fn update_stats(&self, snapshot: &StatsSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stats (id, images, videos, folders, playlists, total_bytes, last_index_at, last_index_duration_ms)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                images                 = excluded.images,
                videos                 = excluded.videos,
                folders                = excluded.folders,
                playlists              = excluded.playlists,
                total_bytes            = excluded.total_bytes,
                last_index_at          = excluded.last_index_at,
                last_index_duration_ms = excluded.last_index_duration_ms
            "#,
        )
        .bind(snapshot.images as i64)
        .bind(snapshot.videos as i64)
        .bind(snapshot.folders as i64)
        .bind(snapshot.playlists as i64)
        .bind(snapshot.total_bytes as i64)
        .bind(snapshot.last_index_at.map(|t| t.timestamp()))
        .bind(snapshot.last_index_duration_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The last persisted snapshot, if an index has ever completed.
    pub async fn get_stats(&self) -> Result<Option<StatsSnapshot>> {
        let row: Option<(i64, i64, i64, i64, i64, Option<i64>, i64)> = sqlx::query_as(
            "SELECT images, videos, folders, playlists, total_bytes, last_index_at, last_index_duration_ms
             FROM stats WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(images, videos, folders, playlists, total_bytes, last_index_at, duration_ms)| {
                StatsSnapshot {
                    images: images.max(0) as u64,
                    videos: videos.max(0) as u64,
                    folders: folders.max(0) as u64,
                    playlists: playlists.max(0) as u64,
                    total_bytes: total_bytes.max(0) as u64,
                    last_index_at: last_index_at.map(datetime_from_unix),
                    last_index_duration_ms: duration_ms.max(0) as u64,
                }
            },
        ))
    }
}
