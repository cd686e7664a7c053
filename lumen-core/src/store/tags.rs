use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;

use super::files::{FileRow, FILE_COLUMNS};
use super::MediaStore;
use crate::error::{MediaError, Result};
use crate::types::{datetime_from_unix, FileRecord};

/// A tag with its association count.
#[derive(Debug, Clone, Serialize)]
pub struct TagSummary {
    pub tag: String,
    pub count: u64,
}

/// One favorited record with the time it was added.
#[derive(Debug, Clone, Serialize)]
pub struct FavoriteEntry {
    #[serde(flatten)]
    pub record: FileRecord,
    #[serde(rename = "addedAt")]
    pub added_at: DateTime<Utc>,
}

/// Trimmed, case-folded tag identifier.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

async fn refresh_search_row(conn: &mut SqliteConnection, path: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO search_index (path, text)
        SELECT f.path, lower(f.name || ' ' || f.path || ' ' ||
            COALESCE((SELECT group_concat(tag, ' ') FROM tags WHERE path = f.path), ''))
        FROM files f WHERE f.path = ?1
        ON CONFLICT(path) DO UPDATE SET text = excluded.text
        "#,
    )
    .bind(path)
    .execute(conn)
    .await?;
    Ok(())
}

impl MediaStore {
    async fn require_file(&self, path: &str) -> Result<()> {
        if self.get_file_by_path(path).await?.is_none() {
            return Err(MediaError::NotFound(path.to_string()));
        }
        Ok(())
    }

    pub async fn add_file_tag(&self, path: &str, tag: &str) -> Result<()> {
        let tag = normalize_tag(tag);
        if tag.is_empty() {
            return Err(MediaError::InvalidMedia("empty tag".into()));
        }
        self.require_file(path).await?;

        let mut tx = self.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO tags (tag, path) VALUES (?, ?)")
            .bind(&tag)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        refresh_search_row(&mut *tx, path).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_file_tag(&self, path: &str, tag: &str) -> Result<()> {
        let tag = normalize_tag(tag);
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM tags WHERE tag = ? AND path = ?")
            .bind(&tag)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        refresh_search_row(&mut *tx, path).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace the association set of `path` with `tags`. Idempotent.
    pub async fn set_file_tags(&self, path: &str, tags: &[String]) -> Result<()> {
        self.require_file(path).await?;

        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM tags WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        for tag in tags {
            let tag = normalize_tag(tag);
            if tag.is_empty() {
                continue;
            }
            sqlx::query("INSERT OR IGNORE INTO tags (tag, path) VALUES (?, ?)")
                .bind(&tag)
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        refresh_search_row(&mut *tx, path).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_file_tags(&self, path: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT tag FROM tags WHERE path = ? ORDER BY tag")
                .bind(path)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    pub async fn list_tags(&self) -> Result<Vec<TagSummary>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT tag, COUNT(*) FROM tags GROUP BY tag ORDER BY tag")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(tag, count)| TagSummary {
                tag,
                count: count.max(0) as u64,
            })
            .collect())
    }

    pub async fn list_files_with_tag(&self, tag: &str) -> Result<Vec<FileRecord>> {
        let tag = normalize_tag(tag);
        let rows: Vec<FileRow> = sqlx::query_as(&format!(
            r#"
            SELECT {FILE_COLUMNS} FROM files
            WHERE path IN (SELECT path FROM tags WHERE tag = ?)
            ORDER BY name COLLATE NOCASE ASC
            "#
        ))
        .bind(&tag)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FileRow::into_record).collect())
    }

    /// Rename a tag across all its associations atomically. Collisions with
    /// an existing `(new, path)` pair collapse into it.
    pub async fn rename_tag(&self, old: &str, new: &str) -> Result<()> {
        let old = normalize_tag(old);
        let new = normalize_tag(new);
        if new.is_empty() {
            return Err(MediaError::InvalidMedia("empty tag".into()));
        }
        if old == new {
            return Ok(());
        }

        let mut tx = self.begin().await?;
        let paths: Vec<(String,)> = sqlx::query_as("SELECT path FROM tags WHERE tag = ?")
            .bind(&old)
            .fetch_all(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO tags (tag, path) SELECT ?, path FROM tags WHERE tag = ?")
            .bind(&new)
            .bind(&old)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tags WHERE tag = ?")
            .bind(&old)
            .execute(&mut *tx)
            .await?;
        for (path,) in &paths {
            refresh_search_row(&mut *tx, path).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_tag(&self, tag: &str) -> Result<()> {
        let tag = normalize_tag(tag);
        let mut tx = self.begin().await?;
        let paths: Vec<(String,)> = sqlx::query_as("SELECT path FROM tags WHERE tag = ?")
            .bind(&tag)
            .fetch_all(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tags WHERE tag = ?")
            .bind(&tag)
            .execute(&mut *tx)
            .await?;
        for (path,) in &paths {
            refresh_search_row(&mut *tx, path).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Flag a record as favorite. Idempotent: re-adding keeps the original
    /// `added_at`.
    pub async fn add_favorite(&self, path: &str) -> Result<()> {
        self.require_file(path).await?;

        let mut tx = self.begin().await?;
        sqlx::query(
            "INSERT INTO favorites (path, added_at) VALUES (?, CAST(strftime('%s', 'now') AS INTEGER))
             ON CONFLICT(path) DO NOTHING",
        )
        .bind(path)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE files SET favorite = 1 WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_favorite(&self, path: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM favorites WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE files SET favorite = 0 WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Favorites ordered by when they were added, oldest first.
    pub async fn list_favorites(&self) -> Result<Vec<FavoriteEntry>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT path, added_at FROM favorites ORDER BY added_at ASC, path ASC")
                .fetch_all(&self.pool)
                .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (path, added_at) in rows {
            if let Some(record) = self.get_file_by_path(&path).await? {
                entries.push(FavoriteEntry {
                    record,
                    added_at: datetime_from_unix(added_at),
                });
            }
        }
        Ok(entries)
    }
}
