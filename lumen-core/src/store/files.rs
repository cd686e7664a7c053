use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Sqlite, Transaction};

use super::MediaStore;
use crate::error::Result;
use crate::types::{datetime_from_unix, FileRecord, MediaKind};

/// One page of a directory or search listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    #[serde(rename = "pageSize")]
    pub page_size: u32,
}

#[derive(sqlx::FromRow)]
pub(super) struct FileRow {
    path: String,
    name: String,
    parent_path: String,
    kind: String,
    size: i64,
    modified: i64,
    mime: String,
    fingerprint: String,
    favorite: i64,
    updated_at: i64,
}

impl FileRow {
    pub(super) fn into_record(self) -> FileRecord {
        FileRecord {
            kind: MediaKind::parse(&self.kind).unwrap_or(MediaKind::Image),
            path: self.path,
            name: self.name,
            parent_path: self.parent_path,
            size: self.size.max(0) as u64,
            modified: datetime_from_unix(self.modified),
            mime: self.mime,
            fingerprint: self.fingerprint,
            favorite: self.favorite != 0,
            updated_at: datetime_from_unix(self.updated_at),
        }
    }
}

pub(super) const FILE_COLUMNS: &str =
    "path, name, parent_path, kind, size, modified, mime, fingerprint, favorite, updated_at";

/// Escape `%`/`_`/`\` so user input can be embedded in a LIKE pattern with
/// `ESCAPE '\'`.
fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

impl MediaStore {
    /// Insert or replace a record by path inside an open batch transaction.
    /// `updated_at` is set to "now" on the connection clock; an existing
    /// favorite flag survives the replace. The search index row is refreshed
    /// in the same transaction.
    pub async fn upsert_file(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        record: &FileRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (path, name, parent_path, kind, size, modified, mime, fingerprint, favorite, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, CAST(strftime('%s', 'now') AS INTEGER))
            ON CONFLICT(path) DO UPDATE SET
                name        = excluded.name,
                parent_path = excluded.parent_path,
                kind        = excluded.kind,
                size        = excluded.size,
                modified    = excluded.modified,
                mime        = excluded.mime,
                fingerprint = excluded.fingerprint,
                updated_at  = excluded.updated_at
            "#,
        )
        .bind(&record.path)
        .bind(&record.name)
        .bind(&record.parent_path)
        .bind(record.kind.as_str())
        .bind(record.size as i64)
        .bind(record.modified.timestamp())
        .bind(&record.mime)
        .bind(&record.fingerprint)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO search_index (path, text)
            VALUES (?1, lower(?2 || ' ' || ?1 || ' ' ||
                COALESCE((SELECT group_concat(tag, ' ') FROM tags WHERE path = ?1), '')))
            ON CONFLICT(path) DO UPDATE SET text = excluded.text
            "#,
        )
        .bind(&record.path)
        .bind(&record.name)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Reap every record whose `updated_at` predates `cutoff`: the cleanup
    /// pass for files that vanished between scans. Tag, favorite, and search
    /// rows cascade.
    pub async fn delete_missing_files(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM files WHERE updated_at < ?")
            .bind(cutoff.timestamp())
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> =
            sqlx::query_as(&format!("SELECT {FILE_COLUMNS} FROM files WHERE path = ?"))
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(FileRow::into_record))
    }

    /// Children of `path`, folders first then name ascending
    /// (case-insensitive), paginated. `page` is 1-based.
    pub async fn list_directory(
        &self,
        path: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<FileRecord>> {
        self.list_children(path, page, page_size, false).await
    }

    /// Like [`Self::list_directory`] but images and videos only.
    pub async fn list_media(
        &self,
        path: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<FileRecord>> {
        self.list_children(path, page, page_size, true).await
    }

    async fn list_children(
        &self,
        path: &str,
        page: u32,
        page_size: u32,
        media_only: bool,
    ) -> Result<Page<FileRecord>> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 1000);
        let kind_filter = if media_only {
            "AND kind IN ('image', 'video')"
        } else {
            ""
        };

        let (total,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM files WHERE parent_path = ? {kind_filter}"
        ))
        .bind(path)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<FileRow> = sqlx::query_as(&format!(
            r#"
            SELECT {FILE_COLUMNS} FROM files
            WHERE parent_path = ? {kind_filter}
            ORDER BY (kind = 'folder') DESC, name COLLATE NOCASE ASC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(path)
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.into_iter().map(FileRow::into_record).collect(),
            total: total.max(0) as u64,
            page,
            page_size,
        })
    }

    /// Substring search over the maintained `(name, path, tags)` index.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<FileRecord>> {
        let pattern = format!("%{}%", escape_like(&query.to_lowercase()));
        let rows: Vec<FileRow> = sqlx::query_as(&format!(
            r#"
            SELECT {FILE_COLUMNS} FROM files
            WHERE path IN (SELECT path FROM search_index WHERE text LIKE ? ESCAPE '\')
            ORDER BY (kind = 'folder') DESC, name COLLATE NOCASE ASC
            LIMIT ?
            "#
        ))
        .bind(pattern)
        .bind(limit.clamp(1, 500) as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FileRow::into_record).collect())
    }

    /// Distinct display names matching `query`, for typeahead.
    pub async fn search_suggestions(&self, query: &str, limit: u32) -> Result<Vec<String>> {
        let pattern = format!("%{}%", escape_like(&query.to_lowercase()));
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT f.name FROM files f
            JOIN search_index s ON s.path = f.path
            WHERE s.text LIKE ? ESCAPE '\'
            ORDER BY f.name COLLATE NOCASE ASC
            LIMIT ?
            "#,
        )
        .bind(pattern)
        .bind(limit.clamp(1, 100) as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// Records of the given kinds, for cache sweeps.
    pub async fn list_files_of_kinds(&self, kinds: &[MediaKind]) -> Result<Vec<FileRecord>> {
        let placeholders = vec!["?"; kinds.len().max(1)].join(", ");
        let sql =
            format!("SELECT {FILE_COLUMNS} FROM files WHERE kind IN ({placeholders}) ORDER BY path");
        let mut query = sqlx::query_as::<_, FileRow>(&sql);
        for kind in kinds {
            query = query.bind(kind.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(FileRow::into_record).collect())
    }
}
