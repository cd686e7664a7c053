//! Single-file SQLite metadata store.
//!
//! Holds the projection of the media tree (file records), the tag and
//! favorite associations, the search index, and the stats snapshot. Writers
//! serialize through transactions; readers run concurrently against the pool.

mod files;
mod stats;
mod tags;

pub use files::Page;
pub use stats::StatsSnapshot;
pub use tags::{FavoriteEntry, TagSummary};

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::error::Result;

/// Additive migrations; `schema_version` records how many have been applied.
const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    r#"
    CREATE TABLE files (
        path        TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        parent_path TEXT NOT NULL DEFAULT '',
        kind        TEXT NOT NULL,
        size        INTEGER NOT NULL DEFAULT 0,
        modified    INTEGER NOT NULL,
        mime        TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        favorite    INTEGER NOT NULL DEFAULT 0,
        updated_at  INTEGER NOT NULL
    );
    CREATE INDEX idx_files_parent ON files(parent_path);
    CREATE INDEX idx_files_updated ON files(updated_at);
    CREATE INDEX idx_files_kind ON files(kind);

    CREATE TABLE tags (
        tag  TEXT NOT NULL,
        path TEXT NOT NULL REFERENCES files(path) ON DELETE CASCADE,
        PRIMARY KEY (tag, path)
    );
    CREATE INDEX idx_tags_path ON tags(path);

    CREATE TABLE favorites (
        path     TEXT PRIMARY KEY REFERENCES files(path) ON DELETE CASCADE,
        added_at INTEGER NOT NULL
    );

    CREATE TABLE search_index (
        path TEXT PRIMARY KEY REFERENCES files(path) ON DELETE CASCADE,
        text TEXT NOT NULL
    );

    CREATE TABLE stats (
        id                     INTEGER PRIMARY KEY CHECK (id = 1),
        images                 INTEGER NOT NULL DEFAULT 0,
        videos                 INTEGER NOT NULL DEFAULT 0,
        folders                INTEGER NOT NULL DEFAULT 0,
        playlists              INTEGER NOT NULL DEFAULT 0,
        total_bytes            INTEGER NOT NULL DEFAULT 0,
        last_index_at          INTEGER,
        last_index_duration_ms INTEGER NOT NULL DEFAULT 0
    );
    "#,
];

/// Handle to the metadata database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MediaStore {
    pool: SqlitePool,
}

impl MediaStore {
    /// Open (creating if necessary) the database file inside `dir` and bring
    /// the schema up to date.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        Self::open_file(&dir.join("lumen.db")).await
    }

    /// Open a specific database file.
    pub async fn open_file(file: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(file)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await?;

        let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version")
            .fetch_optional(&self.pool)
            .await?;
        let current = current.map(|(v,)| v).unwrap_or(0) as usize;

        if current > MIGRATIONS.len() {
            return Err(crate::error::MediaError::Internal(format!(
                "database schema version {current} is newer than this build ({})",
                MIGRATIONS.len()
            )));
        }

        for (idx, migration) in MIGRATIONS.iter().enumerate().skip(current) {
            let version = idx + 1;
            info!("applying metadata schema migration v{version}");
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration).execute(&mut *tx).await?;
            sqlx::query("DELETE FROM schema_version")
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(version as i64)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }

        debug!("metadata store ready (schema v{})", MIGRATIONS.len());
        Ok(())
    }

    /// Start a write transaction: the unit of atomic batch upsert.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool; outstanding readers finish first.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
