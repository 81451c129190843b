//! SQLite metadata index.
//!
//! This manages its own connection pool, separate from any application
//! database. Only metadata lives here; object bytes live in the backend.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Metadata, MetadataError, MetadataIndex};

/// Connection pool for the object metadata table.
#[derive(Debug, Clone)]
pub struct SqliteMetadata {
    pool: SqlitePool,
}

impl std::ops::Deref for SqliteMetadata {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl SqliteMetadata {
    /// Opens the index stored at `path`, creating the file, its parent
    /// directory and the schema as needed.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MetadataError::Migration(format!("creating {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let db = Self::connect(SqlitePoolOptions::new().max_connections(5), options).await?;
        info!(path = %path.display(), "opened object metadata index");
        Ok(db)
    }

    /// An index that lives as long as the pool.
    pub async fn in_memory() -> Result<Self, MetadataError> {
        // One connection, never recycled: the database dies with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        let db = Self::connect(pool, SqliteConnectOptions::new().filename(":memory:")).await?;
        debug!("opened in-memory object metadata index");
        Ok(db)
    }

    async fn connect(
        pool: SqlitePoolOptions,
        options: SqliteConnectOptions,
    ) -> Result<Self, MetadataError> {
        let db = Self {
            pool: pool.connect_with(options).await?,
        };
        db.create_schema().await?;
        Ok(db)
    }

    async fn create_schema(&self) -> Result<(), MetadataError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS object_metadata (
                path TEXT PRIMARY KEY,
                uuid TEXT NOT NULL UNIQUE,
                hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_object_metadata_hash ON object_metadata(hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_metadata(row: &SqliteRow) -> Result<Metadata, MetadataError> {
    let path: String = row.get("path");
    let uuid: String = row.get("uuid");
    let size: i64 = row.get("size");

    let uuid = uuid.parse::<Uuid>().map_err(|e| MetadataError::Corrupt {
        path: path.clone(),
        reason: format!("invalid uuid: {e}"),
    })?;
    let size = u64::try_from(size).map_err(|_| MetadataError::Corrupt {
        path: path.clone(),
        reason: format!("negative size {size}"),
    })?;

    Ok(Metadata {
        uuid,
        hash: row.get("hash"),
        path,
        size,
    })
}

#[async_trait]
impl MetadataIndex for SqliteMetadata {
    async fn get_metadata(&self, path: &str) -> Result<Metadata, MetadataError> {
        let row = sqlx::query(
            r#"
            SELECT path, uuid, hash, size
            FROM object_metadata
            WHERE path = ?1
            "#,
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_metadata(&row),
            None => Err(MetadataError::NotFound(path.to_string())),
        }
    }

    async fn put_metadata(
        &self,
        path: &str,
        hash: &str,
        size: u64,
    ) -> Result<Uuid, MetadataError> {
        let size = i64::try_from(size).map_err(|_| MetadataError::Corrupt {
            path: path.to_string(),
            reason: format!("size {size} exceeds storage range"),
        })?;
        let now = chrono::Utc::now().timestamp();
        let candidate = Uuid::new_v4().to_string();

        // Overwrites keep the original uuid and creation time.
        let row = sqlx::query(
            r#"
            INSERT INTO object_metadata (path, uuid, hash, size, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(path) DO UPDATE SET
                hash = excluded.hash,
                size = excluded.size,
                updated_at = excluded.updated_at
            RETURNING uuid
            "#,
        )
        .bind(path)
        .bind(&candidate)
        .bind(hash)
        .bind(size)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let uuid: String = row.get("uuid");
        let uuid = uuid.parse::<Uuid>().map_err(|e| MetadataError::Corrupt {
            path: path.to_string(),
            reason: format!("invalid uuid: {e}"),
        })?;

        debug!(path = %path, hash = %hash, size = size, "metadata stored");
        Ok(uuid)
    }

    async fn remove_metadata(&self, path: &str) -> Result<(), MetadataError> {
        let result = sqlx::query("DELETE FROM object_metadata WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(path.to_string()));
        }
        debug!(path = %path, "metadata removed");
        Ok(())
    }

    async fn list_metadata(&self) -> Result<Vec<Metadata>, MetadataError> {
        let rows = sqlx::query(
            r#"
            SELECT path, uuid, hash, size
            FROM object_metadata
            ORDER BY path
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_metadata).collect()
    }

    async fn hash_references(&self, hash: &str) -> Result<u64, MetadataError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM object_metadata WHERE hash = ?1")
            .bind(hash)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(count.max(0) as u64)
    }
}
