use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Optional media details supplied by the inbound file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

impl FileAttributes {
    pub fn is_empty(&self) -> bool {
        self.width.is_none() && self.height.is_none() && self.duration.is_none()
    }
}

/// Metadata for one file stored in the bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Unique file ID, generated when the upload starts
    pub file_id: Uuid,
    /// Object key in the bucket
    pub storage_key: String,
    /// Name the file was uploaded with
    pub original_name: String,
    /// Declared size in bytes
    pub size_bytes: u64,
    /// Content type
    pub mime_type: Option<String>,
    /// Telegram user that uploaded the file
    pub uploader_id: i64,
    /// Transport-side file reference
    pub source_file_id: Option<String>,
    /// When the record was persisted
    pub created_at: DateTime<Utc>,
    /// Width/height/duration when known
    pub attributes: Option<FileAttributes>,
}

/// A user seen by the bot; display only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserRecord {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

/// Persistence for file and user records
///
/// Every operation is atomic per record; no multi-record transactions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or refresh a user
    async fn save_user(&self, user: &UserRecord) -> Result<()>;

    /// Insert a file record; a colliding `file_id` is overwritten
    async fn save_file(&self, record: &FileRecord) -> Result<()>;

    /// Get a file record by ID
    async fn get_file(&self, file_id: Uuid) -> Result<Option<FileRecord>>;

    /// Files uploaded by one user, oldest first, at most `limit` records
    async fn list_files_by_uploader(&self, uploader_id: i64, limit: usize)
        -> Result<Vec<FileRecord>>;

    /// Readiness check
    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryTables {
    files: HashMap<Uuid, FileRecord>,
    /// File IDs in insertion order
    file_order: Vec<Uuid>,
    users: HashMap<i64, UserRecord>,
}

/// Process-local metadata store
#[derive(Default)]
pub struct InMemoryMetadataStore {
    tables: RwLock<MemoryTables>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored files
    pub fn file_count(&self) -> usize {
        self.tables.read().files.len()
    }

    /// Look up a user by ID
    pub fn user(&self, user_id: i64) -> Option<UserRecord> {
        self.tables.read().users.get(&user_id).cloned()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        self.tables.write().users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn save_file(&self, record: &FileRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.files.insert(record.file_id, record.clone()).is_none() {
            tables.file_order.push(record.file_id);
        }
        Ok(())
    }

    async fn get_file(&self, file_id: Uuid) -> Result<Option<FileRecord>> {
        Ok(self.tables.read().files.get(&file_id).cloned())
    }

    async fn list_files_by_uploader(
        &self,
        uploader_id: i64,
        limit: usize,
    ) -> Result<Vec<FileRecord>> {
        let tables = self.tables.read();
        let files = tables
            .file_order
            .iter()
            .filter_map(|id| tables.files.get(id))
            .filter(|record| record.uploader_id == uploader_id)
            .take(limit)
            .cloned()
            .collect();

        Ok(files)
    }
}

/// Row shape of the `files` table
#[derive(Debug, FromRow)]
struct FileRow {
    file_id: Uuid,
    storage_key: String,
    original_name: String,
    size_bytes: i64,
    mime_type: Option<String>,
    uploader_id: i64,
    source_file_id: Option<String>,
    created_at: DateTime<Utc>,
    attributes: Option<serde_json::Value>,
}

impl From<FileRow> for FileRecord {
    fn from(row: FileRow) -> Self {
        Self {
            file_id: row.file_id,
            storage_key: row.storage_key,
            original_name: row.original_name,
            size_bytes: u64::try_from(row.size_bytes).unwrap_or(0),
            mime_type: row.mime_type,
            uploader_id: row.uploader_id,
            source_file_id: row.source_file_id,
            created_at: row.created_at,
            attributes: row
                .attributes
                .and_then(|value| serde_json::from_value(value).ok()),
        }
    }
}

/// Metadata store backed by PostgreSQL
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    #[instrument(skip(self, user), fields(user_id = user.user_id))]
    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, username, first_name, last_name, last_seen_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                username = EXCLUDED.username,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(user.user_id)
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.last_seen_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert user")?;

        Ok(())
    }

    #[instrument(skip(self, record), fields(file_id = %record.file_id))]
    async fn save_file(&self, record: &FileRecord) -> Result<()> {
        let size_bytes = i64::try_from(record.size_bytes).context("File size out of range")?;
        let attributes = record
            .attributes
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("Failed to encode file attributes")?;

        sqlx::query(
            r#"
            INSERT INTO files (
                file_id, storage_key, original_name, size_bytes, mime_type,
                uploader_id, source_file_id, created_at, attributes
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9
            )
            ON CONFLICT (file_id) DO UPDATE SET
                storage_key = EXCLUDED.storage_key,
                original_name = EXCLUDED.original_name,
                size_bytes = EXCLUDED.size_bytes,
                mime_type = EXCLUDED.mime_type,
                uploader_id = EXCLUDED.uploader_id,
                source_file_id = EXCLUDED.source_file_id,
                created_at = EXCLUDED.created_at,
                attributes = EXCLUDED.attributes
            "#,
        )
        .bind(record.file_id)
        .bind(&record.storage_key)
        .bind(&record.original_name)
        .bind(size_bytes)
        .bind(&record.mime_type)
        .bind(record.uploader_id)
        .bind(&record.source_file_id)
        .bind(record.created_at)
        .bind(attributes)
        .execute(&self.pool)
        .await
        .context("Failed to insert file metadata")?;

        debug!(storage_key = %record.storage_key, "File indexed");
        Ok(())
    }

    async fn get_file(&self, file_id: Uuid) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT file_id, storage_key, original_name, size_bytes, mime_type,
                   uploader_id, source_file_id, created_at, attributes
            FROM files
            WHERE file_id = $1
            "#,
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query file")?;

        Ok(row.map(FileRecord::from))
    }

    #[instrument(skip(self))]
    async fn list_files_by_uploader(
        &self,
        uploader_id: i64,
        limit: usize,
    ) -> Result<Vec<FileRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT file_id, storage_key, original_name, size_bytes, mime_type,
                   uploader_id, source_file_id, created_at, attributes
            FROM files
            WHERE uploader_id = $1
            ORDER BY created_at ASC, file_id ASC
            LIMIT $2
            "#,
        )
        .bind(uploader_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list files")?;

        Ok(rows.into_iter().map(FileRecord::from).collect())
    }

    async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database unreachable")?;
        Ok(())
    }
}
