//! Upload pipeline: inbound stream to scratch file to object store to metadata.
//!
//! ```text
//! Received ──▶ Staged ──▶ Uploading ──▶ Persisted
//!    │            │            │
//!    ▼            ▼            ▼
//! (rejected)  StagingFailed  Failed
//! ```
//!
//! The scratch file is a [`NamedTempFile`] owned by the running
//! [`UploadPipeline::handle`] call, so it is removed on every exit path,
//! including a panic inside the storage gateway.

use crate::error::UploadError;
use crate::messages;
use crate::metadata_store::{FileAttributes, FileRecord, MetadataStore};
use crate::object_gateway::{storage_key, ObjectStorageGateway};
use crate::progress::{ProgressNotifier, ProgressTracker, StatusSink};
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Largest declared size accepted for upload (4 GiB)
pub const MAX_UPLOAD_BYTES: u64 = 4 * 1024 * 1024 * 1024;

const BYTES_PER_MB: f64 = 1_048_576.0;

/// How long a finished upload waits for its last progress edit
pub const NOTIFY_GRACE: Duration = Duration::from_secs(5);

/// Kind of media the file arrived as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Document,
    Video,
    Audio,
    Photo,
}

/// Inbound file, normalized once at the transport boundary
#[derive(Debug, Clone)]
pub struct InboundFile {
    pub kind: FileKind,
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    pub mime_type: Option<String>,
    pub attributes: FileAttributes,
    /// Transport-side file reference
    pub source_file_id: Option<String>,
}

impl InboundFile {
    /// Declared content type, or one guessed from the file name
    pub fn content_type(&self) -> Option<String> {
        self.mime_type.clone().or_else(|| {
            mime_guess::from_path(&self.name)
                .first_raw()
                .map(str::to_string)
        })
    }
}

/// Pipeline states, used for tracing transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Received,
    Staged,
    Uploading,
    Persisted,
    Failed,
    StagingFailed,
}

/// Reject a declared size above [`MAX_UPLOAD_BYTES`]
pub fn check_size(size: u64) -> Result<(), UploadError> {
    if size > MAX_UPLOAD_BYTES {
        return Err(UploadError::TooLarge {
            size,
            limit: MAX_UPLOAD_BYTES,
        });
    }
    Ok(())
}

/// Result of a successful upload
#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub record: FileRecord,
    /// Wall-clock time from receipt to persistence
    pub elapsed: Duration,
    /// Declared size over `elapsed`, in MB/s
    pub average_speed_mbps: f64,
}

/// Average throughput in MB/s, 0 when no time has elapsed
pub fn average_speed_mbps(size_bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        size_bytes as f64 / secs / BYTES_PER_MB
    } else {
        0.0
    }
}

/// Orchestrates one upload per call; calls for different files run concurrently
pub struct UploadPipeline {
    gateway: Arc<dyn ObjectStorageGateway>,
    store: Arc<dyn MetadataStore>,
    scratch_dir: PathBuf,
    upload_slots: Semaphore,
    notify_grace: Duration,
}

impl UploadPipeline {
    pub fn new(
        gateway: Arc<dyn ObjectStorageGateway>,
        store: Arc<dyn MetadataStore>,
        scratch_dir: PathBuf,
        max_concurrent_uploads: usize,
    ) -> Self {
        Self {
            gateway,
            store,
            scratch_dir,
            upload_slots: Semaphore::new(max_concurrent_uploads),
            notify_grace: NOTIFY_GRACE,
        }
    }

    /// Override how long a finished upload waits for the status sink
    pub fn with_notify_grace(mut self, grace: Duration) -> Self {
        self.notify_grace = grace;
        self
    }

    /// Stage, upload and persist one inbound file
    ///
    /// Progress text is pushed to `status` while the upload runs; the final
    /// outcome is only carried by the return value.
    #[instrument(
        skip(self, file, reader, status),
        fields(file_name = %file.name, size_bytes = file.size, uploader_id = uploader_id)
    )]
    pub async fn handle<R>(
        &self,
        file: InboundFile,
        uploader_id: i64,
        reader: R,
        status: Arc<dyn StatusSink>,
    ) -> Result<UploadSummary, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let result = self.run(file, uploader_id, reader, status).await;

        match &result {
            Ok(summary) => {
                metrics::counter!("filebot.uploads.completed").increment(1);
                metrics::histogram!("filebot.upload.duration_seconds")
                    .record(summary.elapsed.as_secs_f64());
            }
            Err(e) => {
                metrics::counter!("filebot.uploads.failed", "reason" => e.kind()).increment(1);
            }
        }

        result
    }

    async fn run<R>(
        &self,
        file: InboundFile,
        uploader_id: i64,
        reader: R,
        status: Arc<dyn StatusSink>,
    ) -> Result<UploadSummary, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        debug!(stage = ?UploadStage::Received, kind = ?file.kind, "Upload received");

        check_size(file.size).map_err(|e| {
            info!(limit = MAX_UPLOAD_BYTES, "Rejecting oversized file");
            e
        })?;

        // Released on every return path, including a caught panic
        let _slot = self
            .upload_slots
            .acquire()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "upload slots closed"))?;

        metrics::counter!("filebot.uploads.started").increment(1);

        let file_id = Uuid::new_v4();
        let key = storage_key(file_id, &file.name);

        let (scratch, staged_bytes) = self.stage(reader).await.map_err(|e| {
            warn!(stage = ?UploadStage::StagingFailed, error = %e, "Failed to stage file");
            UploadError::Staging(e)
        })?;

        debug!(
            stage = ?UploadStage::Staged,
            path = %scratch.path().display(),
            staged_bytes = staged_bytes,
            "File staged"
        );
        if staged_bytes != file.size {
            warn!(
                declared = file.size,
                staged = staged_bytes,
                "Staged size differs from declared size"
            );
        }

        debug!(stage = ?UploadStage::Uploading, key = %key, "Uploading to object storage");
        let notifier = ProgressNotifier::spawn(status);
        let outcome = {
            let updates = notifier.sender();
            let file_name = file.name.clone();
            let tracker = ProgressTracker::new(file.size, move |snapshot| {
                // The notifier may already be gone; progress is best-effort
                let _ = updates.send(messages::upload_progress(&file_name, &snapshot));
            });
            let on_progress = |transferred: u64| tracker.on_bytes(transferred);

            AssertUnwindSafe(self.gateway.upload(scratch.path(), &key, &on_progress))
                .catch_unwind()
                .await
        };

        match outcome {
            Ok(true) => {}
            Ok(false) => {
                warn!(stage = ?UploadStage::Failed, key = %key, "Object storage rejected upload");
                notifier.cancel().await;
                return Err(UploadError::Storage { key });
            }
            Err(_) => {
                error!(stage = ?UploadStage::Failed, key = %key, "Upload aborted by a panic");
                notifier.cancel().await;
                return Err(UploadError::Aborted { key });
            }
        }

        if let Err(e) = scratch.close() {
            warn!(error = %e, "Failed to remove scratch file");
        }

        let record = FileRecord {
            file_id,
            storage_key: key.clone(),
            original_name: file.name.clone(),
            size_bytes: file.size,
            mime_type: file.content_type(),
            uploader_id,
            source_file_id: file.source_file_id.clone(),
            created_at: Utc::now(),
            attributes: (!file.attributes.is_empty()).then(|| file.attributes.clone()),
        };

        if let Err(e) = self.persist(&record).await {
            notifier.cancel().await;
            return Err(e);
        }

        // Bounded, so a slow chat cannot hold up a stored and indexed file
        notifier.finish(self.notify_grace).await;

        let elapsed = started.elapsed();
        let average_speed_mbps = average_speed_mbps(file.size, elapsed);

        info!(
            stage = ?UploadStage::Persisted,
            file_id = %file_id,
            key = %key,
            elapsed_secs = elapsed.as_secs_f64(),
            average_speed_mbps = average_speed_mbps,
            "Upload complete"
        );

        Ok(UploadSummary {
            record,
            elapsed,
            average_speed_mbps,
        })
    }

    /// Save the record, deleting the stored object if that fails
    async fn persist(&self, record: &FileRecord) -> Result<(), UploadError> {
        let Err(e) = self.store.save_file(record).await else {
            return Ok(());
        };

        error!(stage = ?UploadStage::Failed, error = ?e, "Failed to persist file record");
        // No record may point at bytes we could not index, and vice versa
        if !self.gateway.delete(&record.storage_key).await {
            warn!(key = %record.storage_key, "Stored object left without a metadata record");
        }
        Err(UploadError::Metadata(e.to_string()))
    }

    /// Copy the inbound stream into a fresh scratch file
    async fn stage<R>(&self, mut reader: R) -> io::Result<(NamedTempFile, u64)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let scratch = tempfile::Builder::new()
            .prefix("filebot-")
            .suffix(".part")
            .tempfile_in(&self.scratch_dir)?;

        let mut file = tokio::fs::File::from_std(scratch.reopen()?);
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;

        Ok((scratch, written))
    }
}
