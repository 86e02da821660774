//! Filebot
//!
//! Telegram file relay. Users send documents, videos, audio or photos to the
//! bot; each file is staged locally, streamed to S3-compatible object storage
//! with live progress reports, and indexed so it can later be fetched through
//! time-limited download links or opened in an external player.
//!
//! ## Features
//!
//! - **Streaming Uploads**: multipart uploads for large files, bounded
//!   concurrency, scratch files removed on every exit path
//! - **Live Progress**: throttled percentage/speed/ETA updates edited into the
//!   chat while the transfer runs
//! - **Metadata Indexing**: in-memory or PostgreSQL-backed file and user records
//! - **Link Surface**: presigned download redirects and MX Player intents over
//!   a small HTTP API
//!
//! ## Architecture
//!
//! ```text
//! Telegram                 Upload Pipeline               Object Storage
//! ┌──────────────┐        ┌──────────────────┐         ┌──────────────┐
//! │ Bot          │───────▶│ stage (tempfile) │         │ files/       │
//! │ Dispatcher   │        │ upload ──────────│────────▶│   {id}/      │
//! └──────────────┘        │ persist          │         │   {name}     │
//!        ▲                └──────────────────┘         └──────────────┘
//!        │                    │          │                    ▲
//!        │ edits              │          ▼                    │
//! ┌──────────────┐            │   ┌──────────────┐            │
//! │ Progress     │◀───────────┘   │ Metadata     │            │
//! │ Notifier     │                │ Store        │            │
//! └──────────────┘                └──────────────┘            │
//!                                        │                    │
//!                                        ▼                    │
//!                                 ┌──────────────┐   presign  │
//!                                 │ Web API      │────────────┘
//!                                 │ /stream      │
//!                                 │ /player      │
//!                                 └──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod messages;
pub mod metadata_store;
pub mod object_gateway;
pub mod progress;
pub mod size_format;
pub mod telegram;
pub mod upload_pipeline;
pub mod web;

pub use config::Config;
pub use error::{LookupError, UploadError};
pub use metadata_store::{
    FileAttributes, FileRecord, InMemoryMetadataStore, MetadataStore, PgMetadataStore, UserRecord,
};
pub use object_gateway::{ObjectStorageGateway, S3Gateway};
pub use progress::{ProgressNotifier, ProgressSnapshot, ProgressTracker, StatusSink};
pub use size_format::format_file_size;
pub use upload_pipeline::{FileKind, InboundFile, UploadPipeline, UploadSummary};
pub use web::{AppState, PublicLinks};
