use thiserror::Error;
use uuid::Uuid;

use crate::size_format::format_file_size;

/// Errors that terminate an upload attempt
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("File too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("Failed to stage file locally: {0}")]
    Staging(#[from] std::io::Error),

    #[error("Object storage rejected the upload of {key}")]
    Storage { key: String },

    #[error("Upload of {key} aborted unexpectedly")]
    Aborted { key: String },

    #[error("Failed to save file metadata: {0}")]
    Metadata(String),
}

impl UploadError {
    /// Text shown to the user who submitted the file
    pub fn user_message(&self, file_name: &str) -> String {
        match self {
            UploadError::TooLarge { limit, .. } => {
                format!("File too large! Max {}", format_file_size(*limit))
            }
            UploadError::Staging(_) => {
                format!("Could not receive {}. Please try again.", file_name)
            }
            UploadError::Storage { .. } | UploadError::Aborted { .. } => {
                format!("Upload failed: {}", file_name)
            }
            UploadError::Metadata(_) => {
                format!("Upload failed: {} (could not save file details)", file_name)
            }
        }
    }

    /// Short label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::TooLarge { .. } => "validation",
            UploadError::Staging(_) => "staging",
            UploadError::Storage { .. } => "storage",
            UploadError::Aborted { .. } => "aborted",
            UploadError::Metadata(_) => "metadata",
        }
    }
}

/// Errors resolving a stored file into a link
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("File not found: {0}")]
    NotFound(Uuid),

    #[error("Failed to generate a URL for file {0}")]
    UrlUnavailable(Uuid),

    #[error("Metadata store error: {0}")]
    Store(#[from] anyhow::Error),
}
