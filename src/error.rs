//! Error types for mapcontent

use thiserror::Error;

use crate::digest::DigestMismatch;
use crate::progress::DownloadCancelled;

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("No remote content root is available")]
    NetworkUnavailable,

    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Unknown content type: {0}")]
    UnknownContentType(String),

    #[error("Content item not found: {0}")]
    NotFound(String),

    #[error("Failed to unpack {name}: {source}")]
    Extraction {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ContentError {
    /// Lift an error that surfaced from a stream pipeline back into the
    /// taxonomy: digest mismatches and cancelled reads get their own variants.
    pub fn from_pipeline(err: std::io::Error) -> Self {
        if let Some(inner) = err.get_ref() {
            if let Some(mismatch) = inner.downcast_ref::<DigestMismatch>() {
                return ContentError::HashMismatch {
                    expected: mismatch.expected.clone(),
                    actual: mismatch.actual.clone(),
                };
            }
            if inner.downcast_ref::<DownloadCancelled>().is_some() {
                return ContentError::Cancelled;
            }
        }

        ContentError::Io(err)
    }

    /// Whether the caller may reasonably retry the same operation later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ContentError::Network(_)
                | ContentError::NetworkUnavailable
                | ContentError::Cancelled
                | ContentError::Extraction { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ContentError>;
