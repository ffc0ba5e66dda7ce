//! Error types for the document store layer.
//!
//! All store failures surface as [`StoreError`]. I/O errors are passed
//! through unmodified; this layer never retries.

use crelay_types::FormatError;

/// Errors that can occur while talking to the document store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored document was malformed.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation observed its cancellation token before completing.
    #[error("operation cancelled")]
    Cancelled,
}
