//! Error types for the ingest binary.
//!
//! [`IngestError`] is the top-level error type that `main` propagates.

/// Top-level error for the ingest binary.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: crelay_core::ConfigError,
    },

    /// The document store could not be opened or closed.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: crelay_db::StoreError,
    },

    /// Saving an event failed for a reason other than malformed input.
    #[error("relay error: {source}")]
    Relay {
        /// The underlying relay error.
        #[from]
        source: crelay_core::RelayError,
    },

    /// Reading standard input failed.
    #[error("input error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}
