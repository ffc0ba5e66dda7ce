//! Format errors shared by every crate in the workspace.
//!
//! A [`FormatError`] means the input itself is malformed: a subspace id that
//! is not `0x` + 64 hex characters, a filter payload that does not parse, an
//! event without an id, or a stored document that fails schema-on-read
//! validation. These are rejected immediately and never retried.

/// Malformed input rejected before any storage I/O takes place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// The subspace id is not `0x` followed by exactly 64 hex digits.
    #[error("invalid subspace ID format: {0}")]
    InvalidSubspaceId(String),

    /// An event filter payload could not be parsed.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// An activity event is missing a required field.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// A stored document failed validation when decoded.
    #[error("invalid document {key}: {reason}")]
    InvalidDocument {
        /// The document key (`_id`), or `<unknown>` if it had none.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl FormatError {
    /// Build an [`FormatError::InvalidDocument`] for `key`.
    pub fn document(key: impl Into<String>, reason: impl core::fmt::Display) -> Self {
        Self::InvalidDocument {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
