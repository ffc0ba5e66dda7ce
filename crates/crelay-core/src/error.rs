//! Error types for the indexer core.
//!
//! [`RelayError`] is returned by every public operation. A
//! [`DerivedUpdateError`] is never returned from `save` or `replace`: once the
//! raw event is stored, a failing derived index is logged and reported in the
//! [`SaveOutcome`](crate::adapter::SaveOutcome) instead.

use crelay_db::StoreError;
use crelay_types::FormatError;

/// Errors returned by the adapter, tracker, and aggregator.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The input or a stored document was malformed.
    #[error("format error: {source}")]
    Format {
        /// The underlying format error.
        #[from]
        source: FormatError,
    },

    /// The document store failed. Passed through unmodified.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        source: StoreError,
    },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<StoreError> for RelayError {
    fn from(source: StoreError) -> Self {
        match source {
            StoreError::Cancelled => Self::Cancelled,
            StoreError::Format(source) => Self::Format { source },
            source => Self::Store { source },
        }
    }
}

/// A derived index kept alongside the raw events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedIndex {
    /// The per-subspace causality counters.
    Causality,
    /// The acting user's statistics.
    UserStats,
    /// The inviter's invitation credit on an invite acceptance.
    InviterCredit,
}

impl DerivedIndex {
    /// Short name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Causality => "causality",
            Self::UserStats => "user_stats",
            Self::InviterCredit => "inviter_credit",
        }
    }
}

impl core::fmt::Display for DerivedIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A derived index update that failed after its event was stored.
#[derive(Debug, thiserror::Error)]
#[error("{index} update failed for event {event_id}: {source}")]
pub struct DerivedUpdateError {
    /// Which index failed.
    pub index: DerivedIndex,
    /// The event being indexed.
    pub event_id: String,
    /// Why it failed.
    #[source]
    pub source: RelayError,
}

impl DerivedUpdateError {
    /// Log this failure at `warn`.
    pub fn log(&self) {
        tracing::warn!(
            index = self.index.as_str(),
            event_id = %self.event_id,
            error = %self.source,
            "Derived index update failed"
        );
    }
}
