//! Shared type definitions for the `cRelay` activity indexer.
//!
//! This crate holds every record that crosses a crate boundary: the
//! activity event as admitted from the relay, the filter language used to
//! select stored events, the derived index records, and the document codec
//! that maps all of them onto the generic document store.
//!
//! # Modules
//!
//! - [`ids`] -- Validated subspace identifier
//! - [`event`] -- Activity events, tags, and reserved protocol kinds
//! - [`filter`] -- Event filters and the compiled predicate
//! - [`records`] -- Subspace causality and user statistics records
//! - [`document`] -- Generic documents and the typed codec
//! - [`error`] -- Format errors for malformed input

pub mod document;
pub mod error;
pub mod event;
pub mod filter;
pub mod ids;
pub mod records;

// Re-export primary types for convenience.
pub use document::{DocType, Document, TypedDocument};
pub use error::FormatError;
pub use event::{ActivityEvent, ProtocolKinds, Tag, tags};
pub use filter::{EventFilter, FilterPredicate};
pub use ids::{SUBSPACE_ID_LEN, SubspaceId, is_valid_subspace_id};
pub use records::{
    Ballot, InviteStats, InvitedUser, SubspaceCausality, UserStats, VoteStats, VoteTally,
};
