//! Event interpretation core of the `cRelay` activity indexer.
//!
//! Activity events arrive through the [`EventAdapter`], which stores them as
//! raw documents and then feeds two derived indexes:
//!
//! ```text
//! event
//!   |
//!   +-- EventAdapter::save ------> raw event document
//!         |
//!         +-- CausalityTracker ---> per-subspace causality counters
//!         |
//!         +-- ActivityAggregator -> per-user statistics
//!                 |
//!                 +-- inviter credit (second user document)
//! ```
//!
//! Every read-modify-write of a derived document runs under a per-key lock
//! ([`locks::KeyedLocks`]), so concurrent events touching the same subspace
//! or user never lose an update within one process.
//!
//! # Modules
//!
//! - [`adapter`] -- Raw event persistence and streaming queries
//! - [`causality`] -- Subspace causality tracker
//! - [`activity`] -- User activity aggregator
//! - [`locks`] -- Single-writer-per-key locking
//! - [`config`] -- YAML configuration
//! - [`error`] -- Shared error types

pub mod activity;
pub mod adapter;
pub mod causality;
pub mod config;
pub mod error;
pub mod locks;
mod typed;

// Re-export primary types for convenience.
pub use activity::{ActivityAggregator, ActivityUpdate, InviterCredit, Ranking};
pub use adapter::{EventAdapter, EventStream, QuerySummary, SaveOutcome, StopReason};
pub use causality::{CausalityTracker, CausalityUpdate, parse_operations};
pub use config::{ConfigError, RelayConfig, StoreBackend};
pub use error::{DerivedIndex, DerivedUpdateError, RelayError};
