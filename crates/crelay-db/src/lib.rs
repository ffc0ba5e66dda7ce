//! Document store layer for the `cRelay` indexer.
//!
//! The indexer treats its store as an external, schema-less collaborator:
//! key-addressed documents, several discriminated variants per key, no
//! transactions and no compare-and-swap. This crate defines that seam as the
//! [`DocumentStore`] trait and provides two implementations.
//!
//! # Modules
//!
//! - [`store`] -- The `DocumentStore` trait and scan helpers
//! - [`memory`] -- In-process store for tests and single-node use
//! - [`dragonfly`] -- `Dragonfly` (Redis-compatible) store
//! - [`error`] -- Shared error types

pub mod dragonfly;
pub mod error;
pub mod memory;
pub mod store;

// Re-export primary types for convenience.
pub use dragonfly::DragonflyStore;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use store::{DocumentPredicate, DocumentStore, DocumentStream, next_or_cancelled};
