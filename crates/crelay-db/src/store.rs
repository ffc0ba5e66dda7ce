//! The document store seam.
//!
//! The store is key-addressed and schema-less. One key may hold several
//! co-resident variants told apart by their [`DocType`]; `put` replaces a
//! single variant wholesale (last writer wins) and `delete` removes a single
//! variant. There are no transactions and no compare-and-swap, so any
//! read-modify-write discipline belongs to the caller.

use async_trait::async_trait;
use crelay_types::{DocType, Document};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

/// A lazily produced sequence of documents from [`DocumentStore::scan`].
pub type DocumentStream<'a> = BoxStream<'a, Result<Document, StoreError>>;

/// Predicate over raw documents used by [`DocumentStore::query`].
pub type DocumentPredicate<'a> = &'a (dyn Fn(&Document) -> bool + Send + Sync);

/// A key-addressed document store.
///
/// Implementations are shared by reference between components, so every
/// method takes `&self`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every variant stored under `key`, in discriminator order. Empty if
    /// the key is absent.
    async fn get(&self, key: &str) -> Result<Vec<Document>, StoreError>;

    /// Write `doc`, replacing any existing variant with the same key and
    /// discriminator.
    async fn put(&self, doc: Document) -> Result<(), StoreError>;

    /// Remove the `doc_type` variant at `key`. Other variants sharing the
    /// key are left alone. Returns whether anything was removed.
    async fn delete(&self, key: &str, doc_type: DocType) -> Result<bool, StoreError>;

    /// Lazily stream every document of `doc_type` in store-native order.
    ///
    /// Documents are fetched as the stream is polled, so dropping the stream
    /// stops the scan. Raw entries that cannot be decoded as documents are
    /// logged and skipped.
    fn scan(&self, doc_type: DocType) -> DocumentStream<'_>;

    /// Release the underlying connection. The store must not be used after.
    async fn close(&self) -> Result<(), StoreError>;

    /// Collect every `doc_type` document matching `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cancelled`] as soon as `cancel` fires, or the
    /// first I/O error from the scan.
    async fn query(
        &self,
        doc_type: DocType,
        predicate: DocumentPredicate<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Document>, StoreError> {
        let mut scan = self.scan(doc_type);
        let mut matched = Vec::new();
        while let Some(doc) = next_or_cancelled(&mut scan, cancel).await? {
            if predicate(&doc) {
                matched.push(doc);
            }
        }
        Ok(matched)
    }

    /// Count `doc_type` documents matching `predicate` without collecting
    /// them.
    ///
    /// # Errors
    ///
    /// Same as [`DocumentStore::query`].
    async fn count(
        &self,
        doc_type: DocType,
        predicate: DocumentPredicate<'_>,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        let mut scan = self.scan(doc_type);
        let mut total: usize = 0;
        while let Some(doc) = next_or_cancelled(&mut scan, cancel).await? {
            if predicate(&doc) {
                total = total.saturating_add(1);
            }
        }
        Ok(total)
    }
}

/// Pull the next document unless `cancel` fires first.
///
/// Cancellation wins ties, so a token that is already cancelled stops the
/// scan before another fetch is issued.
///
/// # Errors
///
/// Returns [`StoreError::Cancelled`] if the token fired, or the scan's own
/// error.
pub async fn next_or_cancelled(
    scan: &mut DocumentStream<'_>,
    cancel: &CancellationToken,
) -> Result<Option<Document>, StoreError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StoreError::Cancelled),
        next = scan.next() => next.transpose(),
    }
}
