//! In-process document store.
//!
//! Holds every document in a `tokio` [`RwLock`]-guarded ordered map, so the
//! native scan order is key order. Used by tests and by single-process
//! deployments that do not need persistence.

use std::collections::BTreeMap;

use async_trait::async_trait;
use crelay_types::{DocType, Document};
use futures::StreamExt;
use futures::stream;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{DocumentStore, DocumentStream};

type Variants = BTreeMap<DocType, Document>;

/// A [`DocumentStore`] backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, Variants>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents across every key and variant.
    pub async fn len(&self) -> usize {
        self.docs.read().await.values().map(BTreeMap::len).sum()
    }

    /// Whether the store holds no documents.
    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<Document>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs
            .get(key)
            .map(|variants| variants.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put(&self, doc: Document) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        docs.entry(doc.key().to_owned())
            .or_default()
            .insert(doc.doc_type(), doc);
        Ok(())
    }

    async fn delete(&self, key: &str, doc_type: DocType) -> Result<bool, StoreError> {
        let mut docs = self.docs.write().await;
        let Some(variants) = docs.get_mut(key) else {
            return Ok(false);
        };
        let removed = variants.remove(&doc_type).is_some();
        if variants.is_empty() {
            docs.remove(key);
        }
        Ok(removed)
    }

    fn scan(&self, doc_type: DocType) -> DocumentStream<'_> {
        stream::once(async move {
            let docs = self.docs.read().await;
            let snapshot: Vec<Document> = docs
                .values()
                .filter_map(|variants| variants.get(&doc_type).cloned())
                .collect();
            stream::iter(snapshot.into_iter().map(Ok))
        })
        .flatten()
        .boxed()
    }

    async fn close(&self) -> Result<(), StoreError> {
        let documents = self.len().await;
        tracing::info!(documents, "Memory store closed");
        Ok(())
    }
}
