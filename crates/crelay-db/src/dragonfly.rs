//! `Dragonfly` (Redis-compatible) document store.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `{ns}:doc:{key}` | Hash | One field per variant, `doc_type` -> JSON document |
//! | `{ns}:index:{doc_type}` | Set | Keys holding a variant of `doc_type` |
//!
//! A `put` adds the key to the index before writing the hash field and a
//! `delete` removes the field before leaving the index, so a scan may see an
//! index entry with no document behind it (skipped) but never misses a
//! stored document.

use std::collections::HashMap;

use async_trait::async_trait;
use crelay_types::{DocType, Document};
use fred::prelude::*;
use futures::stream;
use futures::{StreamExt, TryStreamExt, future};

use crate::error::StoreError;
use crate::store::{DocumentStore, DocumentStream};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "crelay";

/// A [`DocumentStore`] backed by a `Dragonfly` instance.
#[derive(Clone)]
pub struct DragonflyStore {
    client: Client,
    namespace: String,
}

impl DragonflyStore {
    /// Connect to `Dragonfly` at the given URL.
    ///
    /// The URL should follow the Redis URL scheme:
    /// `redis://host:port` or `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the URL cannot be parsed.
    /// Returns [`StoreError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, StoreError> {
        let config = Config::from_url(url)
            .map_err(|e| StoreError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            namespace
        };
        tracing::info!(namespace, "Connected to Dragonfly");
        Ok(Self {
            client,
            namespace: namespace.to_owned(),
        })
    }

    /// The key namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn doc_key(&self, key: &str) -> String {
        format!("{}:doc:{key}", self.namespace)
    }

    fn index_key(&self, doc_type: DocType) -> String {
        format!("{}:index:{doc_type}", self.namespace)
    }

    /// Fetch one variant, logging and skipping it if malformed.
    async fn fetch(&self, key: &str, doc_type: DocType) -> Result<Option<Document>, StoreError> {
        let raw: Option<String> = self
            .client
            .hget(self.doc_key(key), doc_type.as_str())
            .await?;
        Ok(raw.and_then(|json| decode(key, &json)))
    }

    /// Delete every key under this store's namespace.
    ///
    /// **WARNING:** This deletes all data in the namespace. Only use for
    /// testing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Dragonfly`] if a read or delete fails.
    pub async fn clear(&self) -> Result<(), StoreError> {
        for doc_type in DocType::ALL {
            let index = self.index_key(doc_type);
            let keys: Vec<String> = self.client.smembers(index.as_str()).await?;
            for key in keys {
                let _: u32 = self.client.del(self.doc_key(&key)).await?;
            }
            let _: u32 = self.client.del(index).await?;
        }
        Ok(())
    }
}

/// Decode a raw hash value. Malformed entries are logged and dropped.
fn decode(key: &str, json: &str) -> Option<Document> {
    let parsed = serde_json::from_str(json)
        .map_err(|e| e.to_string())
        .and_then(|value| Document::from_value(value).map_err(|e| e.to_string()));
    match parsed {
        Ok(doc) => Some(doc),
        Err(reason) => {
            tracing::warn!(key, reason = %reason, "Skipping undecodable document");
            None
        }
    }
}

#[async_trait]
impl DocumentStore for DragonflyStore {
    async fn get(&self, key: &str) -> Result<Vec<Document>, StoreError> {
        let fields: HashMap<String, String> = self.client.hgetall(self.doc_key(key)).await?;
        let mut docs: Vec<Document> = fields
            .values()
            .filter_map(|json| decode(key, json))
            .collect();
        docs.sort_by_key(Document::doc_type);
        Ok(docs)
    }

    async fn put(&self, doc: Document) -> Result<(), StoreError> {
        let json = serde_json::to_string(&doc)?;
        let doc_type = doc.doc_type();
        let _: u32 = self
            .client
            .sadd(self.index_key(doc_type), doc.key())
            .await?;
        let _: u32 = self
            .client
            .hset(self.doc_key(doc.key()), (doc_type.as_str(), json.as_str()))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str, doc_type: DocType) -> Result<bool, StoreError> {
        let removed: u32 = self
            .client
            .hdel(self.doc_key(key), doc_type.as_str())
            .await?;
        let _: u32 = self.client.srem(self.index_key(doc_type), key).await?;
        Ok(removed > 0)
    }

    fn scan(&self, doc_type: DocType) -> DocumentStream<'_> {
        let index = self.index_key(doc_type);
        stream::once(async move {
            let keys: Vec<String> = self.client.smembers(index).await?;
            Ok::<_, StoreError>(stream::iter(keys.into_iter().map(Ok::<_, StoreError>)))
        })
        .try_flatten()
        .and_then(move |key| async move { self.fetch(&key, doc_type).await })
        .try_filter_map(future::ok)
        .boxed()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.client.quit().await?;
        tracing::info!(namespace = %self.namespace, "Dragonfly connection closed");
        Ok(())
    }
}
