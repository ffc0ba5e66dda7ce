//! Integration tests for the `crelay-db` Dragonfly store.
//!
//! These tests require a live Dragonfly instance. Run with:
//!
//! ```bash
//! docker run -d -p 6379:6379 docker.dragonflydb.io/dragonflydb/dragonfly
//! cargo test -p crelay-db -- --ignored
//! ```
//!
//! All tests are marked `#[ignore]` so they are skipped during normal
//! `cargo test` runs. Each test uses its own namespace and clears it.

// Integration tests use expect/unwrap extensively for clarity -- panicking
// on failure is the correct behavior in test code.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]

use crelay_db::{DocumentStore, DragonflyStore};
use crelay_types::{DocType, Document};
use futures::TryStreamExt;
use serde_json::{Map, json};
use tokio_util::sync::CancellationToken;

/// Dragonfly connection URL for the local Docker instance.
const DRAGONFLY_URL: &str = "redis://localhost:6379";

async fn connect(namespace: &str) -> DragonflyStore {
    let store = DragonflyStore::connect(DRAGONFLY_URL, namespace)
        .await
        .expect("Failed to connect to Dragonfly -- is Docker running?");
    store.clear().await.expect("Failed to clear namespace");
    store
}

fn doc(key: &str, doc_type: DocType, n: i64) -> Document {
    let mut body = Map::new();
    body.insert("n".to_owned(), json!(n));
    Document::new(key, doc_type, body)
}

#[tokio::test]
#[ignore = "requires live Dragonfly instance"]
async fn dragonfly_variants_roundtrip() {
    let store = connect("crelay-test-variants").await;

    store.put(doc("k", DocType::Event, 1)).await.expect("put event");
    store
        .put(doc("k", DocType::Causality, 2))
        .await
        .expect("put causality");

    let found = store.get("k").await.expect("get");
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].doc_type(), DocType::Event);
    assert_eq!(found[1].field("n"), Some(&json!(2)));

    assert!(store.delete("k", DocType::Event).await.expect("delete"));
    let found = store.get("k").await.expect("get");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].doc_type(), DocType::Causality);

    store.clear().await.expect("clear");
    store.close().await.expect("close");
}

#[tokio::test]
#[ignore = "requires live Dragonfly instance"]
async fn dragonfly_scan_and_count() {
    let store = connect("crelay-test-scan").await;

    for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
        store
            .put(doc(key, DocType::Event, i64::try_from(i).unwrap()))
            .await
            .expect("put");
    }
    store.put(doc("a", DocType::UserStats, 9)).await.expect("put");

    let mut keys: Vec<String> = store
        .scan(DocType::Event)
        .map_ok(|d| d.key().to_owned())
        .try_collect()
        .await
        .expect("scan");
    keys.sort();
    assert_eq!(keys, vec!["a", "b", "c"]);

    let cancel = CancellationToken::new();
    let n = store
        .count(DocType::UserStats, &|_| true, &cancel)
        .await
        .expect("count");
    assert_eq!(n, 1);

    store.clear().await.expect("clear");
    store.close().await.expect("close");
}
