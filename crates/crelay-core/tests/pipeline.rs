//! End-to-end tests for the indexer pipeline over an in-memory store.
//!
//! Wrapper stores inject latency (to widen race windows) and targeted write
//! failures (to check that derived index failures stay isolated).

// Integration tests use expect/unwrap extensively for clarity -- panicking
// on failure is the correct behavior in test code.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crelay_core::{
    CausalityUpdate, DerivedIndex, EventAdapter, InviterCredit, RelayConfig, RelayError,
    StopReason,
};
use crelay_db::{DocumentStore, DocumentStream, MemoryStore, StoreError};
use crelay_types::{ActivityEvent, DocType, Document, EventFilter, Tag, TypedDocument};
use futures::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

const SID: &str = "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";

// =============================================================================
// Wrapper stores
// =============================================================================

/// Sleeps before every operation and between scanned documents.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl DocumentStore for SlowStore {
    async fn get(&self, key: &str) -> Result<Vec<Document>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn put(&self, doc: Document) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(doc).await
    }

    async fn delete(&self, key: &str, doc_type: DocType) -> Result<bool, StoreError> {
        self.inner.delete(key, doc_type).await
    }

    fn scan(&self, doc_type: DocType) -> DocumentStream<'_> {
        let delay = self.delay;
        self.inner
            .scan(doc_type)
            .then(move |doc| async move {
                tokio::time::sleep(delay).await;
                doc
            })
            .boxed()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

/// Fails every `put` of one document variant, optionally for one key only.
struct FailingStore {
    inner: MemoryStore,
    doc_type: DocType,
    key: Option<&'static str>,
}

#[async_trait]
impl DocumentStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Vec<Document>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, doc: Document) -> Result<(), StoreError> {
        let targeted = doc.doc_type() == self.doc_type
            && self.key.is_none_or(|key| key == doc.key());
        if targeted {
            return Err(StoreError::Config("injected write failure".to_owned()));
        }
        self.inner.put(doc).await
    }

    async fn delete(&self, key: &str, doc_type: DocType) -> Result<bool, StoreError> {
        self.inner.delete(key, doc_type).await
    }

    fn scan(&self, doc_type: DocType) -> DocumentStream<'_> {
        self.inner.scan(doc_type)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn event(id: &str, author: &str, kind: u32, tags: &[&[&str]]) -> ActivityEvent {
    ActivityEvent {
        id: id.to_owned(),
        pubkey: author.to_owned(),
        created_at: 1_700_000_000,
        kind,
        content: String::new(),
        tags: tags.iter().map(|t| Tag::new(t.iter().copied())).collect(),
        sig: "sig".to_owned(),
    }
}

fn memory_adapter() -> EventAdapter {
    EventAdapter::new(Arc::new(MemoryStore::new()), &RelayConfig::default())
}

// =============================================================================
// Pipeline behaviour
// =============================================================================

#[tokio::test]
async fn subspace_lifecycle_end_to_end() {
    let adapter = memory_adapter();
    let cancel = CancellationToken::new();

    adapter
        .save(
            &event("create", "alice", 30100, &[&["sid", SID], &["ops", "create=1,vote=2"]]),
            &cancel,
        )
        .await
        .expect("save create");
    adapter
        .save(&event("join", "bob", 30200, &[&["sid", SID]]), &cancel)
        .await
        .expect("save join");
    for (id, ballot) in [("v1", "yes"), ("v2", "yes"), ("v3", "no")] {
        adapter
            .save(
                &event(id, "bob", 30302, &[&["sid", SID], &["op", "vote"], &["vote", ballot]]),
                &cancel,
            )
            .await
            .expect("save vote");
    }

    let tracker = adapter.tracker();
    assert_eq!(tracker.key(SID, 1, &cancel).await.unwrap(), 0);
    assert_eq!(tracker.key(SID, 2, &cancel).await.unwrap(), 3);
    assert_eq!(
        tracker.events(SID, &cancel).await.unwrap(),
        vec!["create", "join", "v1", "v2", "v3"]
    );

    let bob = adapter.aggregator().get("bob", &cancel).await.unwrap().unwrap();
    let votes = bob.vote_stats.expect("vote stats");
    assert_eq!((votes.total_votes, votes.yes_votes, votes.no_votes), (3, 2, 1));
    let per_subspace = votes.subspace_votes[SID];
    assert_eq!(
        (per_subspace.total_votes, per_subspace.yes_votes, per_subspace.no_votes),
        (3, 2, 1)
    );

    let alice = adapter.aggregator().get("alice", &cancel).await.unwrap().unwrap();
    assert!(alice.created_subspaces.contains(SID));
}

#[tokio::test]
async fn invite_acceptance_credits_only_the_inviter() {
    let adapter = memory_adapter();
    let cancel = CancellationToken::new();
    let outcome = adapter
        .save(
            &event("inv", "bob", 30303, &[&["sid", SID], &["inviter", "alice"]]),
            &cancel,
        )
        .await
        .unwrap();
    assert!(outcome.is_complete());

    let alice = adapter.aggregator().get("alice", &cancel).await.unwrap().unwrap();
    let invites = alice.invite_stats.expect("invite stats");
    assert_eq!(invites.total_invited, 1);
    assert_eq!(invites.subspace_invited[SID], 1);
    assert_eq!(invites.invited_users[SID].len(), 1);
    assert_eq!(invites.invited_users[SID][0].invitee, "bob");
    assert_eq!(invites.invited_users[SID][0].subspace, SID);

    let bob = adapter.aggregator().get("bob", &cancel).await.unwrap().unwrap();
    assert!(bob.invite_stats.is_none());
    assert_eq!(bob.total(30303), 1);
}

#[tokio::test]
async fn filter_from_wire_json_selects_events() {
    let adapter = memory_adapter();
    let cancel = CancellationToken::new();
    adapter.save(&event("a", "A", 30302, &[&["sid", SID]]), &cancel).await.unwrap();
    adapter.save(&event("b", "A", 30302, &[]), &cancel).await.unwrap();
    adapter.save(&event("c", "B", 30302, &[&["SID", SID]]), &cancel).await.unwrap();

    let filter = EventFilter::from_json(&format!(r##"{{"kinds":[30302],"#sid":["{SID}"]}}"##))
        .expect("filter parses");
    let mut ids: Vec<String> = adapter
        .query(&filter, &cancel)
        .map_ok(|e| e.id)
        .try_collect()
        .await
        .unwrap();
    ids.sort();
    assert_eq!(ids, vec!["a", "c"]);
    assert_eq!(adapter.count(&filter, &cancel).await.unwrap(), 2);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_lose_nothing() {
    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(2),
    });
    let adapter = Arc::new(EventAdapter::new(store, &RelayConfig::default()));
    let cancel = CancellationToken::new();
    adapter
        .save(&event("create", "alice", 30100, &[&["sid", SID], &["ops", "vote=2"]]), &cancel)
        .await
        .unwrap();

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let adapter = Arc::clone(&adapter);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let vote = event(&format!("v{i}"), "bob", 2, &[&["sid", SID], &["vote", "yes"]]);
                adapter.save(&vote, &cancel).await
            })
        })
        .collect();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.is_complete());
    }

    assert_eq!(adapter.tracker().key(SID, 2, &cancel).await.unwrap(), 20);
    assert_eq!(adapter.tracker().events(SID, &cancel).await.unwrap().len(), 21);
    let bob = adapter.aggregator().get("bob", &cancel).await.unwrap().unwrap();
    assert_eq!(bob.total(2), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redelivery_indexes_once() {
    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(2),
    });
    let adapter = Arc::new(EventAdapter::new(store, &RelayConfig::default()));
    let cancel = CancellationToken::new();
    let post = event("same", "carol", 1, &[&["sid", SID]]);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let adapter = Arc::clone(&adapter);
            let cancel = cancel.clone();
            let post = post.clone();
            tokio::spawn(async move { adapter.save(&post, &cancel).await })
        })
        .collect();
    let mut first_deliveries = 0_usize;
    for task in tasks {
        if !task.await.unwrap().unwrap().redelivered {
            first_deliveries = first_deliveries.saturating_add(1);
        }
    }
    assert_eq!(first_deliveries, 1);

    let carol = adapter.aggregator().get("carol", &cancel).await.unwrap().unwrap();
    assert_eq!(carol.total(1), 1);
    assert_eq!(adapter.tracker().events(SID, &cancel).await.unwrap(), vec!["same"]);
}

// =============================================================================
// Failure isolation
// =============================================================================

#[tokio::test]
async fn causality_failure_does_not_fail_save() {
    let store = Arc::new(FailingStore {
        inner: MemoryStore::new(),
        doc_type: DocType::Causality,
        key: None,
    });
    let adapter = EventAdapter::new(store, &RelayConfig::default());
    let cancel = CancellationToken::new();

    let outcome = adapter
        .save(&event("e", "alice", 30200, &[&["sid", SID]]), &cancel)
        .await
        .expect("save succeeds despite derived failure");
    assert!(!outcome.is_complete());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].index, DerivedIndex::Causality);
    assert_eq!(outcome.failures[0].event_id, "e");

    assert!(adapter.get("e", &cancel).await.unwrap().is_some());
    assert!(adapter.tracker().get(SID, &cancel).await.unwrap().is_none());
    let alice = adapter.aggregator().get("alice", &cancel).await.unwrap().unwrap();
    assert!(alice.has_joined(SID));
}

#[tokio::test]
async fn inviter_credit_failure_keeps_the_invitee_update() {
    let store = Arc::new(FailingStore {
        inner: MemoryStore::new(),
        doc_type: DocType::UserStats,
        key: Some("alice"),
    });
    let adapter = EventAdapter::new(store, &RelayConfig::default());
    let cancel = CancellationToken::new();

    let outcome = adapter
        .save(
            &event("inv", "bob", 30303, &[&["sid", SID], &["inviter", "alice"]]),
            &cancel,
        )
        .await
        .unwrap();
    assert!(outcome.failures.is_empty());
    assert!(!outcome.is_complete());
    let activity = outcome.activity.expect("primary update ran");
    assert!(matches!(
        activity.inviter,
        InviterCredit::Failed(ref e) if e.index == DerivedIndex::InviterCredit
    ));

    let bob = adapter.aggregator().get("bob", &cancel).await.unwrap().unwrap();
    assert_eq!(bob.total(30303), 1);
    assert!(adapter.aggregator().get("alice", &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn raw_write_failure_is_returned() {
    let store = Arc::new(FailingStore {
        inner: MemoryStore::new(),
        doc_type: DocType::Event,
        key: None,
    });
    let adapter = EventAdapter::new(store, &RelayConfig::default());
    let cancel = CancellationToken::new();

    let result = adapter.save(&event("e", "alice", 1, &[]), &cancel).await;
    assert!(
        matches!(
            &result,
            Err(RelayError::Store {
                source: StoreError::Config(message),
            }) if message == "injected write failure"
        ),
        "expected the store error unchanged, got {result:?}"
    );
    assert!(adapter.aggregator().get("alice", &cancel).await.unwrap().is_none());
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_stops_a_slow_scan() {
    let inner = MemoryStore::new();
    for i in 0..50 {
        let doc = event(&format!("e{i:02}"), "x", 1, &[]).to_document().unwrap();
        inner.put(doc).await.unwrap();
    }
    let store = Arc::new(SlowStore {
        inner,
        delay: Duration::from_millis(20),
    });
    let adapter = EventAdapter::new(store, &RelayConfig::default());
    let cancel = CancellationToken::new();

    let mut stream = adapter.query(&EventFilter::default(), &cancel);
    let first = stream.next().await.expect("one event").unwrap();
    assert_eq!(first.id, "e00");
    cancel.cancel();
    assert!(stream.next().await.is_none());

    let summary = tokio::time::timeout(Duration::from_secs(1), stream.join())
        .await
        .expect("producer stops promptly");
    assert_eq!(summary.stop, StopReason::Cancelled);
    assert!(summary.sent < 50);
}

#[tokio::test]
async fn causality_update_outcomes_are_reported() {
    let adapter = memory_adapter();
    let cancel = CancellationToken::new();
    let outcome = adapter
        .save(&event("x", "alice", 1, &[&["sid", "not-a-subspace"]]), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome.causality, Some(CausalityUpdate::InvalidSubspace));
    assert!(outcome.is_complete());
}
