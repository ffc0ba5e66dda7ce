//! Event adapter and streaming query executor.
//!
//! The adapter is the only writer of raw event documents. A successful
//! `save` is followed by two sequential best-effort derived updates
//! (causality, then user statistics); their failures are logged and
//! reported in the [`SaveOutcome`] but never undo or fail the save.
//!
//! Queries compile an [`EventFilter`] into a predicate and run it on a
//! producer task that scans the store and feeds an [`EventStream`]. The
//! producer stops as soon as its cancellation token fires, the consumer
//! drops the stream, or the filter's limit is reached.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crelay_db::{DocumentStore, StoreError, next_or_cancelled};
use crelay_types::{
    ActivityEvent, DocType, Document, EventFilter, FilterPredicate, TypedDocument,
};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityAggregator, ActivityUpdate, InviterCredit};
use crate::causality::{CausalityTracker, CausalityUpdate};
use crate::config::RelayConfig;
use crate::error::{DerivedIndex, DerivedUpdateError, RelayError};
use crate::locks::KeyedLocks;
use crate::typed::{check, fetch};

/// What a `save` or `replace` did beyond storing the raw event.
#[derive(Debug, Default)]
pub struct SaveOutcome {
    /// The event id was already stored or already applied to causality, so
    /// no derived counter moved.
    pub redelivered: bool,
    /// Causality outcome, if that update ran and succeeded.
    pub causality: Option<CausalityUpdate>,
    /// User statistics outcome, if that update ran and succeeded.
    pub activity: Option<ActivityUpdate>,
    /// Derived updates that failed after the event was stored.
    pub failures: Vec<DerivedUpdateError>,
}

impl SaveOutcome {
    /// Whether every derived update that ran succeeded, the inviter credit
    /// included.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
            && !matches!(
                self.activity,
                Some(ActivityUpdate {
                    inviter: InviterCredit::Failed(_),
                    ..
                })
            )
    }
}

/// Whether a write is a first delivery or an explicit replacement.
///
/// A save applies each event id to the derived indexes at most once. A
/// replace applies it to both indexes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Save,
    Replace,
}

/// Reads and writes activity events and drives the derived indexes.
pub struct EventAdapter {
    store: Arc<dyn DocumentStore>,
    tracker: CausalityTracker,
    aggregator: ActivityAggregator,
    locks: KeyedLocks,
    query_buffer: usize,
}

impl EventAdapter {
    /// Build an adapter, tracker, and aggregator sharing `store`.
    pub fn new(store: Arc<dyn DocumentStore>, config: &RelayConfig) -> Self {
        Self {
            tracker: CausalityTracker::new(Arc::clone(&store), &config.protocol),
            aggregator: ActivityAggregator::new(Arc::clone(&store), config.protocol.kinds),
            store,
            locks: KeyedLocks::new(),
            query_buffer: config.query.buffer.max(1),
        }
    }

    /// The subspace causality tracker fed by this adapter.
    pub const fn tracker(&self) -> &CausalityTracker {
        &self.tracker
    }

    /// The user activity aggregator fed by this adapter.
    pub const fn aggregator(&self) -> &ActivityAggregator {
        &self.aggregator
    }

    /// Store `event`, then update the derived indexes unless the event id
    /// was already stored or already applied to causality.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Format`] if the event has no id or author,
    /// [`RelayError::Store`] if the raw write fails, and
    /// [`RelayError::Cancelled`] if `cancel` fires before the write. Derived
    /// update failures are reported in the returned [`SaveOutcome`].
    pub async fn save(
        &self,
        event: &ActivityEvent,
        cancel: &CancellationToken,
    ) -> Result<SaveOutcome, RelayError> {
        self.write(event, cancel, WriteMode::Save).await
    }

    /// Upsert `event` exactly like [`EventAdapter::save`], but always apply
    /// it to both derived indexes again, even for an id that is already
    /// stored. Causality counters and user statistics both count it.
    ///
    /// # Errors
    ///
    /// Same as [`EventAdapter::save`].
    pub async fn replace(
        &self,
        event: &ActivityEvent,
        cancel: &CancellationToken,
    ) -> Result<SaveOutcome, RelayError> {
        self.write(event, cancel, WriteMode::Replace).await
    }

    /// Remove the raw event stored under `id`. Derived documents are not
    /// touched. Returns whether an event was removed.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Store`] on I/O failure and
    /// [`RelayError::Cancelled`] if `cancel` has fired.
    pub async fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<bool, RelayError> {
        check(cancel)?;
        let _guard = self.locks.lock(id).await;
        Ok(self.store.delete(id, DocType::Event).await?)
    }

    /// The event stored under `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Format`] if the stored event is invalid,
    /// [`RelayError::Store`] on I/O failure, and [`RelayError::Cancelled`]
    /// if `cancel` has fired.
    pub async fn get(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ActivityEvent>, RelayError> {
        check(cancel)?;
        fetch(&*self.store, id).await
    }

    /// Number of stored events matching `filter`. The filter's limit is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Store`] on I/O failure and
    /// [`RelayError::Cancelled`] if `cancel` fires mid-scan.
    pub async fn count(
        &self,
        filter: &EventFilter,
        cancel: &CancellationToken,
    ) -> Result<usize, RelayError> {
        check(cancel)?;
        let predicate = filter.compile();
        let matches = |doc: &Document| {
            decode_event(doc.clone()).is_some_and(|event| predicate.matches(&event))
        };
        Ok(self.store.count(DocType::Event, &matches, cancel).await?)
    }

    /// Stream stored events matching `filter`, in store-native order.
    ///
    /// The scan runs on a separate task. Cancelling `cancel`, calling
    /// [`EventStream::cancel`], or dropping the stream stops it.
    pub fn query(&self, filter: &EventFilter, cancel: &CancellationToken) -> EventStream {
        let (tx, rx) = mpsc::channel(self.query_buffer);
        let token = cancel.child_token();
        let producer = tokio::spawn(produce(
            Arc::clone(&self.store),
            filter.compile(),
            filter.limit,
            tx,
            token.clone(),
        ));
        EventStream {
            inner: ReceiverStream::new(rx),
            cancel: token,
            producer: Some(producer),
        }
    }

    /// Close the underlying store.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Store`] if the store fails to shut down.
    pub async fn close(&self) -> Result<(), RelayError> {
        Ok(self.store.close().await?)
    }

    async fn write(
        &self,
        event: &ActivityEvent,
        cancel: &CancellationToken,
        mode: WriteMode,
    ) -> Result<SaveOutcome, RelayError> {
        check(cancel)?;
        event.validate()?;
        let doc = event.to_document()?;

        let already_stored = {
            let _guard = self.locks.lock(&event.id).await;
            check(cancel)?;
            let existing = self.store.get(&event.id).await?;
            let stored = existing.iter().any(|doc| doc.doc_type() == DocType::Event);
            self.store.put(doc).await?;
            stored
        };

        if already_stored && mode == WriteMode::Save {
            tracing::debug!(
                event_id = %event.id,
                "Event re-delivered, derived indexes unchanged"
            );
            return Ok(SaveOutcome {
                redelivered: true,
                ..SaveOutcome::default()
            });
        }
        Ok(self.reindex(event, cancel, mode).await)
    }

    async fn reindex(
        &self,
        event: &ActivityEvent,
        cancel: &CancellationToken,
        mode: WriteMode,
    ) -> SaveOutcome {
        let mut outcome = SaveOutcome::default();

        let causality = match mode {
            WriteMode::Save => self.tracker.update(event, cancel).await,
            WriteMode::Replace => self.tracker.replay(event, cancel).await,
        };
        match causality {
            Ok(CausalityUpdate::Duplicate) => {
                tracing::debug!(
                    event_id = %event.id,
                    "Event already applied to causality, user statistics unchanged"
                );
                outcome.redelivered = true;
                outcome.causality = Some(CausalityUpdate::Duplicate);
                return outcome;
            }
            Ok(update) => outcome.causality = Some(update),
            Err(source) => {
                let failure = derived_failure(DerivedIndex::Causality, event, source);
                outcome.failures.push(failure);
            }
        }
        match self.aggregator.update(event, cancel).await {
            Ok(update) => outcome.activity = Some(update),
            Err(source) => {
                let failure = derived_failure(DerivedIndex::UserStats, event, source);
                outcome.failures.push(failure);
            }
        }
        outcome
    }
}

fn derived_failure(
    index: DerivedIndex,
    event: &ActivityEvent,
    source: RelayError,
) -> DerivedUpdateError {
    let error = DerivedUpdateError {
        index,
        event_id: event.id.clone(),
        source,
    };
    error.log();
    error
}

fn decode_event(doc: Document) -> Option<ActivityEvent> {
    let key = doc.key().to_owned();
    match ActivityEvent::from_document(doc) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(key, error = %e, "Skipping invalid event document");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming queries
// ---------------------------------------------------------------------------

/// Why a query producer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every stored event was examined.
    Exhausted,
    /// The filter's limit was reached.
    Limit,
    /// The cancellation token fired.
    Cancelled,
    /// The consumer dropped the stream.
    ConsumerGone,
    /// The store failed; the error was sent to the consumer.
    Failed,
    /// The producer task did not run to completion.
    Aborted,
}

/// How a query producer finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySummary {
    /// Events handed to the channel.
    pub sent: usize,
    /// Why the producer stopped.
    pub stop: StopReason,
}

/// A lazily produced sequence of matching events.
///
/// Yields `Err` at most once, as its final item, if the store fails
/// mid-scan. Ends immediately once cancelled, even if matches are buffered.
#[derive(Debug)]
pub struct EventStream {
    inner: ReceiverStream<Result<ActivityEvent, RelayError>>,
    cancel: CancellationToken,
    producer: Option<JoinHandle<QuerySummary>>,
}

impl EventStream {
    /// Stop the producer. Buffered events are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the producer if it is still running and wait for it.
    pub async fn join(mut self) -> QuerySummary {
        self.cancel.cancel();
        match self.producer.take() {
            Some(handle) => handle.await.unwrap_or(QuerySummary {
                sent: 0,
                stop: StopReason::Aborted,
            }),
            None => QuerySummary {
                sent: 0,
                stop: StopReason::Aborted,
            },
        }
    }
}

impl Stream for EventStream {
    type Item = Result<ActivityEvent, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn produce(
    store: Arc<dyn DocumentStore>,
    predicate: FilterPredicate,
    limit: Option<usize>,
    tx: mpsc::Sender<Result<ActivityEvent, RelayError>>,
    cancel: CancellationToken,
) -> QuerySummary {
    let mut sent: usize = 0;
    let stop = if limit == Some(0) {
        StopReason::Limit
    } else {
        let mut scan = store.scan(DocType::Event);
        loop {
            let doc = match next_or_cancelled(&mut scan, &cancel).await {
                Ok(Some(doc)) => doc,
                Ok(None) => break StopReason::Exhausted,
                Err(StoreError::Cancelled) => break StopReason::Cancelled,
                Err(e) => {
                    tx.send(Err(e.into())).await.ok();
                    break StopReason::Failed;
                }
            };
            let Some(event) = decode_event(doc) else {
                continue;
            };
            if !predicate.matches(&event) {
                continue;
            }
            let delivered = tokio::select! {
                biased;
                () = cancel.cancelled() => break StopReason::Cancelled,
                result = tx.send(Ok(event)) => result.is_ok(),
            };
            if !delivered {
                break StopReason::ConsumerGone;
            }
            sent = sent.saturating_add(1);
            if limit.is_some_and(|limit| sent >= limit) {
                break StopReason::Limit;
            }
        }
    };
    tracing::debug!(sent, stop = ?stop, "Query producer stopped");
    QuerySummary { sent, stop }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crelay_db::MemoryStore;
    use crelay_types::Tag;
    use futures::TryStreamExt;

    use super::*;

    const SID: &str = "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";

    fn adapter() -> EventAdapter {
        EventAdapter::new(Arc::new(MemoryStore::new()), &RelayConfig::default())
    }

    fn event(id: &str, author: &str, kind: u32, tags: &[&[&str]]) -> ActivityEvent {
        ActivityEvent {
            id: id.to_owned(),
            pubkey: author.to_owned(),
            created_at: 100,
            kind,
            content: String::new(),
            tags: tags.iter().map(|t| Tag::new(t.iter().copied())).collect(),
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn save_stores_and_indexes() {
        let adapter = adapter();
        let cancel = CancellationToken::new();
        let outcome = adapter
            .save(&event("e1", "alice", 30200, &[&["sid", SID]]), &cancel)
            .await
            .unwrap();
        assert!(!outcome.redelivered);
        assert!(outcome.is_complete());
        assert!(matches!(outcome.causality, Some(CausalityUpdate::Unresolved)));

        let stored = adapter.get("e1", &cancel).await.unwrap().unwrap();
        assert_eq!(stored.kind, 30200);
        let stats = adapter.aggregator().get("alice", &cancel).await.unwrap().unwrap();
        assert!(stats.has_joined(SID));
    }

    #[tokio::test]
    async fn save_rejects_events_without_id() {
        let adapter = adapter();
        let cancel = CancellationToken::new();
        let result = adapter.save(&event("", "alice", 1, &[]), &cancel).await;
        assert!(matches!(result, Err(RelayError::Format { .. })));
    }

    #[tokio::test]
    async fn redelivery_skips_derived_updates() {
        let adapter = adapter();
        let cancel = CancellationToken::new();
        let vote = event("v", "alice", 30302, &[&["sid", SID], &["vote", "yes"]]);
        adapter.save(&vote, &cancel).await.unwrap();
        let again = adapter.save(&vote, &cancel).await.unwrap();
        assert!(again.redelivered);
        assert!(again.causality.is_none());

        let stats = adapter.aggregator().get("alice", &cancel).await.unwrap().unwrap();
        assert_eq!(stats.total(30302), 1);
        assert_eq!(stats.vote_stats.unwrap().total_votes, 1);
    }

    #[tokio::test]
    async fn replace_counts_again_in_both_indexes() {
        let adapter = adapter();
        let cancel = CancellationToken::new();
        let create = event("c", "alice", 30100, &[&["sid", SID], &["ops", "vote=2"]]);
        adapter.save(&create, &cancel).await.unwrap();
        let vote = event("v", "alice", 2, &[&["sid", SID]]);
        adapter.save(&vote, &cancel).await.unwrap();

        let outcome = adapter.replace(&vote, &cancel).await.unwrap();
        assert!(!outcome.redelivered);
        assert_eq!(
            outcome.causality,
            Some(CausalityUpdate::Incremented { key: 2, counter: 2 })
        );

        assert_eq!(adapter.tracker().key(SID, 2, &cancel).await.unwrap(), 2);
        assert_eq!(adapter.tracker().events(SID, &cancel).await.unwrap(), vec!["c", "v"]);
        let stats = adapter.aggregator().get("alice", &cancel).await.unwrap().unwrap();
        assert_eq!(stats.total(2), 2);
        assert_eq!(stats.subspace_stats.get(SID).unwrap().get(&2), Some(&2));
    }

    #[tokio::test]
    async fn resave_after_delete_leaves_both_indexes_alone() {
        let adapter = adapter();
        let cancel = CancellationToken::new();
        let create = event("c", "alice", 30100, &[&["sid", SID], &["ops", "vote=2"]]);
        adapter.save(&create, &cancel).await.unwrap();
        let vote = event("v", "alice", 2, &[&["sid", SID]]);
        adapter.save(&vote, &cancel).await.unwrap();
        adapter.delete("v", &cancel).await.unwrap();

        let outcome = adapter.save(&vote, &cancel).await.unwrap();
        assert!(outcome.redelivered);
        assert!(outcome.activity.is_none());
        assert!(adapter.get("v", &cancel).await.unwrap().is_some());

        assert_eq!(adapter.tracker().key(SID, 2, &cancel).await.unwrap(), 1);
        let stats = adapter.aggregator().get("alice", &cancel).await.unwrap().unwrap();
        assert_eq!(stats.total(2), 1);
    }

    #[tokio::test]
    async fn delete_removes_only_the_raw_event() {
        let adapter = adapter();
        let cancel = CancellationToken::new();
        adapter
            .save(&event("e", "alice", 30200, &[&["sid", SID]]), &cancel)
            .await
            .unwrap();
        assert!(adapter.delete("e", &cancel).await.unwrap());
        assert!(!adapter.delete("e", &cancel).await.unwrap());
        assert!(adapter.get("e", &cancel).await.unwrap().is_none());

        let events = adapter.tracker().events(SID, &cancel).await.unwrap();
        assert_eq!(events, vec!["e"]);
        assert!(adapter.aggregator().get("alice", &cancel).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn query_requires_every_dimension() {
        let adapter = adapter();
        let cancel = CancellationToken::new();
        for (id, author, kind) in [("1", "A", 7), ("2", "A", 8), ("3", "B", 7)] {
            adapter.save(&event(id, author, kind, &[]), &cancel).await.unwrap();
        }
        let filter = EventFilter {
            authors: vec!["A".to_owned()],
            kinds: vec![7],
            ..EventFilter::default()
        };
        let found: Vec<ActivityEvent> =
            adapter.query(&filter, &cancel).try_collect().await.unwrap();
        let ids: Vec<&str> = found.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1"]);
        assert_eq!(adapter.count(&filter, &cancel).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_honours_limit() {
        let adapter = adapter();
        let cancel = CancellationToken::new();
        for id in ["a", "b", "c"] {
            adapter.save(&event(id, "x", 1, &[]), &cancel).await.unwrap();
        }
        let filter = EventFilter {
            limit: Some(2),
            ..EventFilter::default()
        };
        let mut stream = adapter.query(&filter, &cancel);
        let mut seen = Vec::new();
        while let Some(item) = stream.next().await {
            seen.push(item.unwrap().id);
        }
        assert_eq!(seen, vec!["a", "b"]);
        let summary = stream.join().await;
        assert_eq!(summary, QuerySummary { sent: 2, stop: StopReason::Limit });
        assert_eq!(adapter.count(&filter, &cancel).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn cancelled_query_delivers_nothing() {
        let adapter = adapter();
        let cancel = CancellationToken::new();
        for id in ["a", "b", "c"] {
            adapter.save(&event(id, "x", 1, &[]), &cancel).await.unwrap();
        }
        let mut stream = adapter.query(&EventFilter::default(), &cancel);
        cancel.cancel();
        assert!(stream.next().await.is_none());
        let summary = stream.join().await;
        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(summary.sent, 0);
    }

    #[tokio::test]
    async fn stream_cancel_leaves_caller_token_alone() {
        let adapter = adapter();
        let cancel = CancellationToken::new();
        adapter.save(&event("a", "x", 1, &[]), &cancel).await.unwrap();
        let stream = adapter.query(&EventFilter::default(), &cancel);
        stream.cancel();
        assert!(!cancel.is_cancelled());
        assert_eq!(adapter.count(&EventFilter::default(), &cancel).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn count_skips_invalid_events() {
        let store = Arc::new(MemoryStore::new());
        let adapter = EventAdapter::new(Arc::clone(&store) as Arc<dyn DocumentStore>, &RelayConfig::default());
        let cancel = CancellationToken::new();
        adapter.save(&event("a", "x", 7, &[]), &cancel).await.unwrap();
        adapter.save(&event("b", "y", 7, &[]), &cancel).await.unwrap();
        let mut body = serde_json::Map::new();
        body.insert("kind".to_owned(), serde_json::json!("seven"));
        store.put(Document::new("broken", DocType::Event, body)).await.unwrap();

        let filter = EventFilter {
            kinds: vec![7],
            ..EventFilter::default()
        };
        assert_eq!(adapter.count(&filter, &cancel).await.unwrap(), 2);

        cancel.cancel();
        let result = adapter.count(&filter, &cancel).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }
}
