//! Subspace causality tracker.
//!
//! Owns one [`SubspaceCausality`] document per subspace. A creation event
//! registers the subspace's causality keys from its `ops` tag; every later
//! event resolves to at most one key and bumps that key's counter.
//!
//! Key resolution, first match wins:
//!
//! 1. the event's kind, read as a key id, if registered;
//! 2. the `op` tag looked up in the operation registry declared by `ops`;
//! 3. if suffix fallback is enabled, the lowest registered key whose decimal
//!    form ends with the `op` tag value.
//!
//! An event id already present in the subspace's log is not applied again
//! by [`CausalityTracker::update`], so re-delivery never moves a counter
//! twice. [`CausalityTracker::replay`] applies it anyway without logging
//! the id a second time.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use crelay_db::DocumentStore;
use crelay_types::{ActivityEvent, ProtocolKinds, SubspaceCausality, SubspaceId, tags};
use tokio_util::sync::CancellationToken;

use crate::config::ProtocolConfig;
use crate::error::RelayError;
use crate::locks::KeyedLocks;
use crate::typed::{check, collect, fetch, persist};

/// What a call to [`CausalityTracker::update`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CausalityUpdate {
    /// The event has no subspace tag.
    NoSubspace,
    /// The subspace tag is malformed. Nothing was written.
    InvalidSubspace,
    /// The event id was already logged. Nothing was written.
    Duplicate,
    /// A creation event declared these key ids (possibly none).
    Registered(Vec<u32>),
    /// The resolved key's counter reached `counter`.
    Incremented {
        /// The resolved key id.
        key: u32,
        /// Its counter after the increment.
        counter: u64,
    },
    /// No registered key matched. Only the event log changed.
    Unresolved,
}

/// Whether an already-logged event id is skipped or applied again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    First,
    Replay,
}

/// Maintains per-subspace causality counters.
pub struct CausalityTracker {
    store: Arc<dyn DocumentStore>,
    kinds: ProtocolKinds,
    suffix_fallback: bool,
    locks: KeyedLocks,
}

impl CausalityTracker {
    /// Create a tracker over `store`.
    pub fn new(store: Arc<dyn DocumentStore>, protocol: &ProtocolConfig) -> Self {
        Self {
            store,
            kinds: protocol.kinds,
            suffix_fallback: protocol.suffix_fallback,
            locks: KeyedLocks::new(),
        }
    }

    /// Whether `id` is a well-formed subspace id.
    pub fn validate(id: &str) -> bool {
        crelay_types::is_valid_subspace_id(id)
    }

    /// The causality record for subspace `id`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Format`] if `id` is malformed or the stored
    /// record is invalid, [`RelayError::Store`] on I/O failure, and
    /// [`RelayError::Cancelled`] if `cancel` has fired.
    pub async fn get(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<SubspaceCausality>, RelayError> {
        SubspaceId::parse(id)?;
        check(cancel)?;
        fetch(&*self.store, id).await
    }

    /// Event ids logged for subspace `id`, in first-seen order.
    ///
    /// # Errors
    ///
    /// Same as [`CausalityTracker::get`].
    pub async fn events(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RelayError> {
        Ok(self
            .get(id, cancel)
            .await?
            .map(|record| record.events)
            .unwrap_or_default())
    }

    /// Counter for `key_id` in subspace `id`; 0 if either is unknown.
    ///
    /// # Errors
    ///
    /// Same as [`CausalityTracker::get`].
    pub async fn key(
        &self,
        id: &str,
        key_id: u32,
        cancel: &CancellationToken,
    ) -> Result<u64, RelayError> {
        Ok(self
            .get(id, cancel)
            .await?
            .map_or(0, |record| record.counter(key_id)))
    }

    /// Every registered key and its counter for subspace `id`.
    ///
    /// # Errors
    ///
    /// Same as [`CausalityTracker::get`].
    pub async fn all_keys(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<u32, u64>, RelayError> {
        Ok(self
            .get(id, cancel)
            .await?
            .map(|record| record.keys)
            .unwrap_or_default())
    }

    /// Every causality record accepted by `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Store`] on I/O failure and
    /// [`RelayError::Cancelled`] if `cancel` fires mid-scan.
    pub async fn query<P>(
        &self,
        predicate: P,
        cancel: &CancellationToken,
    ) -> Result<Vec<SubspaceCausality>, RelayError>
    where
        P: FnMut(&SubspaceCausality) -> bool,
    {
        check(cancel)?;
        collect(&*self.store, predicate, cancel).await
    }

    /// Apply `event` to its subspace's causality record, unless its id is
    /// already logged.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Format`] if the stored record is invalid,
    /// [`RelayError::Store`] on I/O failure, and [`RelayError::Cancelled`]
    /// if `cancel` fires before the record is written.
    pub async fn update(
        &self,
        event: &ActivityEvent,
        cancel: &CancellationToken,
    ) -> Result<CausalityUpdate, RelayError> {
        self.apply(event, cancel, Delivery::First).await
    }

    /// Apply `event` even if its id is already logged. The counter moves
    /// again; the log keeps a single entry for the id. Never returns
    /// [`CausalityUpdate::Duplicate`].
    ///
    /// # Errors
    ///
    /// Same as [`CausalityTracker::update`].
    pub async fn replay(
        &self,
        event: &ActivityEvent,
        cancel: &CancellationToken,
    ) -> Result<CausalityUpdate, RelayError> {
        self.apply(event, cancel, Delivery::Replay).await
    }

    async fn apply(
        &self,
        event: &ActivityEvent,
        cancel: &CancellationToken,
        delivery: Delivery,
    ) -> Result<CausalityUpdate, RelayError> {
        check(cancel)?;
        let Some(sid) = event.subspace() else {
            return Ok(CausalityUpdate::NoSubspace);
        };
        let Ok(subspace_id) = SubspaceId::parse(sid) else {
            tracing::warn!(
                event_id = %event.id,
                subspace_id = sid,
                "Ignoring invalid subspace tag"
            );
            return Ok(CausalityUpdate::InvalidSubspace);
        };

        let _guard = self.locks.lock(sid).await;
        check(cancel)?;

        let now = Utc::now().timestamp();
        let mut record = fetch::<SubspaceCausality>(&*self.store, sid)
            .await?
            .unwrap_or_else(|| SubspaceCausality::new(subspace_id, now));

        if !record.record_event(&event.id) && delivery == Delivery::First {
            tracing::debug!(
                event_id = %event.id,
                subspace_id = sid,
                "Event already applied to causality"
            );
            return Ok(CausalityUpdate::Duplicate);
        }
        record.updated = now;

        let outcome = if event.kind == self.kinds.subspace_create {
            Self::register(&mut record, event)
        } else {
            self.advance(&mut record, event)
        };

        check(cancel)?;
        persist(&*self.store, &record).await?;
        Ok(outcome)
    }

    fn register(record: &mut SubspaceCausality, event: &ActivityEvent) -> CausalityUpdate {
        let declared = event
            .tag_value(tags::OPS)
            .map(parse_operations)
            .unwrap_or_default();
        for (name, key) in &declared {
            record.register_operation(name, *key);
        }
        let keys: Vec<u32> = declared.iter().map(|(_, key)| *key).collect();
        tracing::debug!(
            subspace_id = %record.subspace_id,
            keys = ?record.keys,
            creator = %event.pubkey,
            "Registered causality keys"
        );
        CausalityUpdate::Registered(keys)
    }

    fn advance(&self, record: &mut SubspaceCausality, event: &ActivityEvent) -> CausalityUpdate {
        let resolved = self.resolve_key(record, event);
        match resolved.and_then(|key| record.increment(key).map(|counter| (key, counter))) {
            Some((key, counter)) => CausalityUpdate::Incremented { key, counter },
            None => {
                tracing::debug!(
                    subspace_id = %record.subspace_id,
                    event_id = %event.id,
                    kind = event.kind,
                    op = event.tag_value(tags::OPERATION),
                    "No causality key for event"
                );
                CausalityUpdate::Unresolved
            }
        }
    }

    fn resolve_key(&self, record: &SubspaceCausality, event: &ActivityEvent) -> Option<u32> {
        if record.keys.contains_key(&event.kind) {
            return Some(event.kind);
        }
        let op = event.tag_value(tags::OPERATION).filter(|op| !op.is_empty())?;
        if let Some(key) = record.ops.get(op) {
            return Some(*key);
        }
        if !self.suffix_fallback {
            return None;
        }
        record
            .keys
            .keys()
            .copied()
            .find(|key| key.to_string().ends_with(op))
    }
}

/// Parse an `ops` tag value: comma-separated `name=keyId` pairs.
///
/// Pairs that do not split into exactly two parts, or whose key id is not a
/// `u32`, are skipped.
pub fn parse_operations(value: &str) -> Vec<(String, u32)> {
    value
        .split(',')
        .filter_map(|pair| {
            let mut parts = pair.split('=');
            let (Some(name), Some(key), None) = (parts.next(), parts.next(), parts.next()) else {
                return None;
            };
            match key.trim().parse::<u32>() {
                Ok(key) => Some((name.trim().to_owned(), key)),
                Err(_) => {
                    tracing::debug!(pair, "Cannot parse causality key id");
                    None
                }
            }
        })
        .collect()
}
