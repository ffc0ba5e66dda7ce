//! Single-writer-per-key locking.
//!
//! The document store offers no compare-and-swap, so concurrent
//! read-modify-write cycles on one document would lose updates under
//! last-writer-wins. Each component serializes its own cycles through a
//! [`KeyedLocks`] table: one async mutex per document key, created on demand
//! and dropped once nobody holds or waits on it.
//!
//! Scope is a single process. Two processes writing the same store are not
//! coordinated.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Idle entries are pruned once the table grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

/// A table of per-key async mutexes.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Exclusive access to one key. Released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = {
            let mut slots = self.slots.lock().await;
            if slots.len() >= PRUNE_THRESHOLD {
                // Only the table itself references an idle slot.
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            Arc::clone(slots.entry(key.to_owned()).or_default())
        };
        KeyGuard {
            _guard: slot.lock_owned().await,
        }
    }

    /// Number of keys currently tracked, held or idle.
    pub async fn tracked(&self) -> usize {
        self.slots.lock().await.len()
    }
}
