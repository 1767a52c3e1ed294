//! Per-identity async mutual exclusion.
//!
//! One `tokio::sync::Mutex` per key (environment slug, or config hash when
//! pooling), created on first use. The table itself sits behind a single
//! coarse `std::sync::Mutex` that is only held for lookup-or-insert and for
//! eviction, never across an await. When the last guard or waiter for a key
//! goes away, the entry is removed, so the table only holds keys that are
//! currently locked or contended.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

type Table = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    table: Table,
}

/// Held for the critical section of one identity. Dropping it releases the
/// lock and evicts the table entry if nobody else is waiting.
pub struct KeyGuard {
    key: String,
    table: Table,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        trace!("Waiting for lock on {}", key);
        let guard = mutex.lock_owned().await;

        KeyGuard {
            key: key.to_string(),
            table: self.table.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release first so the strong count reflects only the table and waiters
        drop(self.guard.take());
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        evict_if_idle(&mut table, &self.key);
    }
}

fn evict_if_idle(table: &mut HashMap<String, Arc<tokio::sync::Mutex<()>>>, key: &str) {
    if let Some(mutex) = table.get(key)
        && Arc::strong_count(mutex) == 1
    {
        table.remove(key);
        trace!("Evicted idle lock {}", key);
    }
}
