//! Key/value stores backing the link-facts memo and the page-cache index.
//!
//! Components never reach for process-wide state: whoever composes a
//! [`LinkParser`](crate::LinkParser) or a [`Fetcher`](crate::Fetcher) hands it
//! a store, so tests can inject a fresh or pre-seeded one.

use indexmap::IndexMap;
use std::sync::{PoisonError, RwLock};

/// A shared, synchronized string-keyed store.
pub trait Store<V>: Send + Sync {
    /// Returns a copy of the value stored under `key`.
    fn get(&self, key: &str) -> Option<V>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: String, value: V);

    /// Stores `value` under `key` and returns the value it displaced, in one step.
    fn replace(&self, key: String, value: V) -> Option<V>;

    /// Removes and returns the value stored under `key`.
    fn remove(&self, key: &str) -> Option<V>;

    /// Forgets every entry.
    fn clear(&self);

    /// Number of entries currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store, insertion ordered. Entries live until removed.
pub struct MemoryStore<V> {
    entries: RwLock<IndexMap<String, V>>,
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }

    /// Creates a store already holding `entries`.
    pub fn seeded<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
    {
        Self {
            entries: RwLock::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }
}

// A poisoned lock only means a writer panicked mid-insert; the map itself is still usable.
impl<V: Clone + Send + Sync> Store<V> for MemoryStore<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn put(&self, key: String, value: V) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    fn replace(&self, key: String, value: V) -> Option<V> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value)
    }

    fn remove(&self, key: &str) -> Option<V> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(key)
    }

    fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
