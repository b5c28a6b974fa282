//! A small TTL cache, owned by whoever is handed one.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use tracing::trace;

/// Entries remember when they were stored and are stale once older than the TTL.
///
/// The `*_at` variants take the current instant explicitly.
#[derive(Debug)]
pub struct PrefetchCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K, V> PrefetchCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let (value, stored_at) = entries.get(key)?;
        if now.saturating_duration_since(*stored_at) >= self.ttl {
            return None;
        }
        Some(value.clone())
    }

    pub fn set(&self, key: K, value: V) {
        self.set_at(key, value, Instant::now());
    }

    pub fn set_at(&self, key: K, value: V, now: Instant) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, (value, now));
    }

    /// Removes and returns the entry for `key`, fresh or not.
    pub fn take(&self, key: &K) -> Option<V> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .map(|(value, _)| value)
    }

    /// Drops every stale entry and returns how many were dropped.
    pub fn expire(&self) -> usize {
        self.expire_at(Instant::now())
    }

    pub fn expire_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, (_, stored_at)| now.saturating_duration_since(*stored_at) < self.ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            trace!("prefetch cache: evicted {evicted} stale entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
