//! Keyed state with one lock per key.
//!
//! The outer `DashMap` only guards membership; each value sits behind its own
//! mutex so that work on one model (or plan, or execution) never serializes
//! work on another.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

pub struct KeyedStore<K, V> {
    entries: DashMap<K, Arc<Mutex<V>>>,
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert or replace the value for `key`.
    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, Arc::new(Mutex::new(value)));
    }

    /// Insert only if absent. Returns false when the key already existed.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Arc::new(Mutex::new(value)));
                true
            }
        }
    }

    fn slot(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        // Clone the Arc so the shard lock is released before the entry lock is taken.
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Run `f` with exclusive access to the value for `key`.
    pub fn with<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let slot = self.slot(key)?;
        let mut guard = lock(&slot);
        Some(f(&mut guard))
    }

    /// Run `f` on the value for `key`, creating it with `init` if missing.
    pub fn with_or_insert<R>(
        &self,
        key: K,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let slot = self
            .entries
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .value()
            .clone();
        let mut guard = lock(&slot);
        f(&mut guard)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry for which `keep` returns false.
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) {
        for key in self.keys() {
            let Some(slot) = self.slot(&key) else { continue };
            let keep_it = keep(&key, &lock(&slot));
            if !keep_it {
                self.entries.remove(&key);
            }
        }
    }
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Snapshot of the value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.with(key, |v| v.clone())
    }

    /// Snapshot of every value.
    pub fn values(&self) -> Vec<V> {
        self.keys().iter().filter_map(|k| self.get(k)).collect()
    }
}

impl<K, V> Default for KeyedStore<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn with_or_insert_initialises_once() {
        let store: KeyedStore<String, u32> = KeyedStore::new();
        store.with_or_insert("a".into(), || 10, |v| *v += 1);
        store.with_or_insert("a".into(), || 100, |v| *v += 1);
        assert_eq!(store.get(&"a".to_string()), Some(12));
    }

    #[test]
    fn insert_if_absent_keeps_existing_value() {
        let store: KeyedStore<u32, &str> = KeyedStore::new();
        assert!(store.insert_if_absent(1, "first"));
        assert!(!store.insert_if_absent(1, "second"));
        assert_eq!(store.get(&1), Some("first"));
    }

    #[test]
    fn retain_drops_rejected_entries() {
        let store: KeyedStore<u32, u32> = KeyedStore::new();
        for i in 0..10 {
            store.insert(i, i * 2);
        }
        store.retain(|_, v| *v >= 10);
        assert_eq!(store.len(), 5);
        assert!(!store.contains(&0));
    }

    #[test]
    fn concurrent_updates_on_one_key_are_serialized() {
        let store: Arc<KeyedStore<&'static str, u64>> = Arc::new(KeyedStore::new());
        store.insert("hits", 0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        store.with(&"hits", |v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get(&"hits"), Some(8000));
    }
}
