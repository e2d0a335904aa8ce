//! Process-wide keyed store with explicit expiry.
//!
//! Expired slots are invisible to readers immediately and are physically
//! removed by [`TtlStore::purge_expired`]. All mutation goes through one
//! lock, so [`TtlStore::check_and_set`] is atomic with respect to every
//! other caller.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

struct Slot<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

impl<V> Slot<V> {
    fn live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

pub struct TtlStore<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K: Eq + Hash, V: Clone> TtlStore<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Remove the slot under `key` only if `pred` holds for its value,
    /// expired or not.
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> bool {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|slot| pred(&slot.value)) {
            slots.remove(key);
            true
        } else {
            false
        }
    }

    /// Atomically inspect the live value under `key` and optionally replace
    /// it.
    ///
    /// `decide` sees `None` for absent or expired slots. If it returns a
    /// `(value, expires_at)` pair, that pair is stored before the lock is
    /// released.
    pub fn check_and_set<R>(
        &self,
        key: K,
        now: DateTime<Utc>,
        decide: impl FnOnce(Option<&V>) -> (Option<(V, DateTime<Utc>)>, R),
    ) -> R {
        let mut slots = self.slots.lock();
        let current = slots
            .get(&key)
            .filter(|slot| slot.live_at(now))
            .map(|slot| &slot.value);
        let (replacement, out) = decide(current);
        if let Some((value, expires_at)) = replacement {
            slots.insert(key, Slot { value, expires_at });
        }
        out
    }

    /// Drop every slot that expired at or before `now`. Returns how many.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| slot.live_at(now));
        before - slots.len()
    }

    /// Number of slots held, expired ones included.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl<K: Eq + Hash, V: Clone> Default for TtlStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    type Store = TtlStore<&'static str, i32>;

    /// Store `value` under `key` unconditionally; returns what was live.
    fn put(store: &Store, key: &'static str, value: i32, now: DateTime<Utc>, ttl: Duration) -> Option<i32> {
        store.check_and_set(key, now, |current| (Some((value, now + ttl)), current.copied()))
    }

    fn peek(store: &Store, key: &'static str, now: DateTime<Utc>) -> Option<i32> {
        store.check_and_set(key, now, |current| (None, current.copied()))
    }

    #[test]
    fn expired_values_are_invisible() {
        let store = TtlStore::new();
        let now = Utc::now();
        put(&store, "k", 1, now, Duration::seconds(10));
        assert_eq!(peek(&store, "k", now), Some(1));
        assert_eq!(peek(&store, "k", now + Duration::seconds(10)), None);
    }

    #[test]
    fn check_and_set_sees_expired_as_absent() {
        let store = TtlStore::new();
        let now = Utc::now();
        put(&store, "k", 1, now, Duration::seconds(1));

        let later = now + Duration::seconds(5);
        assert_eq!(put(&store, "k", 2, later, Duration::seconds(1)), None);
        assert_eq!(peek(&store, "k", later), Some(2));
    }

    #[test]
    fn check_and_set_can_leave_value() {
        let store: Store = TtlStore::new();
        let now = Utc::now();
        let inserted = store.check_and_set("k", now, |_| (None, false));
        assert!(!inserted);
        assert!(store.is_empty());
    }

    #[test]
    fn remove_if_ignores_expiry() {
        let store = TtlStore::new();
        let now = Utc::now();
        put(&store, "k", 7, now, Duration::seconds(1));
        assert!(!store.remove_if(&"k", |v| *v == 8));
        assert!(store.remove_if(&"k", |v| *v == 7));
        assert!(store.is_empty());
    }

    #[test]
    fn purge_removes_only_expired() {
        let store = TtlStore::new();
        let now = Utc::now();
        put(&store, "old", 1, now, Duration::seconds(-1));
        put(&store, "fresh", 2, now, Duration::seconds(60));
        assert_eq!(store.purge_expired(now), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(peek(&store, "fresh", now), Some(2));
    }
}
