//! A sharded concurrent map: a fixed array of buckets, each guarded by its own
//! reader/writer lock and holding an unordered list of key/value pairs. The
//! bucket count is fixed at construction; there is no rehashing, so lookups
//! degrade to O(n/B) as the table fills.
//!
//! Mutating operations accept callbacks that run *inside* the bucket's
//! critical section. The storage layer uses them to append a durability record
//! while the lock is still held, so a later reader can never observe an effect
//! that has not been logged. Callbacks must not re-enter the map or take any
//! other bucket's lock.
//!
//! Whole-table operations use strict two-phase locking: every bucket lock is
//! acquired in index order, the operation (and the optional `then` callback)
//! runs, then all locks are released. The fixed acquisition order makes the
//! scan deadlock-free and gives it point-in-time snapshot semantics.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

/// A bucketed key/value store with per-bucket reader/writer locks.
pub struct ShardedMap<K, V> {
    buckets: Vec<RwLock<Vec<(K, V)>>>,
}

impl<K: Hash + Eq, V> ShardedMap<K, V> {
    /// creates a map with `num_buckets` buckets; the count never changes
    pub fn new(num_buckets: usize) -> Self {
        assert!(num_buckets > 0, "a ShardedMap needs at least one bucket");
        let mut buckets = Vec::with_capacity(num_buckets);
        for _ in 0..num_buckets {
            buckets.push(RwLock::new(Vec::new()));
        }
        ShardedMap { buckets }
    }

    fn bucket_of(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.buckets.len()
    }

    /// Inserts `key` -> `val` only if `key` is not yet mapped. `on_success`
    /// runs inside the bucket's critical section after the pair is appended.
    ///
    /// Returns true if the pair was inserted, false if the key already existed.
    pub fn insert<F: FnOnce()>(&self, key: K, val: V, on_success: F) -> bool {
        let mut bucket = self.buckets[self.bucket_of(&key)].write();
        if bucket.iter().any(|(k, _)| *k == key) {
            return false;
        }
        bucket.push((key, val));
        on_success();
        true
    }

    /// Inserts `key` -> `val`, or replaces the existing value. Exactly one of
    /// `on_insert` / `on_update` runs inside the critical section.
    ///
    /// Returns true if the pair was inserted, false if it was updated.
    pub fn upsert<FI: FnOnce(), FU: FnOnce()>(
        &self,
        key: K,
        val: V,
        on_insert: FI,
        on_update: FU,
    ) -> bool {
        let mut bucket = self.buckets[self.bucket_of(&key)].write();
        if let Some(entry) = bucket.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = val;
            on_update();
            return false;
        }
        bucket.push((key, val));
        on_insert();
        true
    }

    /// Applies `f` to the mutable value mapped to `key`, under the bucket's
    /// write lock. Returns whether the key existed.
    pub fn with<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        let mut bucket = self.buckets[self.bucket_of(key)].write();
        match bucket.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => {
                f(&mut entry.1);
                true
            }
            None => false,
        }
    }

    /// Applies `f` to the value mapped to `key`, under the bucket's read lock.
    /// Returns whether the key existed.
    pub fn with_readonly<F: FnOnce(&V)>(&self, key: &K, f: F) -> bool {
        let bucket = self.buckets[self.bucket_of(key)].read();
        match bucket.iter().find(|(k, _)| k == key) {
            Some(entry) => {
                f(&entry.1);
                true
            }
            None => false,
        }
    }

    /// Removes the mapping for `key`. `on_success` runs inside the critical
    /// section after the pair is gone. Returns whether the key existed.
    pub fn remove<F: FnOnce()>(&self, key: &K, on_success: F) -> bool {
        let mut bucket = self.buckets[self.bucket_of(key)].write();
        match bucket.iter().position(|(k, _)| k == key) {
            Some(i) => {
                bucket.swap_remove(i);
                on_success();
                true
            }
            None => false,
        }
    }

    /// Empties the whole table under strict 2PL.
    pub fn clear(&self) {
        let mut guards: Vec<_> = self.buckets.iter().map(|b| b.write()).collect();
        for bucket in guards.iter_mut() {
            bucket.clear();
        }
    }

    /// Applies `f` to every pair under strict 2PL, then runs `then` while all
    /// locks are still held. `then` is the hook for chaining a second scan or
    /// a snapshot write into the same serialization point.
    pub fn for_each_readonly<F, T>(&self, mut f: F, then: T)
    where
        F: FnMut(&K, &V),
        T: FnOnce(),
    {
        let guards: Vec<_> = self.buckets.iter().map(|b| b.read()).collect();
        for bucket in guards.iter() {
            for (k, v) in bucket.iter() {
                f(k, v);
            }
        }
        then();
    }
}
