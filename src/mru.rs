//! A bounded listing of the most recently touched keys, newest first, with no
//! duplicates. Backs the "top" query.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Tracks the `capacity` most recently used keys.
pub struct MruIndex {
    capacity: usize,
    entries: Mutex<VecDeque<String>>,
}

impl MruIndex {
    /// creates an index that retains at most `capacity` keys
    pub fn new(capacity: usize) -> Self {
        MruIndex {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Moves `key` to the most-recent position, dropping the least-recent
    /// entry if the index would grow past its capacity.
    pub fn insert(&self, key: &str) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e == key) {
            entries.remove(pos);
        }
        entries.push_front(key.to_string());
        while entries.len() > self.capacity {
            entries.pop_back();
        }
    }

    /// Drops `key` from the index if present.
    pub fn remove(&self, key: &str) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e == key) {
            entries.remove(pos);
        }
    }

    /// Empties the index.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// The tracked keys, newline-delimited, most-recent first. Empty string
    /// when nothing has been tracked.
    pub fn get(&self) -> String {
        let entries = self.entries.lock();
        entries.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}
