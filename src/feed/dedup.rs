//! Bounded transaction-hash filter.
//!
//! The push transport can redeliver on reconnect, and pulled history can
//! overlap the live feed around scope changes. Both show up as the same
//! `tx_hash` twice; this cache drops the repeat.

use std::collections::{HashSet, VecDeque};

pub const DEFAULT_DEDUP_CAPACITY: usize = 100;

/// Insertion-ordered set of recently seen hashes with strict FIFO eviction.
///
/// A repeat sighting does not refresh an entry's position.
#[derive(Debug)]
pub struct TxDeduplicator {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl Default for TxDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

impl TxDeduplicator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity + 1),
            seen: HashSet::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Returns true if `tx_hash` was already seen. Otherwise records it and
    /// returns false.
    pub fn is_duplicate(&mut self, tx_hash: &str) -> bool {
        if self.seen.contains(tx_hash) {
            return true;
        }

        self.seen.insert(tx_hash.to_string());
        self.order.push_back(tx_hash.to_string());

        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        false
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
