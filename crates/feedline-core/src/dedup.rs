//! Bounded recent-identifier cache with least-recently-used eviction

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

/// Default number of identifiers remembered.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Fixed-capacity LRU membership set.
///
/// Duplicate suppression only covers the current window: once an identifier
/// is evicted it is treated as new again.
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    tick: u64,
    /// identifier → recency stamp
    entries: FxHashMap<String, u64>,
    /// recency stamp → identifier (oldest first)
    recency: BTreeMap<u64, String>,
}

impl DedupCache {
    /// Create a cache holding at most `capacity` identifiers (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tick: 0,
            entries: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            recency: BTreeMap::new(),
        }
    }

    /// Check and record in one step.
    ///
    /// Returns `true` if `id` was already present (its recency is bumped),
    /// `false` if it was inserted, evicting the least recently used entry
    /// when full.
    pub fn seen_or_record(&mut self, id: &str) -> bool {
        self.tick += 1;
        let tick = self.tick;

        if let Some(stamp) = self.entries.get_mut(id) {
            let previous = std::mem::replace(stamp, tick);
            if let Some(key) = self.recency.remove(&previous) {
                self.recency.insert(tick, key);
            }
            return true;
        }

        if self.entries.len() >= self.capacity {
            if let Some((_, oldest)) = self.recency.pop_first() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(id.to_owned(), tick);
        self.recency.insert(tick, id.to_owned());
        false
    }

    /// Membership test without touching recency.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
