//! Bounded deduplication cache.
//!
//! An exact (never approximate) LRU cache with per-entry TTL, grounded in
//! the teacher's choice of `parking_lot`-guarded hot-path maps
//! (`data-processing/src/batch.rs`, `integration/src/webhook/queue.rs`).
//! The spec requires **zero false positives**, which rules out a
//! Bloom-filter-backed cache (see `DESIGN.md`'s Open Questions): a false
//! positive here would silently drop a unique event.
//!
//! Recency order is tracked with an intrusive doubly linked list threaded
//! through a slab (`Vec<Node>`), so lookup, touch, insert, and eviction are
//! all O(1) instead of scanning the map for the oldest entry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const NONE: usize = usize::MAX;

struct Node {
    key: String,
    expires_at: Instant,
    prev: usize,
    next: usize,
}

struct Inner {
    nodes: Vec<Node>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    /// Most recently used slot.
    head: usize,
    /// Least recently used slot; the next eviction candidate.
    tail: usize,
    max_entries: usize,
    ttl: Duration,
}

impl Inner {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NONE {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NONE {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NONE;
        self.nodes[idx].next = NONE;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NONE;
        self.nodes[idx].next = self.head;
        if self.head != NONE {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NONE {
            self.tail = idx;
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove_slot(&mut self, idx: usize) {
        self.unlink(idx);
        let key = std::mem::take(&mut self.nodes[idx].key);
        self.index.remove(&key);
        self.free.push(idx);
    }

    fn evict_if_over_capacity(&mut self) {
        if self.index.len() > self.max_entries && self.tail != NONE {
            self.remove_slot(self.tail);
        }
    }

    /// Insert `key` fresh or refresh an existing entry's TTL and recency.
    fn insert_or_touch(&mut self, key: &str, ttl: Duration) {
        if let Some(&idx) = self.index.get(key) {
            self.nodes[idx].expires_at = Instant::now() + ttl;
            self.touch(idx);
            return;
        }

        let idx = if let Some(free_idx) = self.free.pop() {
            self.nodes[free_idx] =
                Node { key: key.to_string(), expires_at: Instant::now() + ttl, prev: NONE, next: NONE };
            free_idx
        } else {
            self.nodes.push(Node { key: key.to_string(), expires_at: Instant::now() + ttl, prev: NONE, next: NONE });
            self.nodes.len() - 1
        };
        self.index.insert(key.to_string(), idx);
        self.push_front(idx);
        self.evict_if_over_capacity();
    }
}

/// Bounded, exact deduplication cache with LRU eviction and TTL expiry.
pub struct DedupCache {
    inner: Mutex<Inner>,
}

impl DedupCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = max_entries.min(1024);
        Self {
            inner: Mutex::new(Inner {
                nodes: Vec::with_capacity(capacity),
                free: Vec::new(),
                index: HashMap::with_capacity(capacity),
                head: NONE,
                tail: NONE,
                max_entries,
                ttl,
            }),
        }
    }

    /// Return whether `key` is currently present (and not expired), without
    /// mutating recency.
    pub fn contains(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.index.get(key).copied() {
            Some(idx) if inner.nodes[idx].expires_at > now => true,
            Some(idx) => {
                inner.remove_slot(idx);
                false
            }
            None => false,
        }
    }

    /// Side-effecting duplicate check: records `key` if absent (or expired)
    /// and returns `false`; returns `true` if `key` was already present and
    /// unexpired, refreshing its recency.
    pub fn is_duplicate(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if let Some(idx) = inner.index.get(key).copied() {
            if inner.nodes[idx].expires_at > now {
                inner.touch(idx);
                return true;
            }
        }

        let ttl = inner.ttl;
        inner.insert_or_touch(key, ttl);
        false
    }

    /// Insert or refresh `key`'s expiry and recency.
    pub fn record(&self, key: &str) {
        let mut inner = self.inner.lock();
        let ttl = inner.ttl;
        inner.insert_or_touch(key, ttl);
    }

    /// Sweep all expired entries. Intended to be called periodically by a
    /// background task at half the deduplication window.
    pub fn cleanup_expired(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<usize> = inner
            .index
            .iter()
            .filter(|(_, &idx)| inner.nodes[idx].expires_at <= now)
            .map(|(_, &idx)| idx)
            .collect();
        for idx in expired {
            inner.remove_slot(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn is_duplicate_true_on_second_call_within_ttl() {
        let cache = DedupCache::new(10, Duration::from_secs(60));
        assert!(!cache.is_duplicate("a"));
        assert!(cache.is_duplicate("a"));
    }

    #[test]
    fn is_duplicate_false_after_ttl_expiry() {
        let cache = DedupCache::new(10, Duration::from_millis(10));
        assert!(!cache.is_duplicate("a"));
        sleep(Duration::from_millis(25));
        assert!(!cache.is_duplicate("a"));
    }

    #[test]
    fn capacity_eviction_keeps_size_bounded() {
        let cache = DedupCache::new(2, Duration::from_secs(60));
        cache.record("a");
        cache.record("b");
        cache.record("c");
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn touching_an_entry_protects_it_from_eviction() {
        let cache = DedupCache::new(2, Duration::from_secs(60));
        cache.record("a");
        cache.record("b");
        // Touch "a" so "b" becomes the least recently used entry.
        assert!(cache.is_duplicate("a"));
        cache.record("c");
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn cleanup_expired_removes_stale_entries() {
        let cache = DedupCache::new(10, Duration::from_millis(5));
        cache.record("a");
        sleep(Duration::from_millis(20));
        cache.cleanup_expired();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn contains_does_not_mutate_recency() {
        let cache = DedupCache::new(10, Duration::from_secs(60));
        cache.record("a");
        assert!(cache.contains("a"));
        assert!(cache.contains("a"));
    }

    #[test]
    fn reused_slots_after_eviction_do_not_corrupt_recency_order() {
        let cache = DedupCache::new(1, Duration::from_secs(60));
        cache.record("a");
        cache.record("b");
        cache.record("c");
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("c"));
    }
}
