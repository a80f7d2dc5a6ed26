// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{key::Key, node::InternalNode};
use crossbeam_skiplist::SkipMap;
use std::{
    cmp::Reverse,
    ops::Bound,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

/// Interval key: `(inclusive upper bound, reversed lower bound)`, so a
/// seek by `(k, Reverse(k))` lands on the tightest entry whose interval
/// can still contain `k`.
type IntervalKey = (Key, Reverse<Key>);

struct CacheSlot {
    freq: AtomicU64,
    node: Mutex<Option<Arc<InternalNode>>>,
}

/// A cached internal node, handed out as a refcounted snapshot.
///
/// Concurrent readers keep the snapshot alive after invalidation, which
/// replaces the retirement-queue dance a non-refcounted implementation
/// would need.
pub(crate) struct CacheHit {
    /// Inclusive interval the entry is registered under.
    pub from: Key,
    pub to: Key,
    /// The node snapshot.
    pub node: Arc<InternalNode>,
}

/// Compute-local cache of internal nodes, keyed by the fence interval
/// they cover, with two-random LFU eviction.
pub(crate) struct TreeCache {
    map: SkipMap<IntervalKey, CacheSlot>,
    free: AtomicI64,
    sample: AtomicU64,
}

impl TreeCache {
    pub fn new(capacity_bytes: i64) -> Self {
        Self {
            map: SkipMap::new(),
            free: AtomicI64::new(capacity_bytes),
            sample: AtomicU64::new(0),
        }
    }

    /// Caches a snapshot of `node` under its fence interval, replacing
    /// any snapshot already registered for the same interval.
    pub fn insert(&self, node: &InternalNode) {
        let from = node.meta.fences.lowest;
        let to = predecessor(node.meta.fences.highest);
        let snapshot = Arc::new(node.clone());
        let cost = snapshot.consumed_cache_size();

        let entry = self.map.get_or_insert_with((to, Reverse(from)), || CacheSlot {
            freq: AtomicU64::new(0),
            node: Mutex::new(None),
        });

        let mut slot = entry.value().node.lock().expect("cache slot poisoned");
        let released = slot.take().map_or(0, |old| old.consumed_cache_size());
        *slot = Some(snapshot);
        drop(slot);

        let balance = self.free.fetch_add(released - cost, Ordering::Relaxed) + released - cost;
        if balance < 0 {
            self.evict();
        }
    }

    /// Returns the tightest cached entry covering `k`, if any.
    pub fn point_find(&self, k: &Key) -> Option<CacheHit> {
        let entry = self
            .map
            .lower_bound(Bound::Included(&(*k, Reverse(*k))))?;
        let (to, Reverse(from)) = *entry.key();
        if from > *k || to < *k {
            return None;
        }
        let node = entry
            .value()
            .node
            .lock()
            .expect("cache slot poisoned")
            .clone()?;
        entry.value().freq.fetch_add(1, Ordering::Relaxed);
        Some(CacheHit { from, to, node })
    }

    /// Like [`TreeCache::point_find`], but skips cleared entries and
    /// keeps seeking upward, so a nearby cached ancestor can seed the
    /// descent when the tightest covering node is gone.
    pub fn point_seek(&self, k: &Key) -> Option<CacheHit> {
        let mut cursor = self.map.lower_bound(Bound::Included(&(*k, Reverse(*k))));
        while let Some(entry) = cursor {
            let (to, Reverse(from)) = *entry.key();
            if from <= *k && to >= *k {
                let node = entry.value().node.lock().expect("cache slot poisoned").clone();
                if let Some(node) = node {
                    entry.value().freq.fetch_add(1, Ordering::Relaxed);
                    return Some(CacheHit { from, to, node });
                }
            }
            cursor = entry.next();
        }
        None
    }

    /// Walks cached entries covering `k` upward until one holds a node
    /// at `target_level + 1`, the parent level for an insert at
    /// `target_level`.
    pub fn ancestor_find(&self, k: &Key, target_level: u8) -> Option<CacheHit> {
        let mut cursor = self.map.lower_bound(Bound::Included(&(*k, Reverse(*k))));
        while let Some(entry) = cursor {
            let (to, Reverse(from)) = *entry.key();
            if from > *k || to < *k {
                return None;
            }
            let node = entry.value().node.lock().expect("cache slot poisoned").clone();
            if let Some(node) = node {
                if node.meta.level == target_level + 1 {
                    entry.value().freq.fetch_add(1, Ordering::Relaxed);
                    return Some(CacheHit { from, to, node });
                }
            }
            cursor = entry.next();
        }
        None
    }

    /// Collects all cached level-1 nodes whose interval intersects
    /// `[from, to)`.
    pub fn range_seek(&self, from: &Key, to: &Key) -> Vec<Arc<InternalNode>> {
        let mut out = Vec::new();
        let mut cursor = self
            .map
            .lower_bound(Bound::Included(&(*from, Reverse(*from))));
        while let Some(entry) = cursor {
            let (_, Reverse(entry_from)) = *entry.key();
            if entry_from >= *to {
                break;
            }
            let node = entry.value().node.lock().expect("cache slot poisoned").clone();
            if let Some(node) = node {
                if node.meta.level == 1 {
                    out.push(node);
                }
            }
            cursor = entry.next();
        }
        out
    }

    /// Atomically clears the cached pointer of `hit`'s entry. Readers
    /// holding the snapshot keep it; the entry stops being served.
    pub fn invalidate(&self, hit: &CacheHit) {
        let Some(entry) = self.map.get(&(hit.to, Reverse(hit.from))) else {
            return;
        };
        let mut slot = entry.value().node.lock().expect("cache slot poisoned");
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, &hit.node) {
                let released = current.consumed_cache_size();
                *slot = None;
                self.free.fetch_add(released, Ordering::Relaxed);
            }
        }
    }

    /// Approximate number of live entries (cleared slots included).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    fn random_entry(&self) -> Option<CacheHit> {
        let tick = self.sample.fetch_add(1, Ordering::Relaxed);
        let probe = Key::from(xxhash_rust::xxh3::xxh3_64(&tick.to_le_bytes()));

        let mut cursor = self
            .map
            .lower_bound(Bound::Included(&(probe, Reverse(probe))))
            .or_else(|| self.map.front());
        while let Some(entry) = cursor {
            let node = entry.value().node.lock().expect("cache slot poisoned").clone();
            if let Some(node) = node {
                let (to, Reverse(from)) = *entry.key();
                return Some(CacheHit { from, to, node });
            }
            cursor = entry.next();
        }
        None
    }

    fn entry_freq(&self, hit: &CacheHit) -> u64 {
        self.map
            .get(&(hit.to, Reverse(hit.from)))
            .map_or(0, |e| e.value().freq.load(Ordering::Relaxed))
    }

    /// Two-random LFU eviction until the balance is non-negative.
    fn evict(&self) {
        for _ in 0..1024 {
            if self.free.load(Ordering::Relaxed) >= 0 {
                return;
            }
            let (Some(a), Some(b)) = (self.random_entry(), self.random_entry()) else {
                return;
            };
            let victim = if self.entry_freq(&a) < self.entry_freq(&b) {
                a
            } else {
                b
            };
            self.invalidate(&victim);
        }
    }
}

fn predecessor(k: Key) -> Key {
    Key::from(u64::from(k).wrapping_sub(1))
}
