// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod leaf_ops;
mod range;
mod split;

use crate::{
    cache::{CacheHit, HotspotCache, TreeCache},
    config::Config,
    error::Error,
    key::Key,
    latch::{VacancyLock, LOCK_BIT},
    layout::{
        ENCODED_INTERNAL_LEN, LEAF_ALLOC_LEN, LEAF_LATCH_OFFSET, MAX_RETRY, MAX_TREE_HEIGHT,
        PACKED_ALIGN_BITS, ROOT_OFFSET,
    },
    lock_table::{LocalLockTable, ReadTicket, WriteKind, WriteOutcome, WriteTicket},
    node::{InternalNode, LeafNode},
    remote::{RemotePtr, RootEntry},
    stats::{Counters, Statistics},
    transport::Transport,
    tree::leaf_ops::LeafResult,
    value::Value,
    Result,
};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::{
    atomic::{AtomicU16, Ordering},
    Arc,
};

/// Per-operation record of which remote node the traversal visited at
/// each level, used during splits to locate the parent without
/// re-descending.
pub(crate) struct PathStack {
    nodes: [RemotePtr; MAX_TREE_HEIGHT],
}

impl PathStack {
    pub fn new() -> Self {
        Self {
            nodes: [RemotePtr::NULL; MAX_TREE_HEIGHT],
        }
    }

    pub fn record(&mut self, level: usize, ptr: RemotePtr) {
        if level < MAX_TREE_HEIGHT {
            self.nodes[level] = ptr;
        }
    }

    pub fn at(&self, level: usize) -> RemotePtr {
        self.nodes.get(level).copied().unwrap_or(RemotePtr::NULL)
    }
}

pub struct TreeInner<T: Transport> {
    pub(crate) transport: T,
    pub(crate) config: Config,
    pub(crate) cache: TreeCache,
    pub(crate) hotspot: HotspotCache,
    pub(crate) lock_table: LocalLockTable,
    pub(crate) counters: Counters,
    pub(crate) root_ptr_ptr: RemotePtr,
    pub(crate) rough_height: AtomicU16,
}

/// An order-preserving key-value index whose nodes live in a remote
/// memory pool, driven entirely by one-sided reads, writes and CAS.
///
/// Cloning is cheap and shares the underlying state; clones can be
/// driven from many threads at once.
pub struct Tree<T: Transport>(Arc<TreeInner<T>>);

impl<T: Transport> Clone for Tree<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Transport> std::ops::Deref for Tree<T> {
    type Target = TreeInner<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Transport> Tree<T> {
    pub(crate) fn open(config: Config, transport: T) -> Result<Self> {
        let root_ptr_ptr = RemotePtr::new(0, ROOT_OFFSET + u64::from(config.tree_id) * 8);
        let tree = Self(Arc::new(TreeInner {
            cache: TreeCache::new(config.cache_capacity),
            hotspot: HotspotCache::new(config.hotspot_capacity),
            lock_table: LocalLockTable::new(),
            counters: Counters::default(),
            root_ptr_ptr,
            rough_height: AtomicU16::new(1),
            config,
            transport,
        }));

        if tree.config.init_root {
            tree.bootstrap_root()?;
        }
        let entry = tree.root_entry()?;
        tree.rough_height.store(entry.height, Ordering::Relaxed);
        Ok(tree)
    }

    /// Installs a fresh root leaf unless another client got there first.
    fn bootstrap_root(&self) -> Result<()> {
        let leaf_addr = self.transport.alloc(LEAF_ALLOC_LEN, PACKED_ALIGN_BITS)?;

        let mut leaf = LeafNode::default();
        let mut raw = crate::codec::leaf::encode_node(&mut leaf);
        raw.resize(LEAF_LATCH_OFFSET, 0);
        raw.extend_from_slice(&VacancyLock::new(0).word().to_le_bytes());
        self.transport.write(&raw, leaf_addr)?;

        let desired = RootEntry::new(1, leaf_addr).to_u64();
        let old = self.transport.cas(self.root_ptr_ptr, 0, desired)?;
        if old == 0 {
            log::info!("installed root leaf at {leaf_addr:?}");
        } else {
            log::debug!("root already bootstrapped by another client");
        }
        Ok(())
    }

    pub(crate) fn root_entry(&self) -> Result<RootEntry> {
        let mut buf = [0u8; 8];
        self.transport.read(&mut buf, self.root_ptr_ptr)?;
        let entry = RootEntry::from_u64(LittleEndian::read_u64(&buf));
        self.rough_height.store(entry.height, Ordering::Relaxed);
        Ok(entry)
    }

    /// Current tree height (1 = a single root leaf).
    ///
    /// # Errors
    ///
    /// Returns an error if the root pointer cannot be read.
    pub fn height(&self) -> Result<u16> {
        Ok(self.root_entry()?.height)
    }

    /// Height as of the last root-pointer read, without a remote
    /// round-trip. May lag behind concurrent root growth.
    #[must_use]
    pub fn rough_height(&self) -> u16 {
        self.rough_height.load(Ordering::Relaxed)
    }

    // ---- latch protocol ----------------------------------------------

    /// Acquires the latch of the node at `addr`, returning the previous
    /// latch word (the vacancy payload for leaves).
    pub(crate) fn latch_acquire(&self, addr: RemotePtr, latch_offset: usize) -> Result<u64> {
        let latch_addr = addr.add(latch_offset as u64);
        for _ in 0..MAX_RETRY {
            let old = self
                .transport
                .cas_mask(latch_addr, 0, LOCK_BIT, LOCK_BIT)?;
            if old & LOCK_BIT == 0 {
                return Ok(old);
            }
            self.counters.latch_fails.fetch_add(1, Ordering::Relaxed);
            std::thread::yield_now();
        }
        Err(Error::RetryLimit)
    }

    /// Releases a latch by writing back `word` with the lock bit clear.
    pub(crate) fn latch_release(
        &self,
        addr: RemotePtr,
        latch_offset: usize,
        word: u64,
    ) -> Result<()> {
        let buf = (word & !LOCK_BIT).to_le_bytes();
        self.transport.write(&buf, addr.add(latch_offset as u64))?;
        Ok(())
    }

    // ---- traversal ---------------------------------------------------

    fn seed(&self, k: &Key) -> Result<(Option<CacheHit>, RemotePtr, RemotePtr, u16)> {
        let hit = if self.config.cache_all_levels {
            self.cache.point_seek(k)
        } else {
            self.cache.point_find(k)
        };
        if let Some(hit) = hit {
            let (child, child_sibling) = hit.node.pick_child(k);
            let level = u16::from(hit.node.meta.level);
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((Some(hit), child, child_sibling, level));
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        let entry = self.root_entry()?;
        Ok((None, entry.ptr.unpack(), RemotePtr::NULL, entry.height))
    }

    pub(crate) fn read_internal(&self, addr: RemotePtr) -> Result<InternalNode> {
        let mut raw = vec![0u8; ENCODED_INTERNAL_LEN];
        for _ in 0..MAX_RETRY {
            self.transport.read(&mut raw, addr)?;
            if let Some(node) = crate::codec::plain::decode_node(&raw) {
                return Ok(node);
            }
        }
        Err(Error::RetryLimit)
    }

    pub(crate) fn cache_node(&self, node: &InternalNode) {
        if self.config.cache_all_levels || node.meta.level == 1 {
            self.cache.insert(node);
        }
    }

    /// One step of the descent: reads the internal node at `*p`,
    /// validates it, follows siblings laterally if the key has moved
    /// right, and picks the next child. Returns `false` if a
    /// cache-seeded node failed validation.
    pub(crate) fn internal_search(
        &self,
        p: &mut RemotePtr,
        sibling: &mut RemotePtr,
        k: &Key,
        level: &mut u16,
        from_cache: bool,
        path: &mut PathStack,
    ) -> Result<bool> {
        debug_assert!(*level > 1);
        let mut validate_cache = from_cache;

        loop {
            let node = self.read_internal(*p)?;
            let fences = node.meta.fences;

            if validate_cache && (!node.meta.valid || !fences.contains(k)) {
                return Ok(false);
            }
            validate_cache = false;

            if *k >= fences.highest {
                // the key moved right past this node's fence; follow the
                // sibling at the same level
                *p = node.meta.sibling;
                path.record(usize::from(node.meta.level), *p);
                continue;
            }
            debug_assert!(*k >= fences.lowest);

            *level = u16::from(node.meta.level);
            self.cache_node(&node);
            let (child, child_sibling) = node.pick_child(k);
            *p = child;
            *sibling = child_sibling;
            return Ok(true);
        }
    }

    /// Drives a root-to-leaf descent, retrying from a fresh seed
    /// whenever cache validation fails along the way.
    pub(crate) fn run_to_leaf<F>(&self, k: &Key, leaf_op: F) -> Result<Option<Value>>
    where
        F: Fn(&Self, RemotePtr, RemotePtr, bool, &mut PathStack) -> Result<LeafResult>,
    {
        let mut path = PathStack::new();
        let (mut cache_entry, mut p, mut sibling, mut level) = self.seed(k)?;
        let mut from_cache = cache_entry.is_some();

        for _ in 0..MAX_RETRY {
            path.record(usize::from(level - 1), p);

            if level == 1 {
                match leaf_op(self, p, sibling, from_cache, &mut path)? {
                    LeafResult::Done(value) => return Ok(value),
                    LeafResult::Stale => {
                        self.counters.stale_cache.fetch_add(1, Ordering::Relaxed);
                        if let Some(hit) = cache_entry.take() {
                            self.cache.invalidate(&hit);
                        }
                        (cache_entry, p, sibling, level) = self.seed(k)?;
                        from_cache = cache_entry.is_some();
                        continue;
                    }
                }
            }

            if self.internal_search(&mut p, &mut sibling, k, &mut level, from_cache, &mut path)? {
                from_cache = false;
            } else {
                self.counters.stale_cache.fetch_add(1, Ordering::Relaxed);
                if let Some(hit) = cache_entry.take() {
                    self.cache.invalidate(&hit);
                }
                (cache_entry, p, sibling, level) = self.seed(k)?;
                from_cache = cache_entry.is_some();
            }
        }
        Err(Error::RetryLimit)
    }

    // ---- public API --------------------------------------------------

    /// Inserts `(k, v)`, replacing the value if the key already exists.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or retry-budget exhaustion.
    ///
    /// # Panics
    ///
    /// Panics if `k` is the reserved all-zero key.
    pub fn insert(&self, k: Key, v: Value) -> Result<()> {
        assert!(!k.is_null(), "the all-zero key is reserved");
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        match self.lock_table.acquire_write(&k, WriteKind::Upsert, v) {
            WriteTicket::Combined(outcome) => {
                self.counters.write_handovers.fetch_add(1, Ordering::Relaxed);
                // the leader's write carried this value; its failure is
                // this insert's failure
                outcome.into_result()
            }
            WriteTicket::Leader(lease) => {
                let result = self.run_to_leaf(&k, |tree, p, sibling, from_cache, path| {
                    tree.leaf_insert(p, sibling, &k, v, from_cache, path, Some(&lease))
                });
                self.lock_table.release_write(lease, WriteOutcome::of(&result));
                result.map(|_| ())
            }
        }
    }

    /// Updates an existing key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if `k` is not in the tree, or an
    /// error on transport failure.
    ///
    /// # Panics
    ///
    /// Panics if `k` is the reserved all-zero key.
    pub fn update(&self, k: Key, v: Value) -> Result<()> {
        assert!(!k.is_null(), "the all-zero key is reserved");
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        match self.lock_table.acquire_write(&k, WriteKind::Strict, v) {
            WriteTicket::Combined(outcome) => {
                self.counters.write_handovers.fetch_add(1, Ordering::Relaxed);
                // a missing key and a failed transport are different
                // failures; hand the follower whichever one the leader
                // actually met
                outcome.into_result()
            }
            WriteTicket::Leader(lease) => {
                let result = self.run_to_leaf(&k, |tree, p, sibling, from_cache, path| {
                    tree.leaf_update(p, sibling, &k, v, from_cache, path, Some(&lease))
                });
                let outcome = match &result {
                    Ok(Some(_)) => WriteOutcome::Applied,
                    Ok(None) => WriteOutcome::KeyNotFound,
                    Err(_) => WriteOutcome::of(&result),
                };
                self.lock_table.release_write(lease, outcome);
                match result {
                    Ok(Some(_)) => Ok(()),
                    Ok(None) => Err(Error::KeyNotFound),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Looks up `k`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or retry-budget exhaustion.
    pub fn search(&self, k: Key) -> Result<Option<Value>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);

        match self.lock_table.acquire_read(&k) {
            ReadTicket::Delegated(value) => {
                self.counters.read_handovers.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            ReadTicket::Leader(lease) => {
                let result = self.run_to_leaf(&k, |tree, p, sibling, from_cache, _path| {
                    tree.leaf_search(p, sibling, &k, from_cache)
                });
                self.lock_table
                    .release_read(lease, result.as_ref().ok().copied().flatten());
                result
            }
        }
    }

    /// Returns a snapshot of the operation counters.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        self.counters.snapshot()
    }

    /// Resets all operation counters to zero.
    pub fn clear_statistics(&self) {
        self.counters.clear();
    }

    // ---- shared write plumbing ---------------------------------------

    /// Writes one or two encoded segments of a node and releases its
    /// latch. A segment that ends flush with the encoded node carries
    /// the latch word in the same write; otherwise the release travels
    /// as one extra word in the same batch.
    pub(crate) fn write_segments_and_unlock(
        &self,
        addr: RemotePtr,
        encoded_len: usize,
        latch_offset: usize,
        mut segments: Vec<(crate::codec::SegmentSpan, Vec<u8>)>,
        latch_word: u64,
    ) -> Result<()> {
        let latch_bytes = (latch_word & !LOCK_BIT).to_le_bytes();
        let mut piggybacked = false;

        for (span, raw) in &mut segments {
            if !piggybacked && span.raw_offset + span.raw_len == encoded_len {
                raw.resize(latch_offset - span.raw_offset, 0);
                raw.extend_from_slice(&latch_bytes);
                piggybacked = true;
            }
        }

        let mut regions: Vec<crate::transport::WriteRegion<'_>> = segments
            .iter()
            .map(|(span, raw)| crate::transport::WriteRegion {
                remote: addr.add(span.raw_offset as u64),
                local: raw,
            })
            .collect();

        if !piggybacked {
            regions.push(crate::transport::WriteRegion {
                remote: addr.add(latch_offset as u64),
                local: &latch_bytes,
            });
        }

        self.transport.write_batch(&regions)?;
        Ok(())
    }

    /// Writes a freshly encoded whole node together with its latch slot.
    pub(crate) fn write_node_and_latch(
        &self,
        addr: RemotePtr,
        mut raw: Vec<u8>,
        latch_offset: usize,
        latch_word: u64,
    ) -> Result<()> {
        raw.resize(latch_offset, 0);
        raw.extend_from_slice(&(latch_word & !LOCK_BIT).to_le_bytes());
        self.transport.write(&raw, addr)?;
        Ok(())
    }
}
