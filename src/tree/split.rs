// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Split and recovery paths: leaf splits, internal splits, parent
//! chaining through the path stack, and root growth via the root CAS.

use super::{PathStack, Tree};
use crate::{
    codec,
    error::Error,
    key::Key,
    latch::VacancyLock,
    layout::{
        INTERNAL_ALLOC_LEN, INTERNAL_LATCH_OFFSET, INTERNAL_SPAN, LEAF_ALLOC_LEN,
        LEAF_LATCH_OFFSET, LEAF_SPAN, PACKED_ALIGN_BITS,
    },
    node::{leaf::home_slot, FenceKeys, InternalEntry, InternalNode, LeafNode},
    remote::{RemotePtr, RootEntry},
    transport::Transport,
    value::Value,
    Result,
};
use std::sync::atomic::Ordering;

impl<T: Transport> Tree<T> {
    /// Splits a full leaf, moving every key at or above the chosen split
    /// key into a freshly allocated sibling, inserting `(k, v)` into
    /// whichever half now covers it, and publishing the halves before
    /// chaining the split key into the parent.
    pub(crate) fn leaf_split_and_unlock(
        &self,
        mut leaf: LeafNode,
        k: &Key,
        v: Value,
        addr: RemotePtr,
        mut vacancy: VacancyLock,
        path: &PathStack,
    ) -> Result<()> {
        self.counters.leaf_splits.fetch_add(1, Ordering::Relaxed);
        let was_root = leaf.meta.is_root();
        let split_key = leaf.split_key_for(k);
        debug_assert!(!split_key.is_null());

        let sibling_addr = self.transport.alloc(LEAF_ALLOC_LEN, PACKED_ALIGN_BITS)?;
        let mut sibling = LeafNode::default();

        // migrate: moved keys keep their slot, so their neighborhood
        // geometry is preserved on both sides
        for slot in 0..LEAF_SPAN {
            if leaf.entries[slot].is_empty() || leaf.entries[slot].key < split_key {
                continue;
            }
            let (key, value) = (leaf.entries[slot].key, leaf.entries[slot].value);
            let home = home_slot(&key);
            let offset = (slot + LEAF_SPAN - home) % LEAF_SPAN;

            sibling.entries[slot].key = key;
            sibling.entries[slot].value = value;
            sibling.entries[home].set_hop_bit(offset);

            leaf.entries[slot].key = Key::NULL;
            leaf.entries[slot].value = 0;
            leaf.entries[home].unset_hop_bit(offset);
        }

        let target = if *k < split_key { &mut leaf } else { &mut sibling };
        target
            .hopscotch_insert(k, v, LEAF_SPAN)
            .ok_or(Error::Corruption("post-split hopscotch placement failed"))?;

        sibling.meta.fences = FenceKeys {
            lowest: split_key,
            highest: leaf.meta.fences.highest,
        };
        leaf.meta.fences.highest = split_key;
        sibling.meta.sibling = leaf.meta.sibling;
        leaf.meta.sibling = sibling_addr;

        // publish the sibling first, complete with an unlocked vacancy
        // word, so it is fully readable the instant our own rewrite
        // makes it reachable
        let mut sibling_latch = VacancyLock::new(sibling.max_key_slot());
        sibling_latch.update_vacancy(0, LEAF_SPAN - 1, &sibling.empty_slots_in(0, LEAF_SPAN - 1));
        let raw_sibling = codec::leaf::encode_node(&mut sibling);
        self.write_node_and_latch(sibling_addr, raw_sibling, LEAF_LATCH_OFFSET, sibling_latch.word())?;

        vacancy.set_max_key_slot(leaf.max_key_slot());
        vacancy.update_vacancy(0, LEAF_SPAN - 1, &leaf.empty_slots_in(0, LEAF_SPAN - 1));
        let raw_leaf = codec::leaf::encode_node(&mut leaf);
        self.write_node_and_latch(addr, raw_leaf, LEAF_LATCH_OFFSET, vacancy.word())?;

        log::trace!("leaf split at {split_key}, sibling {sibling_addr:?}");
        self.insert_into_parent(split_key, sibling_addr, addr, 0, was_root, path)
    }

    /// Inserts `(k, child_ptr)` into the internal node at `addr`
    /// (metadata level `level`), splitting it if full. Returns `false`
    /// if a cache-derived address failed validation.
    pub(crate) fn internal_insert(
        &self,
        addr: RemotePtr,
        k: &Key,
        child_ptr: RemotePtr,
        from_cache: bool,
        level: u8,
        path: &PathStack,
    ) -> Result<bool> {
        let latch_word = self.latch_acquire(addr, INTERNAL_LATCH_OFFSET)?;
        let mut node = self.read_internal(addr)?;
        let fences = node.meta.fences;

        if from_cache && (!node.meta.valid || !fences.contains(k)) {
            self.latch_release(addr, INTERNAL_LATCH_OFFSET, latch_word)?;
            return Ok(false);
        }
        if *k >= fences.highest {
            self.latch_release(addr, INTERNAL_LATCH_OFFSET, latch_word)?;
            self.counters.sibling_forwards.fetch_add(1, Ordering::Relaxed);
            let sibling = node.meta.sibling;
            debug_assert!(!sibling.is_null());
            return self.internal_insert(sibling, k, child_ptr, false, level, path);
        }
        debug_assert!(*k >= fences.lowest);

        // children split once per separator; seeing the key again means
        // the tree is damaged
        if node.contains_key(k) {
            self.latch_release(addr, INTERNAL_LATCH_OFFSET, latch_word)?;
            return Err(Error::Corruption("separator key already present in parent"));
        }

        if node.entry_count() < INTERNAL_SPAN {
            node.insert_sorted(k, child_ptr);
            let raw = codec::plain::encode_node(&mut node);
            self.write_node_and_latch(addr, raw, INTERNAL_LATCH_OFFSET, 0)?;
            return Ok(true);
        }

        self.internal_split_and_unlock(node, k, child_ptr, addr, level, path)?;
        Ok(true)
    }

    /// Splits a full internal node at its median separator.
    fn internal_split_and_unlock(
        &self,
        mut node: InternalNode,
        k: &Key,
        child_ptr: RemotePtr,
        addr: RemotePtr,
        level: u8,
        path: &PathStack,
    ) -> Result<()> {
        self.counters.internal_splits.fetch_add(1, Ordering::Relaxed);
        let was_root = node.is_root();
        let count = node.entry_count();
        let median = count / 2;
        let split_key = node.entries[median].key;

        let sibling_addr = self.transport.alloc(INTERNAL_ALLOC_LEN, PACKED_ALIGN_BITS)?;
        let mut sibling = InternalNode::default();
        sibling.meta.level = level;

        // the median's child becomes the sibling's leftmost pointer; the
        // median key itself moves up to the parent
        sibling.meta.leftmost = node.entries[median].ptr;
        for i in median + 1..count {
            sibling.entries[i - median - 1] = node.entries[i];
        }
        for entry in &mut node.entries[median..count] {
            *entry = InternalEntry::default();
        }

        if *k < split_key {
            node.insert_sorted(k, child_ptr);
        } else {
            sibling.insert_sorted(k, child_ptr);
        }

        sibling.meta.fences = FenceKeys {
            lowest: split_key,
            highest: node.meta.fences.highest,
        };
        node.meta.fences.highest = split_key;
        sibling.meta.sibling = node.meta.sibling;
        node.meta.sibling = sibling_addr;
        sibling.meta.sibling_leftmost = node.meta.sibling_leftmost;
        node.meta.sibling_leftmost = sibling.meta.leftmost;

        let raw_sibling = codec::plain::encode_node(&mut sibling);
        self.write_node_and_latch(sibling_addr, raw_sibling, INTERNAL_LATCH_OFFSET, 0)?;

        let raw_node = codec::plain::encode_node(&mut node);
        self.write_node_and_latch(addr, raw_node, INTERNAL_LATCH_OFFSET, 0)?;

        log::debug!("internal split at level {level}, separator {split_key}");
        self.insert_into_parent(split_key, sibling_addr, addr, level, was_root, path)
    }

    /// Chains a split into the parent: path stack first, then a cached
    /// ancestor, then a fresh descent from the root. Growing past the
    /// root is serialized by a CAS on the root entry.
    fn insert_into_parent(
        &self,
        split_key: Key,
        new_sibling: RemotePtr,
        split_node: RemotePtr,
        level: u8,
        was_root: bool,
        path: &PathStack,
    ) -> Result<()> {
        if was_root {
            return self.grow_root(split_key, new_sibling, split_node, level);
        }

        let parent = path.at(usize::from(level) + 1);
        if !parent.is_null()
            && self.internal_insert(parent, &split_key, new_sibling, false, level + 1, path)?
        {
            return Ok(());
        }

        if let Some(hit) = self.cache.ancestor_find(&split_key, level + 1) {
            let (parent_addr, _) = hit.node.pick_child(&split_key);
            if self.internal_insert(parent_addr, &split_key, new_sibling, true, level + 1, path)? {
                return Ok(());
            }
            self.cache.invalidate(&hit);
        }

        log::debug!("parent not on path, re-descending for separator {split_key}");
        let root = self.root_entry()?;
        self.insert_from_root(split_key, new_sibling, root, level + 1)
    }

    /// Allocates a new root referencing the two halves and installs it
    /// with a CAS on the root entry. Losing the race is not an error:
    /// someone else grew the tree, so insert the separator at its proper
    /// level starting from the root they installed.
    fn grow_root(
        &self,
        split_key: Key,
        new_sibling: RemotePtr,
        split_node: RemotePtr,
        level: u8,
    ) -> Result<()> {
        let root_addr = self.transport.alloc(INTERNAL_ALLOC_LEN, PACKED_ALIGN_BITS)?;
        let mut root = InternalNode::default();
        root.meta.level = level + 1;
        root.meta.leftmost = split_node;
        root.entries[0].key = split_key;
        root.entries[0].ptr = new_sibling;
        debug_assert!(root.is_root());

        let raw = codec::plain::encode_node(&mut root);
        self.write_node_and_latch(root_addr, raw, INTERNAL_LATCH_OFFSET, 0)?;

        let expected = RootEntry::new(u16::from(level) + 1, split_node).to_u64();
        let desired = RootEntry::new(u16::from(level) + 2, root_addr).to_u64();
        let old = self.transport.cas(self.root_ptr_ptr, expected, desired)?;
        if old == expected {
            self.counters.root_grows.fetch_add(1, Ordering::Relaxed);
            self.rough_height
                .store(u16::from(level) + 2, Ordering::Relaxed);
            log::info!("tree grew to height {}", u16::from(level) + 2);
            return Ok(());
        }

        let observed = RootEntry::from_u64(old);
        self.rough_height.store(observed.height, Ordering::Relaxed);
        log::debug!(
            "root CAS lost, inserting separator {split_key} from height {}",
            observed.height
        );
        self.insert_from_root(split_key, new_sibling, observed, level + 1)
    }

    /// Descends from `root` and inserts `(k, child_ptr)` into the
    /// internal node at metadata level `target_level` covering `k`.
    pub(crate) fn insert_from_root(
        &self,
        k: Key,
        child_ptr: RemotePtr,
        root: RootEntry,
        target_level: u8,
    ) -> Result<()> {
        let mut path = PathStack::new();
        let mut p = root.ptr.unpack();
        let mut sibling = RemotePtr::NULL;
        let mut level = root.height;

        loop {
            path.record(usize::from(level - 1), p);
            if level - 1 == u16::from(target_level) {
                let inserted = self.internal_insert(p, &k, child_ptr, false, target_level, &path)?;
                debug_assert!(inserted);
                return Ok(());
            }
            let valid = self.internal_search(&mut p, &mut sibling, &k, &mut level, false, &mut path)?;
            debug_assert!(valid);
        }
    }
}
