// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Leaf-level reads and writes: neighborhood reads, speculative
//! single-entry reads, vacancy-guided inserts, segment-granular writes.

use super::{PathStack, Tree};
use crate::{
    codec,
    error::Error,
    key::Key,
    latch::VacancyLock,
    layout::{
        DATA_BLOCK_LEN, ENCODED_LEAF_LEN, LEAF_LATCH_OFFSET, LEAF_SPAN, MAX_RETRY, NEIGHBORHOOD,
        PACKED_ALIGN_BITS,
    },
    lock_table::WriteLease,
    node::{
        leaf::{home_slot, HopInsert},
        LeafEntry, LeafMeta, LeafNode,
    },
    remote::RemotePtr,
    transport::{ReadRegion, Transport},
    value::{DataBlock, DataPointer, Value},
    Result,
};
use std::sync::atomic::Ordering;

/// What a leaf handler tells the traversal driver.
pub(crate) enum LeafResult {
    /// The operation finished with this result.
    Done(Option<Value>),
    /// The cache-seeded leaf failed validation; re-traverse.
    Stale,
}

impl<T: Transport> Tree<T> {
    // ---- reads -------------------------------------------------------

    /// Reads the wrapped slot range `[start, start + count)` into
    /// `view`, returning the covered header replica if the segments
    /// carried one. Retries internally until the read is consistent.
    pub(crate) fn read_leaf_segment(
        &self,
        addr: RemotePtr,
        start: usize,
        count: usize,
        view: &mut LeafNode,
    ) -> Result<Option<LeafMeta>> {
        let size_r = count.min(LEAF_SPAN - start);
        let size_l = count - size_r;

        let span_r = codec::leaf::offset_info(start, size_r);
        let mut buf_r = vec![0u8; span_r.raw_len];

        if size_l == 0 {
            for _ in 0..MAX_RETRY {
                self.transport
                    .read(&mut buf_r, addr.add(span_r.raw_offset as u64))?;
                let Some(seg) = codec::leaf::decode_segment(&buf_r, start, size_r) else {
                    self.counters.leaf_read_retries.fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                for (d, entry) in seg.entries.iter().enumerate() {
                    view.entries[start + d] = *entry;
                }
                return Ok(seg.meta);
            }
            return Err(Error::RetryLimit);
        }

        // the range wraps: two wire segments, one batched read
        self.counters.read_two_segments.fetch_add(1, Ordering::Relaxed);
        let span_l = codec::leaf::offset_info(0, size_l);
        let mut buf_l = vec![0u8; span_l.raw_len];

        for _ in 0..MAX_RETRY {
            {
                let mut regions = [
                    ReadRegion {
                        remote: addr.add(span_l.raw_offset as u64),
                        local: &mut buf_l,
                    },
                    ReadRegion {
                        remote: addr.add(span_r.raw_offset as u64),
                        local: &mut buf_r,
                    },
                ];
                self.transport.read_batch(&mut regions)?;
            }

            let decoded_l = codec::leaf::decode_segment(&buf_l, 0, size_l);
            let decoded_r = codec::leaf::decode_segment(&buf_r, start, size_r);
            let (Some(seg_l), Some(seg_r)) = (decoded_l, decoded_r) else {
                self.counters.leaf_read_retries.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if seg_l.node_version != seg_r.node_version {
                self.counters.leaf_read_retries.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let (Some(a), Some(b)) = (seg_l.meta.as_ref(), seg_r.meta.as_ref()) {
                if a.sibling != b.sibling || a.fences != b.fences || a.valid != b.valid {
                    self.counters.leaf_read_retries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            for (d, entry) in seg_l.entries.iter().enumerate() {
                view.entries[d] = *entry;
            }
            for (d, entry) in seg_r.entries.iter().enumerate() {
                view.entries[start + d] = *entry;
            }
            return Ok(seg_l.meta.or(seg_r.meta));
        }
        Err(Error::RetryLimit)
    }

    /// Reads and validates the whole leaf.
    pub(crate) fn read_leaf_node(&self, addr: RemotePtr) -> Result<LeafNode> {
        let mut raw = vec![0u8; ENCODED_LEAF_LEN];
        for _ in 0..MAX_RETRY {
            self.transport.read(&mut raw, addr)?;
            if let Some(leaf) = codec::leaf::decode_node(&raw) {
                return Ok(leaf);
            }
            self.counters.leaf_read_retries.fetch_add(1, Ordering::Relaxed);
        }
        Err(Error::RetryLimit)
    }

    /// Reads a single slot, plus the header replica when the slot is
    /// group-aligned.
    fn read_leaf_entry(
        &self,
        addr: RemotePtr,
        slot: usize,
    ) -> Result<(LeafEntry, Option<LeafMeta>)> {
        let span = codec::leaf::offset_info(slot, 1);
        let mut raw = vec![0u8; span.raw_len];
        for _ in 0..MAX_RETRY {
            self.transport.read(&mut raw, addr.add(span.raw_offset as u64))?;
            if let Some(seg) = codec::leaf::decode_segment(&raw, slot, 1) {
                return Ok((seg.entries[0], seg.meta));
            }
            self.counters.leaf_read_retries.fetch_add(1, Ordering::Relaxed);
        }
        Err(Error::RetryLimit)
    }

    /// Speculative single-entry read steered by the hotspot cache. A hit
    /// is only trusted when the fetched entry's key equals `k`.
    fn speculative_read(
        &self,
        addr: RemotePtr,
        home: usize,
        k: &Key,
    ) -> Result<Option<(usize, LeafEntry, Option<LeafMeta>)>> {
        let Some(slot) = self.hotspot.search(addr, home, NEIGHBORHOOD, k) else {
            return Ok(None);
        };
        self.counters.speculative_reads.fetch_add(1, Ordering::Relaxed);

        let (entry, meta) = self.read_leaf_entry(addr, slot)?;
        if entry.key == *k {
            self.counters.speculative_hits.fetch_add(1, Ordering::Relaxed);
            self.hotspot.add(addr, slot, k);
            return Ok(Some((slot, entry, meta)));
        }
        Ok(None)
    }

    // ---- lookup ------------------------------------------------------

    pub(crate) fn leaf_search(
        &self,
        addr: RemotePtr,
        _sibling_hint: RemotePtr,
        k: &Key,
        from_cache: bool,
    ) -> Result<LeafResult> {
        let home = home_slot(k);

        if let Some((_, entry, _)) = self.speculative_read(addr, home, k)? {
            return Ok(LeafResult::Done(Some(self.resolve_value(entry.value)?)));
        }

        for _ in 0..MAX_RETRY {
            let mut view = LeafNode::default();
            let meta = self
                .read_leaf_segment(addr, home, NEIGHBORHOOD, &mut view)?
                .ok_or(Error::Corruption("neighborhood read carried no header"))?;

            if from_cache && (!meta.valid || !meta.fences.contains(k)) {
                return Ok(LeafResult::Stale);
            }
            if *k >= meta.fences.highest {
                self.counters.sibling_forwards.fetch_add(1, Ordering::Relaxed);
                return self.leaf_search(meta.sibling, RemotePtr::NULL, k, false);
            }
            debug_assert!(*k >= meta.fences.lowest);

            // rebuild the hop bitmap from the keys while scanning; if it
            // disagrees with the stored bitmap the read raced a writer
            let mut bitmap = 0u16;
            for d in 0..NEIGHBORHOOD {
                let slot = (home + d) % LEAF_SPAN;
                let entry = &view.entries[slot];
                if entry.is_empty() || home_slot(&entry.key) != home {
                    continue;
                }
                bitmap |= 1 << (NEIGHBORHOOD - 1 - d);
                if entry.key == *k {
                    self.hotspot.add(addr, slot, k);
                    return Ok(LeafResult::Done(Some(self.resolve_value(entry.value)?)));
                }
            }
            if bitmap != view.entries[home].hop_bitmap {
                self.counters.leaf_read_retries.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            return Ok(LeafResult::Done(None));
        }
        Err(Error::RetryLimit)
    }

    // ---- insert ------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn leaf_insert(
        &self,
        addr: RemotePtr,
        _sibling_hint: RemotePtr,
        k: &Key,
        v: Value,
        from_cache: bool,
        path: &mut PathStack,
        lease: Option<&WriteLease>,
    ) -> Result<LeafResult> {
        let latch_word = self.latch_acquire(addr, LEAF_LATCH_OFFSET)?;
        let mut vacancy = VacancyLock::from_word(latch_word);

        let home = home_slot(k);
        let mut count = vacancy.read_entry_count_from(home);
        if count < NEIGHBORHOOD {
            // widen the read so it covers at least one header replica
            let end = home + count;
            if home % NEIGHBORHOOD != 0 && home / NEIGHBORHOOD == (end - 1) / NEIGHBORHOOD {
                let end = ((end - 1) / NEIGHBORHOOD + 1) * NEIGHBORHOOD + 1;
                count = end - home;
            }
        }

        let mut view;
        if count >= LEAF_SPAN {
            count = LEAF_SPAN;
            view = self.read_leaf_node(addr)?;
        } else {
            view = LeafNode::default();
            let meta = self
                .read_leaf_segment(addr, home, count, &mut view)?
                .ok_or(Error::Corruption("vacancy read carried no header"))?;
            view.meta = meta;
        }

        if from_cache && (!view.meta.valid || !view.meta.fences.contains(k)) {
            self.latch_release(addr, LEAF_LATCH_OFFSET, latch_word)?;
            return Ok(LeafResult::Stale);
        }
        if *k >= view.meta.fences.highest {
            self.latch_release(addr, LEAF_LATCH_OFFSET, latch_word)?;
            self.counters.sibling_forwards.fetch_add(1, Ordering::Relaxed);
            let sibling = view.meta.sibling;
            return self.leaf_insert(sibling, RemotePtr::NULL, k, v, false, path, lease);
        }
        debug_assert!(*k >= view.meta.fences.lowest);

        // pick up values combined while we were traversing
        let v = lease.map_or(v, |lease| self.lock_table.combining_value(lease));
        let v = self.store_value(v)?;

        // update path: the key already exists somewhere in the read
        // range; probe in neighborhood order so a shadowed stale copy
        // (left behind by a split) can never win over the live one
        let existing = (0..LEAF_SPAN)
            .map(|d| (home + d) % LEAF_SPAN)
            .find(|slot| view.entries[*slot].key == *k);
        if let Some(slot) = existing {
            view.entries[slot].value = v;
            self.entry_write_and_unlock(&mut view, slot, addr, &vacancy)?;
            return Ok(LeafResult::Done(None));
        }

        // place into the hopscotch table on a copy; the pristine view is
        // still needed if placement fails and we must split
        let mut placed = view.clone();
        if let Some(hop) = placed.hopscotch_insert(k, v, count) {
            let slot = hop.slot;
            self.segment_write_and_unlock(&mut placed, &hop, addr, &mut vacancy)?;
            self.hotspot.add(addr, slot, k);
            return Ok(LeafResult::Done(None));
        }

        // the vacancy bitmap may have hidden occupied slots from us; see
        // the whole leaf before deciding to split
        if count < LEAF_SPAN {
            let rest_start = (home + count) % LEAF_SPAN;
            self.read_leaf_segment(addr, rest_start, LEAF_SPAN - count, &mut view)?;
        }
        self.leaf_split_and_unlock(view, k, v, addr, vacancy, path)?;
        Ok(LeafResult::Done(None))
    }

    // ---- update ------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn leaf_update(
        &self,
        addr: RemotePtr,
        _sibling_hint: RemotePtr,
        k: &Key,
        v: Value,
        from_cache: bool,
        path: &mut PathStack,
        lease: Option<&WriteLease>,
    ) -> Result<LeafResult> {
        let latch_word = self.latch_acquire(addr, LEAF_LATCH_OFFSET)?;
        let vacancy = VacancyLock::from_word(latch_word);
        let home = home_slot(k);

        // speculative path: under the latch a single matching entry is
        // definitive
        if let Some((slot, entry, meta)) = self.speculative_read(addr, home, k)? {
            let mut view = LeafNode::default();
            view.entries[slot] = entry;
            if let Some(meta) = meta {
                view.meta = meta;
            }
            let v = lease.map_or(v, |lease| self.lock_table.combining_value(lease));
            let v = self.store_value(v)?;
            view.entries[slot].value = v;
            self.entry_write_and_unlock(&mut view, slot, addr, &vacancy)?;
            return Ok(LeafResult::Done(Some(v)));
        }

        let mut view = LeafNode::default();
        let meta = self
            .read_leaf_segment(addr, home, NEIGHBORHOOD, &mut view)?
            .ok_or(Error::Corruption("neighborhood read carried no header"))?;
        view.meta = meta;

        if from_cache && (!meta.valid || !meta.fences.contains(k)) {
            self.latch_release(addr, LEAF_LATCH_OFFSET, latch_word)?;
            return Ok(LeafResult::Stale);
        }
        if *k >= meta.fences.highest {
            self.latch_release(addr, LEAF_LATCH_OFFSET, latch_word)?;
            self.counters.sibling_forwards.fetch_add(1, Ordering::Relaxed);
            return self.leaf_update(meta.sibling, RemotePtr::NULL, k, v, false, path, lease);
        }

        let found = (0..NEIGHBORHOOD)
            .map(|d| (home + d) % LEAF_SPAN)
            .find(|slot| view.entries[*slot].key == *k);
        let Some(slot) = found else {
            self.latch_release(addr, LEAF_LATCH_OFFSET, latch_word)?;
            return Ok(LeafResult::Done(None));
        };

        self.hotspot.add(addr, slot, k);
        let v = lease.map_or(v, |lease| self.lock_table.combining_value(lease));
        let v = self.store_value(v)?;
        view.entries[slot].value = v;
        self.entry_write_and_unlock(&mut view, slot, addr, &vacancy)?;
        Ok(LeafResult::Done(Some(v)))
    }

    // ---- segment writes ----------------------------------------------

    /// Rewrites a single slot and releases the latch in the same remote
    /// operation. Occupancy did not change, so the vacancy payload is
    /// written back as-is.
    fn entry_write_and_unlock(
        &self,
        view: &mut LeafNode,
        slot: usize,
        addr: RemotePtr,
        vacancy: &VacancyLock,
    ) -> Result<()> {
        let segment = codec::leaf::encode_segment(view, slot, 1, &[slot]);
        self.write_segments_and_unlock(
            addr,
            ENCODED_LEAF_LEN,
            LEAF_LATCH_OFFSET,
            vec![segment],
            vacancy.word(),
        )
    }

    /// Rewrites the dirty range of a hopscotch placement and releases
    /// the latch, updating the vacancy payload to the new occupancy.
    pub(crate) fn segment_write_and_unlock(
        &self,
        leaf: &mut LeafNode,
        hop: &HopInsert,
        addr: RemotePtr,
        vacancy: &mut VacancyLock,
    ) -> Result<()> {
        let l = hop.home;
        let r = hop.end % LEAF_SPAN;

        // the max-key slot moves only if it was displaced or the new key
        // beat the old maximum; a null key here means the max slot was
        // outside the read range, in which case it cannot have moved
        let old_max_slot = vacancy.max_key_slot();
        let old_max_key = leaf.entries[old_max_slot].key;
        let displaced = hop.hopped.contains(&old_max_slot);
        let beaten =
            !old_max_key.is_null() && hop.hopped.iter().any(|&i| leaf.entries[i].key > old_max_key);
        if displaced || beaten {
            let mut best_slot = old_max_slot;
            let mut best_key = if displaced { Key::NULL } else { old_max_key };
            for &slot in &hop.hopped {
                if leaf.entries[slot].key > best_key {
                    best_key = leaf.entries[slot].key;
                    best_slot = slot;
                }
            }
            vacancy.set_max_key_slot(best_slot);
        }
        vacancy.update_vacancy(l, r, &leaf.empty_slots_in(l, r));

        let segments = if l <= r {
            vec![codec::leaf::encode_segment(leaf, l, r - l + 1, &hop.hopped)]
        } else {
            self.counters.write_two_segments.fetch_add(1, Ordering::Relaxed);
            vec![
                codec::leaf::encode_segment(leaf, 0, r + 1, &hop.hopped),
                codec::leaf::encode_segment(leaf, l, LEAF_SPAN - l, &hop.hopped),
            ]
        };
        self.write_segments_and_unlock(
            addr,
            ENCODED_LEAF_LEN,
            LEAF_LATCH_OFFSET,
            segments,
            vacancy.word(),
        )
    }

    // ---- variable-length values --------------------------------------

    /// With variable-length values enabled, spills `v` into a fresh
    /// out-of-line block and returns the pointer word to store inline.
    pub(crate) fn store_value(&self, v: Value) -> Result<Value> {
        if !self.config.var_len_values {
            return Ok(v);
        }
        let block_addr = self
            .transport
            .alloc(DATA_BLOCK_LEN, PACKED_ALIGN_BITS)?;
        let block = DataBlock::new(v);
        self.transport.write(&block.encode(), block_addr)?;
        Ok(DataPointer::new(DATA_BLOCK_LEN as u16, block_addr).to_word())
    }

    /// Inverse of [`Tree::store_value`]: chases the pointer word back to
    /// the stored value.
    pub(crate) fn resolve_value(&self, stored: Value) -> Result<Value> {
        if !self.config.var_len_values {
            return Ok(stored);
        }
        let pointer = DataPointer::from_word(stored);
        let mut buf = vec![0u8; usize::from(pointer.len)];
        self.transport.read(&mut buf, pointer.ptr.unpack())?;
        Ok(DataBlock::decode(&buf).value)
    }
}
