// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cache-guided range scans: plan the minimum set of leaf segments,
//! fetch them in one batched read per round, and re-verify every
//! segment until the whole plan converges.

use super::Tree;
use crate::{
    codec,
    error::Error,
    key::Key,
    layout::{LEAF_SPAN, MAX_LEAF_ENTRIES_PER_IO, MAX_RETRY, NEIGHBORHOOD},
    node::{leaf::home_slot, FenceKeys, LeafEntry},
    remote::RemotePtr,
    transport::{ReadRegion, Transport},
    value::Value,
    Result,
};
use std::{collections::BTreeMap, sync::atomic::Ordering};

/// One planned segment read.
struct Plan {
    leaf: RemotePtr,
    start: usize,
    count: usize,
    /// Key this plan was speculatively narrowed to; if the fetched
    /// segment does not contain it, the plan widens to the full
    /// neighborhood on the next round.
    target: Option<Key>,
    /// Exclusive upper bound of the interval this leaf was planned to
    /// cover. If the fetched fence ends below it, the leaf has split
    /// since it was cached and the scan continues into the sibling.
    hi: Key,
}

impl<T: Transport> Tree<T> {
    /// Returns every `(k, v)` with `from <= k < to`.
    ///
    /// Candidate leaves come from cached level-1 nodes; keys not covered
    /// by the cache fall back to point lookups (which also warm the
    /// cache for the next scan).
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or retry-budget exhaustion.
    pub fn range_query(&self, from: Key, to: Key) -> Result<BTreeMap<Key, Value>> {
        let mut out = BTreeMap::new();
        if from >= to {
            return Ok(out);
        }

        // candidate leaves with their per-child fence intervals
        let mut leaves: BTreeMap<RemotePtr, FenceKeys> = BTreeMap::new();
        for node in self.cache.range_seek(&from, &to) {
            let count = node.entry_count();
            let mut child = node.meta.leftmost;
            let mut lowest = node.meta.fences.lowest;
            for i in 0..=count {
                let highest = if i < count {
                    node.entries[i].key
                } else {
                    node.meta.fences.highest
                };
                if lowest < to && highest > from && !child.is_null() {
                    leaves.insert(child, FenceKeys { lowest, highest });
                }
                if i < count {
                    child = node.entries[i].ptr;
                    lowest = highest;
                }
            }
        }

        let mut pending = Vec::new();
        for (&leaf, fence) in &leaves {
            self.plan_leaf(leaf, fence, &from, &to, &mut pending);
        }
        let mut ranks = BTreeMap::new();
        let mut chased: std::collections::BTreeSet<RemotePtr> = leaves.keys().copied().collect();

        // fetch rounds: everything in one batched read, failed segments
        // resubmitted until the plan converges
        let mut round = 0;
        while !pending.is_empty() {
            round += 1;
            if round > MAX_RETRY {
                return Err(Error::RetryLimit);
            }
            self.counters.range_rounds.fetch_add(1, Ordering::Relaxed);
            pending = self.fetch_round(pending, &from, &to, &mut out, &mut ranks, &mut chased)?;
        }

        // with out-of-line values, chase the pointers in one last pass;
        // this runs before the gap fill because point lookups hand back
        // already-resolved values
        if self.config.var_len_values {
            for value in out.values_mut() {
                *value = self.resolve_value(*value)?;
            }
        }

        // keys outside every cached candidate leaf: point lookups
        self.fill_gaps(&leaves, &from, &to, &mut out)?;
        Ok(out)
    }

    /// Plans the reads for one candidate leaf: the whole leaf when its
    /// fence is fully inside the query, otherwise the merged hopscotch
    /// neighborhoods of the requested keys.
    fn plan_leaf(
        &self,
        leaf: RemotePtr,
        fence: &FenceKeys,
        from: &Key,
        to: &Key,
        pending: &mut Vec<Plan>,
    ) {
        let lo = (*from).max(fence.lowest);
        let hi = (*to).min(fence.highest);
        if fence.lowest >= *from && fence.highest <= *to {
            pending.push(Plan {
                leaf,
                start: 0,
                count: LEAF_SPAN,
                target: None,
                hi,
            });
            return;
        }
        let mut intervals: Vec<(usize, usize)> = Vec::new();
        let mut speculative: Vec<(usize, Key)> = Vec::new();

        let mut k = lo;
        while k < hi {
            let home = home_slot(&k);
            if let Some(slot) = self.hotspot.search(leaf, home, NEIGHBORHOOD, &k) {
                self.counters.speculative_reads.fetch_add(1, Ordering::Relaxed);
                speculative.push((slot, k));
            } else if home + NEIGHBORHOOD <= LEAF_SPAN {
                intervals.push((home, home + NEIGHBORHOOD));
            } else {
                intervals.push((home, LEAF_SPAN));
                intervals.push((0, home + NEIGHBORHOOD - LEAF_SPAN));
            }
            k = k.successor();
        }

        intervals.sort_unstable();
        let merged = merge_intervals(intervals, self.config.greedy_range);
        for (l, r) in merged {
            pending.push(Plan {
                leaf,
                start: l,
                count: r - l,
                target: None,
                hi,
            });
        }
        for (slot, key) in speculative {
            pending.push(Plan {
                leaf,
                start: slot,
                count: 1,
                target: Some(key),
                hi,
            });
        }
    }

    /// Issues one batched read for every pending plan and harvests the
    /// segments that validate; the rest (plus widened speculative
    /// misses) become the next round.
    fn fetch_round(
        &self,
        pending: Vec<Plan>,
        from: &Key,
        to: &Key,
        out: &mut BTreeMap<Key, Value>,
        ranks: &mut BTreeMap<Key, usize>,
        chased: &mut std::collections::BTreeSet<RemotePtr>,
    ) -> Result<Vec<Plan>> {
        let mut buffers: Vec<Vec<u8>> = pending
            .iter()
            .map(|plan| vec![0u8; codec::leaf::offset_info(plan.start, plan.count).raw_len])
            .collect();

        {
            let mut regions: Vec<ReadRegion<'_>> = pending
                .iter()
                .zip(&mut buffers)
                .map(|(plan, buf)| ReadRegion {
                    remote: plan
                        .leaf
                        .add(codec::leaf::offset_info(plan.start, plan.count).raw_offset as u64),
                    local: buf,
                })
                .collect();
            self.transport.read_batch(&mut regions)?;
        }

        let mut next = Vec::new();
        for (plan, buf) in pending.into_iter().zip(&buffers) {
            let Some(seg) = codec::leaf::decode_segment(buf, plan.start, plan.count) else {
                next.push(plan);
                continue;
            };
            if !segment_hop_consistent(&seg.entries, plan.start, plan.count) {
                next.push(plan);
                continue;
            }

            // the leaf split after it was cached: its fence now ends
            // short of the planned interval, so the missing tail lives
            // in the sibling chain
            if let Some(meta) = &seg.meta {
                if meta.valid
                    && meta.fences.highest < plan.hi
                    && !meta.sibling.is_null()
                    && chased.insert(meta.sibling)
                {
                    next.push(Plan {
                        leaf: meta.sibling,
                        start: 0,
                        count: LEAF_SPAN,
                        target: None,
                        hi: plan.hi,
                    });
                }
            }

            if let Some(target) = plan.target {
                self.harvest(&seg.entries, plan.leaf, plan.start, from, to, out, ranks);
                if !seg.entries.iter().any(|e| e.key == target) {
                    // speculative miss: fall back to the neighborhood
                    let home = home_slot(&target);
                    if home + NEIGHBORHOOD <= LEAF_SPAN {
                        next.push(Plan {
                            leaf: plan.leaf,
                            start: home,
                            count: NEIGHBORHOOD,
                            target: None,
                            hi: plan.hi,
                        });
                    } else {
                        next.push(Plan {
                            leaf: plan.leaf,
                            start: home,
                            count: LEAF_SPAN - home,
                            target: None,
                            hi: plan.hi,
                        });
                        next.push(Plan {
                            leaf: plan.leaf,
                            start: 0,
                            count: home + NEIGHBORHOOD - LEAF_SPAN,
                            target: None,
                            hi: plan.hi,
                        });
                    }
                } else {
                    self.counters.speculative_hits.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                self.harvest(&seg.entries, plan.leaf, plan.start, from, to, out, ranks);
            }
        }
        Ok(next)
    }

    fn harvest(
        &self,
        entries: &[LeafEntry],
        leaf: RemotePtr,
        start: usize,
        from: &Key,
        to: &Key,
        out: &mut BTreeMap<Key, Value>,
        ranks: &mut BTreeMap<Key, usize>,
    ) {
        for (d, entry) in entries.iter().enumerate() {
            if entry.is_empty() || entry.key < *from || entry.key >= *to {
                continue;
            }
            // on a duplicate (a stale copy shadowed by a later upsert),
            // keep the copy closest to its home slot, which is the one
            // point lookups return
            let slot = start + d;
            let rank = (slot + LEAF_SPAN - home_slot(&entry.key)) % LEAF_SPAN;
            let best = ranks.entry(entry.key).or_insert(usize::MAX);
            if rank < *best {
                *best = rank;
                out.insert(entry.key, entry.value);
            }
            self.hotspot.add(leaf, slot, &entry.key);
        }
    }

    /// Point-lookup fallback for every key in `[from, to)` not covered
    /// by a candidate leaf (warming the tree cache along the way).
    fn fill_gaps(
        &self,
        leaves: &BTreeMap<RemotePtr, FenceKeys>,
        from: &Key,
        to: &Key,
        out: &mut BTreeMap<Key, Value>,
    ) -> Result<()> {
        let mut covered: Vec<(Key, Key)> = leaves
            .values()
            .map(|f| (f.lowest, f.highest))
            .collect();
        covered.sort_unstable();

        let mut k = *from;
        'scan: while k < *to {
            for &(lowest, highest) in &covered {
                if k >= lowest && k < highest {
                    if highest >= *to {
                        break 'scan;
                    }
                    k = highest;
                    continue 'scan;
                }
            }
            if let Some(v) = self.search(k)? {
                out.insert(k, v);
            }
            k = k.successor();
        }
        Ok(())
    }
}

/// Restricted hopscotch re-verification: every hop bit whose home and
/// member slot both fall inside the segment must point at a key that
/// actually hashes home.
fn segment_hop_consistent(entries: &[LeafEntry], start: usize, count: usize) -> bool {
    let homes: Vec<Option<usize>> = entries
        .iter()
        .map(|e| (!e.is_empty()).then(|| home_slot(&e.key)))
        .collect();

    for j in 0..count {
        for d in 0..NEIGHBORHOOD.min(count - j) {
            let bit_set = entries[j].hop_bitmap & (1 << (NEIGHBORHOOD - 1 - d)) != 0;
            if bit_set && homes[j + d] != Some(start + j) {
                return false;
            }
        }
    }
    true
}

fn merge_intervals(intervals: Vec<(usize, usize)>, greedy: bool) -> Vec<(usize, usize)> {
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (l, r) in intervals {
        match merged.last_mut() {
            Some((_, end)) if l <= *end => *end = (*end).max(r),
            _ => merged.push((l, r)),
        }
    }
    if !greedy {
        return merged;
    }

    // coalesce nearby segments while the combined read stays under the
    // per-IO cap
    let mut out: Vec<(usize, usize)> = Vec::new();
    for (l, r) in merged {
        match out.last_mut() {
            Some((start, end)) if r.max(*end) <= *start + MAX_LEAF_ENTRIES_PER_IO => {
                *end = (*end).max(r);
            }
            _ => out.push((l, r)),
        }
    }
    out
}
