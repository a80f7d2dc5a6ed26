// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    key::Key,
    layout::LEAF_SPAN,
    node::leaf::fingerprint16,
    remote::{PackedPtr, RemotePtr},
};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

const BUCKET_SLOTS: usize = 16;
const SLOT_COST: i64 = 16;

/// One cache slot, packed into two atomics so updates need no pointers
/// and no reclamation:
/// `tag` = packed leaf address (48 bits) | in-leaf slot (16 bits),
/// `info` = fingerprint (high 16 bits) | frequency (low 32 bits).
#[derive(Default)]
struct Slot {
    tag: AtomicU64,
    info: AtomicU64,
}

fn tag_of(leaf: RemotePtr, slot: usize) -> u64 {
    (PackedPtr::pack(leaf).raw() << 16) | slot as u64
}

fn pack_info(fingerprint: u16, freq: u32) -> u64 {
    (u64::from(fingerprint) << 32) | u64::from(freq)
}

fn info_fingerprint(info: u64) -> u16 {
    (info >> 32) as u16
}

fn info_freq(info: u64) -> u32 {
    info as u32
}

/// Approximate `(leaf address, slot) -> key fingerprint` cache.
///
/// A hit licenses a single-slot speculative read; it never stands on its
/// own, the reader always re-checks the fetched entry's key. False
/// positives therefore cost one wasted round-trip, never a wrong result.
pub(crate) struct HotspotCache {
    buckets: Vec<[Slot; BUCKET_SLOTS]>,
    free: AtomicI64,
    delay: AtomicI64,
    sample: AtomicU64,
}

impl HotspotCache {
    /// Sizes the table from a byte budget; a zero budget disables the
    /// cache entirely.
    pub fn new(capacity_bytes: i64) -> Self {
        let buckets = (capacity_bytes / (SLOT_COST * BUCKET_SLOTS as i64)).max(0) as usize;
        Self {
            buckets: (0..buckets).map(|_| Default::default()).collect(),
            free: AtomicI64::new(capacity_bytes),
            delay: AtomicI64::new(0),
            sample: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.buckets.is_empty()
    }

    fn bucket_of(&self, leaf: RemotePtr, slot: usize) -> &[Slot; BUCKET_SLOTS] {
        let index = (leaf.to_u64().wrapping_add(slot as u64)) % self.buckets.len() as u64;
        &self.buckets[index as usize]
    }

    /// Records that `k` lives at `(leaf, slot)`: bumps the frequency on
    /// a fingerprint match, refreshes a mismatched fingerprint, claims an
    /// empty slot, or replaces the least-frequent slot in the bucket.
    pub fn add(&self, leaf: RemotePtr, slot: usize, k: &Key) {
        if !self.is_enabled() {
            return;
        }
        let tag = tag_of(leaf, slot);
        let fingerprint = fingerprint16(k);
        let bucket = self.bucket_of(leaf, slot);

        for candidate in bucket {
            if candidate.tag.load(Ordering::Relaxed) != tag {
                continue;
            }
            let info = candidate.info.load(Ordering::Relaxed);
            let updated = if info_fingerprint(info) == fingerprint {
                pack_info(fingerprint, info_freq(info).saturating_add(1))
            } else {
                pack_info(fingerprint, 1)
            };
            // a lost race just means another thread refreshed the slot
            let _ = candidate.info.compare_exchange(
                info,
                updated,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            return;
        }

        if self.delay.fetch_sub(1, Ordering::Relaxed) > 0 {
            return;
        }

        // claim an empty slot
        let mut lfu: Option<(&Slot, u32)> = None;
        for candidate in bucket {
            let seen = candidate.tag.load(Ordering::Relaxed);
            if seen == 0 {
                if candidate
                    .tag
                    .compare_exchange(0, tag, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    candidate.info.store(pack_info(fingerprint, 1), Ordering::Relaxed);
                    if self.free.fetch_sub(SLOT_COST, Ordering::Relaxed) - SLOT_COST < 0 {
                        self.evict();
                    }
                }
                return;
            }
            let freq = info_freq(candidate.info.load(Ordering::Relaxed));
            if lfu.as_ref().is_none_or(|(_, best)| freq < *best) {
                lfu = Some((candidate, freq));
            }
        }

        // replace the in-bucket LFU slot
        if let Some((victim, _)) = lfu {
            let seen = victim.tag.load(Ordering::Relaxed);
            if victim
                .tag
                .compare_exchange(seen, tag, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                victim.info.store(pack_info(fingerprint, 1), Ordering::Relaxed);
            }
        }
    }

    /// Looks for `k` in the wrapped slot range `[l, l + len)` of `leaf`,
    /// returning the best-frequency slot whose fingerprint matches.
    pub fn search(&self, leaf: RemotePtr, l: usize, len: usize, k: &Key) -> Option<usize> {
        if !self.is_enabled() {
            return None;
        }
        let fingerprint = fingerprint16(k);
        let mut best: Option<(usize, u32)> = None;

        for d in 0..len {
            let slot = (l + d) % LEAF_SPAN;
            let tag = tag_of(leaf, slot);
            for candidate in self.bucket_of(leaf, slot) {
                if candidate.tag.load(Ordering::Relaxed) != tag {
                    continue;
                }
                let info = candidate.info.load(Ordering::Relaxed);
                if info_fingerprint(info) != fingerprint {
                    continue;
                }
                let freq = info_freq(info);
                if best.as_ref().is_none_or(|(_, f)| freq > *f) {
                    best = Some((slot, freq));
                }
            }
        }

        best.map(|(slot, _)| slot)
    }

    /// Two-random LFU eviction across buckets, with a short delay window
    /// that suppresses repeated evictions under burst contention.
    fn evict(&self) {
        self.delay.store(10, Ordering::Relaxed);
        for _ in 0..1024 {
            if self.free.load(Ordering::Relaxed) >= 0 {
                return;
            }
            self.evict_one();
        }
    }

    fn evict_one(&self) {
        let pick = |tick: u64| {
            (xxhash_rust::xxh3::xxh3_64(&tick.to_le_bytes()) % self.buckets.len() as u64) as usize
        };
        let a = pick(self.sample.fetch_add(1, Ordering::Relaxed));
        let b = pick(self.sample.fetch_add(1, Ordering::Relaxed));

        let lfu_of = |bucket: &[Slot; BUCKET_SLOTS]| {
            let mut best: Option<(usize, u32)> = None;
            for (i, slot) in bucket.iter().enumerate() {
                if slot.tag.load(Ordering::Relaxed) == 0 {
                    continue;
                }
                let freq = info_freq(slot.info.load(Ordering::Relaxed));
                if best.as_ref().is_none_or(|(_, f)| freq < *f) {
                    best = Some((i, freq));
                }
            }
            best
        };

        let victims = [
            lfu_of(&self.buckets[a]).map(|(i, f)| (a, i, f)),
            lfu_of(&self.buckets[b]).map(|(i, f)| (b, i, f)),
        ];
        let victim = victims
            .into_iter()
            .flatten()
            .min_by_key(|(_, _, freq)| *freq);

        if let Some((bucket, i, _)) = victim {
            let slot = &self.buckets[bucket][i];
            let seen = slot.tag.load(Ordering::Relaxed);
            if seen != 0
                && slot
                    .tag
                    .compare_exchange(seen, 0, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                self.free.fetch_add(SLOT_COST, Ordering::Relaxed);
            }
        }
    }
}
