// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    key::Key,
    layout::{LEAF_SPAN, NEIGHBORHOOD},
    node::meta::{LeafMeta, PackedVersion},
    value::Value,
};
use byteorder::{ByteOrder, LittleEndian};

/// Home slot of a key: `HASH(k) mod LEAF_SPAN`.
///
/// xxh3 is part of this crate's wire contract; every client of a pool
/// must hash identically.
#[must_use]
pub fn home_slot(key: &Key) -> usize {
    (xxhash_rust::xxh3::xxh3_64(key.as_bytes()) % LEAF_SPAN as u64) as usize
}

/// 16-bit key fingerprint used by the hotspot index cache.
#[must_use]
pub fn fingerprint16(key: &Key) -> u16 {
    (xxhash_rust::xxh3::xxh3_64(key.as_bytes()) >> 48) as u16
}

/// One leaf slot: version, hop bitmap, key, inline value.
///
/// The hop bitmap is meaningful only on a home slot: bit `(H - 1 - d)`
/// set means the slot `d` positions to the right holds a key hashing
/// here.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct LeafEntry {
    /// Self-verification version of this slot.
    pub version: PackedVersion,
    /// Hopscotch neighborhood bitmap (low `NEIGHBORHOOD` bits used).
    pub hop_bitmap: u16,
    /// Stored key, [`Key::NULL`] when the slot is empty.
    pub key: Key,
    /// Stored value word.
    pub value: Value,
}

impl LeafEntry {
    /// Returns `true` if the slot holds no key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key.is_null()
    }

    /// Returns whether the hop bit at neighborhood offset `d` is set.
    #[must_use]
    pub fn hop_bit(&self, d: usize) -> bool {
        debug_assert!(d < NEIGHBORHOOD);
        self.hop_bitmap & (1 << (NEIGHBORHOOD - 1 - d)) != 0
    }

    /// Sets the hop bit at neighborhood offset `d`.
    pub fn set_hop_bit(&mut self, d: usize) {
        debug_assert!(d < NEIGHBORHOOD && !self.hop_bit(d));
        self.hop_bitmap |= 1 << (NEIGHBORHOOD - 1 - d);
    }

    /// Clears the hop bit at neighborhood offset `d`.
    pub fn unset_hop_bit(&mut self, d: usize) {
        debug_assert!(d < NEIGHBORHOOD && self.hop_bit(d));
        self.hop_bitmap &= !(1 << (NEIGHBORHOOD - 1 - d));
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.version.to_byte();
        LittleEndian::write_u16(&mut buf[1..3], self.hop_bitmap);
        buf[3..11].copy_from_slice(self.key.as_bytes());
        LittleEndian::write_u64(&mut buf[11..19], self.value);
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        let mut key = [0u8; 8];
        key.copy_from_slice(&buf[3..11]);
        Self {
            version: PackedVersion::from_byte(buf[0]),
            hop_bitmap: LittleEndian::read_u16(&buf[1..3]),
            key: Key::from_bytes(key),
            value: LittleEndian::read_u64(&buf[11..19]),
        }
    }
}

/// Outcome of a hopscotch placement: the contiguous (possibly wrapping)
/// slot range that changed and the slots whose key/value bytes changed.
#[derive(Debug)]
pub struct HopInsert {
    /// Home slot of the inserted key; left edge of the dirty segment.
    pub home: usize,
    /// Right edge of the dirty segment in unwrapped coordinates
    /// (`home <= end < home + LEAF_SPAN`).
    pub end: usize,
    /// Slot (mod `LEAF_SPAN`) the new key landed in.
    pub slot: usize,
    /// Slots (mod `LEAF_SPAN`) whose key or value changed and whose
    /// entry version must therefore be bumped.
    pub hopped: Vec<usize>,
}

/// Decoded leaf node: header plus the hopscotch table.
#[derive(Clone, Debug)]
pub struct LeafNode {
    /// Leaf header (the scattered-metadata master copy).
    pub meta: LeafMeta,
    /// The hopscotch slot array.
    pub entries: [LeafEntry; LEAF_SPAN],
}

impl Default for LeafNode {
    fn default() -> Self {
        Self {
            meta: LeafMeta::default(),
            entries: [LeafEntry::default(); LEAF_SPAN],
        }
    }
}

impl LeafNode {
    /// Wrap-around slot access by unwrapped index.
    #[must_use]
    pub fn entry(&self, logical: i64) -> &LeafEntry {
        &self.entries[logical.rem_euclid(LEAF_SPAN as i64) as usize]
    }

    fn entry_mut(&mut self, logical: i64) -> &mut LeafEntry {
        &mut self.entries[logical.rem_euclid(LEAF_SPAN as i64) as usize]
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_empty()).count()
    }

    /// Slot currently holding the maximum key (0 for an empty leaf).
    #[must_use]
    pub fn max_key_slot(&self) -> usize {
        let mut max = Key::NULL;
        let mut slot = 0;
        for (i, e) in self.entries.iter().enumerate() {
            if e.key > max {
                max = e.key;
                slot = i;
            }
        }
        slot
    }

    /// Places `(k, v)` by hopscotch insertion, considering only the first
    /// `window` slots starting at the key's home slot when searching for
    /// an empty slot. Returns `None` if no empty slot is in the window or
    /// displacement cannot free the neighborhood (the caller splits).
    pub fn hopscotch_insert(&mut self, k: &Key, v: Value, window: usize) -> Option<HopInsert> {
        let span = LEAF_SPAN as i64;
        let h = NEIGHBORHOOD as i64;
        let home = home_slot(k) as i64;

        // find the first empty slot at or after the home slot
        let empty = (home..home + window as i64).find(|i| self.entry(*i).is_empty())?;

        let mut hopped = Vec::new();
        let mut j = empty;
        loop {
            hopped.push(j.rem_euclid(span) as usize);
            if j < home + h {
                let dst = self.entry_mut(j);
                dst.key = *k;
                dst.value = v;
                self.entry_mut(home).set_hop_bit((j - home) as usize);
                return Some(HopInsert {
                    home: home as usize,
                    end: empty as usize,
                    slot: j.rem_euclid(span) as usize,
                    hopped,
                });
            }

            // displace: find an entry in (j - H, j) that may move into j.
            // Its home slot is derived from hop bitmaps, not by rehashing;
            // the bitmap is the source of truth for slot ownership.
            let mut displaced = None;
            'offsets: for offset in (1..h).rev() {
                let candidate = j - offset;
                for z in (0..h).rev() {
                    let cand_home = candidate - z;
                    if cand_home + h > j && self.entry(cand_home).hop_bit(z as usize) {
                        displaced = Some((candidate, cand_home));
                        break 'offsets;
                    }
                }
            }
            let (candidate, cand_home) = displaced?;

            let moved = *self.entry(candidate);
            let dst = self.entry_mut(j);
            dst.key = moved.key;
            dst.value = moved.value;
            self.entry_mut(cand_home)
                .unset_hop_bit((candidate - cand_home) as usize);
            self.entry_mut(cand_home).set_hop_bit((j - cand_home) as usize);
            j = candidate;
        }
    }

    /// Chooses a split key such that `k` stays insertable after the
    /// split: simulate, for each occupied slot from `k`'s home onward,
    /// whether freeing it would admit `k`; the keys of those slots are
    /// the critical set, and the median of (critical set + k) is the
    /// split key.
    #[must_use]
    pub fn split_key_for(&self, k: &Key) -> Key {
        let span = LEAF_SPAN as i64;
        let h = NEIGHBORHOOD as i64;
        let home = home_slot(k) as i64;

        let mut critical = Vec::new();
        for sim_empty in home..home + span {
            if self.entry(sim_empty).is_empty() {
                break;
            }
            let mut j = sim_empty;
            'chain: loop {
                if j < home + h {
                    critical.push(self.entry(sim_empty).key);
                    break;
                }
                for offset in (1..h).rev() {
                    let candidate = j - offset;
                    let true_home = home_slot(&self.entry(candidate).key) as i64;
                    let diff = (candidate - true_home).rem_euclid(span);
                    let cand_home = candidate - diff;
                    if cand_home + h > j {
                        j = candidate;
                        continue 'chain;
                    }
                }
                break;
            }
        }

        critical.push(*k);
        critical.sort_unstable();
        critical[critical.len() / 2]
    }

    /// Checks the hopscotch invariant over the whole leaf.
    #[must_use]
    pub fn hopscotch_consistent(&self) -> bool {
        for home in 0..LEAF_SPAN {
            let mut bitmap = 0u16;
            for d in 0..NEIGHBORHOOD {
                let e = self.entry((home + d) as i64);
                if !e.is_empty() && home_slot(&e.key) == home {
                    bitmap |= 1 << (NEIGHBORHOOD - 1 - d);
                }
            }
            if bitmap != self.entries[home].hop_bitmap {
                return false;
            }
        }
        true
    }

    /// Slots in the wrapped inclusive range `[l, r]` that are empty.
    #[must_use]
    pub fn empty_slots_in(&self, l: usize, r: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut i = l;
        loop {
            if self.entries[i].is_empty() {
                out.push(i);
            }
            if i == r {
                break;
            }
            i = (i + 1) % LEAF_SPAN;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn filled_leaf(count: usize) -> LeafNode {
        let mut leaf = LeafNode::default();
        let mut k = 1u64;
        let mut inserted = 0;
        while inserted < count {
            let key = Key::from(k);
            if leaf
                .hopscotch_insert(&key, k * 10, LEAF_SPAN)
                .is_some()
            {
                inserted += 1;
            }
            k += 1;
        }
        leaf
    }

    #[test]
    fn hopscotch_insert_keeps_invariant() {
        let leaf = filled_leaf(48);
        assert!(leaf.hopscotch_consistent());
        assert_eq!(48, leaf.occupied());
    }

    #[test]
    fn hopscotch_insert_finds_key_in_neighborhood() {
        let leaf = filled_leaf(56);
        for i in 0..LEAF_SPAN {
            let e = &leaf.entries[i];
            if e.is_empty() {
                continue;
            }
            let home = home_slot(&e.key);
            let d = (i + LEAF_SPAN - home) % LEAF_SPAN;
            assert!(d < NEIGHBORHOOD, "entry escaped its neighborhood");
            assert!(leaf.entries[home].hop_bit(d));
        }
    }

    #[test]
    fn hopscotch_insert_reports_dirty_slots() {
        let mut leaf = LeafNode::default();
        let k = Key::from(123);
        let hop = leaf.hopscotch_insert(&k, 9, LEAF_SPAN).expect("leaf is empty");
        assert_eq!(home_slot(&k), hop.home);
        assert_eq!(vec![hop.end % LEAF_SPAN], hop.hopped);
        assert_eq!(k, leaf.entries[hop.end % LEAF_SPAN].key);
    }

    #[test]
    fn split_key_median_separates_keys() {
        let leaf = filled_leaf(LEAF_SPAN);
        let k = Key::from(1000);
        let split = leaf.split_key_for(&k);
        assert!(!split.is_null());
        let below = leaf
            .entries
            .iter()
            .filter(|e| !e.is_empty() && e.key < split)
            .count();
        assert!(below > 0 && below < LEAF_SPAN);
    }

    #[test]
    fn empty_slot_scan_wraps() {
        let mut leaf = LeafNode::default();
        leaf.entries[63].key = Key::from(1);
        leaf.entries[0].key = Key::from(2);
        let empties = leaf.empty_slots_in(62, 1);
        assert_eq!(vec![62, 1], empties);
    }
}
