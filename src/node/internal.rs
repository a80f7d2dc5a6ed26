// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    key::Key,
    layout::INTERNAL_SPAN,
    node::meta::{InternalMeta, PackedVersion},
    remote::RemotePtr,
};
use byteorder::{ByteOrder, LittleEndian};

// NOTE: PERF: hand-rolled binary search is measurably faster than
// slice::partition_point here
fn partition_point<T, F>(slice: &[T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();

    while left < right {
        let mid = (left + right) / 2;
        if pred(&slice[mid]) {
            left = mid + 1;
        } else {
            right = mid;
        }
    }

    left
}

/// One internal slot: version, separator key, child pointer.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct InternalEntry {
    /// Self-verification version of this slot.
    pub version: PackedVersion,
    /// Separator key, [`Key::NULL`] when the slot is unused.
    pub key: Key,
    /// Child covering `[key, next key)`.
    pub ptr: RemotePtr,
}

impl InternalEntry {
    pub(crate) fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.version.to_byte();
        buf[1..9].copy_from_slice(self.key.as_bytes());
        LittleEndian::write_u64(&mut buf[9..17], self.ptr.to_u64());
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        let mut key = [0u8; 8];
        key.copy_from_slice(&buf[1..9]);
        Self {
            version: PackedVersion::from_byte(buf[0]),
            key: Key::from_bytes(key),
            ptr: RemotePtr::from_u64(LittleEndian::read_u64(&buf[9..17])),
        }
    }
}

/// Decoded internal node: header plus a sorted, null-terminated entry
/// array.
///
/// The leftmost pointer covers `[fences.lowest, entries[0].key)`; entry
/// `i` covers `[entries[i].key, entries[i+1].key)`; the last entry
/// extends to `fences.highest`.
#[derive(Clone, Debug)]
pub struct InternalNode {
    /// Node header.
    pub meta: InternalMeta,
    /// Sorted separator entries; unused slots hold [`Key::NULL`].
    pub entries: [InternalEntry; INTERNAL_SPAN],
}

impl Default for InternalNode {
    fn default() -> Self {
        Self {
            meta: InternalMeta::default(),
            entries: [InternalEntry::default(); INTERNAL_SPAN],
        }
    }
}

impl InternalNode {
    /// Returns `true` if this node is the root of its tree.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.meta.fences == crate::node::meta::FenceKeys::widest()
    }

    /// Number of used entries (prefix before the first null key).
    #[must_use]
    pub fn entry_count(&self) -> usize {
        partition_point(&self.entries, |e| !e.key.is_null())
    }

    /// Picks the child covering `k` and the child's right neighbor at the
    /// same level, for lateral validation during the descent.
    #[must_use]
    pub fn pick_child(&self, k: &Key) -> (RemotePtr, RemotePtr) {
        let count = self.entry_count();
        let used = &self.entries[..count];

        if count == 0 || *k < used[0].key {
            let sibling = used.first().map_or(self.meta.sibling_leftmost, |e| e.ptr);
            return (self.meta.leftmost, sibling);
        }

        // first entry whose key is > k
        let i = partition_point(used, |e| e.key <= *k);
        let sibling = used
            .get(i)
            .map_or(self.meta.sibling_leftmost, |e| e.ptr);
        (used[i - 1].ptr, sibling)
    }

    /// Returns `true` if `k` is present as a separator key.
    #[must_use]
    pub fn contains_key(&self, k: &Key) -> bool {
        let count = self.entry_count();
        let i = partition_point(&self.entries[..count], |e| e.key < *k);
        self.entries[..count].get(i).is_some_and(|e| e.key == *k)
    }

    /// Inserts `(k, ptr)` keeping the entry array sorted.
    ///
    /// # Panics
    ///
    /// Panics if the node is full; the caller must have checked for a
    /// free slot (or split).
    pub fn insert_sorted(&mut self, k: &Key, ptr: RemotePtr) {
        let count = self.entry_count();
        assert!(count < INTERNAL_SPAN, "internal node is full");

        let pos = partition_point(&self.entries[..count], |e| e.key < *k);
        for i in (pos..count).rev() {
            self.entries[i + 1] = self.entries[i];
        }
        self.entries[pos].key = *k;
        self.entries[pos].ptr = ptr;
    }

    /// Approximate bytes one cached copy of this node consumes.
    #[must_use]
    pub fn consumed_cache_size(&self) -> i64 {
        (std::mem::size_of::<InternalMeta>()
            + std::mem::size_of::<usize>()
            + self.entry_count() * std::mem::size_of::<InternalEntry>()) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn node_with_keys(keys: &[u64]) -> InternalNode {
        let mut node = InternalNode::default();
        node.meta.leftmost = RemotePtr::new(0, 0x100);
        node.meta.sibling_leftmost = RemotePtr::new(0, 0x900);
        for &k in keys {
            node.insert_sorted(&Key::from(k), RemotePtr::new(0, 0x100 * (k + 1)));
        }
        node
    }

    #[test]
    fn pick_child_left_of_first_separator() {
        let node = node_with_keys(&[10, 20, 30]);
        let (child, sibling) = node.pick_child(&Key::from(5));
        assert_eq!(RemotePtr::new(0, 0x100), child);
        assert_eq!(RemotePtr::new(0, 0x100 * 11), sibling);
    }

    #[test]
    fn pick_child_middle_and_last() {
        let node = node_with_keys(&[10, 20, 30]);

        let (child, sibling) = node.pick_child(&Key::from(20));
        assert_eq!(RemotePtr::new(0, 0x100 * 21), child);
        assert_eq!(RemotePtr::new(0, 0x100 * 31), sibling);

        let (child, sibling) = node.pick_child(&Key::from(99));
        assert_eq!(RemotePtr::new(0, 0x100 * 31), child);
        assert_eq!(node.meta.sibling_leftmost, sibling);
    }

    #[test]
    fn insert_sorted_keeps_order() {
        let node = node_with_keys(&[30, 10, 20, 25]);
        let keys: Vec<u64> = node.entries[..node.entry_count()]
            .iter()
            .map(|e| e.key.into())
            .collect();
        assert_eq!(vec![10, 20, 25, 30], keys);
        assert!(node.contains_key(&Key::from(25)));
        assert!(!node.contains_key(&Key::from(26)));
    }
}
