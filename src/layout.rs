// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compile-time wire constants shared by every client of a pool.
//!
//! These values are part of the persisted layout: two clients disagreeing
//! on any of them cannot share a tree.

use crate::key::KEY_LEN;

/// Alignment of node-granularity allocations, in bits.
pub const PACKED_ALIGN_BITS: u32 = 8;

/// Remote cache line size the version interleave is built around.
pub const CACHELINE: usize = 64;

/// One interleaved version byte precedes every `BLOCK` payload bytes
/// past the first cache line.
pub const VERSION_LEN: usize = 1;

/// Payload bytes per interleaved block.
pub const BLOCK: usize = CACHELINE - VERSION_LEN;

/// Entries per leaf node.
pub const LEAF_SPAN: usize = 64;

/// Hopscotch neighborhood width.
pub const NEIGHBORHOOD: usize = 8;

/// Hopscotch groups per leaf; each group carries a metadata replica.
pub const GROUP_COUNT: usize = LEAF_SPAN / NEIGHBORHOOD;

/// Entries per internal node.
pub const INTERNAL_SPAN: usize = 64;

/// Inline value width in bytes.
pub const INLINE_VAL_LEN: usize = 8;

/// Leaf entry: version, hop bitmap, key, inline value.
pub const LEAF_ENTRY_LEN: usize = VERSION_LEN + 2 + KEY_LEN + INLINE_VAL_LEN;

/// Scattered leaf metadata replica: version, valid, sibling, fence keys.
pub const SCATTERED_META_LEN: usize = VERSION_LEN + 1 + 8 + 2 * KEY_LEN;

/// One hopscotch group: a metadata replica followed by its entries.
pub const GROUP_LEN: usize = SCATTERED_META_LEN + NEIGHBORHOOD * LEAF_ENTRY_LEN;

/// Decoded (version-stripped) leaf size.
pub const DECODED_LEAF_LEN: usize = GROUP_COUNT * GROUP_LEN;

/// Internal node header: version, level, valid, sibling, leftmost child,
/// sibling's leftmost child, fence keys.
pub const INTERNAL_META_LEN: usize = VERSION_LEN + 2 + 3 * 8 + 2 * KEY_LEN;

/// Internal entry: version, key, child pointer.
pub const INTERNAL_ENTRY_LEN: usize = VERSION_LEN + KEY_LEN + 8;

/// Decoded (version-stripped) internal node size.
pub const DECODED_INTERNAL_LEN: usize = INTERNAL_META_LEN + INTERNAL_SPAN * INTERNAL_ENTRY_LEN;

/// On-wire size of a decoded byte span: the first cache line travels
/// verbatim, every later block gains one version byte.
#[must_use]
pub const fn encoded_len(decoded: usize) -> usize {
    if decoded <= CACHELINE {
        decoded
    } else {
        decoded + (decoded - CACHELINE).div_ceil(BLOCK) * VERSION_LEN
    }
}

/// On-wire leaf size.
pub const ENCODED_LEAF_LEN: usize = encoded_len(DECODED_LEAF_LEN);

/// On-wire internal node size.
pub const ENCODED_INTERNAL_LEN: usize = encoded_len(DECODED_INTERNAL_LEN);

/// The latch word lives at the next 8-byte boundary after the encoded node.
#[must_use]
pub const fn latch_offset(encoded: usize) -> usize {
    (encoded + 7) & !7
}

/// Byte offset of the leaf latch word inside a leaf allocation.
pub const LEAF_LATCH_OFFSET: usize = latch_offset(ENCODED_LEAF_LEN);

/// Byte offset of the internal latch word inside an internal allocation.
pub const INTERNAL_LATCH_OFFSET: usize = latch_offset(ENCODED_INTERNAL_LEN);

/// Space reserved for the latch slot at the end of each allocation.
pub const LATCH_SLOT_LEN: usize = 16;

/// Total remote allocation per leaf.
pub const LEAF_ALLOC_LEN: usize = LEAF_LATCH_OFFSET + LATCH_SLOT_LEN;

/// Total remote allocation per internal node.
pub const INTERNAL_ALLOC_LEN: usize = INTERNAL_LATCH_OFFSET + LATCH_SLOT_LEN;

/// Remote byte offset (on memory node 0) of the root pointer array;
/// tree `t` keeps its root entry at `ROOT_OFFSET + t * 8`.
pub const ROOT_OFFSET: u64 = 64 * 1024;

/// Out-of-line data block: rest-of-key length, value length, value.
pub const DATA_BLOCK_LEN: usize = 8 + 8 + INLINE_VAL_LEN;

/// Upper bound on tree height, used to size per-operation path stacks.
pub const MAX_TREE_HEIGHT: usize = 16;

/// Hard budget for any retry loop before it is declared a failure.
pub const MAX_RETRY: usize = 10_000_000;

/// Buckets in the local lock table.
pub const LOCAL_LOCK_N: usize = 4096;

/// Default cap for greedily coalesced range-scan reads, in leaf entries.
pub const MAX_LEAF_ENTRIES_PER_IO: usize = ENCODED_LEAF_LEN / 2 / LEAF_ENTRY_LEN;

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn wire_sizes() {
        assert_eq!(19, LEAF_ENTRY_LEN);
        assert_eq!(26, SCATTERED_META_LEN);
        assert_eq!(178, GROUP_LEN);
        assert_eq!(1424, DECODED_LEAF_LEN);
        assert_eq!(1446, ENCODED_LEAF_LEN);
        assert_eq!(1448, LEAF_LATCH_OFFSET);

        assert_eq!(43, INTERNAL_META_LEN);
        assert_eq!(17, INTERNAL_ENTRY_LEN);
        assert_eq!(1131, DECODED_INTERNAL_LEN);
        assert_eq!(1148, ENCODED_INTERNAL_LEN);
        assert_eq!(1152, INTERNAL_LATCH_OFFSET);
    }

    #[test]
    fn encoded_len_small_node_is_identity() {
        assert_eq!(40, encoded_len(40));
        assert_eq!(CACHELINE, encoded_len(CACHELINE));
        assert_eq!(CACHELINE + 2, encoded_len(CACHELINE + 1));
    }
}
