// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::layout::PACKED_ALIGN_BITS;

const NODE_ID_BITS: u32 = 16;
const OFFSET_BITS: u32 = 48;
const PACKED_NODE_ID_BITS: u32 = 8;

/// Address of a byte in the remote memory pool: `(memory node id, offset)`.
///
/// Plain remote addresses imply no ownership; sibling pointers between
/// leaves form cycles and are represented as these opaque words.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePtr {
    node_id: u16,
    offset: u64,
}

impl RemotePtr {
    /// The null address `(0, 0)`.
    pub const NULL: Self = Self {
        node_id: 0,
        offset: 0,
    };

    /// The all-ones address, used as a marker that is never allocated.
    pub const WIDEST: Self = Self {
        node_id: u16::MAX,
        offset: (1 << OFFSET_BITS) - 1,
    };

    /// Creates an address from a memory node id and a byte offset.
    ///
    /// # Panics
    ///
    /// Panics if the offset does not fit into 48 bits.
    #[must_use]
    pub fn new(node_id: u16, offset: u64) -> Self {
        assert!(offset < (1 << OFFSET_BITS), "offset out of range");
        Self { node_id, offset }
    }

    /// Returns the memory node id.
    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Returns the byte offset inside the memory node.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns `true` if this is the null address.
    #[must_use]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Returns the address `delta` bytes further into the same node.
    #[must_use]
    pub fn add(self, delta: u64) -> Self {
        Self {
            node_id: self.node_id,
            offset: self.offset + delta,
        }
    }

    /// Packs into one word: node id in the low 16 bits, offset above.
    #[must_use]
    pub fn to_u64(self) -> u64 {
        (self.offset << NODE_ID_BITS) | u64::from(self.node_id)
    }

    /// Unpacks from the [`RemotePtr::to_u64`] form.
    #[must_use]
    pub fn from_u64(word: u64) -> Self {
        Self {
            node_id: (word & ((1 << NODE_ID_BITS) - 1)) as u16,
            offset: word >> NODE_ID_BITS,
        }
    }
}

impl std::fmt::Debug for RemotePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {:#x}]", self.node_id, self.offset)
    }
}

/// 48-bit packed form of a node-granularity remote address.
///
/// Node allocations are aligned to `1 << PACKED_ALIGN_BITS` bytes, so the
/// low alignment bits of the offset are dropped and the whole address fits
/// into 48 bits, leaving room for ancillary state in the same word
/// ([`RootEntry`], `DataPointer`).
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct PackedPtr(u64);

impl PackedPtr {
    /// Packs a node-aligned remote address.
    #[must_use]
    pub fn pack(ptr: RemotePtr) -> Self {
        debug_assert!(
            ptr.offset() % (1 << PACKED_ALIGN_BITS) == 0,
            "address is not node-aligned"
        );
        let offset = ptr.offset() >> PACKED_ALIGN_BITS;
        Self((offset << PACKED_NODE_ID_BITS) | u64::from(ptr.node_id() & 0xff))
    }

    /// Unpacks back into a full remote address.
    #[must_use]
    pub fn unpack(self) -> RemotePtr {
        let node_id = (self.0 & ((1 << PACKED_NODE_ID_BITS) - 1)) as u16;
        let offset = (self.0 >> PACKED_NODE_ID_BITS) << PACKED_ALIGN_BITS;
        RemotePtr::new(node_id, offset)
    }

    /// Returns the raw 48-bit value.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Wraps a raw 48-bit value.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw & ((1 << (PACKED_NODE_ID_BITS + 40)) - 1))
    }
}

/// The word stored at the well-known root address of a tree:
/// tree height in the low 16 bits, packed root pointer above.
///
/// Replaced only by compare-and-swap; a single CAS on this word
/// serializes root replacements across all clients.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RootEntry {
    /// Tree height: 1 for a single root leaf, incremented on root growth.
    pub height: u16,
    /// Packed address of the root node.
    pub ptr: PackedPtr,
}

impl RootEntry {
    /// Builds a root entry from a height and a node-aligned address.
    #[must_use]
    pub fn new(height: u16, ptr: RemotePtr) -> Self {
        Self {
            height,
            ptr: PackedPtr::pack(ptr),
        }
    }

    /// Packs into the persisted 64-bit word.
    #[must_use]
    pub fn to_u64(self) -> u64 {
        (self.ptr.raw() << 16) | u64::from(self.height)
    }

    /// Unpacks from the persisted 64-bit word.
    #[must_use]
    pub fn from_u64(word: u64) -> Self {
        Self {
            height: (word & 0xffff) as u16,
            ptr: PackedPtr::from_raw(word >> 16),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn remote_ptr_word_roundtrip() {
        let p = RemotePtr::new(3, 0xdead_00);
        assert_eq!(p, RemotePtr::from_u64(p.to_u64()));
        assert_eq!(RemotePtr::NULL, RemotePtr::from_u64(0));
    }

    #[test]
    fn packed_ptr_drops_alignment_bits() {
        let p = RemotePtr::new(1, 0x1234_5600);
        assert_eq!(p, PackedPtr::pack(p).unpack());
    }

    #[test]
    fn root_entry_roundtrip() {
        let e = RootEntry::new(3, RemotePtr::new(0, 0x8000));
        let decoded = RootEntry::from_u64(e.to_u64());
        assert_eq!(3, decoded.height);
        assert_eq!(RemotePtr::new(0, 0x8000), decoded.ptr.unpack());
    }
}
