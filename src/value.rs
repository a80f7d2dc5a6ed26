// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    layout::{DATA_BLOCK_LEN, INLINE_VAL_LEN},
    remote::{PackedPtr, RemotePtr},
};
use byteorder::{ByteOrder, LittleEndian};

/// The fixed 64-bit payload stored inline in a leaf entry.
///
/// With variable-length values enabled, the stored word is a
/// [`DataPointer`] to an out-of-line [`DataBlock`] instead.
pub type Value = u64;

/// `(length, remote pointer)` packed into one value word, pointing at an
/// out-of-line [`DataBlock`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DataPointer {
    /// Length of the referenced data block in bytes.
    pub len: u16,
    /// Packed address of the data block.
    pub ptr: PackedPtr,
}

impl DataPointer {
    /// Builds a pointer to a data block of `len` bytes at `ptr`.
    #[must_use]
    pub fn new(len: u16, ptr: RemotePtr) -> Self {
        Self {
            len,
            ptr: PackedPtr::pack(ptr),
        }
    }

    /// Packs into a value word.
    #[must_use]
    pub fn to_word(self) -> Value {
        (self.ptr.raw() << 16) | u64::from(self.len)
    }

    /// Unpacks from a value word.
    #[must_use]
    pub fn from_word(word: Value) -> Self {
        Self {
            len: (word & 0xffff) as u16,
            ptr: PackedPtr::from_raw(word >> 16),
        }
    }
}

/// Out-of-line value storage. The whole key is kept inline in the leaf,
/// so only the value travels out of line.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DataBlock {
    /// Length of the key suffix stored in the block (always 0 here).
    pub rest_of_key_len: u64,
    /// Length of the stored value in bytes.
    pub value_len: u64,
    /// The value payload.
    pub value: Value,
}

impl DataBlock {
    /// Wraps a value for out-of-line storage.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self {
            rest_of_key_len: 0,
            value_len: INLINE_VAL_LEN as u64,
            value,
        }
    }

    /// Serializes into its fixed-size wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; DATA_BLOCK_LEN] {
        let mut buf = [0u8; DATA_BLOCK_LEN];
        LittleEndian::write_u64(&mut buf[0..8], self.rest_of_key_len);
        LittleEndian::write_u64(&mut buf[8..16], self.value_len);
        LittleEndian::write_u64(&mut buf[16..24], self.value);
        buf
    }

    /// Deserializes from the wire form.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            rest_of_key_len: LittleEndian::read_u64(&buf[0..8]),
            value_len: LittleEndian::read_u64(&buf[8..16]),
            value: LittleEndian::read_u64(&buf[16..24]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn data_pointer_word_roundtrip() {
        let ptr = DataPointer::new(24, RemotePtr::new(0, 0x4200));
        let decoded = DataPointer::from_word(ptr.to_word());
        assert_eq!(24, decoded.len);
        assert_eq!(RemotePtr::new(0, 0x4200), decoded.ptr.unpack());
    }

    #[test]
    fn data_block_roundtrip() {
        let block = DataBlock::new(777);
        assert_eq!(block, DataBlock::decode(&block.encode()));
    }
}
