// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Version codec for plain header-plus-entries nodes.
//!
//! The codec is generic over the node layout descriptor (header size,
//! entry size, span); internal nodes are the only plain layout today,
//! leaves use the group-replicated codec in [`crate::codec::leaf`].

use super::{interleave_versions, span_for, strip_versions};
use crate::{
    codec::SegmentSpan,
    layout::{DECODED_INTERNAL_LEN, INTERNAL_ENTRY_LEN, INTERNAL_META_LEN, INTERNAL_SPAN},
    node::{meta::PackedVersion, InternalEntry, InternalMeta, InternalNode},
};

/// Layout descriptor plus field access for a plain node.
pub(crate) trait PlainLayout: Sized {
    /// Header length in bytes.
    const HEADER_LEN: usize;
    /// Entry length in bytes.
    const ENTRY_LEN: usize;
    /// Number of entries.
    const SPAN: usize;
    /// Total decoded length.
    const DECODED_LEN: usize;

    fn header_version(&self) -> PackedVersion;
    fn entry_version(&self, i: usize) -> PackedVersion;
    fn set_node_version(&mut self, node_version: u8);
    fn write_image(&self, image: &mut [u8]);
    fn read_image(image: &[u8]) -> Self;
}

impl PlainLayout for InternalNode {
    const HEADER_LEN: usize = INTERNAL_META_LEN;
    const ENTRY_LEN: usize = INTERNAL_ENTRY_LEN;
    const SPAN: usize = INTERNAL_SPAN;
    const DECODED_LEN: usize = DECODED_INTERNAL_LEN;

    fn header_version(&self) -> PackedVersion {
        self.meta.version
    }

    fn entry_version(&self, i: usize) -> PackedVersion {
        self.entries[i].version
    }

    fn set_node_version(&mut self, node_version: u8) {
        self.meta.version.node_version = node_version;
        for entry in &mut self.entries {
            entry.version.node_version = node_version;
        }
    }

    fn write_image(&self, image: &mut [u8]) {
        self.meta.encode(&mut image[..Self::HEADER_LEN]);
        for (i, entry) in self.entries.iter().enumerate() {
            let at = Self::HEADER_LEN + i * Self::ENTRY_LEN;
            entry.encode(&mut image[at..at + Self::ENTRY_LEN]);
        }
    }

    fn read_image(image: &[u8]) -> Self {
        let meta = InternalMeta::decode(&image[..Self::HEADER_LEN]);
        let mut entries = [InternalEntry::default(); INTERNAL_SPAN];
        for (i, entry) in entries.iter_mut().enumerate() {
            let at = Self::HEADER_LEN + i * Self::ENTRY_LEN;
            *entry = InternalEntry::decode(&image[at..at + Self::ENTRY_LEN]);
        }
        Self { meta, entries }
    }
}

fn version_at<N: PlainLayout>(node: &N, offset: usize) -> PackedVersion {
    if offset < N::HEADER_LEN {
        node.header_version()
    } else {
        node.entry_version((offset - N::HEADER_LEN) / N::ENTRY_LEN)
    }
}

/// On-wire span of the whole node.
fn node_span<N: PlainLayout>() -> SegmentSpan {
    span_for(0, N::DECODED_LEN)
}

/// Rewrites the whole node: increments the node version in the header
/// and every entry, then applies the version interleave.
pub(crate) fn encode_node<N: PlainLayout>(node: &mut N) -> Vec<u8> {
    let node_version = (node.entry_version(0).node_version + 1) & 0xf;
    node.set_node_version(node_version);

    let mut image = vec![0u8; N::DECODED_LEN];
    node.write_image(&mut image);

    let span = node_span::<N>();
    interleave_versions(&image, 0, span.first_offset, |off| {
        version_at(node, off).to_byte()
    })
}

/// Strips and validates a whole-node read. Returns `None` when any block
/// version disagrees with its covering object or the node versions are
/// not uniform; the caller retries the remote read.
pub(crate) fn decode_node<N: PlainLayout>(raw: &[u8]) -> Option<N> {
    let span = node_span::<N>();
    let (image, blocks) = strip_versions(raw, 0, N::DECODED_LEN, span.first_offset)?;
    let node = N::read_image(&image);

    for (off, version) in blocks {
        if version_at(&node, off).to_byte() != version {
            return None;
        }
    }

    let node_version = node.header_version().node_version;
    (0..N::SPAN).all(|i| node.entry_version(i).node_version == node_version).then_some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key::Key, layout::ENCODED_INTERNAL_LEN, remote::RemotePtr};
    use test_log::test;

    fn sample_node() -> InternalNode {
        let mut node = InternalNode::default();
        node.meta.level = 1;
        node.meta.leftmost = RemotePtr::new(0, 0x4000);
        for i in 0..10u64 {
            node.insert_sorted(&Key::from((i + 1) * 7), RemotePtr::new(0, 0x4100 + i * 0x100));
        }
        node
    }

    #[test]
    fn whole_node_roundtrip_and_version_bump() {
        let mut node = sample_node();
        let raw = encode_node(&mut node);
        assert_eq!(ENCODED_INTERNAL_LEN, raw.len());
        assert_eq!(1, node.meta.version.node_version);

        let decoded: InternalNode = decode_node(&raw).expect("read is consistent");
        assert_eq!(node.meta, decoded.meta);
        assert_eq!(node.entries, decoded.entries);
    }

    #[test]
    fn torn_read_is_detected() {
        let mut node = sample_node();
        let first = encode_node(&mut node);
        let second = encode_node(&mut node);

        // splice the tail of the old write onto the new one
        let mut torn = second;
        torn[800..].copy_from_slice(&first[800..]);
        assert!(decode_node::<InternalNode>(&torn).is_none());
    }

    #[test]
    fn node_version_wraps_in_four_bits() {
        let mut node = sample_node();
        for _ in 0..16 {
            let _ = encode_node(&mut node);
        }
        assert_eq!(0, node.meta.version.node_version);
    }
}
