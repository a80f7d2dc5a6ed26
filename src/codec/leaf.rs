// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Version codec for the group-replicated (scattered-metadata) leaf
//! layout.
//!
//! A leaf is tiled into `GROUP_COUNT` groups of `NEIGHBORHOOD` entries;
//! each group is prefixed by a replica of the leaf header, so any
//! segment that touches a group boundary carries the header bits it
//! needs. Segment boundaries are object boundaries: a segment starting
//! at a group-aligned slot starts at that group's replica.

use super::{interleave_versions, span_for, strip_versions, SegmentSpan};
use crate::{
    layout::{GROUP_LEN, LEAF_ENTRY_LEN, LEAF_SPAN, NEIGHBORHOOD, SCATTERED_META_LEN},
    node::{LeafEntry, LeafMeta, LeafNode},
};

/// Decoded offset where the segment starting at slot `i` begins
/// (`i == LEAF_SPAN` yields the end of the node).
fn seg_bound(i: usize) -> usize {
    debug_assert!(i <= LEAF_SPAN);
    let group = i / NEIGHBORHOOD;
    if i % NEIGHBORHOOD == 0 {
        group * GROUP_LEN
    } else {
        group * GROUP_LEN + SCATTERED_META_LEN + (i % NEIGHBORHOOD) * LEAF_ENTRY_LEN
    }
}

/// Logical object covering a decoded offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Object {
    Replica(usize),
    Entry(usize),
}

fn object_at(offset: usize) -> Object {
    let group = offset / GROUP_LEN;
    let within = offset % GROUP_LEN;
    if within < SCATTERED_META_LEN {
        Object::Replica(group)
    } else {
        Object::Entry(group * NEIGHBORHOOD + (within - SCATTERED_META_LEN) / LEAF_ENTRY_LEN)
    }
}

/// On-wire coordinates of the segment covering slots
/// `[start, start + count)`. The range may not wrap; callers split a
/// wrapping segment in two.
#[must_use]
pub(crate) fn offset_info(start: usize, count: usize) -> SegmentSpan {
    debug_assert!(start + count <= LEAF_SPAN);
    span_for(seg_bound(start), seg_bound(start + count))
}

/// A validated segment read.
pub(crate) struct SegmentDecode {
    /// Entries for slots `start..start + count`, in slot order.
    pub entries: Vec<LeafEntry>,
    /// The header replica covered by the segment, if any.
    pub meta: Option<LeafMeta>,
    /// The segment's uniform node version.
    pub node_version: u8,
}

/// Strips and validates a segment read covering slots
/// `[start, start + count)`. Returns `None` when any block version
/// disagrees with its covering object, the node versions are not
/// uniform, or covered header replicas disagree; the caller retries.
pub(crate) fn decode_segment(raw: &[u8], start: usize, count: usize) -> Option<SegmentDecode> {
    let d0 = seg_bound(start);
    let d1 = seg_bound(start + count);
    let span = span_for(d0, d1);
    let (image, blocks) = strip_versions(raw, d0, d1 - d0, span.first_offset)?;

    // walk the image, splitting it back into replicas and entries
    let mut entries = Vec::with_capacity(count);
    let mut replicas: Vec<(usize, LeafMeta)> = Vec::new();
    let mut cursor = d0;
    while cursor < d1 {
        let at = cursor - d0;
        if cursor % GROUP_LEN == 0 {
            replicas.push((
                cursor / GROUP_LEN,
                LeafMeta::decode(&image[at..at + SCATTERED_META_LEN]),
            ));
            cursor += SCATTERED_META_LEN;
        } else {
            entries.push(LeafEntry::decode(&image[at..at + LEAF_ENTRY_LEN]));
            cursor += LEAF_ENTRY_LEN;
        }
    }
    debug_assert_eq!(count, entries.len());

    // block-level consistency: each stripped version byte must equal the
    // version of the object covering the block
    for (off, version) in blocks {
        let expected = match object_at(off) {
            Object::Replica(g) => replicas.iter().find(|(rg, _)| *rg == g)?.1.version,
            Object::Entry(i) => entries.get(i.checked_sub(start)?)?.version,
        };
        if expected.to_byte() != version {
            return None;
        }
    }

    // node-level joint consistency
    let node_version = replicas.first().map_or_else(
        || entries.first().map(|e| e.version.node_version),
        |(_, m)| Some(m.version.node_version),
    )?;
    if !entries.iter().all(|e| e.version.node_version == node_version) {
        return None;
    }
    if !replicas.iter().all(|(_, m)| m.version.node_version == node_version) {
        return None;
    }

    // replicas must agree on the header contents
    if let Some((_, first)) = replicas.first() {
        let agree = replicas.iter().all(|(_, m)| {
            m.valid == first.valid && m.sibling == first.sibling && m.fences == first.fences
        });
        if !agree {
            return None;
        }
    }

    Some(SegmentDecode {
        entries,
        meta: replicas.first().map(|(_, m)| *m),
        node_version,
    })
}

fn build_image(leaf: &LeafNode, d0: usize, d1: usize) -> Vec<u8> {
    let mut image = vec![0u8; d1 - d0];
    let mut cursor = d0;
    while cursor < d1 {
        let at = cursor - d0;
        if cursor % GROUP_LEN == 0 {
            leaf.meta.encode(&mut image[at..at + SCATTERED_META_LEN]);
            cursor += SCATTERED_META_LEN;
        } else {
            match object_at(cursor) {
                Object::Entry(i) => {
                    leaf.entries[i].encode(&mut image[at..at + LEAF_ENTRY_LEN]);
                }
                Object::Replica(_) => unreachable!("replica offsets are group-aligned"),
            }
            cursor += LEAF_ENTRY_LEN;
        }
    }
    image
}

fn version_at(leaf: &LeafNode, offset: usize) -> u8 {
    match object_at(offset) {
        Object::Replica(_) => leaf.meta.version.to_byte(),
        Object::Entry(i) => leaf.entries[i].version.to_byte(),
    }
}

/// Rewrites the segment covering `[start, start + count)`: bumps the
/// entry version of every slot in `hopped` that lies in the segment,
/// stamps the current header into every covered replica, and applies
/// the version interleave. Returns the wire span and bytes.
pub(crate) fn encode_segment(
    leaf: &mut LeafNode,
    start: usize,
    count: usize,
    hopped: &[usize],
) -> (SegmentSpan, Vec<u8>) {
    for &slot in hopped {
        if slot >= start && slot < start + count {
            leaf.entries[slot].version.bump_entry();
        }
    }

    let d0 = seg_bound(start);
    let d1 = seg_bound(start + count);
    let span = span_for(d0, d1);
    let image = build_image(leaf, d0, d1);
    let raw = interleave_versions(&image, d0, span.first_offset, |off| version_at(leaf, off));
    (span, raw)
}

/// Rewrites the whole leaf: increments the node version in the header
/// and every entry, then re-encodes.
pub(crate) fn encode_node(leaf: &mut LeafNode) -> Vec<u8> {
    let node_version = (leaf.meta.version.node_version + 1) & 0xf;
    leaf.meta.version.node_version = node_version;
    for entry in &mut leaf.entries {
        entry.version.node_version = node_version;
    }

    let (_, raw) = encode_segment(leaf, 0, LEAF_SPAN, &[]);
    raw
}

/// Strips and validates a whole-leaf read.
pub(crate) fn decode_node(raw: &[u8]) -> Option<LeafNode> {
    let decoded = decode_segment(raw, 0, LEAF_SPAN)?;
    let mut leaf = LeafNode {
        meta: decoded.meta?,
        ..LeafNode::default()
    };
    leaf.entries.copy_from_slice(&decoded.entries);
    Some(leaf)
}
