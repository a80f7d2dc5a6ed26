// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The cache-line version interleave shared by both node layouts.
//!
//! On the wire, the first `CACHELINE` bytes of a node travel verbatim;
//! after that, one version byte precedes every `BLOCK` payload bytes.
//! A reader strips the interleave and checks every stripped byte against
//! the version embedded in the logical object covering that block, which
//! makes a one-sided read self-verifying without any server-side help.

pub mod leaf;
pub mod plain;

use crate::layout::{BLOCK, CACHELINE, VERSION_LEN};

/// Byte coordinates of a segment inside the encoded (on-wire) node.
///
/// This is the contract between the traversal code and the codec; both
/// sides must agree on it exactly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SegmentSpan {
    /// Offset of the segment inside the encoded node.
    pub raw_offset: usize,
    /// On-wire length of the segment.
    pub raw_len: usize,
    /// Bytes at the head of the raw segment that belong to the partial
    /// first block (no interleaved version byte to skip at the head).
    pub first_offset: usize,
}

/// Computes the on-wire span of the decoded byte range `[d0, d1)`.
pub(crate) fn span_for(d0: usize, d1: usize) -> SegmentSpan {
    let seg_len = d1 - d0;
    let dist = d0 as i64 - CACHELINE as i64;

    let (raw_offset, first_offset) = if dist < 0 {
        (d0, (CACHELINE - d0).min(seg_len))
    } else {
        let version_cnt = (dist as usize).div_ceil(BLOCK);
        (
            d0 + version_cnt * VERSION_LEN,
            (CACHELINE + version_cnt * BLOCK - d0).min(seg_len),
        )
    };

    let raw_dist = |decoded: i64| -> i64 {
        if decoded <= 0 {
            decoded
        } else {
            decoded + (decoded as usize).div_ceil(BLOCK) as i64 * VERSION_LEN as i64
        }
    };
    let raw_len =
        (raw_dist(d1 as i64 - CACHELINE as i64) - raw_dist(dist)) as usize;

    SegmentSpan {
        raw_offset,
        raw_len,
        first_offset,
    }
}

/// Strips the version interleave from a raw segment whose decoded image
/// spans `[d0, d0 + seg_len)`. Returns the decoded bytes plus every
/// stripped `(absolute decoded offset of block start, version byte)`
/// pair, or `None` if the raw buffer is too short.
pub(crate) fn strip_versions(
    raw: &[u8],
    d0: usize,
    seg_len: usize,
    first_offset: usize,
) -> Option<(Vec<u8>, Vec<(usize, u8)>)> {
    let mut image = Vec::with_capacity(seg_len);
    let mut blocks = Vec::new();

    image.extend_from_slice(raw.get(..first_offset)?);
    let mut pos_raw = first_offset;
    let mut pos_dec = first_offset;
    while pos_dec < seg_len {
        let version = *raw.get(pos_raw)?;
        pos_raw += VERSION_LEN;
        blocks.push((d0 + pos_dec, version));

        let n = BLOCK.min(seg_len - pos_dec);
        image.extend_from_slice(raw.get(pos_raw..pos_raw + n)?);
        pos_raw += n;
        pos_dec += n;
    }

    Some((image, blocks))
}

/// Re-applies the version interleave over a decoded segment image
/// spanning `[d0, d0 + image.len())`. `version_of` yields the wire byte
/// of the logical object covering an absolute decoded offset.
pub(crate) fn interleave_versions(
    image: &[u8],
    d0: usize,
    first_offset: usize,
    version_of: impl Fn(usize) -> u8,
) -> Vec<u8> {
    let seg_len = image.len();
    let mut raw = Vec::with_capacity(seg_len + seg_len / BLOCK + VERSION_LEN);

    raw.extend_from_slice(&image[..first_offset]);
    let mut pos_dec = first_offset;
    while pos_dec < seg_len {
        raw.push(version_of(d0 + pos_dec));
        let n = BLOCK.min(seg_len - pos_dec);
        raw.extend_from_slice(&image[pos_dec..pos_dec + n]);
        pos_dec += n;
    }

    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn span_inside_first_cacheline() {
        let span = span_for(10, 40);
        assert_eq!(10, span.raw_offset);
        assert_eq!(30, span.raw_len);
        assert_eq!(30, span.first_offset);
    }

    #[test]
    fn span_starting_at_block_boundary_has_no_head() {
        let span = span_for(CACHELINE, CACHELINE + 10);
        assert_eq!(CACHELINE, span.raw_offset);
        assert_eq!(0, span.first_offset);
        assert_eq!(10 + VERSION_LEN, span.raw_len);
    }

    #[test]
    fn strip_inverts_interleave() {
        let image: Vec<u8> = (0..200u8).collect();
        let d0 = 100;
        let span = span_for(d0, d0 + image.len());
        let raw = interleave_versions(&image, d0, span.first_offset, |off| (off % 251) as u8);
        assert_eq!(span.raw_len, raw.len());

        let (decoded, blocks) =
            strip_versions(&raw, d0, image.len(), span.first_offset).expect("enough bytes");
        assert_eq!(image, decoded);
        for (off, version) in blocks {
            assert_eq!((off % 251) as u8, version);
        }
    }
}
