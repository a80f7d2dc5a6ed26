// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident,)+) => {
        /// Process-wide operation counters, updated with relaxed atomics.
        #[derive(Default)]
        pub(crate) struct Counters {
            $(pub $name: AtomicU64,)+
        }

        impl Counters {
            pub fn snapshot(&self) -> Statistics {
                Statistics {
                    $($name: self.$name.load(Ordering::Relaxed),)+
                }
            }

            pub fn clear(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)+
            }
        }

        /// A point-in-time snapshot of the tree's operation counters.
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
        #[allow(missing_docs)]
        pub struct Statistics {
            $($(#[$doc])* pub $name: u64,)+
        }
    };
}

counters! {
    /// Operations seeded from the tree cache.
    cache_hits,
    /// Operations that had to start from the remote root pointer.
    cache_misses,
    /// Tree cache entries invalidated after failing validation.
    stale_cache,
    /// Latch CAS attempts that found the latch held.
    latch_fails,
    /// Write operations attempted.
    writes,
    /// Writes absorbed by the local combine slot.
    write_handovers,
    /// Read operations attempted.
    reads,
    /// Reads served from another reader's in-flight result.
    read_handovers,
    /// Leaf reads retried after version or hopscotch validation failed.
    leaf_read_retries,
    /// Leaf operations forwarded to a sibling.
    sibling_forwards,
    /// Speculative single-entry reads attempted.
    speculative_reads,
    /// Speculative reads whose entry matched the key.
    speculative_hits,
    /// Hopscotch reads that needed two wire segments.
    read_two_segments,
    /// Segment writes that needed two wire segments.
    write_two_segments,
    /// Leaf splits.
    leaf_splits,
    /// Internal node splits.
    internal_splits,
    /// Root replacements won through the root CAS.
    root_grows,
    /// Range query rounds (batched read submissions).
    range_rounds,
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "cache: {} hits / {} misses / {} stale",
            self.cache_hits, self.cache_misses, self.stale_cache
        )?;
        writeln!(
            f,
            "writes: {} ({} combined), reads: {} ({} delegated)",
            self.writes, self.write_handovers, self.reads, self.read_handovers
        )?;
        writeln!(
            f,
            "leaf: {} read retries, {} sibling forwards, {}/{} speculative hits",
            self.leaf_read_retries,
            self.sibling_forwards,
            self.speculative_hits,
            self.speculative_reads
        )?;
        writeln!(
            f,
            "segments: {} double reads, {} double writes; latch fails: {}",
            self.read_two_segments, self.write_two_segments, self.latch_fails
        )?;
        write!(
            f,
            "splits: {} leaf, {} internal, {} root grows; range rounds: {}",
            self.leaf_splits, self.internal_splits, self.root_grows, self.range_rounds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn snapshot_and_clear() {
        let counters = Counters::default();
        counters.writes.fetch_add(3, Ordering::Relaxed);
        counters.leaf_splits.fetch_add(1, Ordering::Relaxed);

        let snap = counters.snapshot();
        assert_eq!(3, snap.writes);
        assert_eq!(1, snap.leaf_splits);

        counters.clear();
        assert_eq!(Statistics::default(), counters.snapshot());
    }
}
