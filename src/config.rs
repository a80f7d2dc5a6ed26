// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{transport::Transport, tree::Tree};

/// Tree configuration builder.
///
/// # Examples
///
/// ```
/// # use dsm_tree::{Config, transport::MemoryPool};
/// let pool = MemoryPool::new(16 * 1_024 * 1_024);
/// let tree = Config::new().tree_id(0).open(pool)?;
/// # Ok::<(), dsm_tree::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Which root-pointer slot this tree uses.
    pub(crate) tree_id: u16,

    /// Whether to install a fresh root if none exists. Exactly one
    /// client per pool should bootstrap; the rest attach.
    pub(crate) init_root: bool,

    /// Tree cache capacity in bytes.
    pub(crate) cache_capacity: i64,

    /// Hotspot index cache capacity in bytes; 0 disables speculative
    /// single-entry reads.
    pub(crate) hotspot_capacity: i64,

    /// Store values out of line behind a `(length, pointer)` word.
    pub(crate) var_len_values: bool,

    /// Coalesce nearby range-scan segments into fewer, larger reads.
    pub(crate) greedy_range: bool,

    /// Cache internal nodes at every level, not only level 1. Costs
    /// cache space, but lets splits find parents without re-descending.
    pub(crate) cache_all_levels: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tree_id: 0,
            init_root: true,
            cache_capacity: 64 * 1_024 * 1_024,
            hotspot_capacity: 8 * 1_024 * 1_024,
            var_len_values: false,
            greedy_range: true,
            cache_all_levels: false,
        }
    }
}

impl Config {
    /// Creates a config with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets which root-pointer slot this tree uses.
    #[must_use]
    pub fn tree_id(mut self, id: u16) -> Self {
        self.tree_id = id;
        self
    }

    /// Sets whether this client bootstraps the root (default: `true`).
    #[must_use]
    pub fn init_root(mut self, init: bool) -> Self {
        self.init_root = init;
        self
    }

    /// Sets the tree cache capacity in bytes.
    #[must_use]
    pub fn cache_capacity(mut self, bytes: i64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Sets the hotspot index cache capacity in bytes; 0 disables
    /// speculative single-entry reads.
    #[must_use]
    pub fn hotspot_capacity(mut self, bytes: i64) -> Self {
        self.hotspot_capacity = bytes;
        self
    }

    /// Stores values out of line, lifting the inline width limit.
    #[must_use]
    pub fn var_len_values(mut self, enabled: bool) -> Self {
        self.var_len_values = enabled;
        self
    }

    /// Enables or disables greedy coalescing of range-scan reads.
    #[must_use]
    pub fn greedy_range(mut self, enabled: bool) -> Self {
        self.greedy_range = enabled;
        self
    }

    /// Caches internal nodes at every level instead of only level 1.
    #[must_use]
    pub fn cache_all_levels(mut self, enabled: bool) -> Self {
        self.cache_all_levels = enabled;
        self
    }

    /// Opens a tree over the given transport.
    ///
    /// # Errors
    ///
    /// Returns an error if root bootstrap I/O fails.
    pub fn open<T: Transport>(self, transport: T) -> crate::Result<Tree<T>> {
        Tree::open(self, transport)
    }
}
