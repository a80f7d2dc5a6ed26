// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compute-local caches: the fence-interval tree cache and the hotspot
//! index cache.

pub(crate) mod hotspot;
pub(crate) mod tree_cache;

pub(crate) use hotspot::HotspotCache;
pub(crate) use tree_cache::{CacheHit, TreeCache};
