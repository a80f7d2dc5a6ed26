// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A K.I.S.S. implementation of a B+-tree for disaggregated shared
//! memory.
//!
//! ##### NOTE
//!
//! > This crate only provides the tree engine. It drives every lookup,
//! > insert, update and range scan itself through one-sided remote
//! > reads, writes and compare-and-swaps; the remote fabric (an RDMA
//! > NIC, a CXL pool, ...) is plugged in behind the [`Transport`]
//! > trait, and scheduling of outstanding operations is the embedder's
//! > business.
//!
//! ##### About
//!
//! Tree nodes live in a shared remote memory pool; no server executes
//! tree logic. Consistency comes from self-verifying node layouts (a
//! version byte interleaved in front of every remote cache line),
//! per-node latches taken by CAS, and fence keys with sibling
//! forwarding. Leaves are hopscotch hash tables so a writer touches
//! only the neighborhood of its key, and the leaf header is replicated
//! into every hopscotch group so any segment read is self-describing.
//!
//! Keys are fixed-width byte strings ([`Key`]); values are 64-bit
//! words, optionally spilled out of line (`Config::var_len_values`).
//!
//! # Example usage
//!
//! ```
//! use dsm_tree::{Config, Key, transport::MemoryPool};
//!
//! // one in-process pool standing in for the remote fabric
//! let pool = MemoryPool::new(16 * 1_024 * 1_024);
//! let tree = Config::new().open(pool)?;
//!
//! tree.insert(Key::from(1), 100)?;
//! tree.insert(Key::from(2), 200)?;
//!
//! assert_eq!(Some(100), tree.search(Key::from(1))?);
//! assert_eq!(None, tree.search(Key::from(3))?);
//!
//! // inclusive start, exclusive end
//! let range = tree.range_query(Key::from(1), Key::from(3))?;
//! assert_eq!(2, range.len());
//! #
//! # Ok::<(), dsm_tree::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

mod cache;
mod codec;
mod config;
mod error;
mod key;
mod latch;
mod layout;
mod lock_table;
mod node;
mod remote;
mod stats;
mod tree;
mod value;

pub mod transport;

pub use {
    config::Config,
    error::{Error, Result},
    key::{Key, KEY_LEN},
    remote::{PackedPtr, RemotePtr, RootEntry},
    stats::Statistics,
    transport::{ReadRegion, Transport, WriteRegion},
    tree::Tree,
    value::{DataBlock, DataPointer, Value},
};

#[doc(hidden)]
pub use layout::{LEAF_SPAN, NEIGHBORHOOD};
