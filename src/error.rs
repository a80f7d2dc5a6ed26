// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur in the tree
#[derive(Debug)]
pub enum Error {
    /// Transport (remote memory) error
    Io(std::io::Error),

    /// `update` targeted a key that does not exist
    KeyNotFound,

    /// A retry loop (latch acquire, version re-read) exceeded the hard
    /// retry budget, which indicates a bug or a failed memory node
    RetryLimit,

    /// An on-wire invariant was violated (duplicate separator key,
    /// broken hopscotch neighborhood, irreconcilable metadata replicas)
    Corruption(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DsmTreeError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Tree result
pub type Result<T> = std::result::Result<T, Error>;
