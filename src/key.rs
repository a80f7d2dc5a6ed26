// Copyright (c) 2024-present, dsm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Width of a key in bytes (part of the wire contract)
pub const KEY_LEN: usize = 8;

/// A fixed-width key, ordered lexicographically.
///
/// Big-endian encoded unsigned integers sort numerically, so the
/// `From<u64>` impl is the usual way to build integer keys.
///
/// The all-zero key is reserved as the empty-slot marker and may not be
/// inserted into a tree.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// The reserved all-zero key marking an empty slot.
    pub const NULL: Self = Self([0; KEY_LEN]);

    /// The smallest insertable key.
    pub const MIN: Self = Self([0, 0, 0, 0, 0, 0, 0, 1]);

    /// The ghost upper bound (all `0xff`).
    pub const MAX: Self = Self([0xff; KEY_LEN]);

    /// Wraps raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Returns `true` if this is the empty-slot marker.
    #[must_use]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Returns the key immediately following this one in key order.
    ///
    /// Wraps around at [`Key::MAX`]; callers iterating a bounded range
    /// never observe the wrap.
    #[must_use]
    pub fn successor(self) -> Self {
        Self::from(u64::from(self).wrapping_add(1))
    }
}

impl From<u64> for Key {
    fn from(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

impl From<Key> for u64 {
    fn from(key: Key) -> Self {
        Self::from_be_bytes(key.0)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u64::from(*self))
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", u64::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn key_order_matches_integer_order() {
        let a = Key::from(1);
        let b = Key::from(256);
        let c = Key::from(u64::MAX);
        assert!(a < b);
        assert!(b < c);
        assert!(Key::NULL < Key::MIN);
        assert!(c == Key::MAX);
    }

    #[test]
    fn key_successor() {
        assert_eq!(Key::from(2), Key::from(1).successor());
        assert_eq!(Key::MIN, Key::NULL.successor());
        assert_eq!(Key::NULL, Key::MAX.successor());
    }
}
