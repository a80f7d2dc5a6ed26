mod common;

use dsm_tree::{Config, Key, LEAF_SPAN};
use test_log::test;

#[test]
fn fill_one_leaf_and_split() -> dsm_tree::Result<()> {
    let tree = common::tree();
    let count = LEAF_SPAN as u64 + 1;

    for k in 1..=count {
        tree.insert(Key::from(k), k)?;
    }

    // the hopscotch leaf must have split at least once by now
    assert_eq!(2, tree.height()?);
    assert!(tree.statistics().leaf_splits >= 1);

    for k in 1..=count {
        assert_eq!(Some(k), tree.search(Key::from(k))?, "key {k} lost");
    }
    assert_eq!(None, tree.search(Key::from(count + 1))?);
    Ok(())
}

#[test]
fn many_splits_keep_all_keys_reachable() -> dsm_tree::Result<()> {
    let tree = common::tree();
    let count = 20 * LEAF_SPAN as u64;

    for k in 1..=count {
        tree.insert(Key::from(k), k * 7)?;
    }
    for k in 1..=count {
        assert_eq!(Some(k * 7), tree.search(Key::from(k))?, "key {k} lost");
    }
    Ok(())
}

#[test]
fn descending_inserts_split_correctly() -> dsm_tree::Result<()> {
    let tree = common::tree();
    let count = 8 * LEAF_SPAN as u64;

    for k in (1..=count).rev() {
        tree.insert(Key::from(k), k)?;
    }
    for k in 1..=count {
        assert_eq!(Some(k), tree.search(Key::from(k))?, "key {k} lost");
    }
    Ok(())
}

#[test]
fn sparse_keys_survive_splits() -> dsm_tree::Result<()> {
    let tree = common::tree();

    // keys scattered across the whole 64-bit space
    let keys: Vec<u64> = (1..=600u64).map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15)).collect();
    for (i, &k) in keys.iter().enumerate() {
        tree.insert(Key::from(k), i as u64)?;
    }
    for (i, &k) in keys.iter().enumerate() {
        assert_eq!(Some(i as u64), tree.search(Key::from(k))?, "key {k:#x} lost");
    }
    Ok(())
}

#[test]
fn stale_cache_after_foreign_split_is_transparent() -> dsm_tree::Result<()> {
    let (writer, reader, _pool) = common::two_clients();

    // warm the reader's tree cache on a small tree
    for k in 1..=8u64 {
        writer.insert(Key::from(k), k)?;
    }
    for k in 1..=8u64 {
        assert_eq!(Some(k), reader.search(Key::from(k))?);
    }

    // the writer now splits leaves the reader has cached pointers into
    for k in 9..=(4 * LEAF_SPAN as u64) {
        writer.insert(Key::from(k), k)?;
    }

    // the reader must find every key, re-traversing where its cache is
    // stale, without surfacing an error
    for k in 1..=(4 * LEAF_SPAN as u64) {
        assert_eq!(Some(k), reader.search(Key::from(k))?, "key {k} lost");
    }
    Ok(())
}

#[test]
fn caching_every_level_keeps_lookups_correct() -> dsm_tree::Result<()> {
    let tree = common::tree_with(Config::new().cache_all_levels(true));
    let count = 10 * LEAF_SPAN as u64;

    for k in 1..=count {
        tree.insert(Key::from(k), k + 3)?;
    }
    for k in 1..=count {
        assert_eq!(Some(k + 3), tree.search(Key::from(k))?, "key {k} lost");
    }
    Ok(())
}

#[test]
fn update_after_splits_hits_the_right_leaf() -> dsm_tree::Result<()> {
    let tree = common::tree();
    let count = 6 * LEAF_SPAN as u64;

    for k in 1..=count {
        tree.insert(Key::from(k), 1)?;
    }
    for k in 1..=count {
        tree.update(Key::from(k), k + 1_000_000)?;
    }
    for k in 1..=count {
        assert_eq!(Some(k + 1_000_000), tree.search(Key::from(k))?);
    }
    Ok(())
}
