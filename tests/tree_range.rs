mod common;

use dsm_tree::{Config, Key, LEAF_SPAN};
use test_log::test;

#[test]
fn range_is_inclusive_exclusive() -> dsm_tree::Result<()> {
    let tree = common::tree();

    for k in 1..=10u64 {
        tree.insert(Key::from(k), k * 10)?;
    }

    let result = tree.range_query(Key::from(3), Key::from(7))?;
    let keys: Vec<u64> = result.keys().map(|k| u64::from(*k)).collect();
    assert_eq!(vec![3, 4, 5, 6], keys);
    assert_eq!(Some(&30), result.get(&Key::from(3)));
    Ok(())
}

#[test]
fn range_across_leaves() -> dsm_tree::Result<()> {
    let tree = common::tree();
    let count = 3 * LEAF_SPAN as u64;

    for k in 1..=count {
        tree.insert(Key::from(k), k)?;
    }

    let from = LEAF_SPAN as u64 / 2;
    let to = 2 * LEAF_SPAN as u64 + LEAF_SPAN as u64 / 2;
    let result = tree.range_query(Key::from(from), Key::from(to))?;

    assert_eq!((to - from) as usize, result.len());
    for (k, v) in &result {
        assert_eq!(u64::from(*k), *v);
    }
    assert!(result.contains_key(&Key::from(from)));
    assert!(!result.contains_key(&Key::from(to)));
    Ok(())
}

#[test]
fn range_sees_updates() -> dsm_tree::Result<()> {
    let tree = common::tree();

    for k in 1..=100u64 {
        tree.insert(Key::from(k), 1)?;
    }
    for k in 1..=100u64 {
        tree.update(Key::from(k), k + 500)?;
    }

    let result = tree.range_query(Key::from(1), Key::from(101))?;
    assert_eq!(100, result.len());
    for (k, v) in &result {
        assert_eq!(u64::from(*k) + 500, *v);
    }
    Ok(())
}

#[test]
fn empty_and_inverted_ranges() -> dsm_tree::Result<()> {
    let tree = common::tree();
    tree.insert(Key::from(5), 5)?;

    assert!(tree.range_query(Key::from(10), Key::from(20))?.is_empty());
    assert!(tree.range_query(Key::from(20), Key::from(10))?.is_empty());
    assert!(tree.range_query(Key::from(5), Key::from(5))?.is_empty());
    Ok(())
}

#[test]
fn sparse_range_returns_only_present_keys() -> dsm_tree::Result<()> {
    let tree = common::tree();

    for k in (10..=1000u64).step_by(10) {
        tree.insert(Key::from(k), k)?;
    }

    let result = tree.range_query(Key::from(95), Key::from(205))?;
    let keys: Vec<u64> = result.keys().map(|k| u64::from(*k)).collect();
    assert_eq!(vec![100, 110, 120, 130, 140, 150, 160, 170, 180, 190, 200], keys);
    Ok(())
}

#[test]
fn range_without_greedy_coalescing() -> dsm_tree::Result<()> {
    let tree = common::tree_with(Config::new().greedy_range(false));
    let count = 2 * LEAF_SPAN as u64;

    for k in 1..=count {
        tree.insert(Key::from(k), k)?;
    }
    let result = tree.range_query(Key::from(10), Key::from(count - 10))?;
    assert_eq!((count - 20) as usize, result.len());
    Ok(())
}

#[test]
fn scan_round_trips_stay_bounded() -> dsm_tree::Result<()> {
    let (tree, _, pool) = common::two_clients();
    let count = 3 * LEAF_SPAN as u64;

    for k in 1..=count {
        tree.insert(Key::from(k), k)?;
    }

    let before = pool.read_ops();
    let result = tree.range_query(Key::from(1), Key::from(count + 1))?;
    let spent = pool.read_ops() - before;

    assert_eq!(count as usize, result.len());
    // round-trips scale with planned segments, not with keys
    assert!(
        spent < count / 2,
        "range scan spent {spent} reads for {count} keys"
    );
    Ok(())
}
