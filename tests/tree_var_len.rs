mod common;

use dsm_tree::{Config, Key, LEAF_SPAN};
use test_log::test;

#[test]
fn out_of_line_values_roundtrip() -> dsm_tree::Result<()> {
    let tree = common::tree_with(Config::new().var_len_values(true));

    for k in 1..=100u64 {
        tree.insert(Key::from(k), k * 1_000)?;
    }
    for k in 1..=100u64 {
        assert_eq!(Some(k * 1_000), tree.search(Key::from(k))?);
    }
    Ok(())
}

#[test]
fn out_of_line_values_follow_updates() -> dsm_tree::Result<()> {
    let tree = common::tree_with(Config::new().var_len_values(true));

    tree.insert(Key::from(5), 1)?;
    tree.update(Key::from(5), 2)?;
    tree.insert(Key::from(5), 3)?;
    assert_eq!(Some(3), tree.search(Key::from(5))?);
    Ok(())
}

#[test]
fn range_chases_value_pointers() -> dsm_tree::Result<()> {
    let tree = common::tree_with(Config::new().var_len_values(true));
    let count = 2 * LEAF_SPAN as u64;

    for k in 1..=count {
        tree.insert(Key::from(k), k + 7)?;
    }

    let result = tree.range_query(Key::from(1), Key::from(count + 1))?;
    assert_eq!(count as usize, result.len());
    for (k, v) in &result {
        assert_eq!(u64::from(*k) + 7, *v);
    }
    Ok(())
}
