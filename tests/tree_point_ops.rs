mod common;

use dsm_tree::{Error, Key};
use test_log::test;

#[test]
fn insert_then_search() -> dsm_tree::Result<()> {
    let tree = common::tree();

    tree.insert(Key::from(1), 100)?;
    tree.insert(Key::from(2), 200)?;

    assert_eq!(Some(100), tree.search(Key::from(1))?);
    assert_eq!(Some(200), tree.search(Key::from(2))?);
    assert_eq!(None, tree.search(Key::from(3))?);
    Ok(())
}

#[test]
fn insert_is_an_upsert() -> dsm_tree::Result<()> {
    let tree = common::tree();

    tree.insert(Key::from(42), 1)?;
    tree.insert(Key::from(42), 2)?;
    assert_eq!(Some(2), tree.search(Key::from(42))?);
    Ok(())
}

#[test]
fn update_existing_key() -> dsm_tree::Result<()> {
    let tree = common::tree();

    tree.insert(Key::from(42), 42)?;
    tree.update(Key::from(42), 99)?;
    assert_eq!(Some(99), tree.search(Key::from(42))?);
    Ok(())
}

#[test]
fn update_missing_key_is_an_error() -> dsm_tree::Result<()> {
    let tree = common::tree();

    tree.insert(Key::from(1), 1)?;
    assert!(matches!(
        tree.update(Key::from(2), 2),
        Err(Error::KeyNotFound)
    ));
    // the failed update left nothing behind
    assert_eq!(None, tree.search(Key::from(2))?);
    Ok(())
}

#[test]
fn fresh_tree_has_height_one() -> dsm_tree::Result<()> {
    let tree = common::tree();
    assert_eq!(1, tree.height()?);
    Ok(())
}

#[test]
fn statistics_count_operations() -> dsm_tree::Result<()> {
    let tree = common::tree();

    tree.insert(Key::from(5), 50)?;
    tree.search(Key::from(5))?;
    tree.search(Key::from(6))?;

    let stats = tree.statistics();
    assert_eq!(1, stats.writes);
    assert_eq!(2, stats.reads);

    tree.clear_statistics();
    assert_eq!(0, tree.statistics().writes);
    Ok(())
}

#[test]
fn values_can_be_zero() -> dsm_tree::Result<()> {
    let tree = common::tree();

    tree.insert(Key::from(7), 0)?;
    assert_eq!(Some(0), tree.search(Key::from(7))?);
    Ok(())
}

#[test]
#[should_panic(expected = "reserved")]
fn null_key_is_rejected() {
    let tree = common::tree();
    let _ = tree.insert(Key::NULL, 1);
}

#[test]
fn transport_write_failures_surface_to_callers() -> dsm_tree::Result<()> {
    let pool = std::sync::Arc::new(common::FaultyPool::new());
    let tree = dsm_tree::Config::new().open(std::sync::Arc::clone(&pool))?;

    tree.insert(Key::from(1), 10)?;

    pool.fail_writes(true);
    assert!(matches!(
        tree.insert(Key::from(2), 20),
        Err(Error::Io(_))
    ));

    // lookups take no latch and issue no writes, so they still work,
    // and the failed insert left nothing visible behind
    assert_eq!(Some(10), tree.search(Key::from(1))?);
    assert_eq!(None, tree.search(Key::from(2))?);
    Ok(())
}
