mod common;

use dsm_tree::Key;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeMap;
use test_log::test;

/// Random workload against a reference map: at every quiescent point the
/// visible mapping must equal the model.
#[test]
fn randomized_ops_match_reference_map() -> dsm_tree::Result<()> {
    let tree = common::tree();
    let mut model: BTreeMap<u64, u64> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0xdeed);

    for op in 0..4_000u64 {
        let k = rng.random_range(1..=800u64);
        match rng.random_range(0..10) {
            0..=5 => {
                tree.insert(Key::from(k), op)?;
                model.insert(k, op);
            }
            6..=7 => {
                let result = tree.update(Key::from(k), op);
                if model.contains_key(&k) {
                    result?;
                    model.insert(k, op);
                } else {
                    assert!(result.is_err(), "update invented key {k}");
                }
            }
            _ => {
                assert_eq!(
                    model.get(&k).copied(),
                    tree.search(Key::from(k))?,
                    "lookup mismatch for key {k}"
                );
            }
        }
    }

    // full sweep
    for k in 1..=800u64 {
        assert_eq!(
            model.get(&k).copied(),
            tree.search(Key::from(k))?,
            "final state mismatch for key {k}"
        );
    }

    // a range query over everything must agree with the model exactly
    let scanned = tree.range_query(Key::from(1), Key::from(801))?;
    assert_eq!(model.len(), scanned.len());
    for (k, v) in &model {
        assert_eq!(Some(v), scanned.get(&Key::from(*k)), "range missed key {k}");
    }
    Ok(())
}

#[test]
fn random_subrange_scans_match_reference_map() -> dsm_tree::Result<()> {
    let tree = common::tree();
    let mut model: BTreeMap<u64, u64> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..1_500 {
        let k = rng.random_range(1..=2_000u64);
        tree.insert(Key::from(k), k * 3)?;
        model.insert(k, k * 3);
    }

    for _ in 0..50 {
        let a = rng.random_range(1..=2_000u64);
        let b = rng.random_range(1..=2_001u64);
        let (from, to) = if a <= b { (a, b) } else { (b, a) };

        let scanned = tree.range_query(Key::from(from), Key::from(to))?;
        let expected: Vec<(u64, u64)> = model
            .range(from..to)
            .map(|(k, v)| (*k, *v))
            .collect();

        assert_eq!(expected.len(), scanned.len(), "scan [{from}, {to}) size");
        for (k, v) in expected {
            assert_eq!(Some(&v), scanned.get(&Key::from(k)), "scan missed {k}");
        }
    }
    Ok(())
}
