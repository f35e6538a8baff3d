//! Aggregation, ceiling updates and split ratios through a writer.

use crate::e2e_tests::helpers::{all_entries, inconsistencies, put_all, small_tree};
use crate::error::{Result, TreeError};
use crate::layout::LongLayout;
use crate::tree::GbpTree;
use crate::writer::{Aggregation, FirstEntry};

const KEYS: u64 = 2000;

fn tree_with(entries: &[(u64, u64)]) -> GbpTree<LongLayout> {
    let tree = small_tree(LongLayout);
    put_all(&tree, entries.iter().copied()).expect("should insert");
    tree
}

/// Insert `keys` in the given order with `ratio` and return the page count.
fn pages_used(keys: impl Iterator<Item = u64>, ratio: f64) -> Result<u64> {
    let tree = small_tree(LongLayout);
    let mut writer = tree.writer_with_ratio(ratio)?;
    for key in keys {
        writer.put(&key, &key)?;
    }
    writer.close()?;
    assert_eq!(tree.keys_count()?, KEYS);
    assert!(inconsistencies(&tree).is_empty());
    Ok(tree.paged_file().page_count()?)
}

#[test]
fn test_aggregate_folds_first_into_next() {
    let tree = tree_with(&[(10, 10), (20, 20), (30, 31)]);
    let mut writer = tree.writer().expect("should open writer");
    let changed = writer
        .aggregate(&10, &30, |_, first, next| {
            if let Some((_, next)) = next {
                *next += *first;
            }
            Aggregation {
                first: FirstEntry::Consumed,
                next_updated: true,
            }
        })
        .expect("should aggregate");
    writer.close().expect("should close writer");

    assert_eq!(changed, 2);
    assert_eq!(
        all_entries(&tree).expect("should seek"),
        vec![(20, 30), (30, 31)]
    );
}

#[test]
fn test_aggregate_updates_single_entry() {
    let tree = tree_with(&[(10, 10), (20, 20)]);
    let mut writer = tree.writer().expect("should open writer");
    let changed = writer
        .aggregate(&0, &15, |key, first, next| {
            assert_eq!(*key, 10);
            assert!(next.is_none());
            *first = 99;
            Aggregation {
                first: FirstEntry::Updated,
                next_updated: true,
            }
        })
        .expect("should aggregate");
    writer.close().expect("should close writer");

    assert_eq!(changed, 1);
    assert_eq!(
        all_entries(&tree).expect("should seek"),
        vec![(10, 99), (20, 20)]
    );
}

#[test]
fn test_aggregate_without_changes() {
    let tree = tree_with(&[(10, 10), (20, 20)]);
    let mut writer = tree.writer().expect("should open writer");

    let unchanged = writer
        .aggregate(&10, &30, |_, _, _| Aggregation {
            first: FirstEntry::Unchanged,
            next_updated: false,
        })
        .expect("should aggregate");
    assert_eq!(unchanged, 0);

    let empty = writer
        .aggregate(&40, &50, |_, _, _| panic!("empty range has no entries"))
        .expect("should aggregate");
    assert_eq!(empty, 0);

    let reversed = writer
        .aggregate(&20, &10, |_, _, _| panic!("reversed range has no entries"))
        .expect("should aggregate");
    assert_eq!(reversed, 0);
    writer.close().expect("should close writer");

    assert_eq!(
        all_entries(&tree).expect("should seek"),
        vec![(10, 10), (20, 20)]
    );
}

#[test]
fn test_update_ceiling_value() {
    let tree = tree_with(&[(10, 10), (20, 20), (30, 30)]);
    let mut writer = tree.writer().expect("should open writer");

    let found = writer
        .update_ceiling_value(&15, &40, |key, value| {
            assert_eq!(*key, 20);
            Some(value + 1)
        })
        .expect("should update");
    assert!(found);

    let kept = writer
        .update_ceiling_value(&30, &31, |_, _| None)
        .expect("should update");
    assert!(kept);

    let missing = writer
        .update_ceiling_value(&31, &100, |_, _| panic!("nothing at or above 31"))
        .expect("should update");
    assert!(!missing);
    writer.close().expect("should close writer");

    assert_eq!(
        all_entries(&tree).expect("should seek"),
        vec![(10, 10), (20, 21), (30, 30)]
    );
}

#[test]
fn test_keep_all_left_packs_ascending_inserts() {
    let halves = pages_used(0..KEYS, 0.5).expect("should insert");
    let left = pages_used(0..KEYS, 1.0).expect("should insert");
    assert!(left < halves, "ratio 1.0 used {left} pages, 0.5 used {halves}");
}

#[test]
fn test_keep_all_right_packs_descending_inserts() {
    let halves = pages_used((0..KEYS).rev(), 0.5).expect("should insert");
    let right = pages_used((0..KEYS).rev(), 0.0).expect("should insert");
    assert!(right < halves, "ratio 0.0 used {right} pages, 0.5 used {halves}");
}

#[test]
fn test_split_ratio_survives_yield() {
    let balanced = pages_used(0..KEYS, 0.5).expect("should insert");

    let tree = small_tree(LongLayout);
    let mut writer = tree.writer().expect("should open writer");
    writer.set_split_ratio(1.0).expect("should accept ratio");
    for key in 0..KEYS {
        writer.put(&key, &key).expect("should put");
        if key % 100 == 99 {
            writer.yield_now().expect("should yield");
        }
    }
    assert!((writer.split_ratio() - 1.0).abs() < f64::EPSILON);
    writer.close().expect("should close writer");

    let packed = tree.paged_file().page_count().expect("should count pages");
    assert!(
        packed < balanced,
        "yielding writer used {packed} pages, 0.5 used {balanced}"
    );
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_invalid_split_ratio_is_rejected() {
    let tree = small_tree(LongLayout);
    let err = tree.writer_with_ratio(-0.1).expect_err("should reject ratio");
    assert!(matches!(err, TreeError::Config(_)));

    let mut writer = tree.writer().expect("should open writer");
    let before = writer.split_ratio();
    let err = writer.set_split_ratio(1.5).expect_err("should reject ratio");
    assert!(matches!(err, TreeError::Config(_)));
    assert!((writer.split_ratio() - before).abs() < f64::EPSILON);

    writer.close().expect("should close writer");
    let err = writer.yield_now().expect_err("closed writer cannot yield");
    assert!(matches!(err, TreeError::IllegalState(_)));
}
