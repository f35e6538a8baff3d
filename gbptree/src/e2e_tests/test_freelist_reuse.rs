//! Pages released by the tree are reused once a checkpoint made their
//! release stable, so churn does not grow the file without bound.

use crate::e2e_tests::helpers::{inconsistencies, put_all, small_tree};
use crate::error::Result;
use crate::layout::LongLayout;
use crate::tree::GbpTree;

const KEYS: u64 = 1000;

fn fill_and_empty(tree: &GbpTree<LongLayout>) -> Result<()> {
    put_all(tree, (0..KEYS).map(|key| (key, key)))?;
    tree.checkpoint()?;
    let mut writer = tree.writer()?;
    for key in 0..KEYS {
        writer.remove(&key)?;
    }
    writer.close()?;
    tree.checkpoint()
}

#[test]
fn test_churn_reuses_released_pages() {
    let tree = small_tree(LongLayout);
    fill_and_empty(&tree).expect("should run first cycle");
    let after_first_cycle = tree.paged_file().page_count().expect("should count pages");

    for _ in 0..10 {
        fill_and_empty(&tree).expect("should run cycle");
    }
    let after_churn = tree.paged_file().page_count().expect("should count pages");

    // Without reuse every cycle would add about as many pages as the first.
    assert!(
        after_churn <= after_first_cycle * 2,
        "grew from {after_first_cycle} to {after_churn} pages"
    );
    assert_eq!(tree.keys_count().expect("should count"), 0);
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_pages_released_without_checkpoint_are_not_reused() {
    let tree = small_tree(LongLayout);
    put_all(&tree, (0..KEYS).map(|key| (key, key))).expect("should insert");
    tree.checkpoint().expect("should checkpoint");
    let before = tree.paged_file().page_count().expect("should count pages");

    // Every leaf gets a successor, the old versions stay reserved until the
    // next checkpoint.
    put_all(&tree, (0..KEYS).map(|key| (key, key + 1))).expect("should overwrite");
    let after = tree.paged_file().page_count().expect("should count pages");
    assert!(after > before);
    assert!(inconsistencies(&tree).is_empty());
}
