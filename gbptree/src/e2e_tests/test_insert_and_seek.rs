//! Inserting, overwriting and removing entries, read back through seekers.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::e2e_tests::helpers::{
    CountingMonitor, SMALL_PAGE_SIZE, TestStore, all_entries, inconsistencies, put_all, small_tree,
};
use crate::error::Result;
use crate::layout::{BytesLayout, LongLayout};
use crate::monitor::Monitor;
use crate::node::NodeType;
use crate::writer::{KeepExisting, MergeResult, Overwrite};

#[test]
fn test_thousand_keys_seek_in_order() {
    let tree = TestStore::new(crate::page::DEFAULT_PAGE_SIZE).open(LongLayout);
    put_all(&tree, (0..1000u64).map(|key| (key, key * 2))).expect("should insert");
    tree.checkpoint().expect("should checkpoint");

    let entries: Vec<(u64, u64)> = tree
        .seek(0, u64::MAX)
        .collect::<Result<_>>()
        .expect("should seek");
    assert_eq!(entries.len(), 1000);
    for (expected, (key, value)) in (0..1000u64).zip(entries) {
        assert_eq!(key, expected);
        assert_eq!(value, key * 2);
    }
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_many_keys_split_leaves() {
    let monitor = Arc::new(CountingMonitor::default());
    let tree = TestStore::new(SMALL_PAGE_SIZE)
        .open_monitored(LongLayout, Arc::clone(&monitor) as Arc<dyn Monitor>);
    // Reverse order so every split happens at the low end.
    put_all(&tree, (0..2000u64).rev().map(|key| (key, key))).expect("should insert");

    assert!(monitor.growths.load(Ordering::Relaxed) >= 2);
    assert_eq!(tree.keys_count().expect("should count"), 2000);
    let root = tree.root();
    let root_type = crate::node::node_type(
        &tree.paged_file().io_shared(root.id).expect("should pin root"),
        root.id,
    )
    .expect("root should be a node");
    assert_eq!(root_type, NodeType::Internal);
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_seek_ranges() {
    let tree = small_tree(LongLayout);
    put_all(&tree, (0..500u64).map(|key| (key * 2, key))).expect("should insert");

    let keys = |from: u64, to: u64| -> Vec<u64> {
        tree.seek(from, to)
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<Result<_>>()
            .expect("should seek")
    };
    assert_eq!(keys(10, 16), vec![10, 12, 14]);
    assert_eq!(keys(11, 17), vec![12, 14, 16]);
    assert_eq!(keys(16, 10), vec![16, 14, 12]);
    assert_eq!(keys(17, 11), vec![16, 14, 12]);
    assert_eq!(keys(10, 10), Vec::<u64>::new());
    assert_eq!(keys(5000, 6000), Vec::<u64>::new());
    assert_eq!(keys(0, 1000).len(), 500);
    assert_eq!(keys(998, 0).len(), 499);
}

#[test]
fn test_overwrite_keeps_one_entry() {
    let tree = small_tree(LongLayout);
    put_all(&tree, (0..300u64).map(|key| (key, 1))).expect("should insert");
    put_all(&tree, (0..300u64).map(|key| (key, 2))).expect("should overwrite");

    let entries = all_entries(&tree).expect("should seek");
    assert_eq!(entries.len(), 300);
    assert!(entries.iter().all(|(_, value)| *value == 2));
}

#[test]
fn test_remove_everything_shrinks_tree() {
    let monitor = Arc::new(CountingMonitor::default());
    let tree = TestStore::new(SMALL_PAGE_SIZE)
        .open_monitored(LongLayout, Arc::clone(&monitor) as Arc<dyn Monitor>);
    put_all(&tree, (0..1000u64).map(|key| (key, key))).expect("should insert");
    tree.checkpoint().expect("should checkpoint");

    let mut writer = tree.writer().expect("should open writer");
    for key in (0..1000u64).step_by(2) {
        assert_eq!(writer.remove(&key).expect("should remove"), Some(key));
    }
    assert_eq!(writer.remove(&0).expect("should remove absent"), None);
    writer.close().expect("should close writer");
    let remaining: Vec<u64> = all_entries(&tree)
        .expect("should seek")
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(remaining, (1..1000u64).step_by(2).collect::<Vec<_>>());
    assert!(inconsistencies(&tree).is_empty());

    let mut writer = tree.writer().expect("should open writer");
    for key in (1..1000u64).step_by(2) {
        assert_eq!(writer.remove(&key).expect("should remove"), Some(key));
    }
    writer.close().expect("should close writer");

    assert_eq!(tree.keys_count().expect("should count"), 0);
    assert!(monitor.shrinks.load(Ordering::Relaxed) >= 1);
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_merge_variants() {
    let tree = small_tree(LongLayout);
    let mut writer = tree.writer().expect("should open writer");
    let add = |_key: &u64, existing: &u64, new: &u64| MergeResult::Replaced(existing + new);

    writer.merge(&1, &10, &add).expect("should insert absent");
    writer.merge(&1, &5, &add).expect("should merge");
    writer.merge_if_exists(&2, &5, &add).expect("should skip absent");
    writer.merge(&3, &7, &Overwrite).expect("should insert");
    writer.merge(&3, &8, &KeepExisting).expect("should keep");
    writer.merge(&4, &1, &Overwrite).expect("should insert");
    writer
        .merge(&4, &1, &|_: &u64, _: &u64, _: &u64| MergeResult::Removed)
        .expect("should remove on merge");
    writer.close().expect("should close writer");

    assert_eq!(
        all_entries(&tree).expect("should seek"),
        vec![(1, 15), (3, 7)]
    );
}

#[test]
fn test_dynamic_keys_with_offloaded_entries() {
    let tree = TestStore::new(4096).open(BytesLayout);
    let inline_cap = tree.inline_key_value_size_cap();
    let big_value = vec![7u8; inline_cap + 10];

    let mut writer = tree.writer().expect("should open writer");
    for i in 0..200u32 {
        let key = format!("key-{i:05}").into_bytes();
        let value = if i % 10 == 0 {
            big_value.clone()
        } else {
            i.to_le_bytes().to_vec()
        };
        writer.put(&key, &value).expect("should put");
    }
    writer.close().expect("should close writer");

    let entries = all_entries(&tree).expect("should seek");
    assert_eq!(entries.len(), 200);
    for (i, (key, value)) in (0..200u32).zip(&entries) {
        assert_eq!(key, &format!("key-{i:05}").into_bytes());
        if i % 10 == 0 {
            assert_eq!(value, &big_value);
        } else {
            assert_eq!(value, &i.to_le_bytes().to_vec());
        }
    }
    assert!(inconsistencies(&tree).is_empty());

    let mut writer = tree.writer().expect("should open writer");
    for i in (0..200u32).step_by(10) {
        let key = format!("key-{i:05}").into_bytes();
        assert_eq!(writer.remove(&key).expect("should remove"), Some(big_value.clone()));
    }
    writer.close().expect("should close writer");
    assert_eq!(tree.keys_count().expect("should count"), 180);
    assert!(inconsistencies(&tree).is_empty());
}
