//! Test entry size limits.

use crate::e2e_tests::helpers::{TestStore, all_entries, inconsistencies};
use crate::error::TreeError;
use crate::layout::{BytesLayout, LongLayout};
use crate::page::DEFAULT_PAGE_SIZE;

#[test]
fn test_entry_at_cap_is_stored() {
    let tree = TestStore::new(DEFAULT_PAGE_SIZE).open(BytesLayout);
    let cap = tree.key_value_size_cap();
    assert!(cap > tree.inline_key_value_size_cap());

    let key = b"k".to_vec();
    let value = vec![0xAB; cap - key.len()];
    let mut writer = tree.writer().expect("should open writer");
    writer.put(&key, &value).expect("entry at cap should fit");
    writer.close().expect("should close writer");

    assert_eq!(all_entries(&tree).expect("should seek"), vec![(key, value)]);
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_entry_over_cap_is_rejected() {
    let tree = TestStore::new(DEFAULT_PAGE_SIZE).open(BytesLayout);
    let cap = tree.key_value_size_cap();

    let mut writer = tree.writer().expect("should open writer");
    writer
        .put(&b"a".to_vec(), &b"1".to_vec())
        .expect("should put small entry");
    let err = writer
        .put(&b"b".to_vec(), &vec![0; cap])
        .expect_err("entry over cap should fail");
    assert!(matches!(err, TreeError::IllegalArgument(_)));
    writer.close().expect("should close writer");

    assert_eq!(
        all_entries(&tree).expect("should seek"),
        vec![(b"a".to_vec(), b"1".to_vec())]
    );
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_key_at_cap_splits_into_offloaded_separators() {
    let tree = TestStore::new(1024).open(BytesLayout);
    let cap = tree.key_value_size_cap();

    let mut writer = tree.writer().expect("should open writer");
    for i in 0..300u16 {
        let mut key = vec![b'x'; cap];
        key[cap - 2..].copy_from_slice(&i.to_be_bytes());
        writer.put(&key, &Vec::new()).expect("should put key at cap");
    }
    writer.close().expect("should close writer");

    let entries = all_entries(&tree).expect("should seek");
    assert_eq!(entries.len(), 300);
    assert!(entries.windows(2).all(|pair| pair[0].0 < pair[1].0));
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_fixed_layout_cap_is_key_plus_value() {
    let tree = TestStore::new(DEFAULT_PAGE_SIZE).open(LongLayout);
    assert_eq!(tree.key_value_size_cap(), 16);
    assert_eq!(tree.inline_key_value_size_cap(), 16);
}
