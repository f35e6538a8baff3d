//! Consistency checks find corrupted pages.

use crate::consistency::Inconsistency;
use crate::e2e_tests::helpers::{SMALL_PAGE_SIZE, TestStore, inconsistencies, put_all, small_tree};
use crate::error::CursorError;
use crate::layout::{BytesLayout, LongLayout};
use crate::node::{self, NodeType};
use crate::page::{DEFAULT_PAGE_SIZE, MIN_TREE_NODE_ID, PageType};

#[test]
fn test_fresh_tree_is_consistent() {
    let tree = small_tree(LongLayout);
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_unknown_node_type_is_reported() {
    let tree = small_tree(LongLayout);
    put_all(&tree, (0..10u64).map(|key| (key, key))).expect("should insert");
    let root = tree.root();
    {
        let mut cursor = tree
            .paged_file()
            .io_exclusive(root.id)
            .expect("should pin root");
        cursor.write_u8(node::BYTE_POS_NODE_TYPE, 9);
    }

    let found = inconsistencies(&tree);
    assert!(found.contains(&Inconsistency::UnknownNodeType {
        page_id: root.id,
        found: 9,
    }));
}

#[test]
fn test_foreign_page_in_tree_is_reported() {
    let tree = small_tree(LongLayout);
    put_all(&tree, (0..500u64).map(|key| (key, key))).expect("should insert");
    let root = tree.root();
    let first_child = {
        let cursor = tree.paged_file().io_shared(root.id).expect("should pin root");
        assert_eq!(
            node::node_type(&cursor, root.id).expect("root should be a node"),
            NodeType::Internal
        );
        tree.nodes_for_test().child_at(&cursor, 0)
    };
    tree.paged_file()
        .io_exclusive(first_child)
        .expect("should pin child")
        .set_page_type(PageType::Freelist);

    let found = inconsistencies(&tree);
    assert!(found.iter().any(|inconsistency| matches!(
        inconsistency,
        Inconsistency::NotATreeNode { page_id, .. } if *page_id == first_child
    )));
}

#[test]
fn test_out_of_order_keys_are_reported() {
    let tree = small_tree(LongLayout);
    put_all(&tree, (0..10u64).map(|key| (key, key))).expect("should insert");
    let root = tree.root();
    {
        let nodes = tree.nodes_for_test();
        let mut cursor = tree
            .paged_file()
            .io_exclusive(root.id)
            .expect("should pin root");
        let mut entries = nodes.leaf_entries(&cursor, root.id).expect("should read leaf");
        entries.swap(2, 3);
        let generation = node::generation(&cursor);
        nodes.write_leaf(&mut cursor, generation, &entries);
    }

    let found = inconsistencies(&tree);
    assert!(found.contains(&Inconsistency::KeyOrder {
        page_id: root.id,
        pos: 3,
    }));
}

#[test]
fn test_negative_offload_size_is_reported() {
    let tree = TestStore::new(DEFAULT_PAGE_SIZE).open(BytesLayout);
    let big_value = vec![1u8; tree.inline_key_value_size_cap() + 1];
    put_all(&tree, [(b"big".to_vec(), big_value)]).expect("should insert");

    let page_count = tree.paged_file().page_count().expect("should count pages");
    let offload_id = (MIN_TREE_NODE_ID..page_count)
        .find(|&id| {
            tree.paged_file()
                .io_shared(id)
                .is_ok_and(|cursor| cursor.page_type() == Some(PageType::Offload))
        })
        .expect("should find offload page");
    tree.paged_file()
        .io_exclusive(offload_id)
        .expect("should pin offload page")
        .write_i32(8, -5);

    let found = inconsistencies(&tree);
    assert!(found.iter().any(|inconsistency| matches!(
        inconsistency,
        Inconsistency::OffloadCorruption {
            offload_id: id,
            error: CursorError::NegativeOffloadSize { .. },
            ..
        } if *id == offload_id
    )));
}

#[test]
fn test_leaked_page_is_reported() {
    let store = TestStore::new(SMALL_PAGE_SIZE);
    let tree = store.open(LongLayout);
    put_all(&tree, (0..100u64).map(|key| (key, key))).expect("should insert");
    tree.checkpoint().expect("should checkpoint");

    // An id handed out and never used or released.
    let leaked = tree.leak_id_for_test();
    let found = inconsistencies(&tree);
    assert_eq!(found, vec![Inconsistency::UnusedPage { page_id: leaked }]);
}
