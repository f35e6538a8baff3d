//! Structural changes end up in the structure log when one is configured.

use std::sync::Arc;

use crate::cleanup::RecoveryCleanupWorkCollector;
use crate::config::TreeConfig;
use crate::e2e_tests::helpers::{SMALL_PAGE_SIZE, TestStore, put_all};
use crate::layout::LongLayout;
use crate::monitor::NoMonitor;
use crate::page::PageId;
use crate::structure_log::{StructureEvents, StructureWriteLog};
use crate::tree::GbpTree;

#[derive(Default)]
struct Tally {
    splits: usize,
    successors: usize,
    freed: usize,
    growths: Vec<PageId>,
    checkpoints: Vec<(u64, u64)>,
}

impl StructureEvents for Tally {
    fn split(
        &mut self,
        _session_id: u64,
        _timestamp: u64,
        _generation: u64,
        _parent_id: PageId,
        _child_id: PageId,
        _created_child_id: PageId,
    ) {
        self.splits += 1;
    }

    fn create_successor(
        &mut self,
        _session_id: u64,
        _timestamp: u64,
        _generation: u64,
        _parent_id: PageId,
        _old_id: PageId,
        _new_id: PageId,
    ) {
        self.successors += 1;
    }

    fn add_to_freelist(&mut self, _session_id: u64, _timestamp: u64, _generation: u64, _id: PageId) {
        self.freed += 1;
    }

    fn grow_tree(&mut self, _session_id: u64, _timestamp: u64, _generation: u64, created_root_id: PageId) {
        self.growths.push(created_root_id);
    }

    fn checkpoint(
        &mut self,
        _session_id: u64,
        _timestamp: u64,
        _previous_stable: u64,
        new_stable: u64,
        new_unstable: u64,
    ) {
        self.checkpoints.push((new_stable, new_unstable));
    }
}

#[test]
fn test_splits_successors_and_checkpoints_are_logged() {
    let store = TestStore::new(SMALL_PAGE_SIZE);
    let dir = tempfile::tempdir().expect("should create temp dir");
    let log_path = dir.path().join("structure.log");
    let config = TreeConfig::default()
        .with_page_size(SMALL_PAGE_SIZE)
        .with_structure_log(&log_path);
    let collector = RecoveryCleanupWorkCollector::immediate();
    let tree = GbpTree::open(
        store.paged_file(),
        LongLayout,
        config,
        Arc::new(NoMonitor),
        &collector,
    )
    .expect("should open tree");
    collector.start().expect("should start collector");

    put_all(&tree, (0..300u64).map(|key| (key, key))).expect("should insert");
    tree.checkpoint().expect("should checkpoint");
    put_all(&tree, [(0, 1)]).expect("should overwrite");
    tree.checkpoint().expect("should checkpoint");
    let root = tree.root();
    tree.close().expect("should close");

    let mut tally = Tally::default();
    let records = StructureWriteLog::read(&log_path, &mut tally).expect("should read log");
    assert!(records > 0);
    assert!(tally.splits > 0);
    assert!(tally.successors > 0);
    assert!(tally.freed > 0);
    assert!(!tally.growths.is_empty());
    // The overwrite copied the whole path, so the root moved after growing.
    assert_ne!(tally.growths.last().copied(), Some(root.id));
    assert_eq!(tally.checkpoints, vec![(3, 4), (4, 5)]);
}
