//! Reopening after a crash rolls back to the last checkpoint and cleans up
//! whatever the crashed generation left behind.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::cleanup::{CleanupStatus, RecoveryCleanupWorkCollector};
use crate::config::TreeConfig;
use crate::e2e_tests::helpers::{
    CountingMonitor, SMALL_PAGE_SIZE, TestStore, all_entries, inconsistencies, put_all,
};
use crate::layout::LongLayout;
use crate::monitor::{Monitor, NoMonitor};
use crate::paged_file::PagedFile;
use crate::tree::GbpTree;

/// Checkpoint keys `0..200`, then write a crashed generation on top of it
/// and let some of its pages reach the store.
fn crash_after_checkpoint(store: &TestStore) -> crate::generation::Generation {
    let tree = store.open(LongLayout);
    put_all(&tree, (0..200u64).map(|key| (key, key))).expect("should insert");
    tree.checkpoint().expect("should checkpoint");

    let mut writer = tree.writer().expect("should open writer");
    for key in 200..400u64 {
        writer.put(&key, &key).expect("should put");
    }
    for key in 0..100u64 {
        writer.remove(&key).expect("should remove");
    }
    writer.close().expect("should close writer");
    tree.paged_file().flush().expect("should flush pages");
    let generation = tree.generation();
    drop(tree);
    generation
}

fn expected_after_crash() -> Vec<(u64, u64)> {
    (0..200u64).map(|key| (key, key)).collect()
}

#[test]
fn test_reopen_after_crash_rolls_back() {
    let store = TestStore::new(SMALL_PAGE_SIZE);
    let crashed = crash_after_checkpoint(&store);

    let monitor = Arc::new(CountingMonitor::default());
    let tree = store.open_monitored(LongLayout, Arc::clone(&monitor) as Arc<dyn Monitor>);
    assert_eq!(monitor.unclean_startups.load(Ordering::Relaxed), 1);
    assert_eq!(monitor.cleanups_registered.load(Ordering::Relaxed), 1);
    assert_eq!(monitor.cleanups_finished.load(Ordering::Relaxed), 1);
    assert!(monitor.crashed_pages_cleaned.load(Ordering::Relaxed) > 0);
    assert_eq!(tree.cleanup_status(), CleanupStatus::Done);
    assert_eq!(tree.generation(), crashed.after_crash());

    assert_eq!(all_entries(&tree).expect("should seek"), expected_after_crash());
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_recovered_tree_keeps_working() {
    let store = TestStore::new(SMALL_PAGE_SIZE);
    crash_after_checkpoint(&store);

    let tree = store.open(LongLayout);
    put_all(&tree, (1000..1300u64).map(|key| (key, key))).expect("should insert");
    tree.checkpoint().expect("should checkpoint");
    assert!(inconsistencies(&tree).is_empty());
    tree.close().expect("should close");

    let monitor = Arc::new(CountingMonitor::default());
    let tree = store.open_monitored(LongLayout, Arc::clone(&monitor) as Arc<dyn Monitor>);
    assert_eq!(monitor.unclean_startups.load(Ordering::Relaxed), 0);
    assert_eq!(monitor.cleanups_registered.load(Ordering::Relaxed), 0);
    let mut expected = expected_after_crash();
    expected.extend((1000..1300u64).map(|key| (key, key)));
    assert_eq!(all_entries(&tree).expect("should seek"), expected);
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_repeated_crash_is_recovered_again() {
    let store = TestStore::new(SMALL_PAGE_SIZE);
    crash_after_checkpoint(&store);

    // Crash again straight after recovery.
    let tree = store.open(LongLayout);
    tree.paged_file().flush().expect("should flush pages");
    drop(tree);

    let monitor = Arc::new(CountingMonitor::default());
    let tree = store.open_monitored(LongLayout, Arc::clone(&monitor) as Arc<dyn Monitor>);
    assert_eq!(monitor.unclean_startups.load(Ordering::Relaxed), 1);
    assert_eq!(all_entries(&tree).expect("should seek"), expected_after_crash());
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_clean_close_needs_no_recovery() {
    let store = TestStore::new(SMALL_PAGE_SIZE);
    let tree = store.open(LongLayout);
    put_all(&tree, (0..50u64).map(|key| (key, key))).expect("should insert");
    tree.checkpoint().expect("should checkpoint");
    let generation = tree.generation();
    tree.close().expect("should close");

    let monitor = Arc::new(CountingMonitor::default());
    let tree = store.open_monitored(LongLayout, Arc::clone(&monitor) as Arc<dyn Monitor>);
    assert_eq!(monitor.unclean_startups.load(Ordering::Relaxed), 0);
    assert_eq!(tree.generation(), generation);
    assert_eq!(tree.keys_count().expect("should count"), 50);
}

#[test]
fn test_unflushed_close_is_treated_as_crash() {
    let store = TestStore::new(SMALL_PAGE_SIZE);
    let tree = store.open(LongLayout);
    put_all(&tree, (0..50u64).map(|key| (key, key))).expect("should insert");
    // Changes since the last checkpoint keep the state unclean.
    tree.close().expect("should close");

    let monitor = Arc::new(CountingMonitor::default());
    let tree = store.open_monitored(LongLayout, Arc::clone(&monitor) as Arc<dyn Monitor>);
    assert_eq!(monitor.unclean_startups.load(Ordering::Relaxed), 1);
    assert_eq!(tree.keys_count().expect("should count"), 0);
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_background_cleanup_gates_writers() {
    let store = TestStore::new(SMALL_PAGE_SIZE);
    crash_after_checkpoint(&store);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("should build runtime");
    let collector = RecoveryCleanupWorkCollector::background(runtime.handle().clone());
    let tree = GbpTree::open(
        store.paged_file(),
        LongLayout,
        TreeConfig::default()
            .with_page_size(SMALL_PAGE_SIZE)
            .with_cleanup_batch_size(4),
        Arc::new(NoMonitor),
        &collector,
    )
    .expect("should open tree");
    collector.start().expect("should schedule cleanup");

    // Blocks until the cleanup job is done.
    let mut writer = tree.writer().expect("should open writer");
    assert_eq!(tree.cleanup_status(), CleanupStatus::Done);
    writer.put(&500, &500).expect("should put");
    writer.close().expect("should close writer");
    collector.stop().expect("should stop collector");

    assert_eq!(tree.keys_count().expect("should count"), 201);
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_ignored_cleanup_blocks_writers() {
    let store = TestStore::new(SMALL_PAGE_SIZE);
    crash_after_checkpoint(&store);

    let collector = RecoveryCleanupWorkCollector::ignore();
    let tree = GbpTree::open(
        store.paged_file(),
        LongLayout,
        TreeConfig::default().with_page_size(SMALL_PAGE_SIZE),
        Arc::new(NoMonitor),
        &collector,
    )
    .expect("should open tree");
    collector.start().expect("should start collector");

    assert_eq!(tree.cleanup_status(), CleanupStatus::Abandoned);
    assert!(tree.writer().is_err());
    assert!(tree.checkpoint().is_err());
    // Readers still see the last checkpoint.
    assert_eq!(all_entries(&tree).expect("should seek"), expected_after_crash());
}

#[test]
fn test_file_backed_tree_survives_reopen() {
    crate::testing::init_tracing();
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("tree.db");

    let paged_file =
        Arc::new(PagedFile::open_file(&path, SMALL_PAGE_SIZE).expect("should open file"));
    let tree = GbpTree::open_with_defaults(paged_file, LongLayout).expect("should create tree");
    put_all(&tree, (0..300u64).map(|key| (key, key + 1))).expect("should insert");
    tree.checkpoint().expect("should checkpoint");
    tree.close().expect("should close");

    let paged_file =
        Arc::new(PagedFile::open_file(&path, SMALL_PAGE_SIZE).expect("should open file"));
    let tree = GbpTree::open_with_defaults(paged_file, LongLayout).expect("should open tree");
    let entries = all_entries(&tree).expect("should seek");
    assert_eq!(entries.len(), 300);
    assert!(entries.iter().all(|(key, value)| *value == key + 1));
    assert!(inconsistencies(&tree).is_empty());
}
