//! Common helpers for end-to-end tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::cleanup::RecoveryCleanupWorkCollector;
use crate::config::TreeConfig;
use crate::error::Result;
use crate::generation::Generation;
use crate::layout::Layout;
use crate::monitor::{CleanupStats, Monitor};
use crate::page::PageId;
use crate::paged_file::{MemoryStore, PageStore, PagedFile};
use crate::testing;
use crate::tree::GbpTree;

/// Page size small enough that a few hundred long entries span many leaves.
pub const SMALL_PAGE_SIZE: usize = 512;

/// A page store that outlives the trees opened on it, so a test can drop a
/// tree without closing it and open the same pages again.
pub struct TestStore {
    pub store: Arc<MemoryStore>,
    pub page_size: usize,
}

impl TestStore {
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        testing::init_tracing();
        Self {
            store: Arc::new(MemoryStore::new(page_size)),
            page_size,
        }
    }

    /// A fresh page cache over the shared store. Anything a previous cache
    /// did not flush is gone.
    #[must_use]
    pub fn paged_file(&self) -> Arc<PagedFile> {
        Arc::new(PagedFile::new(Arc::clone(&self.store) as Arc<dyn PageStore>))
    }

    #[allow(clippy::expect_used)]
    pub fn open<L: Layout>(&self, layout: L) -> GbpTree<L> {
        GbpTree::open_with_defaults(self.paged_file(), layout).expect("should open tree")
    }

    /// Open with `monitor` and an immediately started collector.
    #[allow(clippy::expect_used)]
    pub fn open_monitored<L: Layout>(&self, layout: L, monitor: Arc<dyn Monitor>) -> GbpTree<L> {
        let collector = RecoveryCleanupWorkCollector::immediate();
        let config = TreeConfig::default().with_page_size(self.page_size);
        let tree = GbpTree::open(self.paged_file(), layout, config, monitor, &collector)
            .expect("should open tree");
        collector.start().expect("should run cleanup");
        tree
    }
}

/// An in-memory tree with small pages.
#[must_use]
pub fn small_tree<L: Layout>(layout: L) -> GbpTree<L> {
    TestStore::new(SMALL_PAGE_SIZE).open(layout)
}

/// Put every `(key, value)` with one writer.
pub fn put_all<L: Layout>(
    tree: &GbpTree<L>,
    entries: impl IntoIterator<Item = (L::Key, L::Value)>,
) -> Result<()> {
    let mut writer = tree.writer()?;
    for (key, value) in entries {
        writer.put(&key, &value)?;
    }
    writer.close()
}

/// Every entry of the tree in key order.
pub fn all_entries<L: Layout>(tree: &GbpTree<L>) -> Result<Vec<(L::Key, L::Value)>> {
    tree.seek_all().collect()
}

/// Run a consistency check and return the findings.
#[allow(clippy::expect_used)]
pub fn inconsistencies<L: Layout>(tree: &GbpTree<L>) -> Vec<crate::consistency::Inconsistency> {
    let mut found = Vec::new();
    let clean = tree
        .consistency_check(&mut found)
        .expect("should run consistency check");
    assert_eq!(clean, found.is_empty());
    found
}

/// Counts monitor callbacks.
#[derive(Debug, Default)]
pub struct CountingMonitor {
    pub checkpoints: AtomicUsize,
    pub cleanups_registered: AtomicUsize,
    pub cleanups_finished: AtomicUsize,
    pub crashed_pages_cleaned: AtomicU64,
    pub unclean_startups: AtomicUsize,
    pub growths: AtomicUsize,
    pub shrinks: AtomicUsize,
}

impl Monitor for CountingMonitor {
    fn checkpoint_completed(&self, _previous: Generation, _current: Generation, _duration: Duration) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    fn cleanup_registered(&self) {
        self.cleanups_registered.fetch_add(1, Ordering::Relaxed);
    }

    fn cleanup_finished(&self, stats: CleanupStats) {
        self.cleanups_finished.fetch_add(1, Ordering::Relaxed);
        self.crashed_pages_cleaned
            .fetch_add(stats.crashed_pages_cleaned, Ordering::Relaxed);
    }

    fn startup_state(&self, clean: bool) {
        if !clean {
            self.unclean_startups.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn tree_growth(&self, _new_root: PageId) {
        self.growths.fetch_add(1, Ordering::Relaxed);
    }

    fn tree_shrink(&self, _new_root: PageId) {
        self.shrinks.fetch_add(1, Ordering::Relaxed);
    }
}
