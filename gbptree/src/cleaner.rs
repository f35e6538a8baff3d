//! Crash generation cleanup.
//!
//! After a crash the tree reopens at its last checkpoint. Everything written
//! in the crashed generation is unreachable from there:
//!
//! | Page range                     | State after the crash               | Cleanup              |
//! |--------------------------------|-------------------------------------|----------------------|
//! | `MIN_TREE_NODE_ID..=last_id`   | Free in the rolled back free-list   | Zero crashed nodes   |
//! | `last_id + 1..page_count`      | Known to nobody                     | Zero, release ids    |
//!
//! `last_id` is the highest id the checkpointed free-list knew about.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::debug;

use crate::error::Result;
use crate::freelist::FreeListIdProvider;
use crate::generation::Generation;
use crate::monitor::CleanupStats;
use crate::node;
use crate::offload;
use crate::page::{MIN_TREE_NODE_ID, PageId, PageType};
use crate::paged_file::PagedFile;

#[derive(Debug)]
pub struct CrashGenerationCleaner {
    paged_file: Arc<PagedFile>,
    freelist: Arc<FreeListIdProvider>,
    generation: Generation,
    persisted_last_id: PageId,
    batch_size: usize,
}

impl CrashGenerationCleaner {
    #[must_use]
    pub fn new(
        paged_file: Arc<PagedFile>,
        freelist: Arc<FreeListIdProvider>,
        generation: Generation,
        persisted_last_id: PageId,
        batch_size: usize,
    ) -> Self {
        Self {
            paged_file,
            freelist,
            generation,
            persisted_last_id,
            batch_size: batch_size.max(1),
        }
    }

    /// Generation the tree resumed in.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Scan and clean in batches. Returns `None` when `cancelled` was set
    /// before the scan finished.
    pub fn clean(&self, cancelled: &AtomicBool) -> Result<Option<CleanupStats>> {
        let started = Instant::now();
        let mut stats = CleanupStats::default();
        let page_count = self.paged_file.page_count()?;
        let Some(highest) = page_count.checked_sub(1) else {
            return Ok(Some(stats));
        };

        let mut from = MIN_TREE_NODE_ID;
        while from <= highest {
            if cancelled.load(Ordering::Acquire) {
                return Ok(None);
            }
            let to = from.saturating_add(self.batch_size as u64 - 1).min(highest);
            for id in from..=to {
                stats.pages_visited += 1;
                let beyond_last_id = id > self.persisted_last_id;
                if self.clean_page(id, beyond_last_id)? {
                    stats.crashed_pages_cleaned += 1;
                }
            }
            debug!(from, to, "Cleaned batch of pages");
            from = to + 1;
        }

        // Released ids must stay within the last id.
        let previous = self.freelist.grow_last_id(highest);
        let (stable, unstable) = (self.generation.stable(), self.generation.unstable());
        for id in previous.max(self.persisted_last_id) + 1..=highest {
            self.freelist.release_id(stable, unstable, id)?;
            stats.pages_released += 1;
        }

        stats.duration = started.elapsed();
        Ok(Some(stats))
    }

    /// Zero a page written in the crashed generation. Pages past the
    /// persisted last id are zeroed whatever they hold.
    fn clean_page(&self, id: PageId, beyond_last_id: bool) -> Result<bool> {
        let crashed = {
            let cursor = self.paged_file.io_shared(id)?;
            match cursor.page_type() {
                Some(PageType::TreeNode) => self.generation.is_crashed(node::generation(&cursor)),
                Some(PageType::Offload) => self.generation.is_crashed(offload::generation(&cursor)),
                Some(PageType::Freelist) => beyond_last_id,
                _ => beyond_last_id && cursor.raw_page_type() != 0,
            }
        };
        if crashed {
            self.paged_file.io_exclusive(id)?.zap();
        }
        Ok(crashed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freelist::NoFreelistMonitor;
    use crate::node::NodeType;

    #[test]
    fn test_clean_zeroes_crashed_nodes_and_releases_tail() {
        let paged_file = Arc::new(PagedFile::in_memory(512));
        let freelist = Arc::new(FreeListIdProvider::new(
            Arc::clone(&paged_file),
            Arc::new(NoFreelistMonitor),
        ));
        freelist
            .initialize_after_creation()
            .expect("should create free-list");

        // Page 4 was checkpointed, pages 5 and 6 written in the crashed
        // generation 3.
        for (id, generation) in [(4, 2), (5, 3), (6, 3)] {
            let mut cursor = paged_file.io_exclusive(id).expect("should pin");
            node::initialize(&mut cursor, NodeType::Leaf, generation);
        }
        let persisted_last_id = 5;
        freelist.grow_last_id(persisted_last_id);

        let resumed = Generation::new(2, 3).after_crash();
        let cleaner = CrashGenerationCleaner::new(
            Arc::clone(&paged_file),
            Arc::clone(&freelist),
            resumed,
            persisted_last_id,
            2,
        );
        let stats = cleaner
            .clean(&AtomicBool::new(false))
            .expect("should clean")
            .expect("should not be cancelled");

        assert_eq!(stats.crashed_pages_cleaned, 2);
        assert_eq!(stats.pages_released, 1);
        assert!(node::is_node(&paged_file.io_shared(4).expect("should pin")));
        assert!(!node::is_node(&paged_file.io_shared(5).expect("should pin")));
        assert!(!node::is_node(&paged_file.io_shared(6).expect("should pin")));
        assert_eq!(freelist.last_id(), 6);
    }

    #[test]
    fn test_clean_stops_when_cancelled() {
        let paged_file = Arc::new(PagedFile::in_memory(512));
        let freelist = Arc::new(FreeListIdProvider::new(
            Arc::clone(&paged_file),
            Arc::new(NoFreelistMonitor),
        ));
        freelist
            .initialize_after_creation()
            .expect("should create free-list");
        let cleaner = CrashGenerationCleaner::new(
            paged_file,
            freelist,
            Generation::initial().after_crash(),
            3,
            1,
        );
        let outcome = cleaner
            .clean(&AtomicBool::new(true))
            .expect("should not fail");
        assert!(outcome.is_none());
    }
}
