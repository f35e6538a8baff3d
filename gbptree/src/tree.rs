//! The tree handle.
//!
//! # Lifecycle
//!
//! 1. `open` creates the file layout on an empty paged file, or validates
//!    the meta record of an existing one.
//! 2. The newest valid state page gives root, generation and free-list.
//! 3. An unclean previous shutdown resumes in a fresh unstable generation and
//!    registers a recovery cleanup job.
//! 4. A state marked unclean is written right away, so a crash before the
//!    next checkpoint is detected on the next open.
//! 5. `checkpoint` makes everything written so far durable and starts a new
//!    generation.
//! 6. `close` marks the state clean if nothing changed since the last
//!    checkpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cleaner::CrashGenerationCleaner;
use crate::cleanup::{
    CleanupState, CleanupStatus, RecoveryCleanupWorkCollector, TreeCleanupJob,
};
use crate::config::{TreeConfig, validate_split_ratio};
use crate::consistency::{ConsistencyChecker, ConsistencyVisitor};
use crate::error::{Result, TreeError};
use crate::freelist::{FreeListIdProvider, FreelistMonitor};
use crate::generation::Generation;
use crate::latch::TreeNodeLatchService;
use crate::layout::Layout;
use crate::meta::{Meta, TreeState};
use crate::monitor::{Monitor, NoMonitor};
use crate::node::{self, NodeType, TreeNodeSelector};
use crate::offload::OffloadStore;
use crate::page::{META_PAGE_ID, PageId, STATE_PAGE_A, STATE_PAGE_B};
use crate::paged_file::PagedFile;
use crate::root_catchup::Root;
use crate::seek::Seeker;
use crate::structure_log::{StructureEvent, StructureWriteLog};
use crate::tree_logic::TreeCore;
use crate::writer::Writer;

/// Logs free-list page turnover.
#[derive(Debug, Default, Clone, Copy)]
struct TracingFreelistMonitor;

impl FreelistMonitor for TracingFreelistMonitor {
    fn acquired_freelist_page_id(&self, page_id: PageId) {
        debug!(page_id, "Acquired free-list page");
    }

    fn released_freelist_page_id(&self, page_id: PageId) {
        debug!(page_id, "Released free-list page");
    }
}

/// Where the newest state lives.
#[derive(Debug, Clone, Copy)]
struct StatePointer {
    page_id: PageId,
    counter: u64,
}

/// A generational copy-on-write B+Tree over a [`PagedFile`].
pub struct GbpTree<L: Layout> {
    core: Arc<TreeCore<L>>,
    config: TreeConfig,
    state: Mutex<StatePointer>,
    cleanup_cancel: Arc<AtomicBool>,
}

impl<L: Layout> GbpTree<L> {
    /// Open the tree in `paged_file`, creating it if the file is empty.
    ///
    /// After an unclean shutdown a cleanup job is added to `collector`.
    /// Writers and checkpoints wait until that job has run.
    pub fn open(
        paged_file: Arc<PagedFile>,
        layout: L,
        config: TreeConfig,
        monitor: Arc<dyn Monitor>,
        collector: &RecoveryCleanupWorkCollector,
    ) -> Result<Self> {
        config.validate()?;
        if paged_file.page_size() != config.page_size {
            return Err(TreeError::IllegalArgument(format!(
                "configured page size {} differs from paged file page size {}",
                config.page_size,
                paged_file.page_size()
            )));
        }

        let freelist = Arc::new(FreeListIdProvider::new(
            Arc::clone(&paged_file),
            Arc::new(TracingFreelistMonitor),
        ));
        let nodes = TreeNodeSelector::select(&layout, config.page_size);
        let expected_meta = Meta::for_layout(&layout, config.page_size);

        let empty = paged_file.io_shared(META_PAGE_ID)?.raw_page_type() == 0;
        if empty {
            Self::create(&paged_file, &freelist, &expected_meta)?;
        }
        Meta::read(&*paged_file.io_shared(META_PAGE_ID)?)?.verify(&expected_meta)?;

        let state_a = TreeState::read(&*paged_file.io_shared(STATE_PAGE_A)?);
        let state_b = TreeState::read(&*paged_file.io_shared(STATE_PAGE_B)?);
        let Some((state_page, state)) = TreeState::newest(state_a, state_b) else {
            return Err(TreeError::MetadataMismatch(
                "neither state page holds a valid state".to_string(),
            ));
        };
        freelist.initialize(state.freelist);
        monitor.startup_state(state.clean);

        let generation = if state.clean {
            state.generation
        } else {
            state.generation.after_crash()
        };
        let structure_log = config
            .structure_log
            .as_deref()
            .map(StructureWriteLog::open)
            .transpose()?;
        let cleanup_status = if state.clean {
            CleanupStatus::Done
        } else {
            CleanupStatus::Pending
        };

        let core = Arc::new(TreeCore {
            offload: OffloadStore::new(Arc::clone(&paged_file), Arc::clone(&freelist)),
            layout,
            paged_file: Arc::clone(&paged_file),
            nodes,
            freelist: Arc::clone(&freelist),
            latch_service: Arc::new(TreeNodeLatchService::new()),
            monitor: Arc::clone(&monitor),
            root: RwLock::new(Root {
                id: state.root_id,
                generation: state.root_generation,
            }),
            generation: Arc::new(RwLock::new(generation)),
            structure_lock: RwLock::new(()),
            cleanup: Arc::new(CleanupState::new(cleanup_status)),
            changed: Arc::new(AtomicBool::new(false)),
            structure_log,
        });

        let cleanup_cancel = Arc::new(AtomicBool::new(false));
        if !state.clean {
            warn!(
                previous = %state.generation,
                resumed = %generation,
                "Tree was not shut down cleanly, registering recovery cleanup"
            );
            let cleaner = CrashGenerationCleaner::new(
                Arc::clone(&paged_file),
                Arc::clone(&freelist),
                generation,
                state.freelist.last_id,
                config.cleanup_batch_size,
            );
            collector.add(Box::new(TreeCleanupJob::new(
                cleaner,
                Arc::clone(&core.cleanup),
                Arc::clone(&monitor),
                Arc::clone(&core.changed),
                Arc::clone(&cleanup_cancel),
            )))?;
            monitor.cleanup_registered();
        }

        let dirty = TreeState {
            counter: state.counter + 1,
            generation,
            clean: false,
            ..state
        };
        let dirty_page = TreeState::next_page(state_page);
        dirty.write(&mut *paged_file.io_exclusive(dirty_page)?);
        paged_file.flush_and_force()?;

        info!(
            root = state.root_id,
            generation = %generation,
            clean = state.clean,
            "Opened tree"
        );
        Ok(Self {
            core,
            config,
            state: Mutex::new(StatePointer {
                page_id: dirty_page,
                counter: dirty.counter,
            }),
            cleanup_cancel,
        })
    }

    /// Open with default configuration and monitor, running any recovery
    /// cleanup before returning.
    pub fn open_with_defaults(paged_file: Arc<PagedFile>, layout: L) -> Result<Self> {
        let config = TreeConfig::default().with_page_size(paged_file.page_size());
        let collector = RecoveryCleanupWorkCollector::immediate();
        let tree = Self::open(paged_file, layout, config, Arc::new(NoMonitor), &collector)?;
        collector.start()?;
        Ok(tree)
    }

    /// Lay out a new file: meta page, free-list, an empty root leaf and the
    /// first state.
    fn create(paged_file: &PagedFile, freelist: &FreeListIdProvider, meta: &Meta) -> Result<()> {
        let generation = Generation::initial();
        meta.write(&mut *paged_file.io_exclusive(META_PAGE_ID)?);
        freelist.initialize_after_creation()?;
        let root_id = freelist.acquire_new_id(generation.stable(), generation.unstable())?;
        node::initialize(
            &mut *paged_file.io_exclusive(root_id)?,
            NodeType::Leaf,
            generation.unstable(),
        );
        let freelist_meta = freelist.flush(generation.stable(), generation.unstable())?;
        paged_file.flush()?;

        let state = TreeState {
            counter: 1,
            generation: generation.after_checkpoint(),
            root_id,
            root_generation: generation.unstable(),
            freelist: freelist_meta,
            clean: true,
        };
        state.write(&mut *paged_file.io_exclusive(STATE_PAGE_A)?);
        paged_file.flush_and_force()?;
        info!(root = root_id, page_size = meta.page_size, "Created tree");
        Ok(())
    }

    /// A writer with the configured split ratio. Blocks while a checkpoint
    /// runs or recovery cleanup is pending.
    pub fn writer(&self) -> Result<Writer<L>> {
        self.writer_with_ratio(self.config.split_ratio)
    }

    pub fn writer_with_ratio(&self, split_ratio: f64) -> Result<Writer<L>> {
        validate_split_ratio(split_ratio)?;
        self.core.cleanup.wait_until_done()?;
        Ok(Writer::new(Arc::clone(&self.core), split_ratio))
    }

    /// Entries in `[from, to)` ascending, or in `(to, from]` descending when
    /// `from > to`.
    pub fn seek(&self, from: L::Key, to: L::Key) -> Seeker<'_, L> {
        Seeker::new(&self.core, from, to)
    }

    /// Every entry, ascending.
    pub fn seek_all(&self) -> Seeker<'_, L> {
        Seeker::all(&self.core)
    }

    pub fn keys_count(&self) -> Result<u64> {
        let mut count = 0;
        for entry in Seeker::all(&self.core) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Largest key plus value size the tree accepts.
    #[must_use]
    pub fn key_value_size_cap(&self) -> usize {
        self.core.nodes.key_value_size_cap()
    }

    /// Largest key plus value size stored inside a leaf.
    #[must_use]
    pub fn inline_key_value_size_cap(&self) -> usize {
        self.core.nodes.inline_key_value_size_cap()
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        *self.core.generation.read()
    }

    #[must_use]
    pub fn root(&self) -> Root {
        self.core.root()
    }

    #[must_use]
    pub fn cleanup_status(&self) -> CleanupStatus {
        self.core.cleanup.status()
    }

    /// Whether anything was written since the last checkpoint.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.core.changed.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    #[must_use]
    pub fn paged_file(&self) -> &Arc<PagedFile> {
        &self.core.paged_file
    }

    /// Make all writes so far durable and start a new unstable generation.
    ///
    /// Waits for every open writer to close. Calling this from a thread that
    /// holds an open writer deadlocks.
    pub fn checkpoint(&self) -> Result<()> {
        self.core.cleanup.wait_until_done()?;
        let started = Instant::now();
        let mut generation = self.core.generation.write();
        let previous = *generation;
        debug!(generation = %previous, "Checkpoint started");

        let freelist = self
            .core
            .freelist
            .flush(previous.stable(), previous.unstable())?;
        self.core.paged_file.flush()?;

        let next = previous.after_checkpoint();
        let root = self.core.root();
        self.write_state(TreeState {
            counter: 0,
            generation: next,
            root_id: root.id,
            root_generation: root.generation,
            freelist,
            clean: false,
        })?;
        *generation = next;
        drop(generation);

        self.core.log_event(
            next.unstable(),
            StructureEvent::Checkpoint {
                previous_stable: u64::from(previous.stable()),
                new_stable: u64::from(next.stable()),
                new_unstable: u64::from(next.unstable()),
            },
        );
        self.core.flush_structure_log();
        self.core.changed.store(false, Ordering::Release);

        let duration = started.elapsed();
        self.core
            .monitor
            .checkpoint_completed(previous, next, duration);
        info!(
            previous = %previous,
            current = %next,
            duration_ms = duration.as_millis(),
            "Checkpoint completed"
        );
        Ok(())
    }

    /// Write `state` to the page not holding the newest state and force it.
    /// The counter is assigned here.
    fn write_state(&self, mut state: TreeState) -> Result<()> {
        let mut pointer = self.state.lock();
        state.counter = pointer.counter + 1;
        let page_id = TreeState::next_page(pointer.page_id);
        state.write(&mut *self.core.paged_file.io_exclusive(page_id)?);
        self.core.paged_file.flush_and_force()?;
        *pointer = StatePointer {
            page_id,
            counter: state.counter,
        };
        Ok(())
    }

    /// Check the whole tree and report every problem to `visitor`. Returns
    /// whether the tree is consistent. Waits for open writers to close.
    pub fn consistency_check(&self, visitor: &mut impl ConsistencyVisitor) -> Result<bool> {
        let generation = self.core.generation.write();
        ConsistencyChecker::new(&self.core, *generation, visitor).check()
    }

    /// Close the tree. The state is marked clean only when nothing changed
    /// since the last checkpoint and recovery cleanup completed.
    pub fn close(self) -> Result<()> {
        self.cleanup_cancel.store(true, Ordering::Release);
        let generation = self.core.generation.write();
        let clean = !self.has_changes() && self.core.cleanup.status() == CleanupStatus::Done;
        if clean {
            let root = self.core.root();
            let freelist = self
                .core
                .freelist
                .flush(generation.stable(), generation.unstable())?;
            self.write_state(TreeState {
                counter: 0,
                generation: *generation,
                root_id: root.id,
                root_generation: root.generation,
                freelist,
                clean: true,
            })?;
        } else {
            self.core.paged_file.flush_and_force()?;
        }
        self.core.flush_structure_log();
        info!(clean, generation = %*generation, "Closed tree");
        Ok(())
    }
}

#[cfg(test)]
impl<L: Layout> GbpTree<L> {
    pub fn nodes_for_test(&self) -> crate::node::TreeNodes {
        self.core.nodes
    }

    /// Acquire an id and forget about it.
    #[allow(clippy::expect_used)]
    pub fn leak_id_for_test(&self) -> PageId {
        let generation = self.generation();
        self.core
            .freelist
            .acquire_new_id(generation.stable(), generation.unstable())
            .expect("should acquire id")
    }
}

impl<L: Layout> std::fmt::Debug for GbpTree<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GbpTree")
            .field("core", &self.core)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LongLayout;
    use crate::testing;

    fn open_in_memory() -> GbpTree<LongLayout> {
        testing::init_tracing();
        let paged_file = Arc::new(PagedFile::in_memory(TreeConfig::default().page_size));
        GbpTree::open_with_defaults(paged_file, LongLayout).expect("should create tree")
    }

    #[test]
    fn test_create_starts_empty() {
        let tree = open_in_memory();
        assert_eq!(tree.keys_count().expect("should count"), 0);
        assert_eq!(tree.generation(), Generation::initial().after_checkpoint());
        assert_eq!(tree.cleanup_status(), CleanupStatus::Done);
    }

    #[test]
    fn test_put_then_seek() {
        let tree = open_in_memory();
        let mut writer = tree.writer().expect("should open writer");
        for key in [5u64, 1, 3] {
            writer.put(&key, &(key * 10)).expect("should put");
        }
        writer.close().expect("should close writer");

        let entries: Vec<(u64, u64)> = tree
            .seek(0, 10)
            .collect::<Result<_>>()
            .expect("should seek");
        assert_eq!(entries, vec![(1, 10), (3, 30), (5, 50)]);
        let backwards: Vec<u64> = tree
            .seek(5, 1)
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<Result<_>>()
            .expect("should seek backwards");
        assert_eq!(backwards, vec![5, 3]);
    }

    #[test]
    fn test_checkpoint_advances_generation() {
        let tree = open_in_memory();
        let before = tree.generation();
        let mut writer = tree.writer().expect("should open writer");
        writer.put(&1, &1).expect("should put");
        writer.close().expect("should close writer");
        assert!(tree.has_changes());

        tree.checkpoint().expect("should checkpoint");
        assert_eq!(tree.generation(), before.after_checkpoint());
        assert!(!tree.has_changes());
    }

    #[test]
    fn test_closing_writer_twice_fails() {
        let tree = open_in_memory();
        let mut writer = tree.writer().expect("should open writer");
        writer.close().expect("should close writer");
        let err = writer.close().expect_err("should refuse second close");
        assert!(matches!(err, TreeError::IllegalState(_)));
        let err = writer.put(&1, &1).expect_err("should refuse closed writer");
        assert!(matches!(err, TreeError::IllegalState(_)));
    }

    #[test]
    fn test_page_size_must_match_paged_file() {
        let paged_file = Arc::new(PagedFile::in_memory(4096));
        let err = GbpTree::open(
            paged_file,
            LongLayout,
            TreeConfig::default(),
            Arc::new(NoMonitor),
            &RecoveryCleanupWorkCollector::immediate(),
        )
        .expect_err("should reject page size");
        assert!(matches!(err, TreeError::IllegalArgument(_)));
    }

    #[test]
    fn test_reopen_with_other_layout_fails() {
        let paged_file = Arc::new(PagedFile::in_memory(TreeConfig::default().page_size));
        let tree = GbpTree::open_with_defaults(Arc::clone(&paged_file), LongLayout)
            .expect("should create tree");
        tree.close().expect("should close");
        let err = GbpTree::open_with_defaults(paged_file, crate::layout::BytesLayout)
            .expect_err("should reject layout");
        assert!(matches!(err, TreeError::MetadataMismatch(_)));
    }
}
