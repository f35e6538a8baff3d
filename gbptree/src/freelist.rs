//! Page id provider backed by a persisted free-list.
//!
//! Released ids are appended, together with the generation they were released
//! in, to a singly linked chain of free-list pages. Acquisition reads from the
//! oldest end of the chain. An id only comes back once its release generation
//! is stable, so a page that the last checkpoint can still reach is never
//! overwritten.
//!
//! The free-list hosts itself: its pages are ordinary ids drawn from the same
//! space, and a fully consumed page is released back into the list.
//!
//! # Free-list Page Format
//!
//! ```text
//! +---------+----------------------------------------+
//! | 0       | page type (Freelist)                   |
//! | 8-15    | next free-list page id                 |
//! | 16-N    | entries: generation (4) + page id (8)  |
//! +---------+----------------------------------------+
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CursorError, Result};
use crate::generation::Generation;
use crate::page::{MIN_TREE_NODE_ID, NO_PAGE, PageId, PageType};
use crate::paged_file::PagedFile;

/// Bytes before the first entry of a free-list page.
pub const FREELIST_HEADER_SIZE: usize = 16;

const BYTE_POS_NEXT: usize = 8;
const ENTRY_SIZE: usize = 12;

/// Number of entries one free-list page holds.
#[must_use]
pub const fn entries_per_page(page_size: usize) -> usize {
    (page_size - FREELIST_HEADER_SIZE) / ENTRY_SIZE
}

/// Notified when the free-list consumes or frees one of its own pages.
pub trait FreelistMonitor: Send + Sync {
    /// A page was taken to extend the chain.
    fn acquired_freelist_page_id(&self, _page_id: PageId) {}

    /// A fully read page was released.
    fn released_freelist_page_id(&self, _page_id: PageId) {}
}

/// Monitor that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFreelistMonitor;

impl FreelistMonitor for NoFreelistMonitor {}

/// Receives every page and entry of the free-list.
pub trait FreelistVisitor {
    fn begin_freelist_page(&mut self, _page_id: PageId) {}

    fn end_freelist_page(&mut self, _page_id: PageId) {}

    fn freelist_entry(&mut self, _page_id: PageId, _generation: u32, _pos: usize) {}

    /// An id released but not yet written to a free-list page.
    fn freelist_entry_from_release_cache(&mut self, _page_id: PageId) {}
}

/// Bookkeeping persisted in the tree state at checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreelistMetaData {
    pub last_id: PageId,
    pub write_page_id: PageId,
    pub read_page_id: PageId,
    pub write_pos: usize,
    pub read_pos: usize,
}

#[derive(Debug)]
struct FreelistState {
    last_id: PageId,
    write_page_id: PageId,
    read_page_id: PageId,
    write_pos: usize,
    read_pos: usize,
    release_cache: VecDeque<(PageId, u32)>,
}

/// Allocator of page ids with generation-aware reuse.
pub struct FreeListIdProvider {
    paged_file: Arc<PagedFile>,
    entries_per_page: usize,
    state: Mutex<FreelistState>,
    monitor: Arc<dyn FreelistMonitor>,
}

impl FreeListIdProvider {
    /// Create an uninitialized provider. Call [`Self::initialize`] or
    /// [`Self::initialize_after_creation`] before use.
    #[must_use]
    pub fn new(paged_file: Arc<PagedFile>, monitor: Arc<dyn FreelistMonitor>) -> Self {
        let entries_per_page = entries_per_page(paged_file.page_size());
        Self {
            paged_file,
            entries_per_page,
            state: Mutex::new(FreelistState {
                last_id: MIN_TREE_NODE_ID - 1,
                write_page_id: NO_PAGE,
                read_page_id: NO_PAGE,
                write_pos: 0,
                read_pos: 0,
                release_cache: VecDeque::new(),
            }),
            monitor,
        }
    }

    /// Restore bookkeeping read from a tree state.
    pub fn initialize(&self, meta: FreelistMetaData) {
        let mut state = self.state.lock();
        state.last_id = meta.last_id;
        state.write_page_id = meta.write_page_id;
        state.read_page_id = meta.read_page_id;
        state.write_pos = meta.write_pos;
        state.read_pos = meta.read_pos;
        state.release_cache.clear();
    }

    /// Set up an empty free-list in a new file. Its first page is itself the
    /// first allocated id.
    pub fn initialize_after_creation(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.last_id = MIN_TREE_NODE_ID;
        let first = MIN_TREE_NODE_ID;
        self.init_freelist_page(first)?;
        state.write_page_id = first;
        state.read_page_id = first;
        state.write_pos = 0;
        state.read_pos = 0;
        state.release_cache.clear();
        Ok(())
    }

    /// Current bookkeeping, including unflushed positions.
    #[must_use]
    pub fn metadata(&self) -> FreelistMetaData {
        let state = self.state.lock();
        FreelistMetaData {
            last_id: state.last_id,
            write_page_id: state.write_page_id,
            read_page_id: state.read_page_id,
            write_pos: state.write_pos,
            read_pos: state.read_pos,
        }
    }

    /// Highest id ever handed out.
    #[must_use]
    pub fn last_id(&self) -> PageId {
        self.state.lock().last_id
    }

    /// Entries a single free-list page can hold.
    #[must_use]
    pub const fn entries_per_page(&self) -> usize {
        self.entries_per_page
    }

    /// Hand out an id. Reuses the oldest released id whose release generation
    /// is stable, otherwise grows `last_id`. The page is zeroed.
    pub fn acquire_new_id(&self, stable: u32, unstable: u32) -> Result<PageId> {
        let id = {
            let mut state = self.state.lock();
            self.acquire_locked(&mut state, stable, unstable)?
        };
        self.paged_file.io_exclusive(id)?.zap();
        Ok(id)
    }

    /// Give an id back. It becomes reusable once `unstable` is stable.
    pub fn release_id(&self, stable: u32, unstable: u32, id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        state.release_cache.push_back((id, unstable));
        if state.release_cache.len() >= self.entries_per_page {
            self.drain_release_cache(&mut state, stable, unstable)?;
        }
        Ok(())
    }

    /// Write all cached releases to free-list pages and return the
    /// bookkeeping to persist.
    pub fn flush(&self, stable: u32, unstable: u32) -> Result<FreelistMetaData> {
        let mut state = self.state.lock();
        self.drain_release_cache(&mut state, stable, unstable)?;
        Ok(FreelistMetaData {
            last_id: state.last_id,
            write_page_id: state.write_page_id,
            read_page_id: state.read_page_id,
            write_pos: state.write_pos,
            read_pos: state.read_pos,
        })
    }

    /// Raise `last_id` to `last_id` if it is higher. Returns the previous
    /// value.
    pub fn grow_last_id(&self, last_id: PageId) -> PageId {
        let mut state = self.state.lock();
        let previous = state.last_id;
        state.last_id = previous.max(last_id);
        previous
    }

    /// Walk every page and entry, oldest first, then the release cache.
    pub fn visit_freelist(&self, visitor: &mut impl FreelistVisitor) -> Result<()> {
        let state = self.state.lock();
        let mut page_id = state.read_page_id;
        let mut pos = state.read_pos;
        let mut pages_visited: u64 = 0;
        loop {
            let cursor = self.paged_file.io_shared(page_id)?;
            check_freelist_page(page_id, cursor.raw_page_type())?;
            visitor.begin_freelist_page(page_id);
            let end = if page_id == state.write_page_id {
                state.write_pos
            } else {
                self.entries_per_page
            };
            while pos < end {
                let offset = entry_offset(pos);
                let generation = cursor.read_u32(offset);
                let id = cursor.read_u64(offset + 4);
                visitor.freelist_entry(id, generation, pos);
                pos += 1;
            }
            visitor.end_freelist_page(page_id);
            if page_id == state.write_page_id {
                break;
            }
            let next = cursor.read_u64(BYTE_POS_NEXT);
            pages_visited += 1;
            if next == NO_PAGE || pages_visited > state.last_id {
                return Err(CursorError::InvalidNodeSpace {
                    page_id,
                    message: "free-list chain ends before the write page".to_string(),
                }
                .into());
            }
            page_id = next;
            pos = 0;
        }
        for (id, _) in &state.release_cache {
            visitor.freelist_entry_from_release_cache(*id);
        }
        Ok(())
    }

    fn acquire_locked(
        &self,
        state: &mut FreelistState,
        stable: u32,
        unstable: u32,
    ) -> Result<PageId> {
        if let Some(id) = self.take_free_entry(state, stable, unstable)? {
            return Ok(id);
        }
        let current = Generation::new(stable, unstable);
        if let Some(index) = state
            .release_cache
            .iter()
            .position(|(_, generation)| current.is_reusable(*generation))
        {
            if let Some((id, _)) = state.release_cache.remove(index) {
                return Ok(id);
            }
        }
        state.last_id += 1;
        Ok(state.last_id)
    }

    fn take_free_entry(
        &self,
        state: &mut FreelistState,
        stable: u32,
        unstable: u32,
    ) -> Result<Option<PageId>> {
        if state.read_pos == self.entries_per_page && state.read_page_id != state.write_page_id {
            let exhausted = state.read_page_id;
            let next = {
                let cursor = self.paged_file.io_shared(exhausted)?;
                check_freelist_page(exhausted, cursor.raw_page_type())?;
                cursor.read_u64(BYTE_POS_NEXT)
            };
            state.read_page_id = next;
            state.read_pos = 0;
            state.release_cache.push_back((exhausted, unstable));
            self.monitor.released_freelist_page_id(exhausted);
        }

        if state.read_page_id == state.write_page_id && state.read_pos >= state.write_pos {
            return Ok(None);
        }
        if state.read_pos >= self.entries_per_page {
            return Ok(None);
        }

        let cursor = self.paged_file.io_shared(state.read_page_id)?;
        check_freelist_page(state.read_page_id, cursor.raw_page_type())?;
        let offset = entry_offset(state.read_pos);
        let generation = cursor.read_u32(offset);
        if !Generation::new(stable, unstable).is_reusable(generation) {
            return Ok(None);
        }
        let id = cursor.read_u64(offset + 4);
        state.read_pos += 1;
        Ok(Some(id))
    }

    fn drain_release_cache(
        &self,
        state: &mut FreelistState,
        stable: u32,
        unstable: u32,
    ) -> Result<()> {
        while let Some((id, generation)) = state.release_cache.pop_front() {
            if state.write_pos == self.entries_per_page {
                let new_page = self.acquire_locked(state, stable, unstable)?;
                self.init_freelist_page(new_page)?;
                self.paged_file
                    .io_exclusive(state.write_page_id)?
                    .write_u64(BYTE_POS_NEXT, new_page);
                state.write_page_id = new_page;
                state.write_pos = 0;
                self.monitor.acquired_freelist_page_id(new_page);
            }
            let mut cursor = self.paged_file.io_exclusive(state.write_page_id)?;
            let offset = entry_offset(state.write_pos);
            cursor.write_u32(offset, generation);
            cursor.write_u64(offset + 4, id);
            state.write_pos += 1;
        }
        Ok(())
    }

    fn init_freelist_page(&self, page_id: PageId) -> Result<()> {
        let mut cursor = self.paged_file.io_exclusive(page_id)?;
        cursor.zap();
        cursor.set_page_type(PageType::Freelist);
        cursor.write_u64(BYTE_POS_NEXT, NO_PAGE);
        Ok(())
    }
}

const fn entry_offset(pos: usize) -> usize {
    FREELIST_HEADER_SIZE + pos * ENTRY_SIZE
}

fn check_freelist_page(page_id: PageId, found: u8) -> Result<(), CursorError> {
    if found == PageType::Freelist as u8 {
        Ok(())
    } else {
        Err(CursorError::UnexpectedPageType {
            page_id,
            expected: PageType::Freelist,
            found,
        })
    }
}

impl std::fmt::Debug for FreeListIdProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeListIdProvider")
            .field("entries_per_page", &self.entries_per_page)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::MIN_PAGE_SIZE;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingMonitor {
        acquired: AtomicU64,
        released: AtomicU64,
    }

    impl FreelistMonitor for CountingMonitor {
        fn acquired_freelist_page_id(&self, _page_id: PageId) {
            self.acquired.fetch_add(1, Ordering::Relaxed);
        }

        fn released_freelist_page_id(&self, _page_id: PageId) {
            self.released.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[derive(Default)]
    struct CollectingVisitor {
        pages: Vec<PageId>,
        entries: Vec<PageId>,
        cached: Vec<PageId>,
    }

    impl FreelistVisitor for CollectingVisitor {
        fn begin_freelist_page(&mut self, page_id: PageId) {
            self.pages.push(page_id);
        }

        fn freelist_entry(&mut self, page_id: PageId, _generation: u32, _pos: usize) {
            self.entries.push(page_id);
        }

        fn freelist_entry_from_release_cache(&mut self, page_id: PageId) {
            self.cached.push(page_id);
        }
    }

    fn new_provider() -> (Arc<PagedFile>, FreeListIdProvider) {
        let paged_file = Arc::new(PagedFile::in_memory(MIN_PAGE_SIZE));
        let provider = FreeListIdProvider::new(Arc::clone(&paged_file), Arc::new(NoFreelistMonitor));
        provider
            .initialize_after_creation()
            .expect("should initialize");
        (paged_file, provider)
    }

    #[test]
    fn test_release_then_acquire_in_later_generation() {
        let (paged_file, provider) = new_provider();
        paged_file
            .io_exclusive(42)
            .expect("should pin")
            .write_u64(100, 0xFFFF);

        provider.release_id(1, 1, 42).expect("should release");
        let id = provider.acquire_new_id(2, 3).expect("should acquire");

        assert_eq!(id, 42);
        let cursor = paged_file.io_shared(42).expect("should pin");
        assert!(cursor.as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_unstable_release_is_not_reused() {
        let (_paged_file, provider) = new_provider();
        let first = provider.acquire_new_id(1, 2).expect("should acquire");
        provider.release_id(1, 2, first).expect("should release");
        provider.flush(1, 2).expect("should flush");

        let second = provider.acquire_new_id(1, 2).expect("should acquire");
        assert_ne!(first, second);

        // After a checkpoint the released id is safe again.
        let third = provider.acquire_new_id(2, 3).expect("should acquire");
        assert_eq!(third, first);
    }

    #[test]
    fn test_first_page_is_self_hosted() {
        let (_paged_file, provider) = new_provider();
        assert_eq!(provider.last_id(), MIN_TREE_NODE_ID);
        assert_eq!(
            provider.acquire_new_id(1, 2).expect("should acquire"),
            MIN_TREE_NODE_ID + 1
        );
    }

    #[test]
    fn test_chain_grows_and_consumed_pages_return() {
        let paged_file = Arc::new(PagedFile::in_memory(MIN_PAGE_SIZE));
        let monitor = Arc::new(CountingMonitor::default());
        let provider = FreeListIdProvider::new(
            Arc::clone(&paged_file),
            Arc::clone(&monitor) as Arc<dyn FreelistMonitor>,
        );
        provider.initialize_after_creation().expect("should init");
        let per_page = provider.entries_per_page();

        let ids: Vec<PageId> = (0..per_page * 3)
            .map(|_| provider.acquire_new_id(1, 2).expect("should acquire"))
            .collect();
        for id in &ids {
            provider.release_id(1, 2, *id).expect("should release");
        }
        provider.flush(1, 2).expect("should flush");
        assert!(monitor.acquired.load(Ordering::Relaxed) >= 2);

        let mut visitor = CollectingVisitor::default();
        provider.visit_freelist(&mut visitor).expect("should visit");
        assert_eq!(visitor.entries.len(), ids.len());
        assert!(visitor.pages.len() >= 3);
        assert!(visitor.cached.is_empty());

        let reacquired: HashSet<PageId> = (0..ids.len())
            .map(|_| provider.acquire_new_id(2, 3).expect("should acquire"))
            .collect();
        assert_eq!(reacquired, ids.iter().copied().collect());
        assert!(monitor.released.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn test_visit_reports_release_cache() {
        let (_paged_file, provider) = new_provider();
        let id = provider.acquire_new_id(1, 2).expect("should acquire");
        provider.release_id(1, 2, id).expect("should release");

        let mut visitor = CollectingVisitor::default();
        provider.visit_freelist(&mut visitor).expect("should visit");
        assert_eq!(visitor.cached, vec![id]);
        assert!(visitor.entries.is_empty());
        assert_eq!(visitor.pages, vec![MIN_TREE_NODE_ID]);
    }

    #[test]
    fn test_restore_from_metadata() {
        let (paged_file, provider) = new_provider();
        let ids: Vec<PageId> = (0..5)
            .map(|_| provider.acquire_new_id(1, 2).expect("should acquire"))
            .collect();
        for id in &ids {
            provider.release_id(1, 2, *id).expect("should release");
        }
        let meta = provider.flush(1, 2).expect("should flush");

        let restored = FreeListIdProvider::new(paged_file, Arc::new(NoFreelistMonitor));
        restored.initialize(meta);
        assert_eq!(restored.metadata(), meta);
        assert_eq!(restored.acquire_new_id(2, 3).expect("should acquire"), ids[0]);
    }

    #[test]
    fn test_corrupt_freelist_page_is_detected() {
        let (paged_file, provider) = new_provider();
        let id = provider.acquire_new_id(1, 2).expect("should acquire");
        provider.release_id(1, 2, id).expect("should release");
        provider.flush(1, 2).expect("should flush");
        paged_file
            .io_exclusive(MIN_TREE_NODE_ID)
            .expect("should pin")
            .set_page_type(PageType::Offload);

        let err = provider.acquire_new_id(2, 3).expect_err("should detect");
        assert!(err.is_corruption());
    }

    #[test]
    fn test_bounded_under_churn() {
        let (_paged_file, provider) = new_provider();
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut held: Vec<PageId> = Vec::new();
        let mut peak = 0usize;
        let mut stable = 1;

        for _ in 0..200 {
            let unstable = stable + 1;
            let acquire = rng.random_range(0..40);
            for _ in 0..acquire {
                held.push(provider.acquire_new_id(stable, unstable).expect("should acquire"));
            }
            peak = peak.max(held.len());
            let release = rng.random_range(0..=held.len());
            for _ in 0..release {
                let index = rng.random_range(0..held.len());
                let id = held.swap_remove(index);
                provider
                    .release_id(stable, unstable, id)
                    .expect("should release");
            }
            provider.flush(stable, unstable).expect("should flush");
            stable = unstable;
        }

        let allocated = usize::try_from(provider.last_id() - MIN_TREE_NODE_ID + 1)
            .expect("fits in usize");
        let reuse_ratio = peak as f64 / allocated as f64;
        assert!(
            reuse_ratio >= 0.8,
            "peak {peak} held ids needed {allocated} allocated ids"
        );
    }

    #[test]
    fn test_concurrent_acquire_is_unique() {
        let (_paged_file, provider) = new_provider();
        let provider = Arc::new(provider);
        provider.grow_last_id(400);
        for id in 100..400 {
            provider.release_id(1, 2, id).expect("should release");
        }
        provider.flush(1, 2).expect("should flush");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let provider = Arc::clone(&provider);
                std::thread::spawn(move || {
                    (0..150)
                        .map(|_| provider.acquire_new_id(2, 3).expect("should acquire"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("thread should finish") {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), 600);
    }
}
