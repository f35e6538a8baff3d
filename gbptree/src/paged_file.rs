//! Paged file: a page cache over a byte store.
//!
//! The tree never keeps page contents around between accesses. Every access
//! pins a frame through [`PagedFile::io_shared`] or [`PagedFile::io_exclusive`]
//! and the pin holds the frame's read or write lock until the cursor drops.
//!
//! Frames stay cached until the file is dropped. Dirty frames only reach the
//! store on [`PagedFile::flush`], so dropping a `PagedFile` without flushing
//! behaves like a process crash: the store keeps whatever was flushed last.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::page::{Page, PageId};

/// Backing storage for a paged file.
pub trait PageStore: Send + Sync + std::fmt::Debug {
    /// Page size this store was created with.
    fn page_size(&self) -> usize;

    /// Read one page into `buf`. Pages never written read as zeroes and
    /// return `Ok(false)`.
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<bool, PagedFileError>;

    /// Write one page.
    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<(), PagedFileError>;

    /// Number of pages up to and including the highest page ever written.
    fn page_count(&self) -> Result<u64, PagedFileError>;

    /// Make previous writes durable.
    fn sync(&self) -> Result<(), PagedFileError>;
}

/// A page store backed by a file, using positioned reads and writes.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    page_size: usize,
}

impl FileStore {
    /// Create a new store file. Fails if the file already exists.
    pub fn create(path: &Path, page_size: usize) -> Result<Self, PagedFileError> {
        if path.exists() {
            return Err(PagedFileError::AlreadyExists(path.to_path_buf()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(PagedFileError::Io)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
        })
    }

    /// Open an existing store file, or create it if missing.
    pub fn open(path: &Path, page_size: usize) -> Result<Self, PagedFileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(PagedFileError::Io)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, page_id: PageId) -> u64 {
        page_id * self.page_size as u64
    }

    fn check_len(&self, len: usize) -> Result<(), PagedFileError> {
        if len == self.page_size {
            Ok(())
        } else {
            Err(PagedFileError::PageSizeMismatch {
                expected: self.page_size,
                actual: len,
            })
        }
    }
}

impl PageStore for FileStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    #[cfg(unix)]
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<bool, PagedFileError> {
        self.check_len(buf.len())?;
        let offset = self.offset(page_id);
        let file_len = self.file.metadata().map_err(PagedFileError::Io)?.len();
        if offset + self.page_size as u64 > file_len {
            buf.fill(0);
            return Ok(false);
        }
        self.file
            .read_exact_at(buf, offset)
            .map_err(PagedFileError::Io)?;
        Ok(true)
    }

    #[cfg(unix)]
    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<(), PagedFileError> {
        self.check_len(buf.len())?;
        self.file
            .write_all_at(buf, self.offset(page_id))
            .map_err(PagedFileError::Io)
    }

    fn page_count(&self) -> Result<u64, PagedFileError> {
        let len = self.file.metadata().map_err(PagedFileError::Io)?.len();
        Ok(len / self.page_size as u64)
    }

    fn sync(&self) -> Result<(), PagedFileError> {
        self.file.sync_all().map_err(PagedFileError::Io)
    }
}

/// An in-memory page store.
///
/// Share it through an `Arc` to reopen a tree on the same "disk" after
/// dropping the paged file that sat on top of it.
#[derive(Debug)]
pub struct MemoryStore {
    page_size: usize,
    pages: Mutex<HashMap<PageId, Box<[u8]>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: Mutex::new(HashMap::new()),
        }
    }
}

impl PageStore for MemoryStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<bool, PagedFileError> {
        if buf.len() != self.page_size {
            return Err(PagedFileError::PageSizeMismatch {
                expected: self.page_size,
                actual: buf.len(),
            });
        }
        let pages = self.pages.lock();
        if let Some(stored) = pages.get(&page_id) {
            buf.copy_from_slice(stored);
            Ok(true)
        } else {
            buf.fill(0);
            Ok(false)
        }
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<(), PagedFileError> {
        if buf.len() != self.page_size {
            return Err(PagedFileError::PageSizeMismatch {
                expected: self.page_size,
                actual: buf.len(),
            });
        }
        self.pages
            .lock()
            .insert(page_id, buf.to_vec().into_boxed_slice());
        Ok(())
    }

    fn page_count(&self) -> Result<u64, PagedFileError> {
        Ok(self.pages.lock().keys().max().map_or(0, |max| max + 1))
    }

    fn sync(&self) -> Result<(), PagedFileError> {
        Ok(())
    }
}

/// Counters describing page cache activity.
#[derive(Debug, Default)]
pub struct PageCacheTracer {
    pins: AtomicU64,
    hits: AtomicU64,
    faults: AtomicU64,
    flushes: AtomicU64,
}

/// A point-in-time copy of [`PageCacheTracer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCacheCounters {
    pub pins: u64,
    pub hits: u64,
    pub faults: u64,
    pub flushes: u64,
}

impl PageCacheTracer {
    /// Snapshot all counters.
    #[must_use]
    pub fn counters(&self) -> PageCacheCounters {
        PageCacheCounters {
            pins: self.pins.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

struct Frame {
    page: Arc<RwLock<Page>>,
    dirty: AtomicBool,
}

/// A page cache over a [`PageStore`].
pub struct PagedFile {
    store: Arc<dyn PageStore>,
    page_size: usize,
    frames: Mutex<HashMap<PageId, Arc<Frame>>>,
    tracer: PageCacheTracer,
}

/// A pinned page held under its shared lock.
pub struct SharedCursor {
    page_id: PageId,
    guard: ArcRwLockReadGuard<RawRwLock, Page>,
}

/// A pinned page held under its exclusive lock.
pub struct ExclusiveCursor {
    page_id: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, Page>,
}

impl SharedCursor {
    /// Id of the pinned page.
    #[must_use]
    pub const fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl ExclusiveCursor {
    /// Id of the pinned page.
    #[must_use]
    pub const fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for SharedCursor {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl Deref for ExclusiveCursor {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl DerefMut for ExclusiveCursor {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.guard
    }
}

impl PagedFile {
    /// Create a paged file over a store.
    #[must_use]
    pub fn new(store: Arc<dyn PageStore>) -> Self {
        let page_size = store.page_size();
        Self {
            store,
            page_size,
            frames: Mutex::new(HashMap::new()),
            tracer: PageCacheTracer::default(),
        }
    }

    /// Convenience constructor for a file-backed paged file.
    pub fn open_file(path: &Path, page_size: usize) -> Result<Self, PagedFileError> {
        Ok(Self::new(Arc::new(FileStore::open(path, page_size)?)))
    }

    /// Convenience constructor for a fresh in-memory paged file.
    #[must_use]
    pub fn in_memory(page_size: usize) -> Self {
        Self::new(Arc::new(MemoryStore::new(page_size)))
    }

    /// Page size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Activity counters.
    #[must_use]
    pub const fn tracer(&self) -> &PageCacheTracer {
        &self.tracer
    }

    /// Pin a page for reading.
    pub fn io_shared(&self, page_id: PageId) -> Result<SharedCursor, PagedFileError> {
        let frame = self.pin(page_id)?;
        Ok(SharedCursor {
            page_id,
            guard: frame.page.read_arc(),
        })
    }

    /// Pin a page for writing. The frame is marked dirty.
    pub fn io_exclusive(&self, page_id: PageId) -> Result<ExclusiveCursor, PagedFileError> {
        let frame = self.pin(page_id)?;
        frame.dirty.store(true, Ordering::Release);
        Ok(ExclusiveCursor {
            page_id,
            guard: frame.page.write_arc(),
        })
    }

    fn pin(&self, page_id: PageId) -> Result<Arc<Frame>, PagedFileError> {
        self.tracer.pins.fetch_add(1, Ordering::Relaxed);
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get(&page_id) {
            self.tracer.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(frame));
        }

        self.tracer.faults.fetch_add(1, Ordering::Relaxed);
        let mut page = Page::new(self.page_size);
        self.store.read_page(page_id, page.as_bytes_mut())?;
        let frame = Arc::new(Frame {
            page: Arc::new(RwLock::new(page)),
            dirty: AtomicBool::new(false),
        });
        frames.insert(page_id, Arc::clone(&frame));
        Ok(frame)
    }

    /// Number of pages, counting both the store and frames not yet flushed.
    pub fn page_count(&self) -> Result<u64, PagedFileError> {
        let cached = self
            .frames
            .lock()
            .keys()
            .max()
            .map_or(0, |max| max + 1);
        Ok(cached.max(self.store.page_count()?))
    }

    /// Write every dirty frame to the store.
    pub fn flush(&self) -> Result<(), PagedFileError> {
        let mut dirty: Vec<(PageId, Arc<Frame>)> = self
            .frames
            .lock()
            .iter()
            .filter(|(_, frame)| frame.dirty.load(Ordering::Acquire))
            .map(|(id, frame)| (*id, Arc::clone(frame)))
            .collect();
        dirty.sort_unstable_by_key(|(id, _)| *id);

        for (page_id, frame) in dirty {
            if frame.dirty.swap(false, Ordering::AcqRel) {
                let page = frame.page.read();
                self.store.write_page(page_id, page.as_bytes())?;
            }
        }
        self.tracer.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Make flushed pages durable.
    pub fn force(&self) -> Result<(), PagedFileError> {
        self.store.sync()
    }

    /// Flush then force.
    pub fn flush_and_force(&self) -> Result<(), PagedFileError> {
        self.flush()?;
        self.force()
    }
}

impl std::fmt::Debug for PagedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedFile")
            .field("store", &self.store)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur during paged file operations.
#[derive(Debug)]
pub enum PagedFileError {
    /// I/O error.
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(PathBuf),
    /// Buffer size does not match the store's page size.
    PageSizeMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for PagedFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::PageSizeMismatch { expected, actual } => {
                write!(f, "page size mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for PagedFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AlreadyExists(_) | Self::PageSizeMismatch { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{MIN_PAGE_SIZE, PageType};
    use tempfile::tempdir;

    #[test]
    fn test_unwritten_page_reads_zeroed() {
        let paged = PagedFile::in_memory(MIN_PAGE_SIZE);
        let cursor = paged.io_shared(12).expect("should pin");
        assert!(cursor.as_bytes().iter().all(|b| *b == 0));
        assert_eq!(cursor.page_id(), 12);
    }

    #[test]
    fn test_tracer_counts_hits_and_faults() {
        let paged = PagedFile::in_memory(MIN_PAGE_SIZE);
        drop(paged.io_shared(3).expect("should pin"));
        drop(paged.io_exclusive(3).expect("should pin"));
        drop(paged.io_shared(4).expect("should pin"));

        let counters = paged.tracer().counters();
        assert_eq!(counters.pins, 3);
        assert_eq!(counters.faults, 2);
        assert_eq!(counters.hits, 1);
    }

    #[test]
    fn test_unflushed_writes_are_lost() {
        let store = Arc::new(MemoryStore::new(MIN_PAGE_SIZE));

        let paged = PagedFile::new(Arc::clone(&store) as Arc<dyn PageStore>);
        paged
            .io_exclusive(5)
            .expect("should pin")
            .write_u64(8, 111);
        paged.flush().expect("should flush");
        paged
            .io_exclusive(5)
            .expect("should pin")
            .write_u64(8, 222);
        drop(paged);

        let reopened = PagedFile::new(store);
        assert_eq!(reopened.io_shared(5).expect("should pin").read_u64(8), 111);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempdir().expect("should create temp dir");
        let path = dir.path().join("tree.db");

        {
            let paged = PagedFile::open_file(&path, MIN_PAGE_SIZE).expect("should open");
            let mut cursor = paged.io_exclusive(2).expect("should pin");
            cursor.set_page_type(PageType::Offload);
            cursor.write_bytes(16, b"persisted");
            drop(cursor);
            paged.flush_and_force().expect("should flush");
            assert_eq!(paged.page_count().expect("should count"), 3);
        }

        let paged = PagedFile::open_file(&path, MIN_PAGE_SIZE).expect("should reopen");
        let cursor = paged.io_shared(2).expect("should pin");
        assert_eq!(cursor.page_type(), Some(PageType::Offload));
        assert_eq!(cursor.read_bytes(16, 9), b"persisted");
        // Beyond the end of the file.
        assert!(
            paged
                .io_shared(40)
                .expect("should pin")
                .as_bytes()
                .iter()
                .all(|b| *b == 0)
        );
    }

    #[test]
    fn test_file_store_create_rejects_existing() {
        let dir = tempdir().expect("should create temp dir");
        let path = dir.path().join("tree.db");
        FileStore::create(&path, MIN_PAGE_SIZE).expect("should create");
        let err = FileStore::create(&path, MIN_PAGE_SIZE).expect_err("should exist");
        assert!(matches!(err, PagedFileError::AlreadyExists(_)));
    }

    #[test]
    fn test_store_rejects_wrong_buffer_size() {
        let store = MemoryStore::new(MIN_PAGE_SIZE);
        let err = store
            .write_page(1, &[0u8; 10])
            .expect_err("should reject");
        assert!(matches!(
            err,
            PagedFileError::PageSizeMismatch {
                expected: MIN_PAGE_SIZE,
                actual: 10
            }
        ));
    }
}
