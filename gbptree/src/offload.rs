//! Out-of-line storage for entries too big to keep inline in a node.
//!
//! An offload record takes one page of its own:
//!
//! ```text
//! +---------+----------------------------------------+
//! | 0       | page type (Offload)                    |
//! | 2-5     | generation the record was written in   |
//! | 8-11    | key size (i32)                         |
//! | 12-15   | value size (i32), 0 for key-only       |
//! | 16-     | key bytes, then value bytes            |
//! +---------+----------------------------------------+
//! ```
//!
//! Records are immutable. Replacing an offloaded entry writes a new record
//! and frees the old one.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::sync::Arc;

use crate::error::{CursorError, Result};
use crate::freelist::FreeListIdProvider;
use crate::generation::Generation;
use crate::page::{Page, PageId, PageType};
use crate::paged_file::PagedFile;

const BYTE_POS_GENERATION: usize = 2;
const BYTE_POS_KEY_SIZE: usize = 8;
const BYTE_POS_VALUE_SIZE: usize = 12;
pub const OFFLOAD_HEADER_SIZE: usize = 16;

/// Reads and writes offload records.
#[derive(Debug, Clone)]
pub struct OffloadStore {
    paged_file: Arc<PagedFile>,
    freelist: Arc<FreeListIdProvider>,
}

impl OffloadStore {
    #[must_use]
    pub const fn new(paged_file: Arc<PagedFile>, freelist: Arc<FreeListIdProvider>) -> Self {
        Self {
            paged_file,
            freelist,
        }
    }

    /// Largest key plus value size one record holds.
    #[must_use]
    pub fn max_entry_size(&self) -> usize {
        self.paged_file.page_size() - OFFLOAD_HEADER_SIZE
    }

    /// Store a key and value in a new record and return its id.
    pub fn write_key_value(&self, key: &[u8], value: &[u8], generation: Generation) -> Result<PageId> {
        let id = self
            .freelist
            .acquire_new_id(generation.stable(), generation.unstable())?;
        let mut cursor = self.paged_file.io_exclusive(id)?;
        cursor.set_page_type(PageType::Offload);
        cursor.write_u32(BYTE_POS_GENERATION, generation.unstable());
        cursor.write_i32(BYTE_POS_KEY_SIZE, key.len() as i32);
        cursor.write_i32(BYTE_POS_VALUE_SIZE, value.len() as i32);
        cursor.write_bytes(OFFLOAD_HEADER_SIZE, key);
        cursor.write_bytes(OFFLOAD_HEADER_SIZE + key.len(), value);
        Ok(id)
    }

    /// Store a key on its own, as used by internal node separators.
    pub fn write_key(&self, key: &[u8], generation: Generation) -> Result<PageId> {
        self.write_key_value(key, &[], generation)
    }

    /// Read the key and value of a record.
    pub fn read_key_value(&self, id: PageId) -> Result<(Vec<u8>, Vec<u8>)> {
        let cursor = self.paged_file.io_shared(id)?;
        let (key_size, value_size) = check_record(&cursor, id)?;
        let key = cursor.read_bytes(OFFLOAD_HEADER_SIZE, key_size).to_vec();
        let value = cursor
            .read_bytes(OFFLOAD_HEADER_SIZE + key_size, value_size)
            .to_vec();
        Ok((key, value))
    }

    /// Read only the key of a record.
    pub fn read_key(&self, id: PageId) -> Result<Vec<u8>> {
        let cursor = self.paged_file.io_shared(id)?;
        let (key_size, _) = check_record(&cursor, id)?;
        Ok(cursor.read_bytes(OFFLOAD_HEADER_SIZE, key_size).to_vec())
    }

    /// Return a record's page to the free-list.
    pub fn free(&self, id: PageId, generation: Generation) -> Result<()> {
        self.freelist
            .release_id(generation.stable(), generation.unstable(), id)
    }
}

/// Generation a record was written in.
#[must_use]
pub fn generation(page: &Page) -> u32 {
    page.read_u32(BYTE_POS_GENERATION)
}

/// Validate the tag and sizes of an offload page, returning the key and value
/// sizes.
pub fn check_record(page: &Page, page_id: PageId) -> Result<(usize, usize), CursorError> {
    let found = page.raw_page_type();
    if found != PageType::Offload as u8 {
        return Err(CursorError::UnexpectedPageType {
            page_id,
            expected: PageType::Offload,
            found,
        });
    }
    let key_size = page.read_i32(BYTE_POS_KEY_SIZE);
    let value_size = page.read_i32(BYTE_POS_VALUE_SIZE);
    let (Ok(key), Ok(value)) = (usize::try_from(key_size), usize::try_from(value_size)) else {
        return Err(CursorError::NegativeOffloadSize {
            page_id,
            key_size,
            value_size,
        });
    };
    let capacity = page.size() - OFFLOAD_HEADER_SIZE;
    if key + value > capacity {
        return Err(CursorError::OffloadSizeOutOfBounds {
            page_id,
            declared: key + value,
            capacity,
        });
    }
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TreeError;
    use crate::freelist::NoFreelistMonitor;
    use crate::page::MIN_PAGE_SIZE;

    fn store() -> (Arc<PagedFile>, OffloadStore) {
        let paged_file = Arc::new(PagedFile::in_memory(MIN_PAGE_SIZE));
        let freelist = Arc::new(FreeListIdProvider::new(
            Arc::clone(&paged_file),
            Arc::new(NoFreelistMonitor),
        ));
        freelist.initialize_after_creation().expect("should init");
        let store = OffloadStore::new(Arc::clone(&paged_file), freelist);
        (paged_file, store)
    }

    #[test]
    fn test_write_and_read_record() {
        let (_paged_file, store) = store();
        let key = vec![3u8; 100];
        let value = vec![9u8; 120];
        let id = store
            .write_key_value(&key, &value, Generation::initial())
            .expect("should write");

        assert_eq!(store.read_key_value(id).expect("should read"), (key.clone(), value));
        assert_eq!(store.read_key(id).expect("should read"), key);
    }

    #[test]
    fn test_non_offload_page_is_corruption() {
        let (paged_file, store) = store();
        let id = store
            .write_key(b"key", Generation::initial())
            .expect("should write");
        paged_file
            .io_exclusive(id)
            .expect("should pin")
            .set_page_type(PageType::TreeNode);

        let err = store.read_key(id).expect_err("should detect");
        assert!(matches!(
            err,
            TreeError::Cursor(CursorError::UnexpectedPageType {
                expected: PageType::Offload,
                ..
            })
        ));
    }

    #[test]
    fn test_negative_size_is_corruption() {
        let (paged_file, store) = store();
        let id = store
            .write_key_value(b"k", b"v", Generation::initial())
            .expect("should write");
        paged_file
            .io_exclusive(id)
            .expect("should pin")
            .write_i32(BYTE_POS_VALUE_SIZE, -4);

        let err = store.read_key_value(id).expect_err("should detect");
        assert!(matches!(
            err,
            TreeError::Cursor(CursorError::NegativeOffloadSize { value_size: -4, .. })
        ));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_oversized_declaration_is_corruption() {
        let (paged_file, store) = store();
        let id = store
            .write_key(b"k", Generation::initial())
            .expect("should write");
        paged_file
            .io_exclusive(id)
            .expect("should pin")
            .write_i32(BYTE_POS_KEY_SIZE, 10_000);

        assert!(matches!(
            store.read_key(id),
            Err(TreeError::Cursor(CursorError::OffloadSizeOutOfBounds { .. }))
        ));
    }
}
