//! Meta page and the two alternating state pages.
//!
//! # Meta Page (page 0)
//!
//! ```text
//! +---------+----------------------------------------+
//! | 0       | page type (Meta)                       |
//! | 4-7     | format version                         |
//! | 8-15    | format identifier                      |
//! | 16-19   | page size                              |
//! | 24-39   | data layout id, major, minor           |
//! | 40      | root layout present                    |
//! | 48-63   | root layout id, major, minor           |
//! | 64-67   | CRC32 of bytes 0-63                    |
//! +---------+----------------------------------------+
//! ```
//!
//! # State Page (pages 1 and 2)
//!
//! ```text
//! +---------+----------------------------------------+
//! | 0       | page type (State)                      |
//! | 8-15    | state counter                          |
//! | 16-19   | stable generation                      |
//! | 20-23   | unstable generation                    |
//! | 24-31   | root id                                |
//! | 32-35   | root generation                        |
//! | 40-47   | last id                                |
//! | 48-55   | free-list write page id                |
//! | 56-63   | free-list read page id                 |
//! | 64-67   | free-list write position               |
//! | 68-71   | free-list read position                |
//! | 72      | clean shutdown flag                    |
//! | 76-79   | CRC32 of bytes 0-75                    |
//! +---------+----------------------------------------+
//! ```
//!
//! A state is written to the page not holding the newest state, so a torn
//! write leaves the previous state intact. The valid state with the highest
//! counter wins.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{Result, TreeError};
use crate::freelist::FreelistMetaData;
use crate::generation::Generation;
use crate::layout::Layout;
use crate::page::{Page, PageId, PageType, STATE_PAGE_A, STATE_PAGE_B};

pub const FORMAT_IDENTIFIER: u64 = u64::from_le_bytes(*b"GBPTREE\0");
pub const FORMAT_VERSION: u32 = 1;

const META_CHECKSUM_POS: usize = 64;
const STATE_CHECKSUM_POS: usize = 76;

/// Identifier and version of a key/value layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutIdentity {
    pub identifier: u64,
    pub major_version: u32,
    pub minor_version: u32,
}

impl LayoutIdentity {
    #[must_use]
    pub fn of<L: Layout>(layout: &L) -> Self {
        Self {
            identifier: layout.identifier(),
            major_version: layout.major_version(),
            minor_version: layout.minor_version(),
        }
    }

    fn write(&self, page: &mut Page, offset: usize) {
        page.write_u64(offset, self.identifier);
        page.write_u32(offset + 8, self.major_version);
        page.write_u32(offset + 12, self.minor_version);
    }

    fn read(page: &Page, offset: usize) -> Self {
        Self {
            identifier: page.read_u64(offset),
            major_version: page.read_u32(offset + 8),
            minor_version: page.read_u32(offset + 12),
        }
    }
}

/// Format description written once when the tree is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub format_identifier: u64,
    pub format_version: u32,
    pub page_size: usize,
    pub data_layout: LayoutIdentity,
    pub root_layout: Option<LayoutIdentity>,
}

impl Meta {
    #[must_use]
    pub fn for_layout<L: Layout>(layout: &L, page_size: usize) -> Self {
        Self {
            format_identifier: FORMAT_IDENTIFIER,
            format_version: FORMAT_VERSION,
            page_size,
            data_layout: LayoutIdentity::of(layout),
            root_layout: None,
        }
    }

    pub fn write(&self, page: &mut Page) {
        page.zap();
        page.set_page_type(PageType::Meta);
        page.write_u32(4, self.format_version);
        page.write_u64(8, self.format_identifier);
        page.write_u32(16, self.page_size as u32);
        self.data_layout.write(page, 24);
        if let Some(root_layout) = &self.root_layout {
            page.write_u8(40, 1);
            root_layout.write(page, 48);
        }
        let checksum = page.compute_checksum(0, META_CHECKSUM_POS);
        page.write_u32(META_CHECKSUM_POS, checksum);
    }

    pub fn read(page: &Page) -> Result<Self> {
        if page.raw_page_type() != PageType::Meta as u8 {
            return Err(TreeError::MetadataMismatch(format!(
                "page 0 is not a meta page (type 0x{:02x})",
                page.raw_page_type()
            )));
        }
        if page.compute_checksum(0, META_CHECKSUM_POS) != page.read_u32(META_CHECKSUM_POS) {
            return Err(TreeError::MetadataMismatch(
                "meta page checksum mismatch".to_string(),
            ));
        }
        Ok(Self {
            format_version: page.read_u32(4),
            format_identifier: page.read_u64(8),
            page_size: page.read_u32(16) as usize,
            data_layout: LayoutIdentity::read(page, 24),
            root_layout: (page.read_u8(40) == 1).then(|| LayoutIdentity::read(page, 48)),
        })
    }

    /// Check that a stored meta record can be opened as `expected`. Minor
    /// layout versions may differ.
    pub fn verify(&self, expected: &Self) -> Result<()> {
        if self.format_identifier != expected.format_identifier
            || self.format_version != expected.format_version
        {
            return Err(TreeError::MetadataMismatch(format!(
                "unsupported format {:#x} version {}",
                self.format_identifier, self.format_version
            )));
        }
        if self.page_size != expected.page_size {
            return Err(TreeError::MetadataMismatch(format!(
                "tree was created with page size {}, opened with {}",
                self.page_size, expected.page_size
            )));
        }
        let stored = self.data_layout;
        let wanted = expected.data_layout;
        if stored.identifier != wanted.identifier || stored.major_version != wanted.major_version {
            return Err(TreeError::MetadataMismatch(format!(
                "tree was created with layout {:#x} v{}, opened with {:#x} v{}",
                stored.identifier, stored.major_version, wanted.identifier, wanted.major_version
            )));
        }
        let unexpected_root = self
            .root_layout
            .filter(|layout| expected.root_layout != Some(*layout));
        if let Some(root_layout) = unexpected_root {
            return Err(TreeError::MetadataMismatch(format!(
                "tree was created with root layout {:#x} v{}, only single-root trees open",
                root_layout.identifier, root_layout.major_version
            )));
        }
        Ok(())
    }
}

/// Everything needed to reopen the tree at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeState {
    pub counter: u64,
    pub generation: Generation,
    pub root_id: PageId,
    pub root_generation: u32,
    pub freelist: FreelistMetaData,
    pub clean: bool,
}

impl TreeState {
    pub fn write(&self, page: &mut Page) {
        page.zap();
        page.set_page_type(PageType::State);
        page.write_u64(8, self.counter);
        page.write_u32(16, self.generation.stable());
        page.write_u32(20, self.generation.unstable());
        page.write_u64(24, self.root_id);
        page.write_u32(32, self.root_generation);
        page.write_u64(40, self.freelist.last_id);
        page.write_u64(48, self.freelist.write_page_id);
        page.write_u64(56, self.freelist.read_page_id);
        page.write_u32(64, self.freelist.write_pos as u32);
        page.write_u32(68, self.freelist.read_pos as u32);
        page.write_u8(72, u8::from(self.clean));
        let checksum = page.compute_checksum(0, STATE_CHECKSUM_POS);
        page.write_u32(STATE_CHECKSUM_POS, checksum);
    }

    /// Decode a state page. `None` if it was never written or is torn.
    #[must_use]
    pub fn read(page: &Page) -> Option<Self> {
        if page.raw_page_type() != PageType::State as u8 {
            return None;
        }
        if page.compute_checksum(0, STATE_CHECKSUM_POS) != page.read_u32(STATE_CHECKSUM_POS) {
            return None;
        }
        Some(Self {
            counter: page.read_u64(8),
            generation: Generation::new(page.read_u32(16), page.read_u32(20)),
            root_id: page.read_u64(24),
            root_generation: page.read_u32(32),
            freelist: FreelistMetaData {
                last_id: page.read_u64(40),
                write_page_id: page.read_u64(48),
                read_page_id: page.read_u64(56),
                write_pos: page.read_u32(64) as usize,
                read_pos: page.read_u32(68) as usize,
            },
            clean: page.read_u8(72) == 1,
        })
    }

    /// The newest of the two state pages, with the page it came from.
    #[must_use]
    pub fn newest(a: Option<Self>, b: Option<Self>) -> Option<(PageId, Self)> {
        match (a, b) {
            (Some(a), Some(b)) if b.counter > a.counter => Some((STATE_PAGE_B, b)),
            (Some(a), _) => Some((STATE_PAGE_A, a)),
            (None, Some(b)) => Some((STATE_PAGE_B, b)),
            (None, None) => None,
        }
    }

    /// The page the state after this one goes to.
    #[must_use]
    pub const fn next_page(current: PageId) -> PageId {
        if current == STATE_PAGE_A {
            STATE_PAGE_B
        } else {
            STATE_PAGE_A
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BytesLayout, LongLayout};

    fn state(counter: u64) -> TreeState {
        TreeState {
            counter,
            generation: Generation::new(4, 5),
            root_id: 17,
            root_generation: 4,
            freelist: FreelistMetaData {
                last_id: 40,
                write_page_id: 3,
                read_page_id: 3,
                write_pos: 2,
                read_pos: 1,
            },
            clean: true,
        }
    }

    #[test]
    fn test_meta_verify() {
        let meta = Meta::for_layout(&LongLayout, 8192);
        let mut page = Page::new(8192);
        meta.write(&mut page);
        let read = Meta::read(&page).expect("should read");
        assert_eq!(read, meta);
        read.verify(&meta).expect("same meta should verify");

        let other_layout = Meta::for_layout(&BytesLayout, 8192);
        assert!(matches!(
            read.verify(&other_layout),
            Err(TreeError::MetadataMismatch(_))
        ));
        let other_size = Meta::for_layout(&LongLayout, 4096);
        assert!(read.verify(&other_size).is_err());
    }

    #[test]
    fn test_multi_root_meta_is_rejected() {
        let single = Meta::for_layout(&LongLayout, 4096);
        let multi = Meta {
            root_layout: Some(LayoutIdentity::of(&BytesLayout)),
            ..single
        };
        let mut page = Page::new(4096);
        multi.write(&mut page);
        let read = Meta::read(&page).expect("should read");
        assert_eq!(read.root_layout, multi.root_layout);
        assert!(matches!(
            read.verify(&single),
            Err(TreeError::MetadataMismatch(_))
        ));
    }

    #[test]
    fn test_meta_checksum() {
        let mut page = Page::new(256);
        Meta::for_layout(&LongLayout, 256).write(&mut page);
        page.write_u32(16, 512);
        assert!(Meta::read(&page).is_err());
    }

    #[test]
    fn test_newest_valid_state_wins() {
        let mut a = Page::new(256);
        let mut b = Page::new(256);
        state(7).write(&mut a);
        state(8).write(&mut b);

        let (page_id, newest) =
            TreeState::newest(TreeState::read(&a), TreeState::read(&b)).expect("should pick");
        assert_eq!(page_id, STATE_PAGE_B);
        assert_eq!(newest, state(8));

        // Torn write of the newer state.
        b.write_u64(24, 99);
        let (page_id, newest) =
            TreeState::newest(TreeState::read(&a), TreeState::read(&b)).expect("should pick");
        assert_eq!(page_id, STATE_PAGE_A);
        assert_eq!(newest.counter, 7);
        assert_eq!(TreeState::next_page(page_id), STATE_PAGE_B);
    }

    #[test]
    fn test_empty_state_pages() {
        let page = Page::new(256);
        assert_eq!(TreeState::read(&page), None);
        assert_eq!(TreeState::newest(None, None), None);
    }
}
