//! Page types and constants for the tree file.
//!
//! Every page starts with a one byte type tag. The remaining layout depends on
//! the tag:
//!
//! - Page 0: meta record
//! - Pages 1-2: alternating tree state pages
//! - Remaining pages: tree nodes, free-list pages and offload records

/// Default page size in bytes (8KB).
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 256;

/// Largest supported page size. Offsets inside dynamic nodes are stored as u16.
pub const MAX_PAGE_SIZE: usize = 32768;

/// A page identifier (0-indexed page number).
pub type PageId = u64;

/// Page id used as a null pointer. Page 0 holds the meta record and can never
/// be referenced from a tree node or the free-list.
pub const NO_PAGE: PageId = 0;

/// Page id of the meta record.
pub const META_PAGE_ID: PageId = 0;

/// Page id of the first tree state page.
pub const STATE_PAGE_A: PageId = 1;

/// Page id of the second tree state page.
pub const STATE_PAGE_B: PageId = 2;

/// Lowest page id handed out by the id provider.
pub const MIN_TREE_NODE_ID: PageId = 3;

/// Byte offset of the type tag, shared by every page kind.
pub const BYTE_POS_PAGE_TYPE: usize = 0;

/// Page type identifiers stored in the first byte of every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Meta record (page 0 only)
    Meta = 0x01,
    /// Tree state (pages 1 and 2)
    State = 0x02,
    /// Tree node, leaf or internal
    TreeNode = 0x03,
    /// Free-list segment
    Freelist = 0x04,
    /// Offloaded key and/or value
    Offload = 0x05,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Meta),
            0x02 => Ok(Self::State),
            0x03 => Ok(Self::TreeNode),
            0x04 => Ok(Self::Freelist),
            0x05 => Ok(Self::Offload),
            _ => Err(value),
        }
    }
}

/// A raw page buffer.
///
/// Unlike a fixed array, the size is chosen when the tree file is created so
/// that tests can run with small pages and force deep trees.
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    /// Create a new zeroed page.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    /// Size of this page in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.data.len()
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero the whole page.
    pub fn zap(&mut self) {
        self.data.fill(0);
    }

    /// Overwrite this page with the contents of another page of the same size.
    pub fn copy_from(&mut self, other: &Self) {
        self.data.copy_from_slice(&other.data);
    }

    /// The type tag, or `None` if the first byte is not a known tag.
    #[must_use]
    pub fn page_type(&self) -> Option<PageType> {
        PageType::try_from(self.data[BYTE_POS_PAGE_TYPE]).ok()
    }

    /// The raw first byte of the page.
    #[must_use]
    pub fn raw_page_type(&self) -> u8 {
        self.data[BYTE_POS_PAGE_TYPE]
    }

    /// Stamp the type tag.
    pub fn set_page_type(&mut self, page_type: PageType) {
        self.data[BYTE_POS_PAGE_TYPE] = page_type as u8;
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Move `len` bytes from `from` to `to` within the page. Ranges may overlap.
    pub fn shift_bytes(&mut self, from: usize, to: usize, len: usize) {
        self.data.copy_within(from..from + len, to);
    }

    /// Read a u8 at the given offset.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    /// Write a u8 at the given offset.
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    /// Read a u16 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// Write a u16 (little-endian) at the given offset.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read an i32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    /// Write an i32 (little-endian) at the given offset.
    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// CRC32 of `len` bytes starting at `offset`.
    #[must_use]
    pub fn compute_checksum(&self, offset: usize, len: usize) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[offset..offset + len]);
        hasher.finalize()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("size", &self.data.len())
            .field("first_16_bytes", &&self.data[..16])
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_type_conversion() {
        for tag in [
            PageType::Meta,
            PageType::State,
            PageType::TreeNode,
            PageType::Freelist,
            PageType::Offload,
        ] {
            assert_eq!(PageType::try_from(tag as u8), Ok(tag));
        }
        assert_eq!(PageType::try_from(0x00), Err(0x00));
        assert_eq!(PageType::try_from(0x7F), Err(0x7F));
    }

    #[test]
    fn test_page_integer_access() {
        let mut page = Page::new(MIN_PAGE_SIZE);
        page.write_u16(10, 0xBEEF);
        page.write_u32(20, 0xDEAD_BEEF);
        page.write_u64(30, 0x0102_0304_0506_0708);
        page.write_i32(40, -17);

        assert_eq!(page.read_u16(10), 0xBEEF);
        assert_eq!(page.read_u32(20), 0xDEAD_BEEF);
        assert_eq!(page.read_u64(30), 0x0102_0304_0506_0708);
        assert_eq!(page.read_i32(40), -17);
    }

    #[test]
    fn test_unknown_tag_reads_as_none() {
        let mut page = Page::new(MIN_PAGE_SIZE);
        assert_eq!(page.page_type(), None);
        page.set_page_type(PageType::Offload);
        assert_eq!(page.page_type(), Some(PageType::Offload));
        page.write_u8(BYTE_POS_PAGE_TYPE, 0xEE);
        assert_eq!(page.page_type(), None);
        assert_eq!(page.raw_page_type(), 0xEE);
    }

    #[test]
    fn test_shift_bytes_overlapping() {
        let mut page = Page::new(MIN_PAGE_SIZE);
        page.write_bytes(0, &[1, 2, 3, 4, 5]);
        page.shift_bytes(0, 2, 5);
        assert_eq!(page.read_bytes(0, 7), &[1, 2, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_checksum_detects_change() {
        let mut page = Page::new(MIN_PAGE_SIZE);
        page.write_bytes(8, b"state");
        let before = page.compute_checksum(0, 64);
        page.write_u8(9, b'X');
        assert_ne!(before, page.compute_checksum(0, 64));
    }
}
