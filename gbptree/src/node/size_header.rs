//! Compact key/value size header of dynamic-size entries.
//!
//! ```text
//! key byte:    [tombstone:1][offload:1][more key:1][key bits 0-4:5]
//! key byte 2:  [key bits 5-12:8]                      (if more key)
//! value byte:  [more value:1][value bits 0-6:7]       (leaf entries only)
//! value byte 2:[value bits 7-14:8]                    (if more value)
//! ```
//!
//! An offloaded entry is the key byte with the offload bit set, followed by
//! the 8-byte id of its offload record.

#![allow(clippy::cast_possible_truncation)]

use crate::page::Page;

const TOMBSTONE: u8 = 0x80;
const OFFLOAD: u8 = 0x40;
const MORE_KEY: u8 = 0x20;
const KEY_LOW_MASK: u8 = 0x1F;
const KEY_LOW_BITS: u32 = 5;
const MORE_VALUE: u8 = 0x80;
const VALUE_LOW_MASK: u8 = 0x7F;
const VALUE_LOW_BITS: u32 = 7;

/// Largest key size the header can express.
pub const MAX_KEY_SIZE: usize = (1 << 13) - 1;

/// Largest value size the header can express.
pub const MAX_VALUE_SIZE: usize = (1 << 15) - 1;

/// Bytes of an offloaded entry: key byte plus offload id.
pub const OFFLOAD_ENTRY_SIZE: usize = 1 + 8;

/// Decoded header of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub tombstone: bool,
    pub offload: bool,
    pub key_size: usize,
    pub value_size: usize,
    pub header_size: usize,
}

impl EntryHeader {
    /// Bytes the entry occupies in the page, header included.
    #[must_use]
    pub const fn entry_size(&self) -> usize {
        if self.offload {
            OFFLOAD_ENTRY_SIZE
        } else {
            self.header_size + self.key_size + self.value_size
        }
    }
}

/// Bytes needed for the header of an inline entry. `value_size` is `None` for
/// key-only entries of internal nodes.
#[must_use]
pub const fn header_size(key_size: usize, value_size: Option<usize>) -> usize {
    let key_bytes = if key_size > KEY_LOW_MASK as usize { 2 } else { 1 };
    let value_bytes = match value_size {
        None => 0,
        Some(size) if size > VALUE_LOW_MASK as usize => 2,
        Some(_) => 1,
    };
    key_bytes + value_bytes
}

/// Write the header of an inline entry at `offset`. Returns the header size.
pub fn write(page: &mut Page, offset: usize, key_size: usize, value_size: Option<usize>) -> usize {
    debug_assert!(key_size <= MAX_KEY_SIZE);
    let mut pos = offset;
    let low = key_size as u8 & KEY_LOW_MASK;
    if key_size > KEY_LOW_MASK as usize {
        page.write_u8(pos, low | MORE_KEY);
        page.write_u8(pos + 1, (key_size >> KEY_LOW_BITS) as u8);
        pos += 2;
    } else {
        page.write_u8(pos, low);
        pos += 1;
    }

    if let Some(value_size) = value_size {
        debug_assert!(value_size <= MAX_VALUE_SIZE);
        let low = value_size as u8 & VALUE_LOW_MASK;
        if value_size > VALUE_LOW_MASK as usize {
            page.write_u8(pos, low | MORE_VALUE);
            page.write_u8(pos + 1, (value_size >> VALUE_LOW_BITS) as u8);
            pos += 2;
        } else {
            page.write_u8(pos, low);
            pos += 1;
        }
    }
    pos - offset
}

/// Write an offloaded entry at `offset`. Returns [`OFFLOAD_ENTRY_SIZE`].
pub fn write_offload(page: &mut Page, offset: usize, offload_id: u64) -> usize {
    page.write_u8(offset, OFFLOAD);
    page.write_u64(offset + 1, offload_id);
    OFFLOAD_ENTRY_SIZE
}

/// Decode the header at `offset`. `has_value` tells whether value size bytes
/// follow the key size. `None` if the header runs past the page end.
#[must_use]
pub fn read(page: &Page, offset: usize, has_value: bool) -> Option<EntryHeader> {
    let byte_at = |pos: usize| (pos < page.size()).then(|| page.read_u8(pos));
    let first = byte_at(offset)?;
    let tombstone = first & TOMBSTONE != 0;
    if first & OFFLOAD != 0 {
        return Some(EntryHeader {
            tombstone,
            offload: true,
            key_size: 0,
            value_size: 0,
            header_size: 1,
        });
    }

    let mut pos = offset + 1;
    let mut key_size = usize::from(first & KEY_LOW_MASK);
    if first & MORE_KEY != 0 {
        key_size |= usize::from(byte_at(pos)?) << KEY_LOW_BITS;
        pos += 1;
    }

    let mut value_size = 0;
    if has_value {
        let value_byte = byte_at(pos)?;
        pos += 1;
        value_size = usize::from(value_byte & VALUE_LOW_MASK);
        if value_byte & MORE_VALUE != 0 {
            value_size |= usize::from(byte_at(pos)?) << VALUE_LOW_BITS;
            pos += 1;
        }
    }

    Some(EntryHeader {
        tombstone,
        offload: false,
        key_size,
        value_size,
        header_size: pos - offset,
    })
}

/// Mark the entry at `offset` as dead.
pub fn set_tombstone(page: &mut Page, offset: usize) {
    let first = page.read_u8(offset);
    page.write_u8(offset, first | TOMBSTONE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_small_sizes_use_one_byte_each() {
        let mut page = Page::new(256);
        assert_eq!(write(&mut page, 10, 31, Some(127)), 2);
        let header = read(&page, 10, true).expect("should decode");
        assert_eq!(header.key_size, 31);
        assert_eq!(header.value_size, 127);
        assert_eq!(header.header_size, 2);
        assert_eq!(header.entry_size(), 2 + 31 + 127);
    }

    #[test]
    fn test_key_only_header() {
        let mut page = Page::new(256);
        assert_eq!(write(&mut page, 0, 32, None), 2);
        let header = read(&page, 0, false).expect("should decode");
        assert_eq!(header.key_size, 32);
        assert_eq!(header.value_size, 0);
        assert_eq!(header.entry_size(), 34);
    }

    #[test]
    fn test_tombstone_keeps_sizes() {
        let mut page = Page::new(256);
        write(&mut page, 4, 100, Some(3));
        set_tombstone(&mut page, 4);
        let header = read(&page, 4, true).expect("should decode");
        assert!(header.tombstone);
        assert_eq!(header.key_size, 100);
        assert_eq!(header.value_size, 3);
    }

    #[test]
    fn test_offload_entry() {
        let mut page = Page::new(256);
        write_offload(&mut page, 20, 77);
        let header = read(&page, 20, true).expect("should decode");
        assert!(header.offload);
        assert_eq!(header.entry_size(), OFFLOAD_ENTRY_SIZE);
        assert_eq!(page.read_u64(21), 77);
    }

    #[test]
    fn test_header_past_page_end() {
        let mut page = Page::new(256);
        page.write_u8(255, MORE_KEY);
        assert_eq!(read(&page, 255, true), None);
    }

    proptest! {
        #[test]
        fn test_header_round_trip(key_size in 0..=MAX_KEY_SIZE, value_size in 0..=MAX_VALUE_SIZE) {
            let mut page = Page::new(256);
            let written = write(&mut page, 0, key_size, Some(value_size));
            let header = read(&page, 0, true).expect("should decode");
            prop_assert_eq!(written, header_size(key_size, Some(value_size)));
            prop_assert_eq!(header.header_size, written);
            prop_assert_eq!(header.key_size, key_size);
            prop_assert_eq!(header.value_size, value_size);
            prop_assert!(!header.tombstone);
        }
    }
}
