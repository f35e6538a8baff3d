//! Dynamic-size node format.
//!
//! ```text
//! +--------+----------------------------------------+
//! | 0-9    | common header                          |
//! | 10-11  | alloc offset                           |
//! | 12-13  | dead space                             |
//! | 14-    | leaf: key count x entry offset (2)     |
//! |        | internal: child 0 (8), then key count  |
//! |        |   x [entry offset (2), child (8)]      |
//! | ...    | alloc space                            |
//! | ..end  | entries, allocated downwards           |
//! +--------+----------------------------------------+
//! ```
//!
//! Removing an entry marks it with a tombstone and counts it as dead space.
//! [`DynamicSizeNodes::defragment`] moves live entries back together at the
//! page end.

#![allow(clippy::cast_possible_truncation)]

use crate::error::CursorError;
use crate::node::size_header::{self, OFFLOAD_ENTRY_SIZE};
use crate::node::{
    COMMON_HEADER_SIZE, InternalContents, InternalKey, LeafEntry, NodeType, initialize, key_count,
    set_key_count,
};
use crate::page::{Page, PageId};

pub const BYTE_POS_ALLOC_OFFSET: usize = COMMON_HEADER_SIZE;
pub const BYTE_POS_DEAD_SPACE: usize = COMMON_HEADER_SIZE + 2;
pub const HEADER_SIZE_DYNAMIC: usize = COMMON_HEADER_SIZE + 4;

const OFFSET_SIZE: usize = 2;
const CHILD_SIZE: usize = 8;
const INTERNAL_SLOT_SIZE: usize = OFFSET_SIZE + CHILD_SIZE;
/// Largest header plus the offset slot of a leaf entry.
const LEAF_ENTRY_OVERHEAD: usize = 4 + OFFSET_SIZE;

/// Variable key and value sizes.
#[derive(Debug, Clone, Copy)]
pub struct DynamicSizeNodes {
    page_size: usize,
}

impl DynamicSizeNodes {
    #[must_use]
    pub const fn new(page_size: usize) -> Self {
        Self { page_size }
    }

    #[must_use]
    pub const fn key_value_size_cap(&self) -> usize {
        (self.page_size - HEADER_SIZE_DYNAMIC) / 2
    }

    #[must_use]
    pub fn inline_key_value_size_cap(&self) -> usize {
        (self.total_space(NodeType::Leaf) / 4 - LEAF_ENTRY_OVERHEAD).min(size_header::MAX_KEY_SIZE)
    }

    #[must_use]
    pub const fn total_space(&self, node_type: NodeType) -> usize {
        match node_type {
            NodeType::Leaf => self.page_size - HEADER_SIZE_DYNAMIC,
            NodeType::Internal => self.page_size - HEADER_SIZE_DYNAMIC - CHILD_SIZE,
        }
    }

    #[must_use]
    pub const fn max_key_count(&self, node_type: NodeType) -> usize {
        match node_type {
            NodeType::Leaf => self.total_space(node_type) / (OFFSET_SIZE + 1),
            NodeType::Internal => self.total_space(node_type) / (INTERNAL_SLOT_SIZE + 1),
        }
    }

    const fn offsets_start(node_type: NodeType) -> usize {
        match node_type {
            NodeType::Leaf => HEADER_SIZE_DYNAMIC,
            NodeType::Internal => HEADER_SIZE_DYNAMIC + CHILD_SIZE,
        }
    }

    const fn slot_size(node_type: NodeType) -> usize {
        match node_type {
            NodeType::Leaf => OFFSET_SIZE,
            NodeType::Internal => INTERNAL_SLOT_SIZE,
        }
    }

    const fn slot_offset(node_type: NodeType, pos: usize) -> usize {
        Self::offsets_start(node_type) + pos * Self::slot_size(node_type)
    }

    fn offsets_end(page: &Page, node_type: NodeType) -> usize {
        Self::slot_offset(node_type, key_count(page))
    }

    #[must_use]
    pub fn alloc_offset(page: &Page) -> usize {
        usize::from(page.read_u16(BYTE_POS_ALLOC_OFFSET))
    }

    fn set_alloc_offset(page: &mut Page, offset: usize) {
        page.write_u16(BYTE_POS_ALLOC_OFFSET, offset as u16);
    }

    #[must_use]
    pub fn dead_space(page: &Page) -> usize {
        usize::from(page.read_u16(BYTE_POS_DEAD_SPACE))
    }

    fn set_dead_space(page: &mut Page, dead: usize) {
        page.write_u16(BYTE_POS_DEAD_SPACE, dead as u16);
    }

    fn alloc_space(page: &Page, node_type: NodeType) -> usize {
        Self::alloc_offset(page).saturating_sub(Self::offsets_end(page, node_type))
    }

    #[must_use]
    pub fn available_space(&self, page: &Page, node_type: NodeType) -> usize {
        Self::alloc_space(page, node_type) + Self::dead_space(page)
    }

    fn leaf_entry_bytes(entry: &LeafEntry) -> usize {
        match entry {
            LeafEntry::Inline { key, value } => {
                size_header::header_size(key.len(), Some(value.len())) + key.len() + value.len()
            }
            LeafEntry::Offloaded(_) => OFFLOAD_ENTRY_SIZE,
        }
    }

    fn internal_key_bytes(key: &InternalKey) -> usize {
        match key {
            InternalKey::Inline(bytes) => size_header::header_size(bytes.len(), None) + bytes.len(),
            InternalKey::Offloaded(_) => OFFLOAD_ENTRY_SIZE,
        }
    }

    #[must_use]
    pub fn leaf_entry_space(&self, entry: &LeafEntry) -> usize {
        OFFSET_SIZE + Self::leaf_entry_bytes(entry)
    }

    #[must_use]
    pub fn internal_key_space(&self, key: &InternalKey) -> usize {
        INTERNAL_SLOT_SIZE + Self::internal_key_bytes(key)
    }

    fn entry_offset(
        &self,
        page: &Page,
        page_id: PageId,
        node_type: NodeType,
        pos: usize,
    ) -> Result<usize, CursorError> {
        let count = key_count(page);
        if count > self.max_key_count(node_type) || pos >= count {
            return Err(CursorError::UnreasonableKeyCount {
                page_id,
                key_count: page.read_u32(crate::node::BYTE_POS_KEY_COUNT),
            });
        }
        let offset = usize::from(page.read_u16(Self::slot_offset(node_type, pos)));
        if offset < Self::offsets_end(page, node_type) || offset >= self.page_size {
            return Err(CursorError::InvalidNodeSpace {
                page_id,
                message: format!("entry {pos} at offset {offset} outside entry area"),
            });
        }
        Ok(offset)
    }

    fn read_header(
        &self,
        page: &Page,
        page_id: PageId,
        offset: usize,
        node_type: NodeType,
    ) -> Result<size_header::EntryHeader, CursorError> {
        let header = size_header::read(page, offset, node_type == NodeType::Leaf).ok_or_else(
            || CursorError::InvalidNodeSpace {
                page_id,
                message: format!("entry header at offset {offset} overruns the page"),
            },
        )?;
        if offset + header.entry_size() > self.page_size {
            return Err(CursorError::InvalidNodeSpace {
                page_id,
                message: format!(
                    "entry at offset {offset} of {} bytes overruns the page",
                    header.entry_size()
                ),
            });
        }
        Ok(header)
    }

    pub fn leaf_entry_at(
        &self,
        page: &Page,
        page_id: PageId,
        pos: usize,
    ) -> Result<LeafEntry, CursorError> {
        let offset = self.entry_offset(page, page_id, NodeType::Leaf, pos)?;
        let header = self.read_header(page, page_id, offset, NodeType::Leaf)?;
        if header.offload {
            return Ok(LeafEntry::Offloaded(page.read_u64(offset + 1)));
        }
        let key_start = offset + header.header_size;
        Ok(LeafEntry::Inline {
            key: page.read_bytes(key_start, header.key_size).to_vec(),
            value: page
                .read_bytes(key_start + header.key_size, header.value_size)
                .to_vec(),
        })
    }

    pub fn internal_key_at(
        &self,
        page: &Page,
        page_id: PageId,
        pos: usize,
    ) -> Result<InternalKey, CursorError> {
        let offset = self.entry_offset(page, page_id, NodeType::Internal, pos)?;
        let header = self.read_header(page, page_id, offset, NodeType::Internal)?;
        if header.offload {
            return Ok(InternalKey::Offloaded(page.read_u64(offset + 1)));
        }
        Ok(InternalKey::Inline(
            page.read_bytes(offset + header.header_size, header.key_size)
                .to_vec(),
        ))
    }

    /// Allocate and write a leaf entry below the alloc offset. The caller
    /// has checked that it fits in the alloc space.
    fn allocate_leaf_entry(page: &mut Page, entry: &LeafEntry) -> usize {
        let offset = Self::alloc_offset(page) - Self::leaf_entry_bytes(entry);
        match entry {
            LeafEntry::Inline { key, value } => {
                let header = size_header::write(page, offset, key.len(), Some(value.len()));
                page.write_bytes(offset + header, key);
                page.write_bytes(offset + header + key.len(), value);
            }
            LeafEntry::Offloaded(id) => {
                size_header::write_offload(page, offset, *id);
            }
        }
        Self::set_alloc_offset(page, offset);
        offset
    }

    fn allocate_internal_key(page: &mut Page, key: &InternalKey) -> usize {
        let offset = Self::alloc_offset(page) - Self::internal_key_bytes(key);
        match key {
            InternalKey::Inline(bytes) => {
                let header = size_header::write(page, offset, bytes.len(), None);
                page.write_bytes(offset + header, bytes);
            }
            InternalKey::Offloaded(id) => {
                size_header::write_offload(page, offset, *id);
            }
        }
        Self::set_alloc_offset(page, offset);
        offset
    }

    fn initialize_dynamic(&self, page: &mut Page, node_type: NodeType, generation: u32) {
        initialize(page, node_type, generation);
        Self::set_alloc_offset(page, self.page_size);
        Self::set_dead_space(page, 0);
    }

    pub fn write_leaf(&self, page: &mut Page, generation: u32, entries: &[LeafEntry]) {
        self.initialize_dynamic(page, NodeType::Leaf, generation);
        for (pos, entry) in entries.iter().enumerate() {
            let offset = Self::allocate_leaf_entry(page, entry);
            page.write_u16(Self::slot_offset(NodeType::Leaf, pos), offset as u16);
        }
        set_key_count(page, entries.len());
    }

    pub fn write_internal(&self, page: &mut Page, generation: u32, contents: &InternalContents) {
        self.initialize_dynamic(page, NodeType::Internal, generation);
        for (pos, key) in contents.keys.iter().enumerate() {
            let offset = Self::allocate_internal_key(page, key);
            page.write_u16(Self::slot_offset(NodeType::Internal, pos), offset as u16);
        }
        for (pos, child) in contents.children.iter().enumerate() {
            self.set_child_at(page, pos, *child);
        }
        set_key_count(page, contents.keys.len());
    }

    pub fn insert_leaf_at(
        &self,
        page: &mut Page,
        page_id: PageId,
        pos: usize,
        entry: &LeafEntry,
    ) -> Result<bool, CursorError> {
        let needed = self.leaf_entry_space(entry);
        if self.available_space(page, NodeType::Leaf) < needed {
            return Ok(false);
        }
        if Self::alloc_space(page, NodeType::Leaf) < needed {
            self.defragment(page, page_id, NodeType::Leaf)?;
        }

        let count = key_count(page);
        let offset = Self::allocate_leaf_entry(page, entry);
        let slot = Self::slot_offset(NodeType::Leaf, pos);
        page.shift_bytes(slot, slot + OFFSET_SIZE, (count - pos) * OFFSET_SIZE);
        page.write_u16(slot, offset as u16);
        set_key_count(page, count + 1);
        Ok(true)
    }

    pub fn replace_leaf_at(
        &self,
        page: &mut Page,
        page_id: PageId,
        pos: usize,
        entry: &LeafEntry,
    ) -> Result<bool, CursorError> {
        let offset = self.entry_offset(page, page_id, NodeType::Leaf, pos)?;
        let old = self.read_header(page, page_id, offset, NodeType::Leaf)?;
        if let LeafEntry::Inline { key, value } = entry {
            if !old.offload && old.key_size == key.len() && old.value_size == value.len() {
                page.write_bytes(offset + old.header_size + key.len(), value);
                return Ok(true);
            }
        }

        let available = self.available_space(page, NodeType::Leaf) + old.entry_size();
        if available < Self::leaf_entry_bytes(entry) {
            return Ok(false);
        }
        self.remove_leaf_at(page, page_id, pos)?;
        self.insert_leaf_at(page, page_id, pos, entry)
    }

    pub fn remove_leaf_at(
        &self,
        page: &mut Page,
        page_id: PageId,
        pos: usize,
    ) -> Result<(), CursorError> {
        let offset = self.entry_offset(page, page_id, NodeType::Leaf, pos)?;
        let header = self.read_header(page, page_id, offset, NodeType::Leaf)?;
        size_header::set_tombstone(page, offset);
        Self::set_dead_space(page, Self::dead_space(page) + header.entry_size());

        let count = key_count(page);
        let slot = Self::slot_offset(NodeType::Leaf, pos);
        page.shift_bytes(slot + OFFSET_SIZE, slot, (count - pos - 1) * OFFSET_SIZE);
        set_key_count(page, count - 1);
        Ok(())
    }

    #[must_use]
    pub fn child_at(&self, page: &Page, pos: usize) -> PageId {
        page.read_u64(Self::child_offset(pos))
    }

    pub fn set_child_at(&self, page: &mut Page, pos: usize, child: PageId) {
        page.write_u64(Self::child_offset(pos), child);
    }

    const fn child_offset(pos: usize) -> usize {
        if pos == 0 {
            HEADER_SIZE_DYNAMIC
        } else {
            Self::slot_offset(NodeType::Internal, pos - 1) + OFFSET_SIZE
        }
    }

    /// Walk the entry area from the alloc offset to the page end.
    fn scan_entries(
        &self,
        page: &Page,
        page_id: PageId,
        node_type: NodeType,
    ) -> Result<Vec<(usize, size_header::EntryHeader)>, CursorError> {
        let mut entries = Vec::new();
        let mut offset = Self::alloc_offset(page);
        while offset < self.page_size {
            let header = self.read_header(page, page_id, offset, node_type)?;
            entries.push((offset, header));
            offset += header.entry_size();
        }
        Ok(entries)
    }

    /// Move all live entries together at the end of the page so that all dead
    /// space becomes alloc space.
    pub fn defragment(
        &self,
        page: &mut Page,
        page_id: PageId,
        node_type: NodeType,
    ) -> Result<(), CursorError> {
        let entries = self.scan_entries(page, page_id, node_type)?;
        let mut moved: Vec<(usize, usize)> = Vec::with_capacity(entries.len());
        let mut write_offset = self.page_size;
        for (offset, header) in entries.iter().rev() {
            if header.tombstone {
                continue;
            }
            let size = header.entry_size();
            write_offset -= size;
            page.shift_bytes(*offset, write_offset, size);
            moved.push((*offset, write_offset));
        }
        moved.sort_unstable_by_key(|(old, _)| *old);

        for pos in 0..key_count(page) {
            let slot = Self::slot_offset(node_type, pos);
            let old = usize::from(page.read_u16(slot));
            let index = moved
                .binary_search_by_key(&old, |(old, _)| *old)
                .map_err(|_| CursorError::InvalidNodeSpace {
                    page_id,
                    message: format!("entry {pos} points at dead or unknown offset {old}"),
                })?;
            page.write_u16(slot, moved[index].1 as u16);
        }
        Self::set_alloc_offset(page, write_offset);
        Self::set_dead_space(page, 0);
        Ok(())
    }

    /// Verify alloc offset, dead space and entry offsets against the entries
    /// actually present.
    pub fn check_space(
        &self,
        page: &Page,
        page_id: PageId,
        node_type: NodeType,
    ) -> Result<(), CursorError> {
        let invalid = |message: String| CursorError::InvalidNodeSpace { page_id, message };
        let alloc_offset = Self::alloc_offset(page);
        let offsets_end = Self::offsets_end(page, node_type);
        if alloc_offset < offsets_end || alloc_offset > self.page_size {
            return Err(invalid(format!(
                "alloc offset {alloc_offset} outside [{offsets_end}, {}]",
                self.page_size
            )));
        }

        let entries = self.scan_entries(page, page_id, node_type)?;
        let dead: usize = entries
            .iter()
            .filter(|(_, header)| header.tombstone)
            .map(|(_, header)| header.entry_size())
            .sum();
        if dead != Self::dead_space(page) {
            return Err(invalid(format!(
                "dead space {} but tombstoned entries take {dead}",
                Self::dead_space(page)
            )));
        }

        let live = entries.iter().filter(|(_, header)| !header.tombstone).count();
        if live != key_count(page) {
            return Err(invalid(format!(
                "{live} live entries but key count {}",
                key_count(page)
            )));
        }
        for pos in 0..key_count(page) {
            let offset = usize::from(page.read_u16(Self::slot_offset(node_type, pos)));
            let points_at_live = entries
                .binary_search_by_key(&offset, |(offset, _)| *offset)
                .is_ok_and(|index| !entries[index].1.tombstone);
            if !points_at_live {
                return Err(invalid(format!(
                    "entry {pos} offset {offset} is not a live entry"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TreeNodes;

    fn entry(key: &[u8], value: &[u8]) -> LeafEntry {
        LeafEntry::Inline {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    fn leaf(entries: &[LeafEntry]) -> (TreeNodes, Page) {
        let nodes = TreeNodes::Dynamic(DynamicSizeNodes::new(256));
        let mut page = Page::new(256);
        nodes.write_leaf(&mut page, 1, entries);
        (nodes, page)
    }

    #[test]
    fn test_insert_and_read_back() {
        let (nodes, mut page) = leaf(&[entry(b"a", b"1"), entry(b"c", b"3")]);
        assert!(nodes
            .insert_leaf_at(&mut page, 3, 1, &entry(b"b", b"22"))
            .expect("should insert"));
        assert!(nodes
            .insert_leaf_at(&mut page, 3, 3, &LeafEntry::Offloaded(40))
            .expect("should insert"));

        let entries = nodes.leaf_entries(&page, 3).expect("should read");
        assert_eq!(
            entries,
            vec![
                entry(b"a", b"1"),
                entry(b"b", b"22"),
                entry(b"c", b"3"),
                LeafEntry::Offloaded(40),
            ]
        );
        nodes
            .check_space(&page, 3, NodeType::Leaf)
            .expect("space should be consistent");
    }

    #[test]
    fn test_remove_creates_dead_space_and_defragment_reclaims_it() {
        let (nodes, mut page) = leaf(&[
            entry(b"a", &[1; 20]),
            entry(b"b", &[2; 20]),
            entry(b"c", &[3; 20]),
        ]);
        let before = nodes.available_space(&page, NodeType::Leaf);
        nodes.remove_leaf_at(&mut page, 3, 1).expect("should remove");

        let dead = DynamicSizeNodes::dead_space(&page);
        assert_eq!(dead, 2 + 1 + 20);
        assert_eq!(
            nodes.available_space(&page, NodeType::Leaf),
            before + dead + OFFSET_SIZE
        );
        nodes
            .check_space(&page, 3, NodeType::Leaf)
            .expect("tombstones should be accounted");

        let alloc_before = DynamicSizeNodes::alloc_offset(&page);
        let TreeNodes::Dynamic(dynamic) = nodes else {
            unreachable!("dynamic nodes")
        };
        dynamic
            .defragment(&mut page, 3, NodeType::Leaf)
            .expect("should defragment");
        assert_eq!(DynamicSizeNodes::dead_space(&page), 0);
        assert_eq!(DynamicSizeNodes::alloc_offset(&page), alloc_before + dead);
        assert_eq!(
            nodes.leaf_entries(&page, 3).expect("should read"),
            vec![entry(b"a", &[1; 20]), entry(b"c", &[3; 20])]
        );
        nodes
            .check_space(&page, 3, NodeType::Leaf)
            .expect("space should be consistent");
    }

    #[test]
    fn test_insert_defragments_when_alloc_space_runs_out() {
        let big = [7u8; 50];
        let (nodes, mut page) = leaf(&[
            entry(b"a", &big),
            entry(b"b", &big),
            entry(b"c", &big),
            entry(b"d", &big),
        ]);
        assert!(!nodes
            .insert_leaf_at(&mut page, 3, 4, &entry(b"e", &big))
            .expect("should not fail"));

        nodes.remove_leaf_at(&mut page, 3, 0).expect("should remove");
        assert!(nodes
            .insert_leaf_at(&mut page, 3, 3, &entry(b"e", &big))
            .expect("should insert after defragment"));
        assert_eq!(DynamicSizeNodes::dead_space(&page), 0);
        assert_eq!(nodes.leaf_entries(&page, 3).expect("should read").len(), 4);
    }

    #[test]
    fn test_replace_with_different_size() {
        let (nodes, mut page) = leaf(&[entry(b"a", b"1"), entry(b"b", b"2")]);
        assert!(nodes
            .replace_leaf_at(&mut page, 3, 0, &entry(b"a", b"longer value"))
            .expect("should replace"));
        assert!(nodes
            .replace_leaf_at(&mut page, 3, 1, &entry(b"b", b"9"))
            .expect("should replace in place"));
        assert_eq!(
            nodes.leaf_entries(&page, 3).expect("should read"),
            vec![entry(b"a", b"longer value"), entry(b"b", b"9")]
        );
    }

    #[test]
    fn test_internal_round_trip_with_offloaded_key() {
        let nodes = TreeNodes::Dynamic(DynamicSizeNodes::new(256));
        let contents = InternalContents {
            keys: vec![
                InternalKey::Inline(b"k".to_vec()),
                InternalKey::Offloaded(55),
            ],
            children: vec![10, 11, 12],
        };
        let mut page = Page::new(256);
        nodes.write_internal(&mut page, 4, &contents);
        assert_eq!(nodes.read_internal(&page, 3).expect("should read"), contents);
        nodes
            .check_space(&page, 3, NodeType::Internal)
            .expect("space should be consistent");
    }

    #[test]
    fn test_corrupt_alloc_offset_is_reported() {
        let (nodes, mut page) = leaf(&[entry(b"a", b"1")]);
        page.write_u16(BYTE_POS_ALLOC_OFFSET, 2);
        assert!(matches!(
            nodes.check_space(&page, 3, NodeType::Leaf),
            Err(CursorError::InvalidNodeSpace { page_id: 3, .. })
        ));
    }
}
