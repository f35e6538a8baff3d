//! Fixed-size node format.
//!
//! ```text
//! leaf:     [header][key 0][value 0][key 1][value 1]...
//! internal: [header][child 0][key 0][child 1][key 1][child 2]...
//! ```
//!
//! Insertion and removal shift the trailing entries.

use crate::error::CursorError;
use crate::node::{
    COMMON_HEADER_SIZE, InternalContents, InternalKey, LeafEntry, NodeType, initialize, key_count,
    set_key_count,
};
use crate::page::{Page, PageId};

const CHILD_SIZE: usize = 8;

/// Fixed key and value sizes.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeNodes {
    page_size: usize,
    key_size: usize,
    value_size: usize,
}

impl FixedSizeNodes {
    #[must_use]
    pub const fn new(page_size: usize, key_size: usize, value_size: usize) -> Self {
        Self {
            page_size,
            key_size,
            value_size,
        }
    }

    const fn leaf_entry_size(&self) -> usize {
        self.key_size + self.value_size
    }

    const fn internal_slot_size(&self) -> usize {
        self.key_size + CHILD_SIZE
    }

    #[must_use]
    pub const fn key_value_size_cap(&self) -> usize {
        self.key_size + self.value_size
    }

    #[must_use]
    pub const fn inline_key_value_size_cap(&self) -> usize {
        self.key_value_size_cap()
    }

    #[must_use]
    pub const fn max_key_count(&self, node_type: NodeType) -> usize {
        match node_type {
            NodeType::Leaf => (self.page_size - COMMON_HEADER_SIZE) / self.leaf_entry_size(),
            NodeType::Internal => {
                (self.page_size - COMMON_HEADER_SIZE - CHILD_SIZE) / self.internal_slot_size()
            }
        }
    }

    #[must_use]
    pub const fn total_space(&self, node_type: NodeType) -> usize {
        match node_type {
            NodeType::Leaf => self.max_key_count(node_type) * self.leaf_entry_size(),
            NodeType::Internal => self.max_key_count(node_type) * self.internal_slot_size(),
        }
    }

    #[must_use]
    pub fn available_space(&self, page: &Page, node_type: NodeType) -> usize {
        let count = key_count(page).min(self.max_key_count(node_type));
        let slot = match node_type {
            NodeType::Leaf => self.leaf_entry_size(),
            NodeType::Internal => self.internal_slot_size(),
        };
        (self.max_key_count(node_type) - count) * slot
    }

    #[must_use]
    pub const fn leaf_entry_space(&self, _entry: &LeafEntry) -> usize {
        self.leaf_entry_size()
    }

    #[must_use]
    pub const fn internal_key_space(&self, _key: &InternalKey) -> usize {
        self.internal_slot_size()
    }

    const fn leaf_offset(&self, pos: usize) -> usize {
        COMMON_HEADER_SIZE + pos * self.leaf_entry_size()
    }

    const fn internal_key_offset(&self, pos: usize) -> usize {
        COMMON_HEADER_SIZE + CHILD_SIZE + pos * self.internal_slot_size()
    }

    const fn child_offset(&self, pos: usize) -> usize {
        if pos == 0 {
            COMMON_HEADER_SIZE
        } else {
            self.internal_key_offset(pos - 1) + self.key_size
        }
    }

    fn check_pos(
        &self,
        page: &Page,
        page_id: PageId,
        pos: usize,
        node_type: NodeType,
    ) -> Result<(), CursorError> {
        let count = key_count(page);
        if count > self.max_key_count(node_type) || pos >= count {
            return Err(CursorError::UnreasonableKeyCount {
                page_id,
                key_count: page.read_u32(crate::node::BYTE_POS_KEY_COUNT),
            });
        }
        Ok(())
    }

    pub fn leaf_entry_at(
        &self,
        page: &Page,
        page_id: PageId,
        pos: usize,
    ) -> Result<LeafEntry, CursorError> {
        self.check_pos(page, page_id, pos, NodeType::Leaf)?;
        let offset = self.leaf_offset(pos);
        Ok(LeafEntry::Inline {
            key: page.read_bytes(offset, self.key_size).to_vec(),
            value: page
                .read_bytes(offset + self.key_size, self.value_size)
                .to_vec(),
        })
    }

    fn write_leaf_entry(&self, page: &mut Page, pos: usize, entry: &LeafEntry) {
        let offset = self.leaf_offset(pos);
        if let LeafEntry::Inline { key, value } = entry {
            debug_assert_eq!(key.len(), self.key_size);
            debug_assert_eq!(value.len(), self.value_size);
            page.write_bytes(offset, key);
            page.write_bytes(offset + self.key_size, value);
        }
    }

    pub fn write_leaf(&self, page: &mut Page, generation: u32, entries: &[LeafEntry]) {
        initialize(page, NodeType::Leaf, generation);
        for (pos, entry) in entries.iter().enumerate() {
            self.write_leaf_entry(page, pos, entry);
        }
        set_key_count(page, entries.len());
    }

    pub fn insert_leaf_at(
        &self,
        page: &mut Page,
        _page_id: PageId,
        pos: usize,
        entry: &LeafEntry,
    ) -> Result<bool, CursorError> {
        let count = key_count(page);
        if count >= self.max_key_count(NodeType::Leaf) {
            return Ok(false);
        }
        let from = self.leaf_offset(pos);
        page.shift_bytes(
            from,
            from + self.leaf_entry_size(),
            (count - pos) * self.leaf_entry_size(),
        );
        self.write_leaf_entry(page, pos, entry);
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
        self.check_pos(page, page_id, pos, NodeType::Leaf)?;
        self.write_leaf_entry(page, pos, entry);
        Ok(true)
    }

    pub fn remove_leaf_at(
        &self,
        page: &mut Page,
        page_id: PageId,
        pos: usize,
    ) -> Result<(), CursorError> {
        self.check_pos(page, page_id, pos, NodeType::Leaf)?;
        let count = key_count(page);
        let to = self.leaf_offset(pos);
        page.shift_bytes(
            to + self.leaf_entry_size(),
            to,
            (count - pos - 1) * self.leaf_entry_size(),
        );
        set_key_count(page, count - 1);
        Ok(())
    }

    pub fn internal_key_at(
        &self,
        page: &Page,
        page_id: PageId,
        pos: usize,
    ) -> Result<InternalKey, CursorError> {
        self.check_pos(page, page_id, pos, NodeType::Internal)?;
        Ok(InternalKey::Inline(
            page.read_bytes(self.internal_key_offset(pos), self.key_size)
                .to_vec(),
        ))
    }

    #[must_use]
    pub fn child_at(&self, page: &Page, pos: usize) -> PageId {
        page.read_u64(self.child_offset(pos))
    }

    pub fn set_child_at(&self, page: &mut Page, pos: usize, child: PageId) {
        page.write_u64(self.child_offset(pos), child);
    }

    pub fn write_internal(&self, page: &mut Page, generation: u32, contents: &InternalContents) {
        initialize(page, NodeType::Internal, generation);
        for (pos, key) in contents.keys.iter().enumerate() {
            if let InternalKey::Inline(bytes) = key {
                debug_assert_eq!(bytes.len(), self.key_size);
                page.write_bytes(self.internal_key_offset(pos), bytes);
            }
        }
        for (pos, child) in contents.children.iter().enumerate() {
            self.set_child_at(page, pos, *child);
        }
        set_key_count(page, contents.keys.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TreeNodes;

    fn entry(key: u64, value: u64) -> LeafEntry {
        LeafEntry::Inline {
            key: key.to_le_bytes().to_vec(),
            value: value.to_le_bytes().to_vec(),
        }
    }

    #[test]
    fn test_insert_shifts_trailing_entries() {
        let nodes = TreeNodes::Fixed(FixedSizeNodes::new(256, 8, 8));
        let mut page = Page::new(256);
        nodes.write_leaf(&mut page, 1, &[entry(1, 10), entry(3, 30)]);

        assert!(nodes
            .insert_leaf_at(&mut page, 5, 1, &entry(2, 20))
            .expect("should insert"));
        let entries = nodes.leaf_entries(&page, 5).expect("should read");
        assert_eq!(entries, vec![entry(1, 10), entry(2, 20), entry(3, 30)]);

        nodes.remove_leaf_at(&mut page, 5, 0).expect("should remove");
        let entries = nodes.leaf_entries(&page, 5).expect("should read");
        assert_eq!(entries, vec![entry(2, 20), entry(3, 30)]);
    }

    #[test]
    fn test_full_leaf_rejects_insert() {
        let nodes = TreeNodes::Fixed(FixedSizeNodes::new(256, 8, 8));
        let max = nodes.max_key_count(NodeType::Leaf);
        let entries: Vec<LeafEntry> = (0..max as u64).map(|i| entry(i, i)).collect();
        let mut page = Page::new(256);
        nodes.write_leaf(&mut page, 1, &entries);

        assert_eq!(nodes.available_space(&page, NodeType::Leaf), 0);
        assert!(!nodes
            .insert_leaf_at(&mut page, 5, 0, &entry(99, 99))
            .expect("should not fail"));
    }

    #[test]
    fn test_internal_children() {
        let nodes = TreeNodes::Fixed(FixedSizeNodes::new(256, 8, 8));
        let contents = InternalContents {
            keys: vec![
                InternalKey::Inline(10u64.to_le_bytes().to_vec()),
                InternalKey::Inline(20u64.to_le_bytes().to_vec()),
            ],
            children: vec![100, 200, 300],
        };
        let mut page = Page::new(256);
        nodes.write_internal(&mut page, 2, &contents);

        assert_eq!(nodes.read_internal(&page, 7).expect("should read"), contents);
        nodes.set_child_at(&mut page, 2, 301);
        assert_eq!(nodes.child_at(&page, 2), 301);
        assert_eq!(nodes.child_at(&page, 0), 100);
    }
}
