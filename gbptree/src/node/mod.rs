//! Tree node pages.
//!
//! Every tree node starts with the same header. What follows depends on the
//! node format picked once per tree by [`TreeNodeSelector`]: fixed-size nodes
//! store entries back to back, dynamic-size nodes keep an offset array that
//! grows from the header and entries that grow down from the page end.
//!
//! # Common Header
//!
//! ```text
//! +---------+----------------------------------------+
//! | 0       | page type (TreeNode)                   |
//! | 1       | node type (leaf / internal)            |
//! | 2-5     | generation the node was written in     |
//! | 6-9     | key count                              |
//! +---------+----------------------------------------+
//! ```

pub mod dynamic;
pub mod fixed;
pub mod size_header;

use crate::error::CursorError;
use crate::layout::Layout;
use crate::page::{Page, PageId, PageType};

pub use dynamic::DynamicSizeNodes;
pub use fixed::FixedSizeNodes;

pub const BYTE_POS_NODE_TYPE: usize = 1;
pub const BYTE_POS_GENERATION: usize = 2;
pub const BYTE_POS_KEY_COUNT: usize = 6;
pub const COMMON_HEADER_SIZE: usize = 10;

/// Leaf or internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
    Leaf = 1,
    Internal = 2,
}

/// A leaf entry as stored, offload reference kept intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafEntry {
    Inline { key: Vec<u8>, value: Vec<u8> },
    Offloaded(PageId),
}

impl LeafEntry {
    /// Id of the offload record holding this entry, if any.
    #[must_use]
    pub const fn offload_id(&self) -> Option<PageId> {
        match self {
            Self::Inline { .. } => None,
            Self::Offloaded(id) => Some(*id),
        }
    }
}

/// An internal node key as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalKey {
    Inline(Vec<u8>),
    Offloaded(PageId),
}

impl InternalKey {
    #[must_use]
    pub const fn offload_id(&self) -> Option<PageId> {
        match self {
            Self::Inline(_) => None,
            Self::Offloaded(id) => Some(*id),
        }
    }
}

/// Decoded keys and children of an internal node. There is always one more
/// child than keys; `children[i]` holds keys below `keys[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalContents {
    pub keys: Vec<InternalKey>,
    pub children: Vec<PageId>,
}

/// Stamp the common header of an empty node.
pub fn initialize(page: &mut Page, node_type: NodeType, generation: u32) {
    page.zap();
    page.set_page_type(PageType::TreeNode);
    page.write_u8(BYTE_POS_NODE_TYPE, node_type as u8);
    page.write_u32(BYTE_POS_GENERATION, generation);
    page.write_u32(BYTE_POS_KEY_COUNT, 0);
}

/// Whether the page carries the tree node tag.
#[must_use]
pub fn is_node(page: &Page) -> bool {
    page.raw_page_type() == PageType::TreeNode as u8
}

/// Node type of a tree node page. Fails if the page is not a tree node.
pub fn node_type(page: &Page, page_id: PageId) -> Result<NodeType, CursorError> {
    let found = page.raw_page_type();
    if found != PageType::TreeNode as u8 {
        return Err(CursorError::UnexpectedPageType {
            page_id,
            expected: PageType::TreeNode,
            found,
        });
    }
    match page.read_u8(BYTE_POS_NODE_TYPE) {
        1 => Ok(NodeType::Leaf),
        2 => Ok(NodeType::Internal),
        found => Err(CursorError::UnknownNodeType { page_id, found }),
    }
}

#[must_use]
pub fn generation(page: &Page) -> u32 {
    page.read_u32(BYTE_POS_GENERATION)
}

pub fn set_generation(page: &mut Page, generation: u32) {
    page.write_u32(BYTE_POS_GENERATION, generation);
}

#[must_use]
pub fn key_count(page: &Page) -> usize {
    page.read_u32(BYTE_POS_KEY_COUNT) as usize
}

#[allow(clippy::cast_possible_truncation)]
pub fn set_key_count(page: &mut Page, key_count: usize) {
    page.write_u32(BYTE_POS_KEY_COUNT, key_count as u32);
}

/// Picks the node format for a layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeNodeSelector;

impl TreeNodeSelector {
    #[must_use]
    pub fn select<L: Layout>(layout: &L, page_size: usize) -> TreeNodes {
        match layout.fixed_key_value_size() {
            Some((key_size, value_size)) => {
                TreeNodes::Fixed(FixedSizeNodes::new(page_size, key_size, value_size))
            }
            None => TreeNodes::Dynamic(DynamicSizeNodes::new(page_size)),
        }
    }
}

/// Node behaviour of one tree: fixed or dynamic format, each covering leaves
/// and internal nodes.
#[derive(Debug, Clone, Copy)]
pub enum TreeNodes {
    Fixed(FixedSizeNodes),
    Dynamic(DynamicSizeNodes),
}

macro_rules! dispatch {
    ($self:ident, $nodes:ident => $body:expr) => {
        match $self {
            TreeNodes::Fixed($nodes) => $body,
            TreeNodes::Dynamic($nodes) => $body,
        }
    };
}

impl TreeNodes {
    #[must_use]
    pub const fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic(_))
    }

    /// Largest key plus value size a single entry may have.
    #[must_use]
    pub fn key_value_size_cap(&self) -> usize {
        dispatch!(self, nodes => nodes.key_value_size_cap())
    }

    /// Largest key plus value size stored inline. Bigger entries are
    /// offloaded.
    #[must_use]
    pub fn inline_key_value_size_cap(&self) -> usize {
        dispatch!(self, nodes => nodes.inline_key_value_size_cap())
    }

    /// Whether an entry of these sizes must go to an offload record.
    #[must_use]
    pub fn needs_offload(&self, key_size: usize, value_size: usize) -> bool {
        self.is_dynamic() && key_size + value_size > self.inline_key_value_size_cap()
    }

    #[must_use]
    pub fn total_space(&self, node_type: NodeType) -> usize {
        dispatch!(self, nodes => nodes.total_space(node_type))
    }

    #[must_use]
    pub fn available_space(&self, page: &Page, node_type: NodeType) -> usize {
        dispatch!(self, nodes => nodes.available_space(page, node_type))
    }

    /// A non-root leaf with more available space than this has underflowed.
    #[must_use]
    pub fn leaf_underflow_threshold(&self) -> usize {
        self.total_space(NodeType::Leaf) / 2
    }

    /// Space an entry takes in a leaf, bookkeeping included.
    #[must_use]
    pub fn leaf_entry_space(&self, entry: &LeafEntry) -> usize {
        dispatch!(self, nodes => nodes.leaf_entry_space(entry))
    }

    /// Space a key and its right child take in an internal node.
    #[must_use]
    pub fn internal_key_space(&self, key: &InternalKey) -> usize {
        dispatch!(self, nodes => nodes.internal_key_space(key))
    }

    #[must_use]
    pub fn leaf_fits(&self, entries: &[LeafEntry]) -> bool {
        let used: usize = entries.iter().map(|e| self.leaf_entry_space(e)).sum();
        used <= self.total_space(NodeType::Leaf)
    }

    #[must_use]
    pub fn internal_fits(&self, keys: &[InternalKey]) -> bool {
        let used: usize = keys.iter().map(|k| self.internal_key_space(k)).sum();
        used <= self.total_space(NodeType::Internal)
    }

    /// Fails when the key count cannot fit in the page.
    pub fn check_key_count(
        &self,
        page: &Page,
        page_id: PageId,
        node_type: NodeType,
    ) -> Result<(), CursorError> {
        let count = key_count(page);
        if count > self.max_key_count(node_type) {
            return Err(CursorError::UnreasonableKeyCount {
                page_id,
                key_count: page.read_u32(BYTE_POS_KEY_COUNT),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn max_key_count(&self, node_type: NodeType) -> usize {
        dispatch!(self, nodes => nodes.max_key_count(node_type))
    }

    pub fn leaf_entry_at(
        &self,
        page: &Page,
        page_id: PageId,
        pos: usize,
    ) -> Result<LeafEntry, CursorError> {
        dispatch!(self, nodes => nodes.leaf_entry_at(page, page_id, pos))
    }

    pub fn leaf_entries(&self, page: &Page, page_id: PageId) -> Result<Vec<LeafEntry>, CursorError> {
        self.check_key_count(page, page_id, NodeType::Leaf)?;
        (0..key_count(page))
            .map(|pos| self.leaf_entry_at(page, page_id, pos))
            .collect()
    }

    /// Rewrite the page as a leaf holding exactly `entries`.
    pub fn write_leaf(&self, page: &mut Page, generation: u32, entries: &[LeafEntry]) {
        dispatch!(self, nodes => nodes.write_leaf(page, generation, entries));
    }

    /// Insert at `pos` if the entry fits. Returns `false` otherwise.
    pub fn insert_leaf_at(
        &self,
        page: &mut Page,
        page_id: PageId,
        pos: usize,
        entry: &LeafEntry,
    ) -> Result<bool, CursorError> {
        dispatch!(self, nodes => nodes.insert_leaf_at(page, page_id, pos, entry))
    }

    /// Replace the entry at `pos` if the new one fits. Returns `false`
    /// otherwise.
    pub fn replace_leaf_at(
        &self,
        page: &mut Page,
        page_id: PageId,
        pos: usize,
        entry: &LeafEntry,
    ) -> Result<bool, CursorError> {
        dispatch!(self, nodes => nodes.replace_leaf_at(page, page_id, pos, entry))
    }

    pub fn remove_leaf_at(
        &self,
        page: &mut Page,
        page_id: PageId,
        pos: usize,
    ) -> Result<(), CursorError> {
        dispatch!(self, nodes => nodes.remove_leaf_at(page, page_id, pos))
    }

    pub fn internal_key_at(
        &self,
        page: &Page,
        page_id: PageId,
        pos: usize,
    ) -> Result<InternalKey, CursorError> {
        dispatch!(self, nodes => nodes.internal_key_at(page, page_id, pos))
    }

    #[must_use]
    pub fn child_at(&self, page: &Page, pos: usize) -> PageId {
        dispatch!(self, nodes => nodes.child_at(page, pos))
    }

    pub fn set_child_at(&self, page: &mut Page, pos: usize, child: PageId) {
        dispatch!(self, nodes => nodes.set_child_at(page, pos, child));
    }

    pub fn read_internal(
        &self,
        page: &Page,
        page_id: PageId,
    ) -> Result<InternalContents, CursorError> {
        self.check_key_count(page, page_id, NodeType::Internal)?;
        let count = key_count(page);
        let keys = (0..count)
            .map(|pos| self.internal_key_at(page, page_id, pos))
            .collect::<Result<Vec<_>, _>>()?;
        let children = (0..=count).map(|pos| self.child_at(page, pos)).collect();
        Ok(InternalContents { keys, children })
    }

    /// Rewrite the page as an internal node holding exactly `contents`.
    pub fn write_internal(&self, page: &mut Page, generation: u32, contents: &InternalContents) {
        dispatch!(self, nodes => nodes.write_internal(page, generation, contents));
    }

    /// Verify the space bookkeeping of a node.
    pub fn check_space(
        &self,
        page: &Page,
        page_id: PageId,
        node_type: NodeType,
    ) -> Result<(), CursorError> {
        match self {
            Self::Fixed(_) => Ok(()),
            Self::Dynamic(nodes) => nodes.check_space(page, page_id, node_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BytesLayout, LongLayout};

    #[test]
    fn test_selector_picks_format() {
        assert!(!TreeNodeSelector::select(&LongLayout, 8192).is_dynamic());
        assert!(TreeNodeSelector::select(&BytesLayout, 8192).is_dynamic());
    }

    #[test]
    fn test_node_type_rejects_foreign_pages() {
        let mut page = Page::new(256);
        page.set_page_type(PageType::Freelist);
        assert!(matches!(
            node_type(&page, 9),
            Err(CursorError::UnexpectedPageType { page_id: 9, .. })
        ));

        initialize(&mut page, NodeType::Leaf, 3);
        assert_eq!(node_type(&page, 9).expect("should be a leaf"), NodeType::Leaf);
        assert_eq!(generation(&page), 3);

        page.write_u8(BYTE_POS_NODE_TYPE, 7);
        assert_eq!(
            node_type(&page, 9),
            Err(CursorError::UnknownNodeType {
                page_id: 9,
                found: 7
            })
        );
    }

    #[test]
    fn test_unreasonable_key_count() {
        let nodes = TreeNodeSelector::select(&LongLayout, 256);
        let mut page = Page::new(256);
        initialize(&mut page, NodeType::Leaf, 1);
        set_key_count(&mut page, 1_000_000);
        assert!(matches!(
            nodes.leaf_entries(&page, 4),
            Err(CursorError::UnreasonableKeyCount { page_id: 4, .. })
        ));
    }

    #[test]
    fn test_offload_decision() {
        let fixed = TreeNodeSelector::select(&LongLayout, 256);
        assert!(!fixed.needs_offload(8, 8));

        let dynamic = TreeNodeSelector::select(&BytesLayout, 256);
        let cap = dynamic.inline_key_value_size_cap();
        assert!(!dynamic.needs_offload(cap, 0));
        assert!(dynamic.needs_offload(cap, 1));
        assert!(dynamic.key_value_size_cap() > cap);
    }
}
