//! Consistency checking.
//!
//! Walks every node reachable from the root and every page of the free-list
//! and reports what it finds wrong to a [`ConsistencyVisitor`]. Corruption is
//! reported, never returned as an error. Errors are reserved for the page
//! store failing.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::{CursorError, Result, TreeError};
use crate::freelist::FreelistVisitor;
use crate::generation::Generation;
use crate::layout::Layout;
use crate::node::{self, InternalKey, LeafEntry, NodeType};
use crate::offload;
use crate::page::{MIN_TREE_NODE_ID, PageId};
use crate::tree_logic::{MAX_TREE_DEPTH, TreeCore};

/// One problem found by a consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    /// A child pointer leads to a page that is not a tree node.
    NotATreeNode { page_id: PageId, found: u8 },
    UnknownNodeType { page_id: PageId, found: u8 },
    UnreasonableKeyCount { page_id: PageId, key_count: u32 },
    /// Space bookkeeping of a dynamic node is broken.
    NodeSpace { page_id: PageId, message: String },
    /// Keys at `pos - 1` and `pos` are not strictly ascending.
    KeyOrder { page_id: PageId, pos: usize },
    /// Key at `pos` lies outside the range its parent gives the node.
    KeyOutsideParentRange { page_id: PageId, pos: usize },
    /// Node written in a generation that crashed.
    CrashedGeneration { page_id: PageId, generation: u32 },
    /// Node written in a generation that has not started.
    FutureGeneration { page_id: PageId, generation: u32 },
    UnevenLeafDepth {
        page_id: PageId,
        depth: usize,
        expected: usize,
    },
    OffloadCorruption {
        page_id: PageId,
        offload_id: PageId,
        error: CursorError,
    },
    ChildPointerBeyondLastId {
        page_id: PageId,
        child_id: PageId,
        last_id: PageId,
    },
    /// The free-list chain itself cannot be read.
    FreelistCorruption { error: CursorError },
    /// A page below the last id that is neither in the tree nor free.
    UnusedPage { page_id: PageId },
    /// A page referenced twice, from the tree or the free-list.
    PageSeenMultipleTimes { page_id: PageId },
}

impl Inconsistency {
    fn from_node_error(error: CursorError) -> Self {
        match error {
            CursorError::UnexpectedPageType { page_id, found, .. } => {
                Self::NotATreeNode { page_id, found }
            }
            CursorError::UnknownNodeType { page_id, found } => {
                Self::UnknownNodeType { page_id, found }
            }
            CursorError::UnreasonableKeyCount { page_id, key_count } => {
                Self::UnreasonableKeyCount { page_id, key_count }
            }
            CursorError::InvalidNodeSpace { page_id, message } => {
                Self::NodeSpace { page_id, message }
            }
            CursorError::NegativeOffloadSize { page_id, .. }
            | CursorError::OffloadSizeOutOfBounds { page_id, .. } => Self::OffloadCorruption {
                page_id,
                offload_id: page_id,
                error,
            },
        }
    }
}

/// Receives the findings of a consistency check.
pub trait ConsistencyVisitor {
    fn inconsistency(&mut self, inconsistency: Inconsistency);
}

impl ConsistencyVisitor for Vec<Inconsistency> {
    fn inconsistency(&mut self, inconsistency: Inconsistency) {
        self.push(inconsistency);
    }
}

/// Key range a node must stay within: `low` inclusive, `high` exclusive.
struct KeyRange<K> {
    low: Option<K>,
    high: Option<K>,
}

pub struct ConsistencyChecker<'a, L: Layout, V: ConsistencyVisitor> {
    core: &'a TreeCore<L>,
    generation: Generation,
    last_id: PageId,
    seen: HashSet<PageId>,
    leaf_depth: Option<usize>,
    visitor: &'a mut V,
    clean: bool,
}

impl<'a, L: Layout, V: ConsistencyVisitor> ConsistencyChecker<'a, L, V> {
    pub fn new(core: &'a TreeCore<L>, generation: Generation, visitor: &'a mut V) -> Self {
        Self {
            core,
            generation,
            last_id: core.freelist.last_id(),
            seen: HashSet::new(),
            leaf_depth: None,
            visitor,
            clean: true,
        }
    }

    fn report(&mut self, inconsistency: Inconsistency) {
        self.clean = false;
        self.visitor.inconsistency(inconsistency);
    }

    /// Mark `page_id` as referenced. Returns `false` if it already was.
    fn see(&mut self, page_id: PageId) -> bool {
        if self.seen.insert(page_id) {
            true
        } else {
            self.report(Inconsistency::PageSeenMultipleTimes { page_id });
            false
        }
    }

    /// Run the whole check. Returns whether nothing was found.
    pub fn check(mut self) -> Result<bool> {
        let root = self.core.root();
        let range = KeyRange {
            low: None,
            high: None,
        };
        self.check_node(root.id, root.id, &range, 0)?;
        self.check_freelist()?;
        for page_id in MIN_TREE_NODE_ID..=self.last_id {
            if !self.seen.contains(&page_id) {
                self.report(Inconsistency::UnusedPage { page_id });
            }
        }
        Ok(self.clean)
    }

    fn check_node(
        &mut self,
        parent_id: PageId,
        page_id: PageId,
        range: &KeyRange<L::Key>,
        depth: usize,
    ) -> Result<()> {
        if page_id < MIN_TREE_NODE_ID || page_id > self.last_id {
            self.report(Inconsistency::ChildPointerBeyondLastId {
                page_id: parent_id,
                child_id: page_id,
                last_id: self.last_id,
            });
            return Ok(());
        }
        if !self.see(page_id) {
            return Ok(());
        }
        if depth > MAX_TREE_DEPTH {
            return Err(TreeError::TreeInconsistency(format!(
                "tree deeper than {MAX_TREE_DEPTH} levels at page {page_id}"
            )));
        }

        let nodes = self.core.nodes;
        let (node_type, generation) = {
            let cursor = self.core.paged_file.io_shared(page_id)?;
            let checked = node::node_type(&cursor, page_id).and_then(|node_type| {
                nodes.check_key_count(&cursor, page_id, node_type)?;
                nodes.check_space(&cursor, page_id, node_type)?;
                Ok(node_type)
            });
            match checked {
                Ok(node_type) => (node_type, node::generation(&cursor)),
                Err(e) => {
                    self.report(Inconsistency::from_node_error(e));
                    return Ok(());
                }
            }
        };
        if self.generation.is_crashed(generation) {
            self.report(Inconsistency::CrashedGeneration {
                page_id,
                generation,
            });
        } else if generation > self.generation.unstable() {
            self.report(Inconsistency::FutureGeneration {
                page_id,
                generation,
            });
        }

        match node_type {
            NodeType::Leaf => self.check_leaf(page_id, range, depth),
            NodeType::Internal => self.check_internal(page_id, range, depth),
        }
    }

    fn check_leaf(&mut self, page_id: PageId, range: &KeyRange<L::Key>, depth: usize) -> Result<()> {
        match self.leaf_depth {
            None => self.leaf_depth = Some(depth),
            Some(expected) if expected != depth => {
                self.report(Inconsistency::UnevenLeafDepth {
                    page_id,
                    depth,
                    expected,
                });
            }
            Some(_) => {}
        }

        let entries = {
            let cursor = self.core.paged_file.io_shared(page_id)?;
            match self.core.nodes.leaf_entries(&cursor, page_id) {
                Ok(entries) => entries,
                Err(e) => {
                    self.report(Inconsistency::from_node_error(e));
                    return Ok(());
                }
            }
        };
        let mut keys = Vec::with_capacity(entries.len());
        for entry in &entries {
            if let LeafEntry::Offloaded(offload_id) = entry {
                if !self.check_offload(page_id, *offload_id)? {
                    return Ok(());
                }
            }
            keys.push(self.core.leaf_key(entry)?);
        }
        self.check_keys(page_id, &keys, range);
        Ok(())
    }

    fn check_internal(
        &mut self,
        page_id: PageId,
        range: &KeyRange<L::Key>,
        depth: usize,
    ) -> Result<()> {
        let contents = {
            let cursor = self.core.paged_file.io_shared(page_id)?;
            match self.core.nodes.read_internal(&cursor, page_id) {
                Ok(contents) => contents,
                Err(e) => {
                    self.report(Inconsistency::from_node_error(e));
                    return Ok(());
                }
            }
        };
        let mut keys = Vec::with_capacity(contents.keys.len());
        for key in &contents.keys {
            if let InternalKey::Offloaded(offload_id) = key {
                if !self.check_offload(page_id, *offload_id)? {
                    return Ok(());
                }
            }
            keys.push(self.core.internal_key(key)?);
        }
        self.check_keys(page_id, &keys, range);

        for (pos, child_id) in contents.children.iter().enumerate() {
            let child_range = KeyRange {
                low: if pos == 0 {
                    range.low.clone()
                } else {
                    Some(keys[pos - 1].clone())
                },
                high: keys.get(pos).cloned().or_else(|| range.high.clone()),
            };
            self.check_node(page_id, *child_id, &child_range, depth + 1)?;
        }
        Ok(())
    }

    /// Returns `false` if the offload record is unreadable.
    fn check_offload(&mut self, page_id: PageId, offload_id: PageId) -> Result<bool> {
        if offload_id < MIN_TREE_NODE_ID || offload_id > self.last_id {
            self.report(Inconsistency::ChildPointerBeyondLastId {
                page_id,
                child_id: offload_id,
                last_id: self.last_id,
            });
            return Ok(false);
        }
        if !self.see(offload_id) {
            return Ok(false);
        }
        let cursor = self.core.paged_file.io_shared(offload_id)?;
        match offload::check_record(&cursor, offload_id) {
            Ok(_) => Ok(true),
            Err(error) => {
                self.report(Inconsistency::OffloadCorruption {
                    page_id,
                    offload_id,
                    error,
                });
                Ok(false)
            }
        }
    }

    fn check_keys(&mut self, page_id: PageId, keys: &[L::Key], range: &KeyRange<L::Key>) {
        let layout = &self.core.layout;
        let mut findings = Vec::new();
        for (pos, key) in keys.iter().enumerate() {
            if pos > 0 && layout.compare(&keys[pos - 1], key) != Ordering::Less {
                findings.push(Inconsistency::KeyOrder { page_id, pos });
            }
            let below = range
                .low
                .as_ref()
                .is_some_and(|low| layout.compare(key, low) == Ordering::Less);
            let above = range
                .high
                .as_ref()
                .is_some_and(|high| layout.compare(key, high) != Ordering::Less);
            if below || above {
                findings.push(Inconsistency::KeyOutsideParentRange { page_id, pos });
            }
        }
        for finding in findings {
            self.report(finding);
        }
    }

    fn check_freelist(&mut self) -> Result<()> {
        let mut pages = FreelistPages::default();
        match self.core.freelist.visit_freelist(&mut pages) {
            Ok(()) => {}
            Err(TreeError::Cursor(error)) => {
                self.report(Inconsistency::FreelistCorruption { error });
            }
            Err(e) => return Err(e),
        }
        for page_id in pages.ids {
            if page_id < MIN_TREE_NODE_ID || page_id > self.last_id {
                self.report(Inconsistency::ChildPointerBeyondLastId {
                    page_id: self.core.freelist.metadata().write_page_id,
                    child_id: page_id,
                    last_id: self.last_id,
                });
            } else {
                self.see(page_id);
            }
        }
        Ok(())
    }
}

/// Collects every page id the free-list holds or consists of.
#[derive(Default)]
struct FreelistPages {
    ids: Vec<PageId>,
}

impl FreelistVisitor for FreelistPages {
    fn begin_freelist_page(&mut self, page_id: PageId) {
        self.ids.push(page_id);
    }

    fn freelist_entry(&mut self, page_id: PageId, _generation: u32, _pos: usize) {
        self.ids.push(page_id);
    }

    fn freelist_entry_from_release_cache(&mut self, page_id: PageId) {
        self.ids.push(page_id);
    }
}
