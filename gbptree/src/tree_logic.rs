//! Tree mutation.
//!
//! A writer descends from the root under [`LatchCrabbingCoordination`],
//! changes one leaf and propagates splits and merges upwards. Nodes written in
//! an earlier generation are never changed in place: the first change in the
//! unstable generation copies the node to a successor page and points the
//! parent at it, recursively up to the root.
//!
//! Every change is planned before anything is written, so an answer of
//! "retry pessimistically" from the coordination never leaves a half-done
//! change behind.

#![allow(clippy::cast_precision_loss)]

use std::cmp::Ordering as KeyOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cleanup::CleanupState;
use crate::coordination::LatchCrabbingCoordination;
use crate::error::{Result, TreeError};
use crate::freelist::FreeListIdProvider;
use crate::generation::Generation;
use crate::latch::{LatchGuard, TreeNodeLatchService};
use crate::layout::Layout;
use crate::monitor::Monitor;
use crate::node::{self, InternalContents, InternalKey, LeafEntry, NodeType, TreeNodes};
use crate::offload::OffloadStore;
use crate::page::{MIN_TREE_NODE_ID, NO_PAGE, Page, PageId};
use crate::paged_file::PagedFile;
use crate::root_catchup::{Root, TripCountingRootCatchup};
use crate::structure_log::{StructureEvent, StructureWriteLog};

/// A descent deeper than this has run into a cycle.
pub const MAX_TREE_DEPTH: usize = 64;

/// Optimistic attempts given up for contention before going pessimistic.
const MAX_OPTIMISTIC_RESTARTS: usize = 8;

/// State shared by the tree handle, its writers, seekers and cleanup.
pub struct TreeCore<L: Layout> {
    pub layout: L,
    pub paged_file: Arc<PagedFile>,
    pub nodes: TreeNodes,
    pub freelist: Arc<FreeListIdProvider>,
    pub offload: OffloadStore,
    pub latch_service: Arc<TreeNodeLatchService>,
    pub monitor: Arc<dyn Monitor>,
    pub root: RwLock<Root>,
    /// Writers hold a read guard for their lifetime, checkpoint the write
    /// guard.
    pub generation: Arc<RwLock<Generation>>,
    /// Taken shared by every writer operation and exclusively by operations
    /// that change two entries as one.
    pub structure_lock: RwLock<()>,
    pub cleanup: Arc<CleanupState>,
    pub changed: Arc<AtomicBool>,
    pub structure_log: Option<StructureWriteLog>,
}

/// Header fields of a node read in one pin.
#[derive(Debug, Clone, Copy)]
pub struct NodeSummary {
    pub node_type: NodeType,
    pub generation: u32,
    pub key_count: usize,
    pub available_space: usize,
}

impl<L: Layout> TreeCore<L> {
    #[must_use]
    pub fn root(&self) -> Root {
        *self.root.read()
    }

    pub fn set_root(&self, root: Root) {
        *self.root.write() = root;
    }

    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }

    /// Append to the structure log, if one is configured. A failing log never
    /// fails the tree operation.
    pub fn log_event(&self, generation: u32, event: StructureEvent) {
        if let Some(log) = &self.structure_log {
            if let Err(e) = log.log(u64::from(generation), event) {
                warn!(error = %e, ?event, "Failed to append structure event");
            }
        }
    }

    pub fn flush_structure_log(&self) {
        if let Some(log) = &self.structure_log {
            if let Err(e) = log.flush() {
                warn!(error = %e, "Failed to flush structure log");
            }
        }
    }

    /// Fail with `IllegalArgument` when an entry exceeds the size cap.
    pub fn check_entry_size(&self, key_size: usize, value_size: usize) -> Result<()> {
        let cap = self.nodes.key_value_size_cap();
        if key_size + value_size > cap {
            return Err(TreeError::IllegalArgument(format!(
                "key of {key_size} bytes and value of {value_size} bytes exceed the entry size cap of {cap} bytes"
            )));
        }
        Ok(())
    }

    pub fn node_summary(&self, id: PageId) -> Result<NodeSummary> {
        let cursor = self.paged_file.io_shared(id)?;
        let node_type = node::node_type(&cursor, id)?;
        Ok(NodeSummary {
            node_type,
            generation: node::generation(&cursor),
            key_count: node::key_count(&cursor),
            available_space: self.nodes.available_space(&cursor, node_type),
        })
    }

    fn expect_node_type(page: &Page, id: PageId, expected: NodeType) -> Result<()> {
        let found = node::node_type(page, id)?;
        if found != expected {
            return Err(TreeError::TreeInconsistency(format!(
                "page {id} is a {found:?} node where a {expected:?} node was expected"
            )));
        }
        Ok(())
    }

    pub fn read_leaf(&self, id: PageId) -> Result<Vec<LeafEntry>> {
        let cursor = self.paged_file.io_shared(id)?;
        Self::expect_node_type(&cursor, id, NodeType::Leaf)?;
        Ok(self.nodes.leaf_entries(&cursor, id)?)
    }

    pub fn read_internal(&self, id: PageId) -> Result<InternalContents> {
        let cursor = self.paged_file.io_shared(id)?;
        Self::expect_node_type(&cursor, id, NodeType::Internal)?;
        Ok(self.nodes.read_internal(&cursor, id)?)
    }

    pub fn write_leaf(&self, id: PageId, generation: u32, entries: &[LeafEntry]) -> Result<()> {
        let mut cursor = self.paged_file.io_exclusive(id)?;
        self.nodes.write_leaf(&mut cursor, generation, entries);
        Ok(())
    }

    pub fn write_internal(
        &self,
        id: PageId,
        generation: u32,
        contents: &InternalContents,
    ) -> Result<()> {
        let mut cursor = self.paged_file.io_exclusive(id)?;
        self.nodes.write_internal(&mut cursor, generation, contents);
        Ok(())
    }

    pub fn leaf_key(&self, entry: &LeafEntry) -> Result<L::Key> {
        match entry {
            LeafEntry::Inline { key, .. } => Ok(self.layout.read_key(key)),
            LeafEntry::Offloaded(id) => Ok(self.layout.read_key(&self.offload.read_key(*id)?)),
        }
    }

    pub fn leaf_key_value(&self, entry: &LeafEntry) -> Result<(L::Key, L::Value)> {
        match entry {
            LeafEntry::Inline { key, value } => {
                Ok((self.layout.read_key(key), self.layout.read_value(value)))
            }
            LeafEntry::Offloaded(id) => {
                let (key, value) = self.offload.read_key_value(*id)?;
                Ok((self.layout.read_key(&key), self.layout.read_value(&value)))
            }
        }
    }

    pub fn internal_key(&self, key: &InternalKey) -> Result<L::Key> {
        match key {
            InternalKey::Inline(bytes) => Ok(self.layout.read_key(bytes)),
            InternalKey::Offloaded(id) => Ok(self.layout.read_key(&self.offload.read_key(*id)?)),
        }
    }

    /// Child to follow towards `key`: the number of keys not greater than
    /// `key`, or with `strict` the number of keys less than `key`.
    pub fn child_position(
        &self,
        contents: &InternalContents,
        key: &L::Key,
        strict: bool,
    ) -> Result<usize> {
        let mut low = 0;
        let mut high = contents.keys.len();
        while low < high {
            let mid = low + (high - low) / 2;
            let mid_key = self.internal_key(&contents.keys[mid])?;
            let go_right = match self.layout.compare(&mid_key, key) {
                KeyOrdering::Less => true,
                KeyOrdering::Equal => !strict,
                KeyOrdering::Greater => false,
            };
            if go_right {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }

    /// `Ok(pos)` when `key` is at `pos`, `Err(pos)` with the insert position
    /// otherwise.
    pub fn search_leaf(
        &self,
        entries: &[LeafEntry],
        key: &L::Key,
    ) -> Result<std::result::Result<usize, usize>> {
        let mut low = 0;
        let mut high = entries.len();
        while low < high {
            let mid = low + (high - low) / 2;
            let mid_key = self.leaf_key(&entries[mid])?;
            match self.layout.compare(&mid_key, key) {
                KeyOrdering::Less => low = mid + 1,
                KeyOrdering::Greater => high = mid,
                KeyOrdering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(low))
    }

    /// Build a leaf entry, writing an offload record when it is too big to
    /// stay inline.
    pub fn make_leaf_entry(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        generation: Generation,
    ) -> Result<LeafEntry> {
        if self.nodes.needs_offload(key.len(), value.len()) {
            let id = self.offload.write_key_value(&key, &value, generation)?;
            Ok(LeafEntry::Offloaded(id))
        } else {
            Ok(LeafEntry::Inline { key, value })
        }
    }

    pub fn make_internal_key(&self, key: Vec<u8>, generation: Generation) -> Result<InternalKey> {
        if self.nodes.needs_offload(key.len(), 0) {
            Ok(InternalKey::Offloaded(self.offload.write_key(&key, generation)?))
        } else {
            Ok(InternalKey::Inline(key))
        }
    }

    /// Same size accounting as [`Self::make_internal_key`] without writing
    /// anything.
    fn planned_internal_key(&self, key: &[u8]) -> InternalKey {
        if self.nodes.needs_offload(key.len(), 0) {
            InternalKey::Offloaded(NO_PAGE)
        } else {
            InternalKey::Inline(key.to_vec())
        }
    }

    pub fn free_offload(&self, id: Option<PageId>, generation: Generation) -> Result<()> {
        match id {
            Some(id) => self.offload.free(id, generation),
            None => Ok(()),
        }
    }
}

impl<L: Layout> std::fmt::Debug for TreeCore<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCore")
            .field("paged_file", &self.paged_file)
            .field("nodes", &self.nodes)
            .field("root", &self.root())
            .finish_non_exhaustive()
    }
}

/// What to do with the entry of a key, decided from its current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<V> {
    Keep,
    Write(V),
    Remove,
}

enum Attempt<V> {
    Done(Option<V>),
    Restart,
    Pessimistic,
}

/// A node on the descent path and its position in the parent.
#[derive(Debug, Clone, Copy)]
struct PathNode {
    id: PageId,
    child_pos: usize,
}

/// The neighbour a node merges or rebalances with.
#[derive(Debug, Clone, Copy)]
struct Sibling {
    pos: usize,
    is_left: bool,
}

impl Sibling {
    /// Prefer the left neighbour.
    const fn of(pos: usize, child_count: usize) -> Option<Self> {
        if pos > 0 {
            Some(Self {
                pos: pos - 1,
                is_left: true,
            })
        } else if child_count > 1 {
            Some(Self {
                pos: 1,
                is_left: false,
            })
        } else {
            None
        }
    }

    /// Parent key between the node at `node_pos` and this sibling.
    const fn separator_pos(self, node_pos: usize) -> usize {
        if self.is_left { self.pos } else { node_pos }
    }
}

struct LeafSplit<K> {
    pos: usize,
    separator: K,
}

/// One writer operation against the tree, in one generation.
pub struct InternalTreeLogic<'a, L: Layout> {
    core: &'a TreeCore<L>,
    generation: Generation,
    coordination: &'a mut LatchCrabbingCoordination,
    split_ratio: f64,
}

impl<'a, L: Layout> InternalTreeLogic<'a, L> {
    pub fn new(
        core: &'a TreeCore<L>,
        generation: Generation,
        coordination: &'a mut LatchCrabbingCoordination,
        split_ratio: f64,
    ) -> Self {
        Self {
            core,
            generation,
            coordination,
            split_ratio,
        }
    }

    /// Insert, replace or remove the entry of `key` as `decide` says, given
    /// its current value. Returns the value the key had before.
    ///
    /// `decide` may be called more than once when the operation is retried.
    pub fn modify<F>(&mut self, key: &L::Key, mut decide: F) -> Result<Option<L::Value>>
    where
        F: FnMut(Option<&L::Value>) -> Decision<L::Value>,
    {
        let mut catchup = TripCountingRootCatchup::new();
        let mut restarts = 0;
        let result = loop {
            match self.attempt(key, &mut decide, &mut catchup) {
                Ok(Attempt::Done(previous)) => break Ok(previous),
                Ok(Attempt::Restart) => {
                    restarts += 1;
                    if restarts >= MAX_OPTIMISTIC_RESTARTS {
                        self.coordination.flip_to_pessimistic();
                    } else {
                        std::thread::yield_now();
                    }
                }
                Ok(Attempt::Pessimistic) => self.coordination.flip_to_pessimistic(),
                Err(e) => break Err(e),
            }
        };
        self.coordination.reset();
        result
    }

    fn attempt<F>(
        &mut self,
        key: &L::Key,
        decide: &mut F,
        catchup: &mut TripCountingRootCatchup,
    ) -> Result<Attempt<L::Value>>
    where
        F: FnMut(Option<&L::Value>) -> Decision<L::Value>,
    {
        self.coordination.begin_operation();
        let root = self.latch_root(catchup)?;
        let mut path = vec![PathNode {
            id: root.id,
            child_pos: 0,
        }];
        loop {
            let current = path[path.len() - 1];
            let summary = self.core.node_summary(current.id)?;
            let needs_successor = self.generation.needs_successor(summary.generation);
            let is_internal = summary.node_type == NodeType::Internal;
            if !self.coordination.arrived_at_child(
                is_internal,
                summary.available_space,
                needs_successor,
            )? {
                return Ok(Attempt::Pessimistic);
            }
            if !is_internal {
                return self.modify_leaf(&mut path, key, decide);
            }
            if self.coordination.check_force_reset() {
                return Ok(Attempt::Restart);
            }
            if path.len() >= MAX_TREE_DEPTH {
                return Err(TreeError::TreeInconsistency(format!(
                    "descent passed {MAX_TREE_DEPTH} levels at page {}",
                    current.id
                )));
            }

            let contents = self.core.read_internal(current.id)?;
            let child_pos = self.core.child_position(&contents, key, false)?;
            let child_id = contents.children[child_pos];
            if child_id < MIN_TREE_NODE_ID {
                return Err(TreeError::TreeInconsistency(format!(
                    "page {} has child pointer {child_id} at position {child_pos}",
                    current.id
                )));
            }
            self.coordination.before_traversing_to_child(child_id)?;
            path.push(PathNode {
                id: child_id,
                child_pos,
            });
        }
    }

    /// Latch the root and make sure it still is the root.
    fn latch_root(&mut self, catchup: &mut TripCountingRootCatchup) -> Result<Root> {
        let mut root = self.core.root();
        loop {
            self.coordination.before_traversing_to_child(root.id)?;
            let current = self.core.root();
            if current == root {
                return Ok(root);
            }
            self.coordination.begin_operation();
            root = catchup.catch_up(current)?;
        }
    }

    fn modify_leaf<F>(
        &mut self,
        path: &mut [PathNode],
        key: &L::Key,
        decide: &mut F,
    ) -> Result<Attempt<L::Value>>
    where
        F: FnMut(Option<&L::Value>) -> Decision<L::Value>,
    {
        let level = path.len() - 1;
        let entries = self.core.read_leaf(path[level].id)?;
        let search = self.core.search_leaf(&entries, key)?;
        let existing = match search {
            Ok(pos) => Some(self.core.leaf_key_value(&entries[pos])?.1),
            Err(_) => None,
        };

        let applied = match (decide(existing.as_ref()), search) {
            (Decision::Keep, _) | (Decision::Remove, Err(_)) => true,
            (Decision::Remove, Ok(pos)) => self.remove_from_leaf(path, &entries, pos)?,
            (Decision::Write(value), _) => self.write_to_leaf(path, entries, search, key, &value)?,
        };
        Ok(if applied {
            Attempt::Done(existing)
        } else {
            Attempt::Pessimistic
        })
    }

    /// Returns `false` if the write needs a pessimistic retry.
    fn write_to_leaf(
        &mut self,
        path: &mut [PathNode],
        mut entries: Vec<LeafEntry>,
        search: std::result::Result<usize, usize>,
        key: &L::Key,
        value: &L::Value,
    ) -> Result<bool> {
        let core = self.core;
        let nodes = core.nodes;
        let level = path.len() - 1;
        let key_bytes = core.layout.key_bytes(key);
        let value_bytes = core.layout.value_bytes(value);
        core.check_entry_size(key_bytes.len(), value_bytes.len())?;

        // Offloaded entries take the same room whatever their id.
        let planned = if nodes.needs_offload(key_bytes.len(), value_bytes.len()) {
            LeafEntry::Offloaded(NO_PAGE)
        } else {
            LeafEntry::Inline {
                key: key_bytes.clone(),
                value: value_bytes.clone(),
            }
        };
        let (pos, replaced) = match search {
            Ok(pos) => (pos, Some(std::mem::replace(&mut entries[pos], planned))),
            Err(pos) => {
                entries.insert(pos, planned);
                (pos, None)
            }
        };

        if nodes.leaf_fits(&entries) {
            let leaf_id = self.ensure_writable(path, level)?;
            let entry = core.make_leaf_entry(key_bytes, value_bytes, self.generation)?;
            let mut cursor = core.paged_file.io_exclusive(leaf_id)?;
            let in_place = if replaced.is_some() {
                nodes.replace_leaf_at(&mut cursor, leaf_id, pos, &entry)?
            } else {
                nodes.insert_leaf_at(&mut cursor, leaf_id, pos, &entry)?
            };
            if !in_place {
                entries[pos] = entry;
                nodes.write_leaf(&mut cursor, self.generation.unstable(), &entries);
            }
        } else {
            let split = self.plan_leaf_split(&entries, pos, key)?;
            let separator_bytes = core.layout.key_bytes(&split.separator);
            let planned_separator = core.planned_internal_key(&separator_bytes);
            if !self
                .coordination
                .before_splitting_leaf(nodes.internal_key_space(&planned_separator))?
            {
                return Ok(false);
            }
            if !self.coordination.is_pessimistic()
                && !self.parent_accepts(path, level, planned_separator)?
            {
                return Ok(false);
            }

            self.ensure_writable(path, level)?;
            entries[pos] = core.make_leaf_entry(key_bytes, value_bytes, self.generation)?;
            let separator = core.make_internal_key(separator_bytes, self.generation)?;
            self.split_leaf(path, level, &entries, split.pos, separator)?;
        }

        if let Some(old) = replaced {
            core.free_offload(old.offload_id(), self.generation)?;
        }
        core.mark_changed();
        Ok(true)
    }

    /// Whether the parent of `path[level]` takes one more key without
    /// splitting.
    fn parent_accepts(&self, path: &[PathNode], level: usize, key: InternalKey) -> Result<bool> {
        if level == 0 {
            return Ok(false);
        }
        let mut contents = self.core.read_internal(path[level - 1].id)?;
        contents.keys.insert(path[level].child_pos, key);
        Ok(self.core.nodes.internal_fits(&contents.keys))
    }

    /// Where to split an overfull leaf and the separator to push up. The
    /// entry at `new_pos` may not be written yet, so its key is `new_key`.
    fn plan_leaf_split(
        &self,
        entries: &[LeafEntry],
        new_pos: usize,
        new_key: &L::Key,
    ) -> Result<LeafSplit<L::Key>> {
        let pos = self.choose_leaf_split(entries, self.split_ratio)?;
        let key_at = |i: usize| {
            if i == new_pos {
                Ok(new_key.clone())
            } else {
                self.core.leaf_key(&entries[i])
            }
        };
        let left = key_at(pos - 1)?;
        let right = key_at(pos)?;
        Ok(LeafSplit {
            pos,
            separator: self.core.layout.minimal_splitter(&left, &right),
        })
    }

    /// Split position in `1..len` whose halves both fit and whose left half
    /// is closest to `ratio` of the total.
    fn choose_leaf_split(&self, entries: &[LeafEntry], ratio: f64) -> Result<usize> {
        let nodes = self.core.nodes;
        let capacity = nodes.total_space(NodeType::Leaf);
        let sizes: Vec<usize> = entries.iter().map(|e| nodes.leaf_entry_space(e)).collect();
        let total: usize = sizes.iter().sum();
        let target = ratio * total as f64;

        let mut best: Option<(usize, f64)> = None;
        let mut left = 0;
        for pos in 1..entries.len() {
            left += sizes[pos - 1];
            if left > capacity || total - left > capacity {
                continue;
            }
            let distance = (left as f64 - target).abs();
            if best.is_none_or(|(_, d)| distance < d) {
                best = Some((pos, distance));
            }
        }
        best.map(|(pos, _)| pos).ok_or_else(|| {
            TreeError::TreeInconsistency(format!(
                "no split point for {} entries of {total} bytes",
                entries.len()
            ))
        })
    }

    /// Middle key of an overfull internal node: keys left of it stay, keys
    /// right of it move to a new node.
    fn choose_internal_split(&self, keys: &[InternalKey]) -> Result<usize> {
        let nodes = self.core.nodes;
        let capacity = nodes.total_space(NodeType::Internal);
        let sizes: Vec<usize> = keys.iter().map(|k| nodes.internal_key_space(k)).collect();
        let total: usize = sizes.iter().sum();

        let mut best: Option<(usize, usize)> = None;
        let mut left = 0;
        for middle in 1..keys.len().saturating_sub(1) {
            left += sizes[middle - 1];
            let right = total - left - sizes[middle];
            if left > capacity || right > capacity {
                continue;
            }
            let distance = left.abs_diff(right);
            if best.is_none_or(|(_, d)| distance < d) {
                best = Some((middle, distance));
            }
        }
        best.map(|(middle, _)| middle).ok_or_else(|| {
            TreeError::TreeInconsistency(format!(
                "no split point for internal node with {} keys",
                keys.len()
            ))
        })
    }

    fn split_leaf(
        &mut self,
        path: &mut [PathNode],
        level: usize,
        entries: &[LeafEntry],
        split_pos: usize,
        separator: InternalKey,
    ) -> Result<()> {
        let unstable = self.generation.unstable();
        let left_id = path[level].id;
        let right_id = self.acquire_id()?;
        self.core.write_leaf(left_id, unstable, &entries[..split_pos])?;
        self.core.write_leaf(right_id, unstable, &entries[split_pos..])?;
        let parent_id = self.insert_into_parent(path, level, separator, right_id)?;
        self.core.log_event(
            unstable,
            StructureEvent::Split {
                parent_id,
                child_id: left_id,
                created_child_id: right_id,
            },
        );
        Ok(())
    }

    /// Add `key` and its right child next to `path[level]` in the parent,
    /// splitting upwards as needed. Returns the node the key went into.
    fn insert_into_parent(
        &mut self,
        path: &mut [PathNode],
        level: usize,
        key: InternalKey,
        right_id: PageId,
    ) -> Result<PageId> {
        let unstable = self.generation.unstable();
        if level == 0 {
            let new_root = self.acquire_id()?;
            let contents = InternalContents {
                keys: vec![key],
                children: vec![path[0].id, right_id],
            };
            self.core.write_internal(new_root, unstable, &contents)?;
            self.core.set_root(Root {
                id: new_root,
                generation: unstable,
            });
            self.core.log_event(
                unstable,
                StructureEvent::GrowTree {
                    created_root_id: new_root,
                },
            );
            self.core.monitor.tree_growth(new_root);
            debug!(root = new_root, "Tree grew by one level");
            return Ok(new_root);
        }

        let parent_level = level - 1;
        let parent_id = self.ensure_writable(path, parent_level)?;
        let mut contents = self.core.read_internal(parent_id)?;
        let pos = path[level].child_pos;
        contents.keys.insert(pos, key);
        contents.children.insert(pos + 1, right_id);
        if self.core.nodes.internal_fits(&contents.keys) {
            self.core.write_internal(parent_id, unstable, &contents)?;
            return Ok(parent_id);
        }

        let middle = self.choose_internal_split(&contents.keys)?;
        let mut left_keys = contents.keys;
        let right_keys = left_keys.split_off(middle + 1);
        let Some(up) = left_keys.pop() else {
            return Err(TreeError::TreeInconsistency(format!(
                "internal split of page {parent_id} left no key to push up"
            )));
        };
        let mut left_children = contents.children;
        let right_children = left_children.split_off(middle + 1);

        let new_id = self.acquire_id()?;
        self.core.write_internal(
            parent_id,
            unstable,
            &InternalContents {
                keys: left_keys,
                children: left_children,
            },
        )?;
        self.core.write_internal(
            new_id,
            unstable,
            &InternalContents {
                keys: right_keys,
                children: right_children,
            },
        )?;
        let grandparent_id = self.insert_into_parent(path, parent_level, up, new_id)?;
        self.core.log_event(
            unstable,
            StructureEvent::Split {
                parent_id: grandparent_id,
                child_id: parent_id,
                created_child_id: new_id,
            },
        );
        Ok(parent_id)
    }

    /// Returns `false` if the removal needs a pessimistic retry.
    fn remove_from_leaf(
        &mut self,
        path: &mut [PathNode],
        entries: &[LeafEntry],
        pos: usize,
    ) -> Result<bool> {
        let core = self.core;
        let nodes = core.nodes;
        let level = path.len() - 1;
        if !self
            .coordination
            .before_removal_from_leaf(nodes.leaf_entry_space(&entries[pos]))
        {
            return Ok(false);
        }

        let leaf_id = self.ensure_writable(path, level)?;
        let available = {
            let mut cursor = core.paged_file.io_exclusive(leaf_id)?;
            nodes.remove_leaf_at(&mut cursor, leaf_id, pos)?;
            nodes.available_space(&cursor, NodeType::Leaf)
        };
        core.free_offload(entries[pos].offload_id(), self.generation)?;
        core.mark_changed();

        if level > 0
            && self.coordination.is_pessimistic()
            && available > nodes.leaf_underflow_threshold()
        {
            self.rebalance_leaf(path, level)?;
        }
        Ok(true)
    }

    /// Merge an underflowed leaf with a sibling, or move entries over from
    /// the sibling when both do not fit in one leaf.
    fn rebalance_leaf(&mut self, path: &mut [PathNode], level: usize) -> Result<()> {
        let core = self.core;
        let unstable = self.generation.unstable();
        let parent_level = level - 1;
        let parent = core.read_internal(path[parent_level].id)?;
        let pos = path[level].child_pos;
        let Some(sibling) = Sibling::of(pos, parent.children.len()) else {
            return Ok(());
        };
        let sibling_id = parent.children[sibling.pos];
        let _sibling_latch = LatchGuard::write(&core.latch_service, sibling_id)?;

        let leaf_id = path[level].id;
        let leaf_entries = core.read_leaf(leaf_id)?;
        let sibling_entries = core.read_leaf(sibling_id)?;
        let separator_pos = sibling.separator_pos(pos);
        let all: Vec<LeafEntry> = if sibling.is_left {
            sibling_entries.into_iter().chain(leaf_entries).collect()
        } else {
            leaf_entries.into_iter().chain(sibling_entries).collect()
        };

        if core.nodes.leaf_fits(&all) {
            core.write_leaf(leaf_id, unstable, &all)?;
            let parent_id = self.ensure_writable(path, parent_level)?;
            let mut contents = core.read_internal(parent_id)?;
            let removed = contents.keys.remove(separator_pos);
            contents.children.remove(sibling.pos);
            core.write_internal(parent_id, unstable, &contents)?;
            if sibling.is_left {
                path[level].child_pos -= 1;
            }
            core.free_offload(removed.offload_id(), self.generation)?;
            self.release_id(sibling_id)?;
            core.log_event(
                unstable,
                StructureEvent::Merge {
                    parent_id,
                    child_id: leaf_id,
                    deleted_child_id: sibling_id,
                },
            );
            return self.after_internal_removal(path, parent_level);
        }

        let split = self.choose_leaf_split(&all, 0.5)?;
        let left_key = core.leaf_key(&all[split - 1])?;
        let right_key = core.leaf_key(&all[split])?;
        let separator_bytes = core
            .layout
            .key_bytes(&core.layout.minimal_splitter(&left_key, &right_key));
        let mut keys = parent.keys;
        keys[separator_pos] = core.planned_internal_key(&separator_bytes);
        if !core.nodes.internal_fits(&keys) {
            return Ok(());
        }

        let sibling_id = self.ensure_sibling_writable(path, parent_level, sibling.pos, sibling_id)?;
        let (left_id, right_id) = if sibling.is_left {
            (sibling_id, leaf_id)
        } else {
            (leaf_id, sibling_id)
        };
        core.write_leaf(left_id, unstable, &all[..split])?;
        core.write_leaf(right_id, unstable, &all[split..])?;

        let separator = core.make_internal_key(separator_bytes, self.generation)?;
        let parent_id = self.ensure_writable(path, parent_level)?;
        let mut contents = core.read_internal(parent_id)?;
        let old = std::mem::replace(&mut contents.keys[separator_pos], separator);
        core.write_internal(parent_id, unstable, &contents)?;
        core.free_offload(old.offload_id(), self.generation)
    }

    /// `path[level]` lost a key. Shrink the tree if it is an empty root,
    /// merge it with a sibling if it underflowed.
    fn after_internal_removal(&mut self, path: &mut [PathNode], level: usize) -> Result<()> {
        let core = self.core;
        let unstable = self.generation.unstable();
        let id = path[level].id;
        let contents = core.read_internal(id)?;
        if level == 0 {
            if contents.keys.is_empty() {
                self.shrink_tree(id, contents.children[0])?;
            }
            return Ok(());
        }

        let available = core.node_summary(id)?.available_space;
        if available <= core.nodes.total_space(NodeType::Internal) / 2 {
            return Ok(());
        }
        let parent_level = level - 1;
        let parent = core.read_internal(path[parent_level].id)?;
        let pos = path[level].child_pos;
        let Some(sibling) = Sibling::of(pos, parent.children.len()) else {
            return Ok(());
        };
        let sibling_id = parent.children[sibling.pos];
        let _sibling_latch = LatchGuard::write(&core.latch_service, sibling_id)?;
        let sibling_contents = core.read_internal(sibling_id)?;
        let separator_pos = sibling.separator_pos(pos);

        // The separator moves down between the two halves.
        let (left, right) = if sibling.is_left {
            (sibling_contents, contents)
        } else {
            (contents, sibling_contents)
        };
        let mut keys = left.keys;
        keys.push(parent.keys[separator_pos].clone());
        keys.extend(right.keys);
        if !core.nodes.internal_fits(&keys) {
            return Ok(());
        }
        let mut children = left.children;
        children.extend(right.children);
        core.write_internal(id, unstable, &InternalContents { keys, children })?;

        let parent_id = self.ensure_writable(path, parent_level)?;
        let mut parent_contents = core.read_internal(parent_id)?;
        parent_contents.keys.remove(separator_pos);
        parent_contents.children.remove(sibling.pos);
        core.write_internal(parent_id, unstable, &parent_contents)?;
        if sibling.is_left {
            path[level].child_pos -= 1;
        }
        self.release_id(sibling_id)?;
        core.log_event(
            unstable,
            StructureEvent::Merge {
                parent_id,
                child_id: id,
                deleted_child_id: sibling_id,
            },
        );
        self.after_internal_removal(path, parent_level)
    }

    fn shrink_tree(&mut self, old_root: PageId, new_root: PageId) -> Result<()> {
        let unstable = self.generation.unstable();
        let generation = self.core.node_summary(new_root)?.generation;
        self.core.set_root(Root {
            id: new_root,
            generation,
        });
        self.release_id(old_root)?;
        self.core.log_event(
            unstable,
            StructureEvent::ShrinkTree {
                deleted_root_id: old_root,
            },
        );
        self.core.monitor.tree_shrink(new_root);
        debug!(root = new_root, "Tree shrank by one level");
        Ok(())
    }

    /// Make `path[level]` writable in the unstable generation, creating its
    /// successor and repointing its parent (or the root) when needed.
    /// Returns the id to write to.
    fn ensure_writable(&mut self, path: &mut [PathNode], level: usize) -> Result<PageId> {
        let id = path[level].id;
        let node_generation = self.core.node_summary(id)?.generation;
        if !self.generation.needs_successor(node_generation) {
            return Ok(id);
        }

        let unstable = self.generation.unstable();
        let successor = self.copy_to_successor(id)?;
        self.coordination.update_node_id(id, successor)?;
        self.release_id(id)?;
        path[level].id = successor;

        let parent_id = if level == 0 {
            self.core.set_root(Root {
                id: successor,
                generation: unstable,
            });
            NO_PAGE
        } else {
            let parent_id = self.ensure_writable(path, level - 1)?;
            let mut cursor = self.core.paged_file.io_exclusive(parent_id)?;
            self.core
                .nodes
                .set_child_at(&mut cursor, path[level].child_pos, successor);
            parent_id
        };
        self.core.log_event(
            unstable,
            StructureEvent::CreateSuccessor {
                parent_id,
                old_id: id,
                new_id: successor,
            },
        );
        Ok(successor)
    }

    /// Successor handling for a sibling latched outside the coordination.
    fn ensure_sibling_writable(
        &mut self,
        path: &mut [PathNode],
        parent_level: usize,
        sibling_pos: usize,
        sibling_id: PageId,
    ) -> Result<PageId> {
        let node_generation = self.core.node_summary(sibling_id)?.generation;
        if !self.generation.needs_successor(node_generation) {
            return Ok(sibling_id);
        }
        let successor = self.copy_to_successor(sibling_id)?;
        self.release_id(sibling_id)?;
        let parent_id = self.ensure_writable(path, parent_level)?;
        {
            let mut cursor = self.core.paged_file.io_exclusive(parent_id)?;
            self.core
                .nodes
                .set_child_at(&mut cursor, sibling_pos, successor);
        }
        self.core.log_event(
            self.generation.unstable(),
            StructureEvent::CreateSuccessor {
                parent_id,
                old_id: sibling_id,
                new_id: successor,
            },
        );
        Ok(successor)
    }

    fn copy_to_successor(&self, id: PageId) -> Result<PageId> {
        let successor = self.acquire_id()?;
        let mut snapshot = Page::new(self.core.paged_file.page_size());
        snapshot.copy_from(&*self.core.paged_file.io_shared(id)?);
        node::set_generation(&mut snapshot, self.generation.unstable());
        self.core
            .paged_file
            .io_exclusive(successor)?
            .copy_from(&snapshot);
        Ok(successor)
    }

    fn acquire_id(&self) -> Result<PageId> {
        self.core
            .freelist
            .acquire_new_id(self.generation.stable(), self.generation.unstable())
    }

    fn release_id(&self, id: PageId) -> Result<()> {
        let unstable = self.generation.unstable();
        self.core
            .freelist
            .release_id(self.generation.stable(), unstable, id)?;
        self.core
            .log_event(unstable, StructureEvent::AddToFreelist { id });
        Ok(())
    }
}
