//! Latch crabbing for writers.
//!
//! A writer first descends optimistically: read latches on internal nodes,
//! keeping only the parent and the current node, and a write latch on the
//! leaf obtained by upgrading its read latch. Whenever a change cannot be
//! contained in what is write-latched, the coordination answers `false` and
//! the writer starts over in pessimistic mode, write-latching the whole path
//! from the root. Pessimistic mode holds until [`LatchCrabbingCoordination::reset`].

use std::sync::Arc;

use crate::latch::{LatchError, LongSpinLatch, TreeNodeLatchService};
use crate::page::PageId;

/// How a node on the stack is latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Read,
    Write,
}

/// Traversal mode of one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationMode {
    Optimistic,
    Pessimistic,
}

#[derive(Debug)]
struct LatchFrame {
    latch: Arc<LongSpinLatch>,
    mode: LatchMode,
    available_space: usize,
    needs_successor: bool,
}

impl LatchFrame {
    fn node_id(&self) -> PageId {
        self.latch.tree_node_id()
    }
}

/// Per-writer latch crabbing state.
#[derive(Debug)]
pub struct LatchCrabbingCoordination {
    latch_service: Arc<TreeNodeLatchService>,
    mode: CoordinationMode,
    stack: Vec<LatchFrame>,
    /// Latches of nodes replaced by successors during this operation. They
    /// stay held until the operation ends so nobody enters a stale node
    /// before the new id is published.
    retired: Vec<(Arc<LongSpinLatch>, LatchMode)>,
    /// A non-root leaf with more available space than this has underflowed.
    leaf_underflow_threshold: usize,
}

impl LatchCrabbingCoordination {
    /// Create a coordination in optimistic mode.
    #[must_use]
    pub const fn new(
        latch_service: Arc<TreeNodeLatchService>,
        leaf_underflow_threshold: usize,
    ) -> Self {
        Self {
            latch_service,
            mode: CoordinationMode::Optimistic,
            stack: Vec::new(),
            retired: Vec::new(),
            leaf_underflow_threshold,
        }
    }

    /// Current traversal mode.
    #[must_use]
    pub const fn mode(&self) -> CoordinationMode {
        self.mode
    }

    /// Whether the writer must latch the whole path.
    #[must_use]
    pub fn is_pessimistic(&self) -> bool {
        self.mode == CoordinationMode::Pessimistic
    }

    /// Start a traversal from the root. Drops latches left from a previous
    /// attempt but keeps the mode.
    pub fn begin_operation(&mut self) {
        self.release_all();
    }

    /// Drop all latches and switch to pessimistic mode for the rest of the
    /// operation.
    pub fn flip_to_pessimistic(&mut self) {
        self.release_all();
        self.mode = CoordinationMode::Pessimistic;
    }

    /// Drop all latches and return to optimistic mode.
    pub fn reset(&mut self) {
        self.release_all();
        self.mode = CoordinationMode::Optimistic;
    }

    /// Latch `child_id` before reading it. Read latch when optimistic, write
    /// latch when pessimistic. In optimistic mode only the parent stays
    /// latched above the child.
    pub fn before_traversing_to_child(&mut self, child_id: PageId) -> Result<(), LatchError> {
        let latch = self.latch_service.latch(child_id);
        let mode = match self.mode {
            CoordinationMode::Optimistic => LatchMode::Read,
            CoordinationMode::Pessimistic => LatchMode::Write,
        };
        let acquired = match mode {
            LatchMode::Read => latch.acquire_read(),
            LatchMode::Write => latch.acquire_write(),
        };
        if let Err(e) = acquired {
            self.latch_service.release(&latch);
            return Err(e);
        }
        self.stack.push(LatchFrame {
            latch,
            mode,
            available_space: 0,
            needs_successor: false,
        });

        if self.mode == CoordinationMode::Optimistic && self.stack.len() > 2 {
            let grandparent = self.stack.remove(0);
            self.release_frame(&grandparent);
        }
        Ok(())
    }

    /// Record what the writer found in the node it just latched. For an
    /// optimistic leaf this upgrades the leaf to write, and the parent too
    /// when the leaf must be copied into a successor. Returns `false` when the
    /// writer must retry pessimistically.
    pub fn arrived_at_child(
        &mut self,
        is_internal: bool,
        available_space: usize,
        needs_successor: bool,
    ) -> Result<bool, LatchError> {
        let Some(current) = self.stack.last_mut() else {
            return Ok(false);
        };
        current.available_space = available_space;
        current.needs_successor = needs_successor;

        if self.mode == CoordinationMode::Pessimistic || is_internal {
            return Ok(true);
        }

        if !Self::upgrade(current)? {
            return Ok(false);
        }
        if !needs_successor {
            return Ok(true);
        }

        // The successor's id has to be written into the parent. A root leaf
        // changes the root itself, which is left to pessimistic mode.
        let depth = self.stack.len();
        if depth < 2 {
            return Ok(false);
        }
        let parent = &mut self.stack[depth - 2];
        if parent.needs_successor {
            return Ok(false);
        }
        Self::upgrade(parent)
    }

    /// Ask whether the current leaf may split. Optimistically the parent must
    /// already be writable in place and have room for the new separator.
    pub fn before_splitting_leaf(&mut self, required_space: usize) -> Result<bool, LatchError> {
        if self.mode == CoordinationMode::Pessimistic {
            return Ok(true);
        }
        let depth = self.stack.len();
        if depth < 2 {
            return Ok(false);
        }
        let parent = &mut self.stack[depth - 2];
        if parent.needs_successor || parent.available_space < required_space {
            return Ok(false);
        }
        if !Self::upgrade(parent)? {
            return Ok(false);
        }
        parent.available_space -= required_space;
        Ok(true)
    }

    /// Ask whether `removed_space` bytes may leave the current leaf.
    /// Optimistically the leaf must not underflow, unless it is the root.
    pub fn before_removal_from_leaf(&mut self, removed_space: usize) -> bool {
        if self.mode == CoordinationMode::Pessimistic {
            return true;
        }
        let depth = self.stack.len();
        let Some(leaf) = self.stack.last_mut() else {
            return false;
        };
        let after = leaf.available_space + removed_space;
        if depth >= 2 && after > self.leaf_underflow_threshold {
            return false;
        }
        leaf.available_space = after;
        true
    }

    /// Release everything if a writer is spinning on any latch this
    /// optimistic traversal holds. Returns `true` if latches were dropped and
    /// the traversal must start over.
    pub fn check_force_reset(&mut self) -> bool {
        if self.mode == CoordinationMode::Pessimistic {
            return false;
        }
        let contended = self
            .stack
            .iter()
            .any(|frame| frame.latch.waiting_writers() > 0);
        if contended {
            self.release_all();
        }
        contended
    }

    /// A node on the stack has been replaced by a freshly allocated
    /// successor. The frame moves to a write latch on the new id, the old
    /// latch is kept until the operation ends.
    pub fn update_node_id(&mut self, old_id: PageId, new_id: PageId) -> Result<(), LatchError> {
        let Some(index) = self.stack.iter().rposition(|frame| frame.node_id() == old_id) else {
            return Ok(());
        };
        let latch = self.latch_service.latch(new_id);
        if let Err(e) = latch.acquire_write() {
            self.latch_service.release(&latch);
            return Err(e);
        }
        let old = std::mem::replace(&mut self.stack[index].latch, latch);
        let old_mode = std::mem::replace(&mut self.stack[index].mode, LatchMode::Write);
        self.retired.push((old, old_mode));
        Ok(())
    }

    /// Ids currently latched, root-most first.
    #[must_use]
    pub fn latched_node_ids(&self) -> Vec<(PageId, LatchMode)> {
        self.stack
            .iter()
            .map(|frame| (frame.node_id(), frame.mode))
            .collect()
    }

    fn upgrade(frame: &mut LatchFrame) -> Result<bool, LatchError> {
        if frame.mode == LatchMode::Write {
            return Ok(true);
        }
        if frame.latch.try_upgrade_to_write()? {
            frame.mode = LatchMode::Write;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn release_latch(&self, latch: &Arc<LongSpinLatch>, mode: LatchMode) {
        match mode {
            LatchMode::Read => latch.release_read(),
            LatchMode::Write => latch.release_write(),
        }
        self.latch_service.release(latch);
    }

    fn release_frame(&self, frame: &LatchFrame) {
        self.release_latch(&frame.latch, frame.mode);
    }

    fn release_all(&mut self) {
        while let Some(frame) = self.stack.pop() {
            self.release_frame(&frame);
        }
        while let Some((latch, mode)) = self.retired.pop() {
            self.release_latch(&latch, mode);
        }
    }
}

impl Drop for LatchCrabbingCoordination {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latch::LatchWaitState;
    use std::thread;
    use std::time::Duration;

    const ROOT: PageId = 10;
    const LEAF: PageId = 20;

    fn coordination(service: &Arc<TreeNodeLatchService>) -> LatchCrabbingCoordination {
        LatchCrabbingCoordination::new(Arc::clone(service), 100)
    }

    fn descend_to_leaf(coordination: &mut LatchCrabbingCoordination) {
        coordination
            .before_traversing_to_child(ROOT)
            .expect("should latch root");
        assert!(
            coordination
                .arrived_at_child(true, 50, false)
                .expect("alive")
        );
        coordination
            .before_traversing_to_child(LEAF)
            .expect("should latch leaf");
    }

    #[test]
    fn test_optimistic_leaf_is_upgraded() {
        let service = Arc::new(TreeNodeLatchService::new());
        let mut writer = coordination(&service);
        descend_to_leaf(&mut writer);
        assert!(writer.arrived_at_child(false, 40, false).expect("alive"));
        assert_eq!(
            writer.latched_node_ids(),
            vec![(ROOT, LatchMode::Read), (LEAF, LatchMode::Write)]
        );
        writer.reset();
        assert!(service.is_empty());
    }

    #[test]
    fn test_optimistic_keeps_only_parent() {
        let service = Arc::new(TreeNodeLatchService::new());
        let mut writer = coordination(&service);
        writer.before_traversing_to_child(1).expect("latch");
        assert!(writer.arrived_at_child(true, 10, false).expect("alive"));
        writer.before_traversing_to_child(2).expect("latch");
        assert!(writer.arrived_at_child(true, 10, false).expect("alive"));
        writer.before_traversing_to_child(3).expect("latch");
        let ids: Vec<PageId> = writer.latched_node_ids().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![2, 3]);
        writer.reset();
        assert!(service.is_empty());
    }

    #[test]
    fn test_successor_at_edge_needs_parent_write() {
        let service = Arc::new(TreeNodeLatchService::new());
        let mut writer = coordination(&service);
        writer.before_traversing_to_child(ROOT).expect("latch");
        assert!(writer.arrived_at_child(true, 50, false).expect("alive"));
        writer.before_traversing_to_child(LEAF).expect("latch");

        // Another reader on the parent blocks the upgrade.
        let other = service.latch(ROOT);
        other.acquire_read().expect("latch");
        assert!(!writer.arrived_at_child(false, 40, true).expect("alive"));
        other.release_read();
        service.release(&other);

        writer.flip_to_pessimistic();
        assert!(writer.is_pessimistic());
        writer.before_traversing_to_child(ROOT).expect("latch");
        assert!(writer.arrived_at_child(true, 50, false).expect("alive"));
        writer.before_traversing_to_child(LEAF).expect("latch");
        assert!(writer.arrived_at_child(false, 40, true).expect("alive"));
        assert_eq!(
            writer.latched_node_ids(),
            vec![(ROOT, LatchMode::Write), (LEAF, LatchMode::Write)]
        );
        writer.reset();
        assert!(!writer.is_pessimistic());
        assert!(service.is_empty());
    }

    #[test]
    fn test_successor_with_unwritable_parent_fails() {
        let service = Arc::new(TreeNodeLatchService::new());
        let mut writer = coordination(&service);
        writer.before_traversing_to_child(ROOT).expect("latch");
        // The parent itself is stable, so the change would cascade.
        assert!(writer.arrived_at_child(true, 50, true).expect("alive"));
        writer.before_traversing_to_child(LEAF).expect("latch");
        assert!(!writer.arrived_at_child(false, 40, true).expect("alive"));
        writer.reset();
    }

    #[test]
    fn test_split_checks_parent_space() {
        let service = Arc::new(TreeNodeLatchService::new());
        let mut writer = coordination(&service);
        descend_to_leaf(&mut writer);
        assert!(writer.arrived_at_child(false, 0, false).expect("alive"));
        assert!(!writer.before_splitting_leaf(51).expect("alive"));
        assert!(writer.before_splitting_leaf(30).expect("alive"));
        assert_eq!(writer.latched_node_ids()[0], (ROOT, LatchMode::Write));
        // Remembered space shrank by the first split.
        assert!(!writer.before_splitting_leaf(30).expect("alive"));
        writer.reset();
    }

    #[test]
    fn test_root_leaf_split_needs_pessimistic() {
        let service = Arc::new(TreeNodeLatchService::new());
        let mut writer = coordination(&service);
        writer.before_traversing_to_child(LEAF).expect("latch");
        assert!(writer.arrived_at_child(false, 0, false).expect("alive"));
        assert!(!writer.before_splitting_leaf(10).expect("alive"));
        writer.flip_to_pessimistic();
        writer.before_traversing_to_child(LEAF).expect("latch");
        assert!(writer.arrived_at_child(false, 0, false).expect("alive"));
        assert!(writer.before_splitting_leaf(10).expect("alive"));
        writer.reset();
    }

    #[test]
    fn test_removal_underflow_is_predicted() {
        let service = Arc::new(TreeNodeLatchService::new());
        let mut writer = coordination(&service);
        descend_to_leaf(&mut writer);
        assert!(writer.arrived_at_child(false, 80, false).expect("alive"));
        assert!(writer.before_removal_from_leaf(20));
        // 100 is the threshold, the first removal already took 20.
        assert!(!writer.before_removal_from_leaf(1));
        writer.reset();

        // A root leaf may shrink to nothing.
        writer.before_traversing_to_child(LEAF).expect("latch");
        assert!(writer.arrived_at_child(false, 95, false).expect("alive"));
        assert!(writer.before_removal_from_leaf(50));
        writer.reset();
    }

    #[test]
    fn test_update_node_id_moves_latch() {
        let service = Arc::new(TreeNodeLatchService::new());
        let mut writer = coordination(&service);
        descend_to_leaf(&mut writer);
        assert!(writer.arrived_at_child(false, 40, false).expect("alive"));
        writer.update_node_id(LEAF, 33).expect("alive");
        assert_eq!(
            writer.latched_node_ids(),
            vec![(ROOT, LatchMode::Read), (33, LatchMode::Write)]
        );
        // The replaced node stays latched until the operation ends.
        let stale = service.latch(LEAF);
        assert!(stale.is_write_locked());
        service.release(&stale);
        writer.reset();
        assert!(service.is_empty());
    }

    #[test]
    fn test_two_writers_force_reset() {
        let service = Arc::new(TreeNodeLatchService::new());
        let mut first = coordination(&service);
        let mut second = coordination(&service);

        // Both descend optimistically and meet on the leaf.
        descend_to_leaf(&mut first);
        descend_to_leaf(&mut second);

        // The upgrade is refused while the other writer reads the leaf.
        assert!(!first.arrived_at_child(false, 0, false).expect("alive"));
        first.flip_to_pessimistic();
        assert!(second.arrived_at_child(false, 0, false).expect("alive"));

        let root_latch = service.latch(ROOT);
        let pessimistic = thread::spawn(move || {
            first
                .before_traversing_to_child(ROOT)
                .expect("should latch root");
            assert!(first.arrived_at_child(true, 50, false).expect("alive"));
            first
                .before_traversing_to_child(LEAF)
                .expect("should latch leaf");
            assert!(first.arrived_at_child(false, 0, false).expect("alive"));
            assert!(first.before_splitting_leaf(10).expect("alive"));
            first.reset();
        });

        // Wait until the pessimistic writer spins on the root.
        let mut observed = false;
        for _ in 0..10_000 {
            if root_latch.wait_state() == LatchWaitState::WriteWaiting {
                observed = true;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(observed, "pessimistic writer never reached the root latch");

        assert!(second.check_force_reset());
        assert!(second.latched_node_ids().is_empty());
        pessimistic.join().expect("pessimistic writer should finish");
        assert!(!second.check_force_reset());

        service.release(&root_latch);
        assert!(service.is_empty());
    }
}
