//! Range reads.
//!
//! A seeker reads one leaf at a time. Each leaf is found by a fresh descent
//! from the root, latching hand over hand, and copied out whole while its read
//! latch is held. The separator that bounds the leaf on the far side becomes
//! the start of the next descent, so concurrent splits and merges never make
//! the seeker skip or repeat a key.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::Bound;

use crate::error::{Result, TreeError};
use crate::latch::LatchGuard;
use crate::layout::Layout;
use crate::node::NodeType;
use crate::root_catchup::TripCountingRootCatchup;
use crate::tree_logic::{MAX_TREE_DEPTH, TreeCore};

/// Iterator over `[from, to)` in ascending order, or over `(to, from]` in
/// descending order when `from` is greater than `to`.
pub struct Seeker<'a, L: Layout> {
    core: &'a TreeCore<L>,
    forward: bool,
    /// Where the next leaf read starts.
    position: Bound<L::Key>,
    /// Exclusive far end of the range.
    end: Bound<L::Key>,
    buffer: VecDeque<(L::Key, L::Value)>,
    finished: bool,
}

impl<'a, L: Layout> Seeker<'a, L> {
    /// Seek `[from, to)` if `from <= to`, otherwise `(to, from]` backwards.
    pub fn new(core: &'a TreeCore<L>, from: L::Key, to: L::Key) -> Self {
        let forward = core.layout.compare(&from, &to) != Ordering::Greater;
        let finished = core.layout.compare(&from, &to) == Ordering::Equal;
        Self {
            core,
            forward,
            position: Bound::Included(from),
            end: Bound::Excluded(to),
            buffer: VecDeque::new(),
            finished,
        }
    }

    /// Every entry, in ascending order.
    pub fn all(core: &'a TreeCore<L>) -> Self {
        Self {
            core,
            forward: true,
            position: Bound::Unbounded,
            end: Bound::Unbounded,
            buffer: VecDeque::new(),
            finished: false,
        }
    }

    #[must_use]
    pub const fn is_forward(&self) -> bool {
        self.forward
    }

    fn fill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.finished {
            let (entries, next) = self.read_next_leaf()?;
            if self.forward {
                for (key, value) in entries {
                    if self.after_position(&key) && self.before_end(&key) {
                        self.buffer.push_back((key, value));
                    }
                }
            } else {
                for (key, value) in entries.into_iter().rev() {
                    if self.after_position(&key) && self.before_end(&key) {
                        self.buffer.push_back((key, value));
                    }
                }
            }
            match next {
                Some(bound) if self.before_end(&bound) => {
                    self.position = if self.forward {
                        Bound::Included(bound)
                    } else {
                        Bound::Excluded(bound)
                    };
                }
                _ => self.finished = true,
            }
        }
        Ok(())
    }

    /// Whether `key` is not before the current position in seek order.
    fn after_position(&self, key: &L::Key) -> bool {
        let layout = &self.core.layout;
        match (&self.position, self.forward) {
            (Bound::Unbounded, _) => true,
            (Bound::Included(p), true) => layout.compare(key, p) != Ordering::Less,
            (Bound::Excluded(p), true) => layout.compare(key, p) == Ordering::Greater,
            (Bound::Included(p), false) => layout.compare(key, p) != Ordering::Greater,
            (Bound::Excluded(p), false) => layout.compare(key, p) == Ordering::Less,
        }
    }

    /// Whether `key` is strictly before the end in seek order.
    fn before_end(&self, key: &L::Key) -> bool {
        let layout = &self.core.layout;
        match &self.end {
            Bound::Unbounded => true,
            Bound::Included(e) | Bound::Excluded(e) => {
                let ordering = layout.compare(key, e);
                if self.forward {
                    ordering == Ordering::Less
                } else {
                    ordering == Ordering::Greater
                }
            }
        }
    }

    /// Descend to the leaf holding the current position and copy it out.
    /// Also returns the separator bounding the leaf in seek direction, `None`
    /// when the leaf is the last one.
    #[allow(clippy::type_complexity)]
    fn read_next_leaf(&self) -> Result<(Vec<(L::Key, L::Value)>, Option<L::Key>)> {
        let core = self.core;
        let mut catchup = TripCountingRootCatchup::new();
        let mut root = core.root();
        let mut guard = loop {
            let guard = LatchGuard::read(&core.latch_service, root.id)?;
            let current = core.root();
            if current == root {
                break guard;
            }
            drop(guard);
            root = catchup.catch_up(current)?;
        };

        let mut id = root.id;
        let mut next: Option<L::Key> = None;
        for _ in 0..MAX_TREE_DEPTH {
            if core.node_summary(id)?.node_type == NodeType::Leaf {
                let entries = core.read_leaf(id)?;
                let decoded = entries
                    .iter()
                    .map(|entry| core.leaf_key_value(entry))
                    .collect::<Result<Vec<_>>>()?;
                drop(guard);
                return Ok((decoded, next));
            }

            let contents = core.read_internal(id)?;
            let key_count = contents.keys.len();
            let pos = match (&self.position, self.forward) {
                (Bound::Unbounded, true) => 0,
                (Bound::Unbounded, false) => key_count,
                (Bound::Included(p), _) => core.child_position(&contents, p, false)?,
                (Bound::Excluded(p), true) => core.child_position(&contents, p, false)?,
                (Bound::Excluded(p), false) => core.child_position(&contents, p, true)?,
            };
            if self.forward && pos < key_count {
                next = Some(core.internal_key(&contents.keys[pos])?);
            } else if !self.forward && pos > 0 {
                next = Some(core.internal_key(&contents.keys[pos - 1])?);
            }
            id = contents.children[pos];
            guard = LatchGuard::read(&core.latch_service, id)?;
        }
        Err(TreeError::TreeInconsistency(format!(
            "seek passed {MAX_TREE_DEPTH} levels without reaching a leaf"
        )))
    }
}

impl<L: Layout> Iterator for Seeker<'_, L> {
    type Item = Result<(L::Key, L::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if let Err(e) = self.fill() {
                self.finished = true;
                self.buffer.clear();
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl<L: Layout> std::fmt::Debug for Seeker<'_, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seeker")
            .field("forward", &self.forward)
            .field("position", &self.position)
            .field("end", &self.end)
            .field("buffered", &self.buffer.len())
            .field("finished", &self.finished)
            .finish()
    }
}
