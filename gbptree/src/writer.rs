//! Writers.
//!
//! A [`Writer`] holds the shared side of the generation lock for its whole
//! life, so a checkpoint waits for every open writer to close. Any number of
//! writers may be open at once. Each operation latches only the nodes it
//! touches.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RawRwLock;
use parking_lot::lock_api::ArcRwLockReadGuard;
use tracing::debug;

use crate::config::validate_split_ratio;
use crate::coordination::LatchCrabbingCoordination;
use crate::error::{Result, TreeError};
use crate::generation::Generation;
use crate::layout::Layout;
use crate::seek::Seeker;
use crate::tree_logic::{Decision, InternalTreeLogic, TreeCore};

/// Outcome of merging a new value into an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult<V> {
    Unchanged,
    Replaced(V),
    Removed,
}

/// Combines the value already stored under a key with a new one.
pub trait ValueMerger<K, V> {
    fn merge(&self, key: &K, existing: &V, new: &V) -> MergeResult<V>;
}

impl<K, V, F> ValueMerger<K, V> for F
where
    F: Fn(&K, &V, &V) -> MergeResult<V>,
{
    fn merge(&self, key: &K, existing: &V, new: &V) -> MergeResult<V> {
        self(key, existing, new)
    }
}

/// Replace the existing value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overwrite;

impl<K, V: Clone> ValueMerger<K, V> for Overwrite {
    fn merge(&self, _key: &K, _existing: &V, new: &V) -> MergeResult<V> {
        MergeResult::Replaced(new.clone())
    }
}

/// Keep the existing value.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepExisting;

impl<K, V> ValueMerger<K, V> for KeepExisting {
    fn merge(&self, _key: &K, _existing: &V, _new: &V) -> MergeResult<V> {
        MergeResult::Unchanged
    }
}

/// What [`Writer::aggregate`] does with the first entry of the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstEntry {
    Unchanged,
    /// Write back the value the aggregator changed.
    Updated,
    /// Remove the first entry, typically after folding it into the next one.
    Consumed,
}

/// Decision of an aggregator over the first two entries of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregation {
    pub first: FirstEntry,
    /// Write back the value of the second entry.
    pub next_updated: bool,
}

/// A writer over a [`crate::GbpTree`].
pub struct Writer<L: Layout> {
    core: Arc<TreeCore<L>>,
    generation: Option<ArcRwLockReadGuard<RawRwLock, Generation>>,
    coordination: LatchCrabbingCoordination,
    split_ratio: f64,
}

#[allow(clippy::significant_drop_tightening)] // Structure guard spans each operation
impl<L: Layout> Writer<L> {
    pub fn new(core: Arc<TreeCore<L>>, split_ratio: f64) -> Self {
        let generation = core.generation.read_arc();
        let coordination = LatchCrabbingCoordination::new(
            Arc::clone(&core.latch_service),
            core.nodes.leaf_underflow_threshold(),
        );
        debug!(generation = %*generation, "Writer opened");
        Self {
            core,
            generation: Some(generation),
            coordination,
            split_ratio,
        }
    }

    fn generation(&self) -> Result<Generation> {
        self.generation
            .as_deref()
            .copied()
            .ok_or_else(|| TreeError::IllegalState("writer is closed".to_string()))
    }

    fn logic(&mut self) -> Result<InternalTreeLogic<'_, L>> {
        let generation = self.generation()?;
        Ok(InternalTreeLogic::new(
            &self.core,
            generation,
            &mut self.coordination,
            self.split_ratio,
        ))
    }

    /// Insert or overwrite.
    pub fn put(&mut self, key: &L::Key, value: &L::Value) -> Result<()> {
        let core = Arc::clone(&self.core);
        let _shared = core.structure_lock.read();
        self.logic()?
            .modify(key, |_| Decision::Write(value.clone()))?;
        Ok(())
    }

    /// Insert `value`, or merge it into the existing value of `key`.
    pub fn merge(
        &mut self,
        key: &L::Key,
        value: &L::Value,
        merger: &impl ValueMerger<L::Key, L::Value>,
    ) -> Result<()> {
        self.merge_with(key, value, merger, true)
    }

    /// Merge into the existing value of `key`. Does nothing if `key` is
    /// absent.
    pub fn merge_if_exists(
        &mut self,
        key: &L::Key,
        value: &L::Value,
        merger: &impl ValueMerger<L::Key, L::Value>,
    ) -> Result<()> {
        self.merge_with(key, value, merger, false)
    }

    fn merge_with(
        &mut self,
        key: &L::Key,
        value: &L::Value,
        merger: &impl ValueMerger<L::Key, L::Value>,
        insert_absent: bool,
    ) -> Result<()> {
        let core = Arc::clone(&self.core);
        let _shared = core.structure_lock.read();
        self.logic()?.modify(key, |existing| match existing {
            None if insert_absent => Decision::Write(value.clone()),
            None => Decision::Keep,
            Some(existing) => match merger.merge(key, existing, value) {
                MergeResult::Unchanged => Decision::Keep,
                MergeResult::Replaced(merged) => Decision::Write(merged),
                MergeResult::Removed => Decision::Remove,
            },
        })?;
        Ok(())
    }

    /// Remove `key`. Returns the value it had.
    pub fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>> {
        let core = Arc::clone(&self.core);
        let _shared = core.structure_lock.read();
        self.logic()?.modify(key, |existing| {
            if existing.is_some() {
                Decision::Remove
            } else {
                Decision::Keep
            }
        })
    }

    /// Hand the first two entries of `[from, to)` to `aggregator`, which
    /// may change both values, then apply its decision. No other writer
    /// operation runs in between. Returns the number of entries changed.
    pub fn aggregate<F>(&mut self, from: &L::Key, to: &L::Key, aggregator: F) -> Result<usize>
    where
        F: FnOnce(&L::Key, &mut L::Value, Option<(&L::Key, &mut L::Value)>) -> Aggregation,
    {
        let core = Arc::clone(&self.core);
        let _exclusive = core.structure_lock.write();
        self.generation()?;
        if core.layout.compare(from, to) != Ordering::Less {
            return Ok(0);
        }
        let mut entries = Seeker::new(&core, from.clone(), to.clone())
            .take(2)
            .collect::<Result<Vec<_>>>()?
            .into_iter();
        let Some((first_key, mut first_value)) = entries.next() else {
            return Ok(0);
        };
        let mut next = entries.next();
        let aggregation = aggregator(
            &first_key,
            &mut first_value,
            next.as_mut().map(|(key, value)| (&*key, value)),
        );

        let mut changed = 0;
        match aggregation.first {
            FirstEntry::Unchanged => {}
            FirstEntry::Updated => {
                self.logic()?
                    .modify(&first_key, |_| Decision::Write(first_value.clone()))?;
                changed += 1;
            }
            FirstEntry::Consumed => {
                self.logic()?.modify(&first_key, |_| Decision::Remove)?;
                changed += 1;
            }
        }
        if let (true, Some((next_key, next_value))) = (aggregation.next_updated, &next) {
            self.logic()?
                .modify(next_key, |_| Decision::Write(next_value.clone()))?;
            changed += 1;
        }
        Ok(changed)
    }

    /// Offer the smallest entry in `[from, to)` to `updater` and write back
    /// the value it returns. Returns whether an entry was found.
    pub fn update_ceiling_value<F>(&mut self, from: &L::Key, to: &L::Key, updater: F) -> Result<bool>
    where
        F: FnOnce(&L::Key, &L::Value) -> Option<L::Value>,
    {
        let core = Arc::clone(&self.core);
        let _exclusive = core.structure_lock.write();
        self.generation()?;
        if core.layout.compare(from, to) != Ordering::Less {
            return Ok(false);
        }
        let Some(ceiling) = Seeker::new(&core, from.clone(), to.clone()).next() else {
            return Ok(false);
        };
        let (key, value) = ceiling?;
        if let Some(updated) = updater(&key, &value) {
            self.logic()?
                .modify(&key, |_| Decision::Write(updated.clone()))?;
        }
        Ok(true)
    }

    #[must_use]
    pub const fn split_ratio(&self) -> f64 {
        self.split_ratio
    }

    /// Share of a splitting leaf kept on the left, in `[0, 1]`.
    pub fn set_split_ratio(&mut self, ratio: f64) -> Result<()> {
        validate_split_ratio(ratio)?;
        self.split_ratio = ratio;
        Ok(())
    }

    /// Let a pending checkpoint through, then continue in the generation it
    /// leaves behind.
    pub fn yield_now(&mut self) -> Result<()> {
        let Some(guard) = self.generation.take() else {
            return Err(TreeError::IllegalState("writer is closed".to_string()));
        };
        self.coordination.reset();
        drop(guard);
        std::thread::yield_now();
        self.generation = Some(self.core.generation.read_arc());
        Ok(())
    }

    /// Close the writer. Closing twice is an error.
    pub fn close(&mut self) -> Result<()> {
        if self.generation.take().is_none() {
            return Err(TreeError::IllegalState("writer already closed".to_string()));
        }
        self.coordination.reset();
        debug!("Writer closed");
        Ok(())
    }
}

impl<L: Layout> Drop for Writer<L> {
    fn drop(&mut self) {
        if self.generation.is_some() {
            let _ = self.close();
        }
    }
}

impl<L: Layout> std::fmt::Debug for Writer<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("generation", &self.generation.as_deref())
            .field("split_ratio", &self.split_ratio)
            .finish_non_exhaustive()
    }
}
