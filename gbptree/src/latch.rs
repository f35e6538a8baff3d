//! Per tree node read/write spin latches and their registry.
//!
//! Latches give writers logical exclusivity over a node across several page
//! pins. They spin instead of parking: critical sections are a handful of page
//! accesses, and spinning threads publish what they wait for so another thread
//! can see that someone is stuck behind a latch it holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::page::PageId;

const WRITE_LOCKED: u64 = 1 << 63;
const SPINS_BEFORE_YIELD: u32 = 64;

/// What, if anything, threads are currently spinning for on a latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchWaitState {
    /// Nobody is waiting.
    Idle,
    /// At least one thread waits for a read latch.
    ReadWaiting,
    /// At least one thread waits for the write latch.
    WriteWaiting,
}

/// A reference-counted read/write spin latch for one tree node.
#[derive(Debug)]
pub struct LongSpinLatch {
    tree_node_id: PageId,
    /// Bit 63 is the write bit, the rest is the reader count.
    state: AtomicU64,
    /// References held by coordinators. Zero means dead.
    ref_count: AtomicU32,
    waiting_readers: AtomicU32,
    waiting_writers: AtomicU32,
}

impl LongSpinLatch {
    fn new(tree_node_id: PageId) -> Self {
        Self {
            tree_node_id,
            state: AtomicU64::new(0),
            ref_count: AtomicU32::new(1),
            waiting_readers: AtomicU32::new(0),
            waiting_writers: AtomicU32::new(0),
        }
    }

    /// Tree node this latch guards.
    #[must_use]
    pub const fn tree_node_id(&self) -> PageId {
        self.tree_node_id
    }

    /// Whether all references are gone.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) == 0
    }

    /// Add a reference unless the latch already died.
    fn try_ref(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference. Returns `true` if this was the last one.
    fn deref_latch(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn check_alive(&self) -> Result<(), LatchError> {
        if self.is_dead() {
            Err(LatchError::Dead {
                tree_node_id: self.tree_node_id,
            })
        } else {
            Ok(())
        }
    }

    /// Acquire a read latch, spinning while a writer holds it.
    pub fn acquire_read(&self) -> Result<(), LatchError> {
        self.check_alive()?;
        let mut spins = 0;
        let mut waiting = false;
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current & WRITE_LOCKED == 0
                && self
                    .state
                    .compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                if waiting {
                    self.waiting_readers.fetch_sub(1, Ordering::AcqRel);
                }
                return Ok(());
            }
            if !waiting {
                waiting = true;
                self.waiting_readers.fetch_add(1, Ordering::AcqRel);
            }
            backoff(&mut spins);
        }
    }

    /// Release a read latch.
    pub fn release_read(&self) {
        self.state.fetch_sub(1, Ordering::AcqRel);
    }

    /// Acquire the write latch, spinning until no reader or writer holds it.
    pub fn acquire_write(&self) -> Result<(), LatchError> {
        self.check_alive()?;
        if self.try_acquire_write() {
            return Ok(());
        }
        self.waiting_writers.fetch_add(1, Ordering::AcqRel);
        let mut spins = 0;
        while !self.try_acquire_write() {
            backoff(&mut spins);
        }
        self.waiting_writers.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn try_acquire_write(&self) -> bool {
        self.state
            .compare_exchange(0, WRITE_LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the write latch.
    pub fn release_write(&self) {
        self.state.fetch_and(!WRITE_LOCKED, Ordering::AcqRel);
    }

    /// Turn the caller's read latch into the write latch, but only if the
    /// caller is the sole reader. On `false` the caller still holds its read
    /// latch.
    pub fn try_upgrade_to_write(&self) -> Result<bool, LatchError> {
        self.check_alive()?;
        Ok(self
            .state
            .compare_exchange(1, WRITE_LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Number of readers currently holding the latch.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn readers(&self) -> u32 {
        (self.state.load(Ordering::Acquire) & !WRITE_LOCKED) as u32
    }

    /// Whether a writer holds the latch.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) & WRITE_LOCKED != 0
    }

    /// Threads spinning for the write latch.
    #[must_use]
    pub fn waiting_writers(&self) -> u32 {
        self.waiting_writers.load(Ordering::Acquire)
    }

    /// What other threads are currently spinning for.
    #[must_use]
    pub fn wait_state(&self) -> LatchWaitState {
        if self.waiting_writers.load(Ordering::Acquire) > 0 {
            LatchWaitState::WriteWaiting
        } else if self.waiting_readers.load(Ordering::Acquire) > 0 {
            LatchWaitState::ReadWaiting
        } else {
            LatchWaitState::Idle
        }
    }
}

fn backoff(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

/// Registry of live latches, keyed by tree node id. Owned by one tree.
#[derive(Debug, Default)]
pub struct TreeNodeLatchService {
    latches: Mutex<HashMap<PageId, Arc<LongSpinLatch>>>,
}

impl TreeNodeLatchService {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live latch for `tree_node_id`, taking a reference on it.
    /// Creates and registers a new latch if none is live.
    pub fn latch(&self, tree_node_id: PageId) -> Arc<LongSpinLatch> {
        let mut latches = self.latches.lock();
        if let Some(existing) = latches.get(&tree_node_id) {
            if existing.try_ref() {
                return Arc::clone(existing);
            }
        }
        let latch = Arc::new(LongSpinLatch::new(tree_node_id));
        latches.insert(tree_node_id, Arc::clone(&latch));
        latch
    }

    /// Drop a reference taken by [`Self::latch`]. A latch whose last
    /// reference goes away removes itself from the registry.
    pub fn release(&self, latch: &Arc<LongSpinLatch>) {
        if latch.deref_latch() {
            let mut latches = self.latches.lock();
            if latches
                .get(&latch.tree_node_id())
                .is_some_and(|current| Arc::ptr_eq(current, latch))
            {
                latches.remove(&latch.tree_node_id());
            }
        }
    }

    /// Number of registered latches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.latches.lock().len()
    }

    /// Whether no latch is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.latches.lock().is_empty()
    }
}

/// A latch held in one mode until dropped.
#[derive(Debug)]
pub struct LatchGuard<'a> {
    service: &'a TreeNodeLatchService,
    latch: Arc<LongSpinLatch>,
    write: bool,
}

impl<'a> LatchGuard<'a> {
    /// Take the read latch of `tree_node_id`.
    pub fn read(service: &'a TreeNodeLatchService, tree_node_id: PageId) -> Result<Self, LatchError> {
        Self::acquire(service, tree_node_id, false)
    }

    /// Take the write latch of `tree_node_id`.
    pub fn write(service: &'a TreeNodeLatchService, tree_node_id: PageId) -> Result<Self, LatchError> {
        Self::acquire(service, tree_node_id, true)
    }

    fn acquire(
        service: &'a TreeNodeLatchService,
        tree_node_id: PageId,
        write: bool,
    ) -> Result<Self, LatchError> {
        let latch = service.latch(tree_node_id);
        let acquired = if write {
            latch.acquire_write()
        } else {
            latch.acquire_read()
        };
        if let Err(e) = acquired {
            service.release(&latch);
            return Err(e);
        }
        Ok(Self {
            service,
            latch,
            write,
        })
    }

    #[must_use]
    pub fn tree_node_id(&self) -> PageId {
        self.latch.tree_node_id()
    }
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        if self.write {
            self.latch.release_write();
        } else {
            self.latch.release_read();
        }
        self.service.release(&self.latch);
    }
}

/// Contract violations on latches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatchError {
    /// The latch lost its last reference and must not be used again.
    Dead { tree_node_id: PageId },
}

impl std::fmt::Display for LatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dead { tree_node_id } => {
                write!(f, "latch for tree node {tree_node_id} is dead")
            }
        }
    }
}

impl std::error::Error for LatchError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition never became true");
    }

    #[test]
    fn test_readers_share() {
        let service = TreeNodeLatchService::new();
        let latch = service.latch(10);
        latch.acquire_read().expect("should latch");
        latch.acquire_read().expect("should latch");
        assert_eq!(latch.readers(), 2);
        assert!(!latch.try_upgrade_to_write().expect("alive"));
        latch.release_read();
        assert!(latch.try_upgrade_to_write().expect("alive"));
        assert!(latch.is_write_locked());
        latch.release_write();
        assert_eq!(latch.readers(), 0);
        service.release(&latch);
    }

    #[test]
    fn test_dead_latch_rejects_acquisition() {
        let service = TreeNodeLatchService::new();
        let latch = service.latch(7);
        service.release(&latch);

        assert!(latch.is_dead());
        assert_eq!(
            latch.acquire_read(),
            Err(LatchError::Dead { tree_node_id: 7 })
        );
        assert_eq!(
            latch.acquire_write(),
            Err(LatchError::Dead { tree_node_id: 7 })
        );
        assert!(latch.try_upgrade_to_write().is_err());
        assert!(service.is_empty());
    }

    #[test]
    fn test_latch_after_death_is_new_instance() {
        let service = TreeNodeLatchService::new();
        let first = service.latch(3);
        let shared = service.latch(3);
        assert!(Arc::ptr_eq(&first, &shared));

        service.release(&shared);
        assert!(!first.is_dead());
        service.release(&first);
        assert!(first.is_dead());

        let second = service.latch(3);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_dead());
        second.acquire_write().expect("new latch is alive");
        second.release_write();
        service.release(&second);
    }

    #[test]
    fn test_stale_release_keeps_newer_latch_registered() {
        let service = TreeNodeLatchService::new();
        let old = service.latch(5);
        // Die without going through the registry lock first.
        assert!(old.deref_latch());
        let newer = service.latch(5);
        assert!(!Arc::ptr_eq(&old, &newer));
        assert_eq!(service.len(), 1);
        service.release(&newer);
        assert!(service.is_empty());
    }

    #[test]
    fn test_writer_wait_state_is_visible() {
        let service = Arc::new(TreeNodeLatchService::new());
        let latch = service.latch(1);
        latch.acquire_read().expect("should latch");

        let writer = {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                let latch = service.latch(1);
                latch.acquire_write().expect("should latch");
                latch.release_write();
                service.release(&latch);
            })
        };

        wait_until(|| latch.wait_state() == LatchWaitState::WriteWaiting);
        assert_eq!(latch.waiting_writers(), 1);
        latch.release_read();
        writer.join().expect("writer should finish");
        assert_eq!(latch.wait_state(), LatchWaitState::Idle);
        service.release(&latch);
        assert!(service.is_empty());
    }

    #[test]
    fn test_concurrent_latch_never_returns_dead() {
        let service = Arc::new(TreeNodeLatchService::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let service = Arc::clone(&service);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let latch = service.latch(99);
                        assert!(!latch.is_dead());
                        latch.acquire_write().expect("never dead");
                        latch.release_write();
                        service.release(&latch);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread should finish");
        }
        assert!(service.is_empty());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let service = TreeNodeLatchService::new();
        let probe = service.latch(12);
        {
            let first = LatchGuard::read(&service, 12).expect("should latch");
            let _second = LatchGuard::read(&service, 12).expect("should latch");
            assert_eq!(first.tree_node_id(), 12);
            assert_eq!(probe.readers(), 2);
        }
        assert_eq!(probe.readers(), 0);

        let guard = LatchGuard::write(&service, 12).expect("should latch");
        assert!(probe.is_write_locked());
        drop(guard);
        assert!(!probe.is_write_locked());

        service.release(&probe);
        assert!(service.is_empty());
    }
}
