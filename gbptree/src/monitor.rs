//! Lifecycle notifications.

use std::time::Duration;

use crate::generation::Generation;
use crate::page::PageId;

/// What one recovery cleanup run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub pages_visited: u64,
    pub crashed_pages_cleaned: u64,
    pub pages_released: u64,
    pub duration: Duration,
}

/// Receives tree lifecycle events. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait Monitor: Send + Sync {
    fn checkpoint_completed(&self, previous: Generation, current: Generation, duration: Duration) {}

    fn cleanup_registered(&self) {}

    fn cleanup_started(&self) {}

    fn cleanup_finished(&self, stats: CleanupStats) {}

    /// The cleanup job was closed, whether it ran or not.
    fn cleanup_closed(&self) {}

    fn cleanup_failed(&self, error: &str) {}

    /// Called once per open. `clean` is whether the previous session shut
    /// down cleanly.
    fn startup_state(&self, clean: bool) {}

    fn tree_growth(&self, new_root: PageId) {}

    fn tree_shrink(&self, new_root: PageId) {}
}

/// Monitor that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMonitor;

impl Monitor for NoMonitor {}
