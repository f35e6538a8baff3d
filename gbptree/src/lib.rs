// Life of a write:
// 1. A writer holds the shared side of the generation lock
// 2. It descends from the root, latching optimistically, then pessimistically
//    if the change turns out to reach above the leaf
// 3. Nodes from an older generation are copied to successor pages first
// 4. Splits and merges propagate towards the root
//
// Life of a checkpoint:
// 1. Wait for writers, flush free-list and pages
// 2. Write the next state page and force
// 3. The unstable generation becomes stable
//
// System components:
//  - Paged file and page cache
//  - Free-list id allocator
//  - Node formats, fixed and dynamic size, with offload pages
//  - Latches and latch crabbing coordination
//  - Recovery cleanup

mod cleaner;
mod cleanup;
mod config;
mod consistency;
mod coordination;
mod e2e_tests;
mod error;
mod freelist;
mod generation;
mod latch;
mod layout;
mod meta;
mod monitor;
mod node;
mod offload;
mod page;
mod paged_file;
mod root_catchup;
mod seek;
mod structure_log;
#[cfg(test)]
mod testing;
mod tree;
mod tree_logic;
mod writer;

pub use cleaner::CrashGenerationCleaner;
pub use cleanup::{
    CleanupJob, CleanupState, CleanupStatus, CollectorKind, RecoveryCleanupWorkCollector,
    TreeCleanupJob,
};
pub use config::{ConfigError, TreeConfig, validate_split_ratio};
pub use consistency::{ConsistencyVisitor, Inconsistency};
pub use coordination::{CoordinationMode, LatchCrabbingCoordination, LatchMode};
pub use error::{CursorError, Result, TreeError};
pub use freelist::{
    FreeListIdProvider, FreelistMetaData, FreelistMonitor, FreelistVisitor, NoFreelistMonitor,
};
pub use generation::Generation;
pub use latch::{LatchError, LatchGuard, LongSpinLatch, TreeNodeLatchService};
pub use layout::{BytesLayout, Layout, LongLayout};
pub use meta::{Meta, TreeState};
pub use monitor::{CleanupStats, Monitor, NoMonitor};
pub use node::{NodeType, TreeNodes};
pub use page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, MIN_TREE_NODE_ID, Page, PageId, PageType};
pub use paged_file::{FileStore, MemoryStore, PageCacheCounters, PageStore, PagedFile, PagedFileError};
pub use root_catchup::{Root, TripCountingRootCatchup};
pub use seek::Seeker;
pub use structure_log::{StructureEvent, StructureEvents, StructureRecordType, StructureWriteLog};
pub use tree::GbpTree;
pub use writer::{Aggregation, FirstEntry, KeepExisting, MergeResult, Overwrite, ValueMerger, Writer};
