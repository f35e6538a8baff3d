//! End-to-end tests against a whole tree.
//!
//! Each test file covers a specific scenario through the public tree
//! handle: writers, seekers, checkpoints, crashes and consistency checks.

#![cfg(test)]

mod helpers;

mod test_concurrency;
mod test_consistency;
mod test_crash_recovery;
mod test_freelist_reuse;
mod test_insert_and_seek;
mod test_seek_model;
mod test_size_limits;
mod test_structure_log;
mod test_writer_ops;
