//! Writers, seekers and checkpoints running at the same time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::e2e_tests::helpers::{all_entries, inconsistencies, put_all, small_tree};
use crate::error::Result;
use crate::layout::LongLayout;

const WRITERS: u64 = 4;
const KEYS_PER_WRITER: u64 = 500;

#[test]
fn test_concurrent_writers_and_seekers() {
    let tree = small_tree(LongLayout);
    let writers_done = AtomicBool::new(false);

    thread::scope(|scope| {
        let writers: Vec<_> = (0..WRITERS)
            .map(|id| {
                let tree = &tree;
                scope.spawn(move || {
                    let mut writer = tree.writer().expect("should open writer");
                    for i in 0..KEYS_PER_WRITER {
                        let key = i * WRITERS + id;
                        writer.put(&key, &id).expect("should put");
                    }
                    writer.close().expect("should close writer");
                })
            })
            .collect();

        for _ in 0..2 {
            let tree = &tree;
            let writers_done = &writers_done;
            scope.spawn(move || {
                while !writers_done.load(Ordering::Acquire) {
                    let keys: Vec<u64> = tree
                        .seek_all()
                        .map(|entry| entry.map(|(key, _)| key))
                        .collect::<Result<_>>()
                        .expect("should seek");
                    assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
                }
            });
        }

        let joined: Vec<_> = writers.into_iter().map(|writer| writer.join()).collect();
        writers_done.store(true, Ordering::Release);
        assert!(joined.iter().all(|result| result.is_ok()));
    });

    let entries = all_entries(&tree).expect("should seek");
    assert_eq!(entries.len() as u64, WRITERS * KEYS_PER_WRITER);
    for (key, value) in entries {
        assert_eq!(key % WRITERS, value);
    }
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_concurrent_removals_merge_leaves() {
    let tree = small_tree(LongLayout);
    put_all(&tree, (0..2000u64).map(|key| (key, key))).expect("should insert");
    tree.checkpoint().expect("should checkpoint");

    thread::scope(|scope| {
        for id in 0..WRITERS {
            let tree = &tree;
            scope.spawn(move || {
                let mut writer = tree.writer().expect("should open writer");
                for key in (0..2000u64).filter(|key| key % WRITERS == id && key % 5 != 0) {
                    assert_eq!(writer.remove(&key).expect("should remove"), Some(key));
                }
                writer.close().expect("should close writer");
            });
        }
    });

    let keys: Vec<u64> = all_entries(&tree)
        .expect("should seek")
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(keys, (0..2000u64).step_by(5).collect::<Vec<_>>());
    assert!(inconsistencies(&tree).is_empty());
}

#[test]
fn test_checkpoints_between_yielding_writers() {
    let tree = small_tree(LongLayout);
    let writers_done = AtomicBool::new(false);

    thread::scope(|scope| {
        let writers: Vec<_> = (0..WRITERS)
            .map(|id| {
                let tree = &tree;
                scope.spawn(move || {
                    let mut writer = tree.writer().expect("should open writer");
                    for i in 0..KEYS_PER_WRITER {
                        writer.put(&(i * WRITERS + id), &i).expect("should put");
                        if i % 50 == 49 {
                            writer.yield_now().expect("should yield");
                        }
                    }
                    writer.close().expect("should close writer");
                })
            })
            .collect();

        let tree = &tree;
        let writers_done = &writers_done;
        let checkpointer = scope.spawn(move || {
            while !writers_done.load(Ordering::Acquire) {
                tree.checkpoint().expect("should checkpoint");
                thread::yield_now();
            }
        });

        let joined: Vec<_> = writers.into_iter().map(|writer| writer.join()).collect();
        writers_done.store(true, Ordering::Release);
        assert!(joined.iter().all(|result| result.is_ok()));
        checkpointer.join().expect("checkpointer should not panic");
    });

    tree.checkpoint().expect("should checkpoint");
    assert_eq!(
        tree.keys_count().expect("should count"),
        WRITERS * KEYS_PER_WRITER
    );
    assert!(inconsistencies(&tree).is_empty());
}
