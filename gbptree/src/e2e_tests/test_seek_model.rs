//! Random operation sequences checked against an ordered map.

use std::collections::BTreeMap;

use proptest::prelude::*;

use crate::e2e_tests::helpers::{inconsistencies, small_tree};
use crate::error::Result;
use crate::layout::LongLayout;

#[derive(Debug, Clone)]
enum Op {
    Put(u64, u64),
    Remove(u64),
    Checkpoint,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..600u64, any::<u64>()).prop_map(|(key, value)| Op::Put(key, value)),
        3 => (0..600u64).prop_map(Op::Remove),
        1 => Just(Op::Checkpoint),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_seek_matches_model(
        ops in prop::collection::vec(op(), 1..1500),
        ranges in prop::collection::vec((0..650u64, 0..650u64), 1..8),
    ) {
        let tree = small_tree(LongLayout);
        let mut model = BTreeMap::new();
        for op in ops {
            match op {
                Op::Put(key, value) => {
                    let mut writer = tree.writer().expect("should open writer");
                    writer.put(&key, &value).expect("should put");
                    writer.close().expect("should close writer");
                    model.insert(key, value);
                }
                Op::Remove(key) => {
                    let mut writer = tree.writer().expect("should open writer");
                    let removed = writer.remove(&key).expect("should remove");
                    writer.close().expect("should close writer");
                    prop_assert_eq!(removed, model.remove(&key));
                }
                Op::Checkpoint => tree.checkpoint().expect("should checkpoint"),
            }
        }

        for (from, to) in ranges {
            let found: Vec<(u64, u64)> = tree
                .seek(from, to)
                .collect::<Result<_>>()
                .expect("should seek");
            let expected: Vec<(u64, u64)> = if from <= to {
                model.range(from..to).map(|(k, v)| (*k, *v)).collect()
            } else {
                model
                    .range(to + 1..=from)
                    .rev()
                    .map(|(k, v)| (*k, *v))
                    .collect()
            };
            prop_assert_eq!(found, expected);
        }
        prop_assert_eq!(tree.keys_count().expect("should count"), model.len() as u64);
        prop_assert!(inconsistencies(&tree).is_empty());
    }
}
