//! Property tests for the k-way term merge
//!
//! Uses proptest to check, over arbitrary sorted sources:
//! - output terms strictly ascend
//! - the output is exactly the union of input terms with summed frequencies
//! - two merges over the same inputs produce the same sequence

use std::collections::BTreeMap;

use ftgs_engine::merge::MergeIterator;
use ftgs_engine::reader::{MemoryTermSource, TermSource};
use proptest::prelude::*;

// =============================================================================
// Strategies
// =============================================================================

/// 1 to 5 sources, each a set of distinct terms with frequencies in 1..50
fn int_sources() -> impl Strategy<Value = Vec<Vec<(i64, u64)>>> {
    prop::collection::vec(
        prop::collection::btree_map(-1000i64..1000, 1u64..50, 0..40)
            .prop_map(|m| m.into_iter().collect::<Vec<_>>()),
        1..6,
    )
}

fn byte_sources() -> impl Strategy<Value = Vec<Vec<(Vec<u8>, u64)>>> {
    prop::collection::vec(
        prop::collection::btree_map(
            prop::collection::vec(any::<u8>(), 0..6),
            1u64..50,
            0..30,
        )
        .prop_map(|m| m.into_iter().collect::<Vec<_>>()),
        1..5,
    )
}

fn merge_all<K>(sources: Vec<Vec<(K, u64)>>) -> Vec<(K, u64)>
where
    K: ftgs_engine::types::TermKey + 'static,
{
    let sources: Vec<MemoryTermSource<K>> =
        sources.into_iter().map(MemoryTermSource::from_freqs).collect();
    MergeIterator::new(sources)
        .unwrap()
        .pairs()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn expected<K: Ord + Clone>(sources: &[Vec<(K, u64)>]) -> Vec<(K, u64)> {
    let mut totals: BTreeMap<K, u64> = BTreeMap::new();
    for source in sources {
        for (term, freq) in source {
            *totals.entry(term.clone()).or_default() += freq;
        }
    }
    totals.into_iter().collect()
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn test_merge_is_strictly_ascending(sources in int_sources()) {
        let merged = merge_all(sources);
        for pair in merged.windows(2) {
            prop_assert!(pair[0].0 < pair[1].0);
        }
    }

    #[test]
    fn test_merge_is_union_with_summed_frequencies(sources in int_sources()) {
        let want = expected(&sources);
        prop_assert_eq!(merge_all(sources), want);
    }

    #[test]
    fn test_byte_merge_is_union_with_summed_frequencies(sources in byte_sources()) {
        let want = expected(&sources);
        prop_assert_eq!(merge_all(sources), want);
    }

    #[test]
    fn test_merge_is_deterministic(sources in int_sources()) {
        let first = merge_all(sources.clone());
        let second = merge_all(sources);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn test_contributors_are_exactly_the_holders(sources in int_sources()) {
        let inputs: Vec<MemoryTermSource<i64>> =
            sources.iter().cloned().map(MemoryTermSource::from_freqs).collect();
        let mut merge = MergeIterator::new(inputs).unwrap();
        while merge.next().unwrap() {
            let term = *merge.term().unwrap();
            let mut holders: Vec<usize> = sources
                .iter()
                .enumerate()
                .filter(|(_, s)| s.iter().any(|(t, _)| *t == term))
                .map(|(i, _)| i)
                .collect();
            holders.sort_unstable();
            let mut contributors = merge.contributors().to_vec();
            contributors.sort_unstable();
            prop_assert_eq!(contributors, holders);
            for &i in merge.contributors() {
                prop_assert_eq!(*merge.source(i).term(), term);
            }
        }
        prop_assert!(merge.is_exhausted());
    }
}

#[test]
fn test_merge_of_no_sources_is_rejected() {
    assert!(MergeIterator::<MemoryTermSource<i64>>::new(vec![]).is_err());
}

#[test]
fn test_merge_of_empty_sources_is_empty() {
    assert!(merge_all::<i64>(vec![vec![], vec![]]).is_empty());
}

#[test]
fn test_concrete_scenario() {
    let merged = merge_all(vec![vec![(5i64, 3), (7, 2)], vec![(5, 1), (9, 4)]]);
    assert_eq!(merged, vec![(5, 4), (7, 2), (9, 4)]);
}
