//! Integration tests for the regroup engine
//!
//! These tests validate:
//! - condition application never touches marked or unruled documents
//! - group 0 never reaches the compacted batch or any group stat
//! - the bitset regroup scenario
//! - multi-step regroups through a shard session

use std::sync::Arc;

use ftgs_engine::config::ExecutorConfig;
use ftgs_engine::group::{
    DocBitSet, GroupLookup, GroupMultiRemapRule, GroupRemapRule, GroupsSeen, RegroupCondition,
    RuleTable, ScratchBuffers,
};
use ftgs_engine::reader::{MemoryReader, MemoryStatLookup, StatLookup, COUNT_METRIC};
use ftgs_engine::session::{MemoryContext, MemoryReservation, ShardSession};
use ftgs_engine::{Error, Field, TermRef};
use proptest::prelude::*;

// ============================================================================
// Helper Functions
// ============================================================================

fn open_session(reader: MemoryReader) -> (Arc<MemoryReservation>, ShardSession) {
    let reservation = Arc::new(MemoryReservation::new(1 << 24));
    let memory = Arc::new(MemoryContext::new(Arc::clone(&reservation)));
    let session = ShardSession::new(Arc::new(reader), memory, &ExecutorConfig::default())
        .expect("session should open");
    (reservation, session)
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn test_conditions_leave_unaffected_documents_alone(
        groups in prop::collection::vec(0u32..5, 1..64),
        marked in prop::collection::vec(any::<bool>(), 64),
        term in 0i64..4,
    ) {
        let size = groups.len();
        let mut lookup = GroupLookup::from_groups(groups.clone());
        let mut remapped = DocBitSet::new(size);
        for (doc, &m) in marked.iter().take(size).enumerate() {
            if m {
                remapped.set(doc as u32);
            }
        }
        let before_marks = remapped.clone();

        // Only groups 1 and 3 carry rules
        let rules = vec![
            GroupRemapRule::new(1, RegroupCondition::int_eq("f", 2), 6, 7),
            GroupRemapRule::new(3, RegroupCondition::int_le("f", 1), 8, 9),
        ];
        let table = RuleTable::build(&rules, 10).unwrap();
        let docs: Vec<u32> = (0..size as u32).collect();
        lookup.apply_int_conditions(&docs, &mut remapped, &table, &Field::int("f"), term);

        for doc in 0..size {
            let was = groups[doc];
            let now = lookup.get(doc as u32);
            if before_marks.get(doc as u32) || (was != 1 && was != 3) {
                prop_assert_eq!(now, was);
            } else if was == 1 {
                prop_assert_eq!(now, if term == 2 { 7 } else { 1 });
            } else {
                prop_assert_eq!(now, if term <= 1 { 9 } else { 3 });
            }
        }
    }

    #[test]
    fn test_group_zero_never_reaches_stats(
        groups in prop::collection::vec(0u32..4, 1..100),
        batch in 1usize..16,
    ) {
        let size = groups.len();
        let lookup = GroupLookup::from_groups(groups.clone());
        let values: Vec<i64> = (0..size as i64).map(|v| v + 1).collect();
        let stats: Vec<Arc<dyn StatLookup>> = vec![Arc::new(MemoryStatLookup::new(values.clone()))];
        let mut totals = vec![vec![0i64; lookup.num_groups() as usize]];
        let mut seen = GroupsSeen::new(lookup.num_groups() as usize);
        let mut scratch = ScratchBuffers::new(batch);

        let mut start = 0;
        while start < size {
            let n = scratch.batch_size().min(size - start);
            for i in 0..n {
                scratch.doc_ids[i] = (start + i) as u32;
            }
            let kept = lookup.next_group_callback(n, &mut scratch, &stats, &mut totals, &mut seen);
            for &doc in &scratch.doc_ids[..kept] {
                prop_assert_ne!(lookup.get(doc), 0);
            }
            start += n;
        }

        prop_assert!(!seen.contains(0));
        prop_assert_eq!(totals[0][0], 0);
        for group in 1..lookup.num_groups() {
            let want: i64 = groups
                .iter()
                .zip(&values)
                .filter(|(g, _)| **g == group)
                .map(|(_, v)| *v)
                .sum();
            prop_assert_eq!(totals[0][group as usize], want);
        }
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_bit_set_regroup_scenario() {
    let mut lookup = GroupLookup::new(4, 1);
    let bits = DocBitSet::from_ids(4, &[0, 2]);
    lookup.bit_set_regroup(&bits, 1, 1, 2).unwrap();
    assert_eq!(lookup.as_slice(), &[2, 1, 2, 1]);
    lookup.recalculate_num_groups();
    assert_eq!(lookup.num_groups(), 3);
}

#[test]
fn test_rule_regroup_drops_unruled_groups() {
    let reader = MemoryReader::builder(6)
        .string_term("browser", "chrome", &[0, 1, 4])
        .string_term("browser", "firefox", &[2, 3, 5])
        .build();
    let (reservation, mut session) = open_session(reader);

    session.string_or_regroup("browser", &["firefox"], 1, 2, 3).unwrap();
    assert_eq!(session.group_lookup().as_slice(), &[2, 2, 3, 3, 2, 3]);

    // Only group 3 is ruled, so group 2 empties into group 0
    let rule = GroupRemapRule::new(3, RegroupCondition::string_eq("browser", "firefox"), 4, 5);
    assert_eq!(session.regroup(&[rule]).unwrap(), 6);
    assert_eq!(session.group_lookup().as_slice(), &[0, 0, 5, 5, 0, 5]);

    session.close().unwrap();
    assert_eq!(reservation.used(), 0);
}

#[test]
fn test_multisplit_first_condition_wins() {
    let reader = MemoryReader::from_int_columns(5, &[("age", vec![10, 20, 30, 40, 50])]);
    let (_reservation, mut session) = open_session(reader);

    let rule = GroupMultiRemapRule::new(
        1,
        9,
        vec![RegroupCondition::int_le("age", 20), RegroupCondition::int_le("age", 40)],
        vec![2, 3],
    )
    .unwrap();
    assert_eq!(session.multisplit_regroup(&[rule], false).unwrap(), 10);
    assert_eq!(session.group_lookup().as_slice(), &[2, 2, 3, 3, 9]);
}

#[test]
fn test_metric_filter_then_random_regroup() {
    let reader = MemoryReader::builder(4)
        .int_term("score", 5, &[0])
        .int_term("score", 15, &[1])
        .int_term("score", 25, &[2, 3])
        .string_term("user", "a", &[0, 1])
        .string_term("user", "b", &[2, 3])
        .build();
    let (_reservation, mut session) = open_session(reader);
    session.push_stat("score").unwrap();

    assert_eq!(session.metric_filter(0, 10, 20, false).unwrap(), 2);
    assert_eq!(session.group_lookup().as_slice(), &[0, 1, 0, 0]);

    // p = 1 sends every selected document to the positive group
    session.reset_groups().unwrap();
    session.random_regroup("user", false, "salt", 1.0, 1, 2, 3).unwrap();
    assert_eq!(session.group_lookup().as_slice(), &[3, 3, 3, 3]);

    // p = 0 sends none
    session.reset_groups().unwrap();
    session.random_regroup("user", false, "salt", 0.0, 1, 2, 3).unwrap();
    assert_eq!(session.group_lookup().as_slice(), &[2, 2, 2, 2]);

    assert!(matches!(
        session.random_regroup("user", false, "salt", 1.5, 1, 2, 3),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_group_stats_exclude_group_zero() {
    let reader = MemoryReader::from_int_columns(5, &[("v", vec![1, 2, 4, 8, 16])]);
    let (_reservation, mut session) = open_session(reader);
    session.push_stat("v").unwrap();
    session.push_stat(COUNT_METRIC).unwrap();

    session.remap_groups(&[1], &[2], false).unwrap();
    assert_eq!(session.group_lookup().as_slice(), &[2, 2, 2, 2, 2]);
    // Documents without 4 or 8 are dropped into group 0
    session.int_or_regroup("v", &[4, 8], 2, 0, 2).unwrap();

    assert_eq!(session.group_stats(0).unwrap(), vec![0, 0, 12]);
    assert_eq!(session.group_stats(1).unwrap(), vec![0, 0, 2]);
}

#[test]
fn test_conditions_match_on_field_and_type() {
    let condition = RegroupCondition::int_eq("f", 3);
    assert!(condition.fires(&Field::int("f"), TermRef::Int(3)));
    assert!(!condition.fires(&Field::int("g"), TermRef::Int(3)));
    assert!(!condition.fires(&Field::string("f"), TermRef::Bytes(b"3")));
    assert!(!condition.fires(&Field::int("f"), TermRef::Int(4)));
}
