//! Per-document group assignment
//!
//! A [`GroupLookup`] maps every document of a shard to its current group.
//! Group 0 means "not selected": those documents stay in the array but never
//! reach group-stat buffers or the FTGS stream.
//!
//! The hot-path operations work on caller-owned [`ScratchBuffers`] so that a
//! term scan performs no per-document allocation.
//!
//! ```text
//!   doc ids of one term      groups            compacted (group 0 dropped)
//!   [ 0, 1, 2, 3, 4 ]   →   [ 1, 0, 2, 0, 1 ]   →   docs [0, 2, 4]
//!                                                    grps [1, 2, 1]
//!                                                    stats[s][g] += value
//! ```

use std::sync::Arc;

use super::bits::{DocBitSet, GroupsSeen};
use super::rules::{GroupRemapRule, RuleTable};
use crate::error::{Error, Result};
use crate::reader::StatLookup;
use crate::types::{DocId, Field, GroupId, TermRef, MAX_NUM_GROUPS, NO_GROUP};

// ============================================================================
// ScratchBuffers
// ============================================================================

/// Pre-sized buffers for batched per-term document work
#[derive(Debug, Clone)]
pub struct ScratchBuffers {
    /// Document ids of the current batch
    pub doc_ids: Vec<DocId>,
    /// Group of each document in `doc_ids`
    pub groups: Vec<GroupId>,
    /// Stat value of each document in `doc_ids`
    pub values: Vec<i64>,
}

impl ScratchBuffers {
    /// Allocate buffers holding `batch_size` documents
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            doc_ids: vec![0; batch_size],
            groups: vec![0; batch_size],
            values: vec![0; batch_size],
        }
    }

    /// Documents per batch
    pub fn batch_size(&self) -> usize {
        self.doc_ids.len()
    }
}

/// Reject destination groups at or beyond [`MAX_NUM_GROUPS`]
pub fn check_groups(groups: impl IntoIterator<Item = GroupId>) -> Result<()> {
    match groups.into_iter().find(|&g| g >= MAX_NUM_GROUPS) {
        Some(group) => Err(Error::InvalidArgument(format!(
            "group {} exceeds the maximum group id {}",
            group,
            MAX_NUM_GROUPS - 1
        ))),
        None => Ok(()),
    }
}

// ============================================================================
// GroupLookup
// ============================================================================

/// Dense document → group array, never resized after creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLookup {
    groups: Vec<GroupId>,
    /// Upper bound (exclusive) on assigned groups; at least `max + 1`
    num_groups: u32,
}

impl GroupLookup {
    /// Create a lookup for `size` documents, all in `initial_group`
    pub fn new(size: usize, initial_group: GroupId) -> Self {
        Self {
            groups: vec![initial_group; size],
            num_groups: initial_group.saturating_add(1),
        }
    }

    /// Wrap an existing assignment
    pub fn from_groups(groups: Vec<GroupId>) -> Self {
        let mut lookup = Self {
            groups,
            num_groups: 1,
        };
        lookup.recalculate_num_groups();
        lookup
    }

    /// Bytes needed by a lookup over `size` documents
    pub fn memory_for_size(size: usize) -> u64 {
        4 * size as u64
    }

    /// Group of `doc`
    #[inline]
    pub fn get(&self, doc: DocId) -> GroupId {
        self.groups[doc as usize]
    }

    /// Move `doc` to `group`
    #[inline]
    pub fn set(&mut self, doc: DocId, group: GroupId) {
        self.groups[doc as usize] = group;
        self.bump(group);
    }

    /// Move every document to `group`
    pub fn fill(&mut self, group: GroupId) {
        self.groups.fill(group);
        self.num_groups = group.saturating_add(1);
    }

    /// Assign `groups[i]` to `doc_ids[i]`
    pub fn batch_set(&mut self, doc_ids: &[DocId], groups: &[GroupId]) {
        for (&doc, &group) in doc_ids.iter().zip(groups) {
            self.groups[doc as usize] = group;
            self.bump(group);
        }
    }

    /// Write the group of each `doc_ids[i]` into `out[i]`
    pub fn fill_doc_group_buffer(&self, doc_ids: &[DocId], out: &mut [GroupId]) {
        for (slot, &doc) in out.iter_mut().zip(doc_ids) {
            *slot = self.groups[doc as usize];
        }
    }

    /// Copy the groups of documents `start..start + out.len()` into `out`
    pub fn fill_doc_group_buffer_sequential(&self, start: usize, out: &mut [GroupId]) {
        let end = start + out.len();
        out.copy_from_slice(&self.groups[start..end]);
    }

    /// Apply single-condition rules to documents holding an integer term
    pub fn apply_int_conditions(
        &mut self,
        doc_ids: &[DocId],
        remapped: &mut DocBitSet,
        rules: &RuleTable<GroupRemapRule>,
        field: &Field,
        term: i64,
    ) {
        self.apply_conditions(doc_ids, remapped, rules, field, TermRef::Int(term));
    }

    /// Apply single-condition rules to documents holding a string term
    pub fn apply_string_conditions(
        &mut self,
        doc_ids: &[DocId],
        remapped: &mut DocBitSet,
        rules: &RuleTable<GroupRemapRule>,
        field: &Field,
        term: &[u8],
    ) {
        self.apply_conditions(doc_ids, remapped, rules, field, TermRef::Bytes(term));
    }

    /// Move each document whose rule fires for `term` to the rule's positive
    /// group and mark it remapped
    ///
    /// Documents already marked, and documents whose group has no rule, are
    /// left untouched.
    pub fn apply_conditions(
        &mut self,
        doc_ids: &[DocId],
        remapped: &mut DocBitSet,
        rules: &RuleTable<GroupRemapRule>,
        field: &Field,
        term: TermRef<'_>,
    ) {
        for &doc in doc_ids {
            if remapped.get(doc) {
                continue;
            }
            let Some(rule) = rules.get(self.groups[doc as usize]) else {
                continue;
            };
            if !rule.condition.fires(field, term) {
                continue;
            }
            self.groups[doc as usize] = rule.positive_group;
            self.bump(rule.positive_group);
            remapped.set(doc);
        }
    }

    /// Accumulate one batch of a term's documents into per-group stats
    ///
    /// Reads `scratch.doc_ids[..n]`, drops group-0 documents, compacts the
    /// survivors in place (stable) into `doc_ids`/`groups`, records their
    /// groups in `seen`, and adds each stat's values into
    /// `group_stats[stat][group]`. Returns the number of survivors.
    pub fn next_group_callback(
        &self,
        n: usize,
        scratch: &mut ScratchBuffers,
        stats: &[Arc<dyn StatLookup>],
        group_stats: &mut [Vec<i64>],
        seen: &mut GroupsSeen,
    ) -> usize {
        let mut head = 0;
        for i in 0..n {
            let doc = scratch.doc_ids[i];
            let group = self.groups[doc as usize];
            if group == NO_GROUP {
                continue;
            }
            scratch.doc_ids[head] = doc;
            scratch.groups[head] = group;
            head += 1;
        }

        for &group in &scratch.groups[..head] {
            seen.insert(group);
        }

        if head > 0 {
            for (lookup, totals) in stats.iter().zip(group_stats.iter_mut()) {
                lookup.lookup(&scratch.doc_ids[..head], &mut scratch.values[..head]);
                for (&group, &value) in scratch.groups[..head].iter().zip(&scratch.values[..head]) {
                    totals[group as usize] = totals[group as usize].wrapping_add(value);
                }
            }
        }
        head
    }

    /// Split `target_group` by a bitset: set bits go to `positive_group`,
    /// clear bits to `negative_group`
    ///
    /// `bits` must cover every document of the lookup.
    pub fn bit_set_regroup(
        &mut self,
        bits: &DocBitSet,
        target_group: GroupId,
        negative_group: GroupId,
        positive_group: GroupId,
    ) -> Result<()> {
        if bits.len() < self.groups.len() {
            return Err(Error::SizeMismatch {
                expected: self.groups.len(),
                actual: bits.len(),
            });
        }
        check_groups([negative_group, positive_group])?;
        for (doc, group) in self.groups.iter_mut().enumerate() {
            if *group == target_group {
                *group = if bits.get(doc as DocId) {
                    positive_group
                } else {
                    negative_group
                };
            }
        }
        self.bump(negative_group.max(positive_group));
        Ok(())
    }

    /// Copy every assignment and the cached group count into `other`
    pub fn copy_into(&self, other: &mut GroupLookup) -> Result<()> {
        if self.groups.len() != other.groups.len() {
            return Err(Error::SizeMismatch {
                expected: self.groups.len(),
                actual: other.groups.len(),
            });
        }
        other.groups.copy_from_slice(&self.groups);
        other.num_groups = self.num_groups;
        Ok(())
    }

    /// Recompute `num_groups` as `max(group) + 1`
    pub fn recalculate_num_groups(&mut self) {
        self.num_groups = self
            .groups
            .iter()
            .copied()
            .max()
            .map_or(1, |max| max.saturating_add(1));
    }

    /// Upper bound (exclusive) on assigned groups
    pub fn num_groups(&self) -> u32 {
        self.num_groups
    }

    /// Number of documents
    pub fn size(&self) -> usize {
        self.groups.len()
    }

    /// Bytes held by the assignment array
    pub fn memory_used(&self) -> u64 {
        Self::memory_for_size(self.groups.len())
    }

    /// Raw assignment
    pub fn as_slice(&self) -> &[GroupId] {
        &self.groups
    }

    #[inline]
    fn bump(&mut self, group: GroupId) {
        if group >= self.num_groups {
            self.num_groups = group.saturating_add(1);
        }
    }
}
