//! Regroup operations over one shard
//!
//! Each operation takes the shard's [`GroupLookup`], its reader and the
//! session's scratch buffers by reference. Condition-driven operations make a
//! single pass over the sorted terms of every referenced field; metric-driven
//! operations walk documents sequentially in scratch-sized batches.
//!
//! Every operation finishes with [`GroupLookup::recalculate_num_groups`] so
//! per-group buffers allocated afterwards are sized from a fresh bound.

use tracing::debug;

use super::bits::DocBitSet;
use super::lookup::{check_groups, GroupLookup, ScratchBuffers};
use super::rules::{GroupMultiRemapRule, GroupRemapRule, RuleTable};
use crate::error::{Error, Result};
use crate::metrics::record_regroup;
use crate::reader::{ShardReader, StatLookup, TermSource};
use crate::split::hash::murmur_hash32;
use crate::types::{DocId, Field, FieldType, GroupId, Term, TermKey, TermRef, MAX_NUM_GROUPS, NO_GROUP};

// ============================================================================
// Term scanning
// ============================================================================

/// Visit every (term, doc batch) of `field` in ascending term order
pub fn scan_field<F>(
    reader: &dyn ShardReader,
    field: &Field,
    buf: &mut [DocId],
    visit: F,
) -> Result<()>
where
    F: FnMut(TermRef<'_>, &[DocId]) -> Result<()>,
{
    match field.field_type {
        FieldType::Int => scan_source(reader.int_terms(&field.name)?, buf, visit),
        FieldType::String => scan_source(reader.string_terms(&field.name)?, buf, visit),
    }
}

fn scan_source<S, F>(mut source: S, buf: &mut [DocId], mut visit: F) -> Result<()>
where
    S: TermSource,
    F: FnMut(TermRef<'_>, &[DocId]) -> Result<()>,
{
    let mut walk = || -> Result<()> {
        while source.next()? {
            loop {
                let n = source.read_doc_ids(buf)?;
                if n == 0 {
                    break;
                }
                visit(source.term().term_ref(), &buf[..n])?;
            }
        }
        Ok(())
    };
    let result = walk();
    let closed = source.close();
    result.and(closed)
}

/// Walk documents `0..size` in batches: ids go to `scratch.doc_ids`, groups
/// to `scratch.groups`, stat values to `scratch.values`
fn for_each_doc_batch<F>(
    lookup: &mut GroupLookup,
    stat: &dyn StatLookup,
    scratch: &mut ScratchBuffers,
    mut remap: F,
) -> Result<()>
where
    F: FnMut(GroupId, i64) -> GroupId,
{
    if stat.num_docs() < lookup.size() {
        return Err(Error::SizeMismatch {
            expected: lookup.size(),
            actual: stat.num_docs(),
        });
    }
    let size = lookup.size();
    let batch = scratch.batch_size();
    let mut start = 0;
    while start < size {
        let n = batch.min(size - start);
        for (i, slot) in scratch.doc_ids[..n].iter_mut().enumerate() {
            *slot = (start + i) as DocId;
        }
        lookup.fill_doc_group_buffer_sequential(start, &mut scratch.groups[..n]);
        stat.lookup(&scratch.doc_ids[..n], &mut scratch.values[..n]);
        for (group, &value) in scratch.groups[..n].iter_mut().zip(&scratch.values[..n]) {
            if *group != NO_GROUP {
                *group = remap(*group, value);
            }
        }
        lookup.batch_set(&scratch.doc_ids[..n], &scratch.groups[..n]);
        start += n;
    }
    Ok(())
}

// ============================================================================
// Rule-based regroups
// ============================================================================

/// Rule-based regroup
///
/// Documents whose rule fires for any scanned term move to the rule's
/// positive group. Afterwards, unmarked documents in a ruled group move to its
/// negative group and documents in groups without a rule move to group 0.
/// Returns the new group count.
pub fn regroup(
    lookup: &mut GroupLookup,
    reader: &dyn ShardReader,
    scratch: &mut ScratchBuffers,
    rules: &[GroupRemapRule],
) -> Result<u32> {
    let table = RuleTable::build(rules, lookup.num_groups())?;
    let mut remapped = DocBitSet::new(lookup.size());

    for field in table.fields() {
        scan_field(reader, field, &mut scratch.doc_ids, |term, docs| {
            lookup.apply_conditions(docs, &mut remapped, &table, field, term);
            Ok(())
        })?;
    }

    for doc in 0..lookup.size() as DocId {
        if remapped.get(doc) {
            continue;
        }
        let group = lookup.get(doc);
        let next = table.get(group).map_or(NO_GROUP, |rule| rule.negative_group);
        lookup.set(doc, next);
    }

    lookup.recalculate_num_groups();
    record_regroup("rules");
    debug!(rules = table.len(), num_groups = lookup.num_groups(), "Applied regroup rules");
    Ok(lookup.num_groups())
}

/// Multi-way regroup: the lowest-index condition that fires picks the
/// destination
///
/// With `error_on_collisions`, a document for which two different conditions
/// fire fails the operation with [`Error::InvalidArgument`] and leaves the
/// lookup untouched.
pub fn multisplit_regroup(
    lookup: &mut GroupLookup,
    reader: &dyn ShardReader,
    scratch: &mut ScratchBuffers,
    rules: &[GroupMultiRemapRule],
    error_on_collisions: bool,
) -> Result<u32> {
    const UNMATCHED: u32 = u32::MAX;

    let table = RuleTable::build(rules, lookup.num_groups())?;
    let mut matched = vec![UNMATCHED; lookup.size()];

    for field in table.fields() {
        let lookup = &*lookup;
        scan_field(reader, field, &mut scratch.doc_ids, |term, docs| {
            for &doc in docs {
                let Some(rule) = table.get(lookup.get(doc)) else {
                    continue;
                };
                for (index, condition) in rule.conditions.iter().enumerate() {
                    if !condition.fires(field, term) {
                        continue;
                    }
                    let slot = &mut matched[doc as usize];
                    let index = index as u32;
                    if *slot != UNMATCHED && *slot != index && error_on_collisions {
                        return Err(Error::InvalidArgument(format!(
                            "document {} matches conditions {} and {}",
                            doc, *slot, index
                        )));
                    }
                    *slot = (*slot).min(index);
                }
            }
            Ok(())
        })?;
    }

    for doc in 0..lookup.size() as DocId {
        let group = lookup.get(doc);
        let next = match table.get(group) {
            None => NO_GROUP,
            Some(rule) => match matched[doc as usize] {
                UNMATCHED => rule.negative_group,
                index => rule.positive_groups[index as usize],
            },
        };
        lookup.set(doc, next);
    }

    lookup.recalculate_num_groups();
    record_regroup("multisplit");
    Ok(lookup.num_groups())
}

// ============================================================================
// Term-set regroups
// ============================================================================

/// Split `target_group` by membership in a set of terms
///
/// Documents holding any of `terms` in `field` go to `positive_group`, the
/// rest of `target_group` to `negative_group`.
#[allow(clippy::too_many_arguments)]
pub fn term_or_regroup(
    lookup: &mut GroupLookup,
    reader: &dyn ShardReader,
    scratch: &mut ScratchBuffers,
    field: &Field,
    terms: &[Term],
    target_group: GroupId,
    negative_group: GroupId,
    positive_group: GroupId,
) -> Result<()> {
    check_groups([negative_group, positive_group])?;
    let mut wanted: Vec<&Term> = terms.iter().collect();
    wanted.sort();
    wanted.dedup();

    let mut bits = DocBitSet::new(lookup.size());
    scan_field(reader, field, &mut scratch.doc_ids, |term, docs| {
        if wanted.binary_search_by(|t| t.as_ref().cmp(&term)).is_ok() {
            for &doc in docs {
                bits.set(doc);
            }
        }
        Ok(())
    })?;

    lookup.bit_set_regroup(&bits, target_group, negative_group, positive_group)?;
    lookup.recalculate_num_groups();
    record_regroup("term_or");
    Ok(())
}

/// Deterministic salted hash of a term mapped into `[0, 1)`
pub fn term_fraction(term: TermRef<'_>, salt: &str) -> f64 {
    let mut key = match term {
        TermRef::Int(v) => v.to_string().into_bytes(),
        TermRef::Bytes(b) => b.to_vec(),
    };
    key.extend_from_slice(salt.as_bytes());
    murmur_hash32(&key) as f64 / (u32::MAX as f64 + 1.0)
}

/// Randomly split `target_group` by a salted hash of each document's term
///
/// Documents holding a term whose [`term_fraction`] is below `p` go to
/// `positive_group`; the rest of `target_group` goes to `negative_group`.
#[allow(clippy::too_many_arguments)]
pub fn random_regroup(
    lookup: &mut GroupLookup,
    reader: &dyn ShardReader,
    scratch: &mut ScratchBuffers,
    field: &Field,
    salt: &str,
    p: f64,
    target_group: GroupId,
    negative_group: GroupId,
    positive_group: GroupId,
) -> Result<()> {
    if !(0.0..=1.0).contains(&p) {
        return Err(Error::InvalidArgument(format!(
            "probability {} outside [0, 1]",
            p
        )));
    }
    check_groups([negative_group, positive_group])?;

    let mut bits = DocBitSet::new(lookup.size());
    scan_field(reader, field, &mut scratch.doc_ids, |term, docs| {
        if term_fraction(term, salt) < p {
            for &doc in docs {
                bits.set(doc);
            }
        }
        Ok(())
    })?;

    lookup.bit_set_regroup(&bits, target_group, negative_group, positive_group)?;
    lookup.recalculate_num_groups();
    record_regroup("random");
    Ok(())
}

/// Split `target_group` across `result_groups` by a salted hash of each
/// document's terms
///
/// `percentages` are ascending cumulative thresholds, one fewer than
/// `result_groups`. A document lands in the first result group whose
/// threshold exceeds the smallest [`term_fraction`] among its terms. Documents
/// above every threshold, or holding no term of `field`, land in the last
/// result group. Returns the new group count.
#[allow(clippy::too_many_arguments)]
pub fn random_multi_regroup(
    lookup: &mut GroupLookup,
    reader: &dyn ShardReader,
    scratch: &mut ScratchBuffers,
    field: &Field,
    salt: &str,
    target_group: GroupId,
    percentages: &[f64],
    result_groups: &[GroupId],
) -> Result<u32> {
    if result_groups.len() != percentages.len() + 1 {
        return Err(Error::InvalidArgument(format!(
            "{} thresholds need {} result groups, got {}",
            percentages.len(),
            percentages.len() + 1,
            result_groups.len()
        )));
    }
    if percentages.iter().any(|p| !(0.0..=1.0).contains(p))
        || percentages.windows(2).any(|w| w[1] < w[0])
    {
        return Err(Error::InvalidArgument(
            "thresholds must ascend within [0, 1]".to_string(),
        ));
    }
    check_groups(result_groups.iter().copied())?;

    // 1.0 sits above every threshold
    let mut fractions = vec![1.0f64; lookup.size()];
    {
        let lookup = &*lookup;
        scan_field(reader, field, &mut scratch.doc_ids, |term, docs| {
            let fraction = term_fraction(term, salt);
            for &doc in docs {
                if lookup.get(doc) == target_group {
                    let slot = &mut fractions[doc as usize];
                    *slot = slot.min(fraction);
                }
            }
            Ok(())
        })?;
    }

    for doc in 0..lookup.size() as DocId {
        if lookup.get(doc) != target_group {
            continue;
        }
        let fraction = fractions[doc as usize];
        let index = percentages
            .iter()
            .position(|&p| fraction < p)
            .unwrap_or(percentages.len());
        lookup.set(doc, result_groups[index]);
    }

    lookup.recalculate_num_groups();
    record_regroup("random_multi");
    Ok(lookup.num_groups())
}

// ============================================================================
// Metric regroups
// ============================================================================

/// Shape of a metric bucketing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricBuckets {
    /// Inclusive lower bound
    pub min: i64,
    /// Exclusive upper bound
    pub max: i64,
    /// Width of each bucket
    pub interval: i64,
    /// Send out-of-range documents to group 0 instead of gutter groups
    pub no_gutters: bool,
}

impl MetricBuckets {
    fn bucket_count(&self) -> i128 {
        (self.max as i128 - 1 - self.min as i128) / self.interval as i128 + 1
    }

    /// Number of in-range buckets, saturating for ranges too wide to regroup
    pub fn num_buckets(&self) -> i64 {
        i64::try_from(self.bucket_count()).unwrap_or(i64::MAX)
    }

    /// Groups each source group expands into
    pub fn groups_per_source(&self) -> i64 {
        if self.no_gutters {
            self.num_buckets()
        } else {
            self.num_buckets().saturating_add(2)
        }
    }

    /// Destination of a document in `group` with stat `value`
    ///
    /// In-range values map to buckets `1..=num_buckets`; with gutters, values
    /// below `min` map to `num_buckets + 1` and values at or above `max` to
    /// `num_buckets + 2`. Only meaningful for a shape that passed validation.
    #[inline]
    pub fn destination(&self, group: GroupId, value: i64) -> GroupId {
        let per = self.groups_per_source() as i128;
        let base = (group as i128 - 1) * per;
        let offset = if value < self.min {
            if self.no_gutters {
                return NO_GROUP;
            }
            self.bucket_count() + 1
        } else if value >= self.max {
            if self.no_gutters {
                return NO_GROUP;
            }
            self.bucket_count() + 2
        } else {
            (value as i128 - self.min as i128) / self.interval as i128 + 1
        };
        (base + offset) as GroupId
    }

    fn validate(&self, num_groups: u32) -> Result<()> {
        if self.interval <= 0 {
            return Err(Error::InvalidArgument(format!(
                "interval must be positive, got {}",
                self.interval
            )));
        }
        if self.max <= self.min {
            return Err(Error::InvalidArgument(format!(
                "max {} must exceed min {}",
                self.max, self.min
            )));
        }
        let per = if self.no_gutters {
            self.bucket_count()
        } else {
            self.bucket_count() + 2
        };
        let needed = (num_groups.max(1) as i128 - 1) * per + 1;
        if needed > MAX_NUM_GROUPS as i128 {
            return Err(Error::InvalidArgument(format!(
                "metric regroup would create {} groups",
                needed
            )));
        }
        Ok(())
    }
}

/// Bucketise every selected document by a stat value
///
/// Source group `g` expands into `groups_per_source` consecutive groups
/// starting after `(g - 1) * groups_per_source`. Returns the new group count.
pub fn metric_regroup(
    lookup: &mut GroupLookup,
    stat: &dyn StatLookup,
    scratch: &mut ScratchBuffers,
    buckets: MetricBuckets,
) -> Result<u32> {
    buckets.validate(lookup.num_groups())?;
    for_each_doc_batch(lookup, stat, scratch, |group, value| {
        buckets.destination(group, value)
    })?;
    lookup.recalculate_num_groups();
    record_regroup("metric");
    Ok(lookup.num_groups())
}

/// Drop selected documents by stat range
///
/// Documents with `min <= value <= max` are kept; with `negate` the range is
/// dropped instead. Dropped documents move to group 0.
pub fn metric_filter(
    lookup: &mut GroupLookup,
    stat: &dyn StatLookup,
    scratch: &mut ScratchBuffers,
    min: i64,
    max: i64,
    negate: bool,
) -> Result<u32> {
    if max < min {
        return Err(Error::InvalidArgument(format!(
            "max {} below min {}",
            max, min
        )));
    }
    for_each_doc_batch(lookup, stat, scratch, |group, value| {
        let inside = value >= min && value <= max;
        if inside != negate {
            group
        } else {
            NO_GROUP
        }
    })?;
    lookup.recalculate_num_groups();
    record_regroup("metric_filter");
    Ok(lookup.num_groups())
}

/// Split `target_group` by stat range
///
/// Documents of `target_group` with `min <= value <= max` go to
/// `positive_group`, the others to `negative_group`. Other groups are left
/// alone. Returns the new group count.
#[allow(clippy::too_many_arguments)]
pub fn targeted_metric_filter(
    lookup: &mut GroupLookup,
    stat: &dyn StatLookup,
    scratch: &mut ScratchBuffers,
    min: i64,
    max: i64,
    target_group: GroupId,
    negative_group: GroupId,
    positive_group: GroupId,
) -> Result<u32> {
    if max < min {
        return Err(Error::InvalidArgument(format!(
            "max {} below min {}",
            max, min
        )));
    }
    check_groups([negative_group, positive_group])?;
    for_each_doc_batch(lookup, stat, scratch, |group, value| {
        if group != target_group {
            group
        } else if value >= min && value <= max {
            positive_group
        } else {
            negative_group
        }
    })?;
    lookup.recalculate_num_groups();
    record_regroup("targeted_metric_filter");
    Ok(lookup.num_groups())
}

// ============================================================================
// Group remapping
// ============================================================================

/// Rename groups: `from[i]` becomes `to[i]`
///
/// Groups not listed keep their id, or move to group 0 with
/// `filter_out_not_targeted`. The first mapping of a repeated source group
/// wins. Returns the new group count.
pub fn remap_groups(
    lookup: &mut GroupLookup,
    from: &[GroupId],
    to: &[GroupId],
    filter_out_not_targeted: bool,
) -> Result<u32> {
    if from.len() != to.len() {
        return Err(Error::InvalidArgument(format!(
            "{} source groups but {} destinations",
            from.len(),
            to.len()
        )));
    }
    check_groups(to.iter().copied())?;

    let mut mapping: Vec<Option<GroupId>> = vec![None; lookup.num_groups() as usize];
    for (&source, &dest) in from.iter().zip(to) {
        if let Some(slot) = mapping.get_mut(source as usize) {
            if slot.is_none() {
                *slot = Some(dest);
            }
        }
    }

    for doc in 0..lookup.size() as DocId {
        let group = lookup.get(doc);
        if group == NO_GROUP {
            continue;
        }
        match mapping[group as usize] {
            Some(dest) => lookup.set(doc, dest),
            None if filter_out_not_targeted => lookup.set(doc, NO_GROUP),
            None => {}
        }
    }

    lookup.recalculate_num_groups();
    record_regroup("remap");
    Ok(lookup.num_groups())
}
