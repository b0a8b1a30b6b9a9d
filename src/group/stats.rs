//! Active statistic stack and per-group summaries

use std::sync::Arc;

use super::bits::GroupsSeen;
use super::lookup::{GroupLookup, ScratchBuffers};
use crate::error::{Error, Result};
use crate::reader::{ShardReader, StatLookup, TermSource};
use crate::types::{DocFreq, Field, FieldType, NO_GROUP};

/// Pushed statistics, in push order
///
/// The position of a stat on the stack is its index in every stat vector the
/// session emits.
#[derive(Clone, Default)]
pub struct StatStack {
    metrics: Vec<String>,
    lookups: Vec<Arc<dyn StatLookup>>,
}

impl StatStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a metric with its lookup; returns the new depth
    pub fn push(&mut self, metric: impl Into<String>, lookup: Arc<dyn StatLookup>) -> usize {
        self.metrics.push(metric.into());
        self.lookups.push(lookup);
        self.lookups.len()
    }

    /// Pop the most recent metric
    pub fn pop(&mut self) -> Result<(String, Arc<dyn StatLookup>)> {
        match (self.metrics.pop(), self.lookups.pop()) {
            (Some(metric), Some(lookup)) => Ok((metric, lookup)),
            _ => Err(Error::InvalidArgument("stat stack is empty".to_string())),
        }
    }

    /// Number of active stats
    pub fn len(&self) -> usize {
        self.lookups.len()
    }

    /// Whether no stat is active
    pub fn is_empty(&self) -> bool {
        self.lookups.is_empty()
    }

    /// Lookup at `index`
    pub fn get(&self, index: usize) -> Result<&Arc<dyn StatLookup>> {
        self.lookups.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "stat index {} out of range (depth {})",
                index,
                self.lookups.len()
            ))
        })
    }

    /// All active lookups
    pub fn lookups(&self) -> &[Arc<dyn StatLookup>] {
        &self.lookups
    }

    /// Metric names in push order
    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }
}

impl std::fmt::Debug for StatStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatStack")
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// Sum `stat` per group over every document; group 0 stays 0
pub fn sum_by_group(
    lookup: &GroupLookup,
    stat: &dyn StatLookup,
    scratch: &mut ScratchBuffers,
) -> Vec<i64> {
    let mut totals = vec![0i64; lookup.num_groups() as usize];
    let size = lookup.size();
    let batch = scratch.batch_size();

    let mut start = 0;
    while start < size {
        let n = batch.min(size - start);
        for (i, slot) in scratch.doc_ids[..n].iter_mut().enumerate() {
            *slot = (start + i) as u32;
        }
        lookup.fill_doc_group_buffer_sequential(start, &mut scratch.groups[..n]);
        stat.lookup(&scratch.doc_ids[..n], &mut scratch.values[..n]);
        for (&group, &value) in scratch.groups[..n].iter().zip(&scratch.values[..n]) {
            if group != NO_GROUP {
                totals[group as usize] = totals[group as usize].wrapping_add(value);
            }
        }
        start += n;
    }
    totals
}

/// Sum of the doc frequencies of every term of `fields`, ignoring groups
pub fn total_doc_freq(reader: &dyn ShardReader, fields: &[Field]) -> Result<DocFreq> {
    let mut total: DocFreq = 0;
    for field in fields {
        let freq = match field.field_type {
            FieldType::Int => sum_doc_freq(reader.int_terms(&field.name)?),
            FieldType::String => sum_doc_freq(reader.string_terms(&field.name)?),
        }?;
        total = total.saturating_add(freq);
    }
    Ok(total)
}

fn sum_doc_freq<S: TermSource>(mut source: S) -> Result<DocFreq> {
    let mut walk = || -> Result<DocFreq> {
        let mut total: DocFreq = 0;
        while source.next()? {
            total = total.saturating_add(source.doc_freq());
        }
        Ok(total)
    };
    let result = walk();
    let closed = source.close();
    result.and_then(|total| closed.map(|()| total))
}

/// Per group, the number of distinct terms of `field` held by at least one
/// of its documents; group 0 stays 0
pub fn distinct_by_group(
    lookup: &GroupLookup,
    reader: &dyn ShardReader,
    scratch: &mut ScratchBuffers,
    field: &Field,
) -> Result<Vec<i64>> {
    let mut counts = vec![0i64; lookup.num_groups() as usize];
    let mut seen = GroupsSeen::new(lookup.num_groups() as usize);
    match field.field_type {
        FieldType::Int => count_distinct(
            reader.int_terms(&field.name)?,
            lookup,
            &mut scratch.doc_ids,
            &mut counts,
            &mut seen,
        )?,
        FieldType::String => count_distinct(
            reader.string_terms(&field.name)?,
            lookup,
            &mut scratch.doc_ids,
            &mut counts,
            &mut seen,
        )?,
    }
    Ok(counts)
}

fn count_distinct<S: TermSource>(
    mut source: S,
    lookup: &GroupLookup,
    buf: &mut [u32],
    counts: &mut [i64],
    seen: &mut GroupsSeen,
) -> Result<()> {
    let mut walk = || -> Result<()> {
        while source.next()? {
            loop {
                let n = source.read_doc_ids(buf)?;
                if n == 0 {
                    break;
                }
                for &doc in &buf[..n] {
                    let group = lookup.get(doc);
                    if group != NO_GROUP {
                        seen.insert(group);
                    }
                }
            }
            for &group in seen.sorted() {
                counts[group as usize] += 1;
            }
            seen.clear();
        }
        Ok(())
    };
    let result = walk();
    let closed = source.close();
    result.and(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemoryStatLookup;

    #[test]
    fn test_push_pop() {
        let mut stack = StatStack::new();
        assert!(stack.pop().is_err());
        assert_eq!(stack.push("a", Arc::new(MemoryStatLookup::new(vec![1]))), 1);
        assert_eq!(stack.push("b", Arc::new(MemoryStatLookup::new(vec![2]))), 2);
        let (metric, _) = stack.pop().unwrap();
        assert_eq!(metric, "b");
        assert_eq!(stack.metrics(), &["a".to_string()]);
        assert!(stack.get(1).is_err());
    }

    #[test]
    fn test_sum_by_group_excludes_zero() {
        let lookup = GroupLookup::from_groups(vec![0, 1, 2, 1, 0]);
        let stat = MemoryStatLookup::new(vec![100, 1, 2, 3, 100]);
        let mut scratch = ScratchBuffers::new(2);
        assert_eq!(sum_by_group(&lookup, &stat, &mut scratch), vec![0, 4, 2]);
    }

    #[test]
    fn test_total_doc_freq_and_distinct() {
        use crate::reader::MemoryReader;

        let reader = MemoryReader::builder(4)
            .int_term("price", 10, &[0, 1])
            .int_term("price", 20, &[2])
            .string_term("country", "us", &[0, 3])
            .string_term("country", "de", &[1])
            .build();
        let fields = [Field::int("price"), Field::string("country")];
        assert_eq!(total_doc_freq(&reader, &fields).unwrap(), 6);
        assert_eq!(total_doc_freq(&reader, &[Field::int("missing")]).unwrap(), 0);

        let lookup = GroupLookup::from_groups(vec![1, 2, 2, 0]);
        let mut scratch = ScratchBuffers::new(1);
        // group 1: {10}, group 2: {10, 20}
        assert_eq!(
            distinct_by_group(&lookup, &reader, &mut scratch, &fields[0]).unwrap(),
            vec![0, 1, 2]
        );
        // doc 3 holds "us" but sits in group 0
        assert_eq!(
            distinct_by_group(&lookup, &reader, &mut scratch, &fields[1]).unwrap(),
            vec![0, 1, 1]
        );
    }
}
