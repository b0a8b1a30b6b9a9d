//! Per-shard FTGS generation
//!
//! Walks the requested fields of one shard, and for each term feeds its
//! documents through [`GroupLookup::next_group_callback`] to build the
//! term's per-group stats.

use std::sync::Arc;

use super::FtgsIterator;
use crate::error::{Error, Result};
use crate::group::{GroupLookup, GroupsSeen, ScratchBuffers};
use crate::reader::{IntTermSource, ShardReader, StatLookup, StringTermSource, TermSource};
use crate::session::MemoryClaim;
use crate::types::{DocFreq, Field, FieldType, GroupId, TermRef};

enum FieldCursor {
    Int(IntTermSource),
    String(StringTermSource),
}

impl FieldCursor {
    fn open(reader: &dyn ShardReader, field: &Field) -> Result<Self> {
        Ok(match field.field_type {
            FieldType::Int => FieldCursor::Int(reader.int_terms(&field.name)?),
            FieldType::String => FieldCursor::String(reader.string_terms(&field.name)?),
        })
    }

    fn next(&mut self) -> Result<bool> {
        match self {
            FieldCursor::Int(s) => s.next(),
            FieldCursor::String(s) => s.next(),
        }
    }

    fn term(&self) -> TermRef<'_> {
        match self {
            FieldCursor::Int(s) => TermRef::Int(*s.term()),
            FieldCursor::String(s) => TermRef::Bytes(s.term()),
        }
    }

    fn doc_freq(&self) -> DocFreq {
        match self {
            FieldCursor::Int(s) => s.doc_freq(),
            FieldCursor::String(s) => s.doc_freq(),
        }
    }

    fn read_doc_ids(&mut self, buf: &mut [u32]) -> Result<usize> {
        match self {
            FieldCursor::Int(s) => s.read_doc_ids(buf),
            FieldCursor::String(s) => s.read_doc_ids(buf),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            FieldCursor::Int(s) => s.close(),
            FieldCursor::String(s) => s.close(),
        }
    }
}

/// FTGS stream of one shard under a fixed group assignment
pub struct ShardFtgs {
    reader: Arc<dyn ShardReader>,
    lookup: Arc<GroupLookup>,
    stats: Vec<Arc<dyn StatLookup>>,
    fields: Vec<Field>,
    /// Index of the current field plus one
    field_pos: usize,
    cursor: Option<FieldCursor>,
    on_term: bool,
    scratch: ScratchBuffers,
    /// `[stat][group]` totals of the current term
    group_stats: Vec<Vec<i64>>,
    seen: GroupsSeen,
    groups: Vec<GroupId>,
    group_pos: usize,
    /// Holds the bytes of the per-group buffers, when accounted
    claim: Option<MemoryClaim>,
}

impl ShardFtgs {
    /// Bytes of per-group buffers for `num_groups` groups and `num_stats`
    /// stats
    pub fn memory_for(num_groups: u32, num_stats: usize) -> u64 {
        num_groups as u64 * (8 * num_stats as u64 + 4) + (num_groups as u64).div_ceil(8)
    }

    /// Stream `fields` of `reader`, grouped by `lookup`, with `stats`
    pub fn new(
        reader: Arc<dyn ShardReader>,
        lookup: Arc<GroupLookup>,
        stats: Vec<Arc<dyn StatLookup>>,
        fields: Vec<Field>,
        batch_size: usize,
    ) -> Result<Self> {
        if lookup.size() != reader.num_docs() {
            return Err(Error::SizeMismatch {
                expected: reader.num_docs(),
                actual: lookup.size(),
            });
        }
        let num_groups = lookup.num_groups() as usize;
        Ok(Self {
            reader,
            group_stats: vec![vec![0; num_groups]; stats.len()],
            seen: GroupsSeen::new(num_groups),
            lookup,
            stats,
            fields,
            field_pos: 0,
            cursor: None,
            on_term: false,
            scratch: ScratchBuffers::new(batch_size),
            groups: Vec::new(),
            group_pos: 0,
            claim: None,
        })
    }

    /// Keep `claim` alive as long as the stream
    pub fn with_claim(mut self, claim: MemoryClaim) -> Self {
        self.claim = Some(claim);
        self
    }

    fn reset_term(&mut self) {
        for &group in &self.groups {
            for totals in &mut self.group_stats {
                totals[group as usize] = 0;
            }
        }
        self.groups.clear();
        self.seen.clear();
        self.group_pos = 0;
        self.on_term = false;
    }

    fn close_cursor(&mut self) -> Result<()> {
        match self.cursor.take() {
            Some(mut cursor) => cursor.close(),
            None => Ok(()),
        }
    }

    fn accumulate_term(&mut self) -> Result<()> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(());
        };
        loop {
            let n = cursor.read_doc_ids(&mut self.scratch.doc_ids)?;
            if n == 0 {
                break;
            }
            self.lookup.next_group_callback(
                n,
                &mut self.scratch,
                &self.stats,
                &mut self.group_stats,
                &mut self.seen,
            );
        }
        self.groups.extend_from_slice(self.seen.sorted());
        Ok(())
    }
}

impl std::fmt::Debug for ShardFtgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardFtgs")
            .field("fields", &self.fields)
            .field("field_pos", &self.field_pos)
            .field("num_groups", &self.lookup.num_groups())
            .field("num_stats", &self.stats.len())
            .field("claimed", &self.claim.as_ref().map_or(0, MemoryClaim::bytes))
            .finish()
    }
}

impl FtgsIterator for ShardFtgs {
    fn num_stats(&self) -> usize {
        self.stats.len()
    }

    fn num_groups(&self) -> u32 {
        self.lookup.num_groups()
    }

    fn next_field(&mut self) -> Result<bool> {
        self.reset_term();
        self.close_cursor()?;
        if self.field_pos >= self.fields.len() {
            self.field_pos = self.fields.len() + 1;
            return Ok(false);
        }
        self.field_pos += 1;
        let field = &self.fields[self.field_pos - 1];
        self.cursor = Some(FieldCursor::open(self.reader.as_ref(), field)?);
        Ok(true)
    }

    fn field(&self) -> &Field {
        &self.fields[self.field_pos - 1]
    }

    fn next_term(&mut self) -> Result<bool> {
        self.reset_term();
        let advanced = match self.cursor.as_mut() {
            Some(cursor) => cursor.next()?,
            None => return Ok(false),
        };
        if !advanced {
            return Ok(false);
        }
        self.on_term = true;
        self.accumulate_term()?;
        Ok(true)
    }

    fn term(&self) -> TermRef<'_> {
        match &self.cursor {
            Some(cursor) if self.on_term => cursor.term(),
            _ => TermRef::Int(0),
        }
    }

    fn term_doc_freq(&self) -> DocFreq {
        match &self.cursor {
            Some(cursor) if self.on_term => cursor.doc_freq(),
            _ => 0,
        }
    }

    fn next_group(&mut self) -> Result<bool> {
        if self.group_pos >= self.groups.len() {
            self.group_pos = self.groups.len() + 1;
            return Ok(false);
        }
        self.group_pos += 1;
        Ok(true)
    }

    fn group(&self) -> GroupId {
        self.groups[self.group_pos - 1]
    }

    fn group_stats(&self, stats: &mut [i64]) {
        let group = self.group() as usize;
        for (slot, totals) in stats.iter_mut().zip(&self.group_stats) {
            *slot = totals[group];
        }
    }

    fn close(&mut self) -> Result<()> {
        self.reset_term();
        self.field_pos = self.fields.len() + 1;
        self.close_cursor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftgs::{collect_ftgs, FtgsGroup};
    use crate::reader::{MemoryReader, COUNT_METRIC};
    use crate::types::Term;

    #[test]
    fn test_shard_ftgs_groups_and_stats() {
        let reader: Arc<dyn ShardReader> = Arc::new(
            MemoryReader::builder(4)
                .int_term("clicks", 3, &[0, 2])
                .int_term("clicks", 5, &[1, 3])
                .string_term("country", "us", &[0, 1, 2])
                .build(),
        );
        // doc 3 is filtered out
        let lookup = Arc::new(GroupLookup::from_groups(vec![1, 2, 2, 0]));
        let stats = vec![
            reader.stat_lookup(COUNT_METRIC).unwrap(),
            reader.stat_lookup("clicks").unwrap(),
        ];

        let mut ftgs = ShardFtgs::new(
            reader,
            lookup,
            stats,
            vec![Field::string("country"), Field::int("clicks")],
            2,
        )
        .unwrap();
        let fields = collect_ftgs(&mut ftgs).unwrap();

        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field, Field::string("country"));
        let us = &fields[0].terms[0];
        assert_eq!(us.term, Term::from("us"));
        assert_eq!(us.doc_freq, 3);
        assert_eq!(
            us.groups,
            vec![FtgsGroup::new(1, vec![1, 3]), FtgsGroup::new(2, vec![2, 8])]
        );

        let clicks = &fields[1].terms;
        assert_eq!(clicks[0].term, Term::Int(3));
        assert_eq!(
            clicks[0].groups,
            vec![FtgsGroup::new(1, vec![1, 3]), FtgsGroup::new(2, vec![1, 3])]
        );
        // doc 3 sits in group 0 and never shows up
        assert_eq!(clicks[1].doc_freq, 2);
        assert_eq!(clicks[1].groups, vec![FtgsGroup::new(2, vec![1, 5])]);
    }

    #[test]
    fn test_size_mismatch() {
        let reader: Arc<dyn ShardReader> = Arc::new(MemoryReader::builder(3).build());
        let lookup = Arc::new(GroupLookup::new(2, 1));
        assert!(ShardFtgs::new(reader, lookup, vec![], vec![], 8).is_err());
    }
}
