//! Materialised FTGS streams
//!
//! Used to replay a known stream (tests, benches, small result sets) and to
//! capture any [`FtgsIterator`] into plain values for comparison.

use serde::{Deserialize, Serialize};

use super::FtgsIterator;
use crate::error::Result;
use crate::types::{DocFreq, Field, GroupId, Term, TermRef};

/// One group of a term with its stats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtgsGroup {
    /// Group id
    pub group: GroupId,
    /// Stat values in push order
    pub stats: Vec<i64>,
}

impl FtgsGroup {
    /// Create a group entry
    pub fn new(group: GroupId, stats: Vec<i64>) -> Self {
        Self { group, stats }
    }
}

/// One term of a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtgsTerm {
    /// Term value
    pub term: Term,
    /// Document frequency
    pub doc_freq: DocFreq,
    /// Groups in ascending order
    pub groups: Vec<FtgsGroup>,
}

/// One field of the stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtgsField {
    /// Field
    pub field: Field,
    /// Terms in ascending order
    pub terms: Vec<FtgsTerm>,
}

/// Drain an FTGS stream into values
pub fn collect_ftgs<I: FtgsIterator + ?Sized>(input: &mut I) -> Result<Vec<FtgsField>> {
    let mut stats = vec![0i64; input.num_stats()];
    let mut fields = Vec::new();
    while input.next_field()? {
        let mut terms = Vec::new();
        while input.next_term()? {
            let term = input.term().to_owned();
            let doc_freq = input.term_doc_freq();
            let mut groups = Vec::new();
            while input.next_group()? {
                input.group_stats(&mut stats);
                groups.push(FtgsGroup::new(input.group(), stats.clone()));
            }
            terms.push(FtgsTerm {
                term,
                doc_freq,
                groups,
            });
        }
        fields.push(FtgsField {
            field: input.field().clone(),
            terms,
        });
    }
    Ok(fields)
}

/// Replays a materialised stream
#[derive(Debug, Clone)]
pub struct MemoryFtgs {
    fields: Vec<FtgsField>,
    num_stats: usize,
    num_groups: u32,
    // Positions are index + 1; 0 means "before first"
    field_pos: usize,
    term_pos: usize,
    group_pos: usize,
}

impl MemoryFtgs {
    /// Wrap materialised fields
    ///
    /// `num_groups` is derived from the largest group present.
    pub fn new(fields: Vec<FtgsField>, num_stats: usize) -> Self {
        let max_group = fields
            .iter()
            .flat_map(|f| f.terms.iter())
            .flat_map(|t| t.groups.iter())
            .map(|g| g.group)
            .max()
            .unwrap_or(0);
        Self {
            fields,
            num_stats,
            num_groups: max_group + 1,
            field_pos: 0,
            term_pos: 0,
            group_pos: 0,
        }
    }

    /// Override the advertised group bound
    pub fn with_num_groups(mut self, num_groups: u32) -> Self {
        self.num_groups = self.num_groups.max(num_groups);
        self
    }

    /// The replayed fields
    pub fn fields(&self) -> &[FtgsField] {
        &self.fields
    }

    fn current_field(&self) -> &FtgsField {
        &self.fields[self.field_pos - 1]
    }

    fn current_term(&self) -> &FtgsTerm {
        &self.current_field().terms[self.term_pos - 1]
    }

    fn current_group(&self) -> &FtgsGroup {
        &self.current_term().groups[self.group_pos - 1]
    }
}

impl FtgsIterator for MemoryFtgs {
    fn num_stats(&self) -> usize {
        self.num_stats
    }

    fn num_groups(&self) -> u32 {
        self.num_groups
    }

    fn next_field(&mut self) -> Result<bool> {
        if self.field_pos >= self.fields.len() {
            self.field_pos = self.fields.len() + 1;
            return Ok(false);
        }
        self.field_pos += 1;
        self.term_pos = 0;
        self.group_pos = 0;
        Ok(true)
    }

    fn field(&self) -> &Field {
        &self.current_field().field
    }

    fn next_term(&mut self) -> Result<bool> {
        if self.field_pos == 0 || self.field_pos > self.fields.len() {
            return Ok(false);
        }
        let len = self.current_field().terms.len();
        if self.term_pos >= len {
            self.term_pos = len + 1;
            return Ok(false);
        }
        self.term_pos += 1;
        self.group_pos = 0;
        Ok(true)
    }

    fn term(&self) -> TermRef<'_> {
        self.current_term().term.as_ref()
    }

    fn term_doc_freq(&self) -> DocFreq {
        self.current_term().doc_freq
    }

    fn next_group(&mut self) -> Result<bool> {
        if self.term_pos == 0 || self.term_pos > self.current_field().terms.len() {
            return Ok(false);
        }
        let len = self.current_term().groups.len();
        if self.group_pos >= len {
            self.group_pos = len + 1;
            return Ok(false);
        }
        self.group_pos += 1;
        Ok(true)
    }

    fn group(&self) -> GroupId {
        self.current_group().group
    }

    fn group_stats(&self, stats: &mut [i64]) {
        stats.copy_from_slice(&self.current_group().stats);
    }
}
