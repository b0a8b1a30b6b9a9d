//! FTGS-level merge
//!
//! Merges several FTGS streams that visit the same fields in the same order
//! (typically the same split index read back from every shard). Terms are
//! merged with [`MergeIterator`]; the groups of every contributor are summed
//! into a dense accumulator and replayed in ascending group order.

use super::MergeIterator;
use crate::error::{CloseErrors, Error, Result};
use crate::ftgs::FtgsIterator;
use crate::group::GroupsSeen;
use crate::reader::TermSource;
use crate::session::MemoryClaim;
use crate::types::{DocFreq, DocId, Field, GroupId, Term, TermRef};

/// Term cursor over the current field of one FTGS input
struct FtgsTermCursor<I> {
    inner: I,
    term: Term,
}

impl<I: FtgsIterator> TermSource for FtgsTermCursor<I> {
    type Key = Term;

    fn next(&mut self) -> Result<bool> {
        if !self.inner.next_term()? {
            return Ok(false);
        }
        match (&mut self.term, self.inner.term()) {
            (Term::Bytes(buf), TermRef::Bytes(b)) => {
                buf.clear();
                buf.extend_from_slice(b);
            }
            (slot, term) => *slot = term.to_owned(),
        }
        Ok(true)
    }

    fn term(&self) -> &Term {
        &self.term
    }

    fn doc_freq(&self) -> DocFreq {
        self.inner.term_doc_freq()
    }

    fn read_doc_ids(&mut self, _buf: &mut [DocId]) -> Result<usize> {
        // FTGS streams carry aggregates only
        Ok(0)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

enum Stage<I: FtgsIterator> {
    /// Between fields; inputs positioned at a field boundary
    Idle(Vec<FtgsTermCursor<I>>),
    /// Merging the terms of the current field
    Merging(MergeIterator<FtgsTermCursor<I>>),
    /// Transitional placeholder while ownership moves between stages
    Empty,
}

/// Sums several FTGS streams into one
pub struct FtgsMerger<I: FtgsIterator> {
    stage: Stage<I>,
    field: Field,
    num_stats: usize,
    num_groups: u32,
    /// `num_groups × num_stats`, row per group
    totals: Vec<i64>,
    seen: GroupsSeen,
    /// Ascending groups of the current term
    groups: Vec<GroupId>,
    /// Position in `groups` plus one
    group_pos: usize,
    scratch: Vec<i64>,
    closed: bool,
    claim: Option<MemoryClaim>,
}

impl<I: FtgsIterator> FtgsMerger<I> {
    /// Bytes of accumulators for `num_groups` groups and `num_stats` stats
    pub fn memory_for(num_groups: u32, num_stats: usize) -> u64 {
        num_groups.max(1) as u64 * (8 * num_stats as u64 + 4)
            + (num_groups.max(1) as u64).div_ceil(8)
    }

    /// Merge `inputs`; they must agree on `num_stats`
    pub fn new(inputs: Vec<I>) -> Result<Self> {
        let first = inputs.first().ok_or_else(|| {
            Error::InvalidArgument("FTGS merge requires at least one input".to_string())
        })?;
        let num_stats = first.num_stats();
        if let Some(bad) = inputs.iter().find(|i| i.num_stats() != num_stats) {
            return Err(Error::InvalidArgument(format!(
                "inputs disagree on stat count: {} vs {}",
                num_stats,
                bad.num_stats()
            )));
        }
        let num_groups = inputs.iter().map(|i| i.num_groups()).max().unwrap_or(1).max(1);

        Ok(Self {
            stage: Stage::Idle(
                inputs
                    .into_iter()
                    .map(|inner| FtgsTermCursor {
                        inner,
                        term: Term::Int(0),
                    })
                    .collect(),
            ),
            field: Field::int(""),
            num_stats,
            num_groups,
            totals: vec![0; num_groups as usize * num_stats],
            seen: GroupsSeen::new(num_groups as usize),
            groups: Vec::new(),
            group_pos: 0,
            scratch: vec![0; num_stats],
            closed: false,
            claim: None,
        })
    }

    /// Keep `claim` alive as long as the merger
    pub fn with_claim(mut self, claim: MemoryClaim) -> Self {
        self.claim = Some(claim);
        self
    }

    /// Bytes held for the accumulators, when accounted
    pub fn claimed(&self) -> u64 {
        self.claim.as_ref().map_or(0, MemoryClaim::bytes)
    }

    fn take_cursors(&mut self) -> Vec<FtgsTermCursor<I>> {
        match std::mem::replace(&mut self.stage, Stage::Empty) {
            Stage::Idle(cursors) => cursors,
            Stage::Merging(merge) => merge.into_sources(),
            Stage::Empty => Vec::new(),
        }
    }

    fn reset_term(&mut self) {
        for &group in &self.groups {
            let row = group as usize * self.num_stats;
            self.totals[row..row + self.num_stats].fill(0);
        }
        self.groups.clear();
        self.seen.clear();
        self.group_pos = 0;
    }

    fn accumulate_contributors(&mut self) -> Result<()> {
        let Stage::Merging(merge) = &mut self.stage else {
            return Ok(());
        };
        let num_stats = self.num_stats;
        let num_groups = self.num_groups;
        let totals = &mut self.totals;
        let seen = &mut self.seen;
        let scratch = &mut self.scratch;

        merge.for_each_contributor(|index, cursor| {
            while cursor.inner.next_group()? {
                let group = cursor.inner.group();
                if group >= num_groups {
                    return Err(Error::Corrupt(format!(
                        "input {} emitted group {} outside [0, {})",
                        index, group, num_groups
                    )));
                }
                cursor.inner.group_stats(&mut scratch[..]);
                let row = group as usize * num_stats;
                for (total, &value) in totals[row..row + num_stats].iter_mut().zip(scratch.iter()) {
                    *total = total.wrapping_add(value);
                }
                seen.insert(group);
            }
            Ok(())
        })?;

        self.groups.extend_from_slice(self.seen.sorted());
        Ok(())
    }
}

impl<I: FtgsIterator> FtgsIterator for FtgsMerger<I> {
    fn num_stats(&self) -> usize {
        self.num_stats
    }

    fn num_groups(&self) -> u32 {
        self.num_groups
    }

    fn next_field(&mut self) -> Result<bool> {
        if self.closed {
            return Err(Error::Closed("FTGS merger".to_string()));
        }
        self.reset_term();

        let mut cursors = self.take_cursors();
        let mut advanced = Vec::with_capacity(cursors.len());
        for cursor in &mut cursors {
            advanced.push(cursor.inner.next_field());
        }

        let mut field: Option<Field> = None;
        let mut ended = 0;
        let mut failure = None;
        for (i, outcome) in advanced.into_iter().enumerate() {
            match outcome {
                Ok(true) => {
                    let input_field = cursors[i].inner.field();
                    match &field {
                        None => field = Some(input_field.clone()),
                        Some(f) if f == input_field => {}
                        Some(f) => {
                            failure.get_or_insert(Error::Corrupt(format!(
                                "input {} is on field {} while others are on {}",
                                i, input_field, f
                            )));
                        }
                    }
                }
                Ok(false) => ended += 1,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if failure.is_none() && ended != 0 && ended != cursors.len() {
            failure = Some(Error::Corrupt(format!(
                "{} of {} inputs ended early",
                ended,
                cursors.len()
            )));
        }
        if let Some(e) = failure {
            self.stage = Stage::Idle(cursors);
            return Err(e);
        }

        match field {
            Some(field) => {
                self.field = field;
                self.stage = Stage::Merging(MergeIterator::new(cursors)?);
                Ok(true)
            }
            None => {
                self.stage = Stage::Idle(cursors);
                Ok(false)
            }
        }
    }

    fn field(&self) -> &Field {
        &self.field
    }

    fn next_term(&mut self) -> Result<bool> {
        self.reset_term();
        let advanced = match &mut self.stage {
            Stage::Merging(merge) => merge.next()?,
            _ => return Ok(false),
        };
        if !advanced {
            return Ok(false);
        }
        self.accumulate_contributors()?;
        Ok(true)
    }

    fn term(&self) -> TermRef<'_> {
        match &self.stage {
            Stage::Merging(merge) => merge.term().map_or(TermRef::Int(0), |t| t.as_ref()),
            _ => TermRef::Int(0),
        }
    }

    fn term_doc_freq(&self) -> DocFreq {
        match &self.stage {
            Stage::Merging(merge) => merge.doc_freq(),
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
        let row = self.group() as usize * self.num_stats;
        stats.copy_from_slice(&self.totals[row..row + self.num_stats]);
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut errors = CloseErrors::new();
        match std::mem::replace(&mut self.stage, Stage::Empty) {
            Stage::Merging(mut merge) => errors.record("ftgs_merge", merge.close()),
            Stage::Idle(mut cursors) => {
                for cursor in &mut cursors {
                    errors.record("ftgs_input", cursor.inner.close());
                }
            }
            Stage::Empty => {}
        }
        errors.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftgs::{collect_ftgs, FtgsField, FtgsGroup, FtgsTerm, MemoryFtgs};

    fn term(term: Term, doc_freq: DocFreq, groups: &[(GroupId, i64)]) -> FtgsTerm {
        FtgsTerm {
            term,
            doc_freq,
            groups: groups
                .iter()
                .map(|&(g, v)| FtgsGroup::new(g, vec![v]))
                .collect(),
        }
    }

    #[test]
    fn test_merges_terms_and_sums_groups() {
        let a = MemoryFtgs::new(
            vec![
                FtgsField {
                    field: Field::int("f"),
                    terms: vec![
                        term(Term::Int(1), 2, &[(1, 10), (3, 5)]),
                        term(Term::Int(4), 1, &[(2, 1)]),
                    ],
                },
                FtgsField {
                    field: Field::string("s"),
                    terms: vec![term(Term::from("x"), 1, &[(1, 1)])],
                },
            ],
            1,
        );
        let b = MemoryFtgs::new(
            vec![
                FtgsField {
                    field: Field::int("f"),
                    terms: vec![term(Term::Int(1), 3, &[(2, 7), (3, 1)])],
                },
                FtgsField {
                    field: Field::string("s"),
                    terms: vec![
                        term(Term::from("w"), 2, &[(2, 2)]),
                        term(Term::from("x"), 4, &[(1, 3)]),
                    ],
                },
            ],
            1,
        );

        let mut merged = FtgsMerger::new(vec![a, b]).unwrap();
        assert_eq!(merged.num_groups(), 4);
        let fields = collect_ftgs(&mut merged).unwrap();

        assert_eq!(
            fields,
            vec![
                FtgsField {
                    field: Field::int("f"),
                    terms: vec![
                        term(Term::Int(1), 5, &[(1, 10), (2, 7), (3, 6)]),
                        term(Term::Int(4), 1, &[(2, 1)]),
                    ],
                },
                FtgsField {
                    field: Field::string("s"),
                    terms: vec![
                        term(Term::from("w"), 2, &[(2, 2)]),
                        term(Term::from("x"), 5, &[(1, 4)]),
                    ],
                },
            ]
        );
        merged.close().unwrap();
    }

    #[test]
    fn test_field_disagreement_is_corrupt() {
        let a = MemoryFtgs::new(
            vec![FtgsField {
                field: Field::int("a"),
                terms: vec![],
            }],
            0,
        );
        let b = MemoryFtgs::new(
            vec![FtgsField {
                field: Field::int("b"),
                terms: vec![],
            }],
            0,
        );
        let mut merged = FtgsMerger::new(vec![a, b]).unwrap();
        assert!(matches!(merged.next_field(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_stat_count_disagreement_rejected() {
        let a = MemoryFtgs::new(vec![], 1);
        let b = MemoryFtgs::new(vec![], 2);
        assert!(FtgsMerger::new(vec![a, b]).is_err());
        assert!(FtgsMerger::<MemoryFtgs>::new(vec![]).is_err());
    }
}
