//! K-way term merge
//!
//! This module merges several sorted [`TermSource`]s of the same key type into
//! one strictly ascending, duplicate-free stream:
//!
//! - [`MergeIterator`]: min-heap merge that sums document frequencies of equal
//!   terms and records which sources contributed each emitted term
//! - [`FtgsMerger`]: the same merge lifted to whole FTGS streams, summing
//!   per-group statistics of equal terms
//!
//! # Algorithm
//!
//! ```text
//!   source 0: 5 ──── 7 ─────────
//!   source 1: 5 ────────── 9 ───        heap keyed by (term, source index)
//!                 │
//!                 ▼
//!   emit (5, f0+f1)  contributors [0, 1]   ← both popped, not re-queued
//!   emit (7, f0)     contributors [0]      ← 0 and 1 advanced first
//!   emit (9, f1)     contributors [1]
//! ```
//!
//! Every source is either queued with a term greater than the last emitted
//! term, or pending advance because it contributed that term.
//!
//! # Example
//!
//! ```rust
//! use ftgs_engine::merge::MergeIterator;
//! use ftgs_engine::reader::MemoryTermSource;
//!
//! let a = MemoryTermSource::from_freqs(vec![(5i64, 3), (7, 2)]);
//! let b = MemoryTermSource::from_freqs(vec![(5i64, 1), (9, 4)]);
//!
//! let merged: Vec<(i64, u64)> = MergeIterator::new(vec![a, b])
//!     .unwrap()
//!     .pairs()
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//! assert_eq!(merged, vec![(5, 4), (7, 2), (9, 4)]);
//! ```

mod ftgs;

pub use ftgs::FtgsMerger;

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tracing::debug;

use crate::error::{CloseErrors, Error, Result};
use crate::metrics::record_term_merged;
use crate::reader::TermSource;
use crate::types::DocFreq;

/// Heap entry ordered by term, then source index
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry<K> {
    term: K,
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeState {
    /// Sources not yet advanced, or mid-stream
    Active,
    /// All sources exhausted
    Exhausted,
    /// Closed by the owner
    Closed,
}

/// K-way merge over same-typed term sources
pub struct MergeIterator<S: TermSource> {
    sources: Vec<S>,
    heap: BinaryHeap<Reverse<HeapEntry<S::Key>>>,
    /// Sources that must be advanced before the next term is chosen
    pending: Vec<usize>,
    /// Sources holding the current term, ascending by index
    contributors: Vec<usize>,
    current: Option<S::Key>,
    doc_freq: DocFreq,
    state: MergeState,
}

impl<S: TermSource> MergeIterator<S> {
    /// Create a merge over `sources`
    ///
    /// No source is advanced until the first call to [`MergeIterator::next`].
    pub fn new(sources: Vec<S>) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::InvalidArgument(
                "merge requires at least one term source".to_string(),
            ));
        }

        let count = sources.len();
        Ok(Self {
            sources,
            heap: BinaryHeap::with_capacity(count),
            pending: (0..count).collect(),
            contributors: Vec::with_capacity(count),
            current: None,
            doc_freq: 0,
            state: MergeState::Active,
        })
    }

    /// Advance to the next merged term; `false` once every source is drained
    pub fn next(&mut self) -> Result<bool> {
        match self.state {
            MergeState::Exhausted => return Ok(false),
            MergeState::Closed => return Err(Error::Closed("merge iterator closed".to_string())),
            MergeState::Active => {}
        }

        if let Err(e) = self.advance_pending() {
            self.terminate();
            return Err(e);
        }

        let first = match self.heap.pop() {
            Some(Reverse(entry)) => entry,
            None => {
                debug!(sources = self.sources.len(), "Merge exhausted");
                self.terminate();
                return Ok(false);
            }
        };

        self.doc_freq = self.sources[first.index].doc_freq();
        self.pending.push(first.index);

        while self
            .heap
            .peek()
            .is_some_and(|Reverse(top)| top.term == first.term)
        {
            if let Some(Reverse(entry)) = self.heap.pop() {
                self.doc_freq += self.sources[entry.index].doc_freq();
                self.pending.push(entry.index);
            }
        }

        self.pending.sort_unstable();
        self.contributors.clear();
        self.contributors.extend_from_slice(&self.pending);
        self.current = Some(first.term);
        record_term_merged();
        Ok(true)
    }

    /// Advance every pending source and queue the ones that still have terms
    fn advance_pending(&mut self) -> Result<()> {
        let mut pending = std::mem::take(&mut self.pending);
        for &index in &pending {
            let source = &mut self.sources[index];
            if source.next()? {
                self.heap.push(Reverse(HeapEntry {
                    term: source.term().clone(),
                    index,
                }));
            }
        }
        pending.clear();
        self.pending = pending;
        Ok(())
    }

    fn terminate(&mut self) {
        self.heap.clear();
        self.pending.clear();
        self.contributors.clear();
        self.current = None;
        self.doc_freq = 0;
        self.state = MergeState::Exhausted;
    }

    /// Current merged term, if positioned on one
    pub fn term(&self) -> Option<&S::Key> {
        self.current.as_ref()
    }

    /// Sum of document frequencies over the current contributors
    pub fn doc_freq(&self) -> DocFreq {
        self.doc_freq
    }

    /// Indices of the sources holding the current term, ascending
    pub fn contributors(&self) -> &[usize] {
        &self.contributors
    }

    /// Number of merged sources
    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Borrow one source
    pub fn source(&self, index: usize) -> &S {
        &self.sources[index]
    }

    /// Mutably borrow one source
    ///
    /// Callers must not advance the source; only document enumeration of the
    /// current term is allowed.
    pub fn source_mut(&mut self, index: usize) -> &mut S {
        &mut self.sources[index]
    }

    /// Visit every contributor of the current term in ascending index order
    pub fn for_each_contributor<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(usize, &mut S) -> Result<()>,
    {
        for &index in &self.contributors {
            f(index, &mut self.sources[index])?;
        }
        Ok(())
    }

    /// Whether every source has been drained
    pub fn is_exhausted(&self) -> bool {
        self.state == MergeState::Exhausted
    }

    /// Close every source, reporting the first failure
    ///
    /// All sources are attempted even when an earlier one fails.
    pub fn close(&mut self) -> Result<()> {
        if self.state == MergeState::Closed {
            return Ok(());
        }
        self.terminate();
        self.state = MergeState::Closed;

        let mut errors = CloseErrors::new();
        for source in &mut self.sources {
            errors.record("term_source", source.close());
        }
        errors.finish()
    }

    /// Give back the underlying sources without closing them
    pub fn into_sources(self) -> Vec<S> {
        self.sources
    }

    /// Iterate owned `(term, doc_freq)` pairs
    pub fn pairs(self) -> MergePairs<S> {
        MergePairs { merge: self }
    }
}

/// Owned-pair adapter returned by [`MergeIterator::pairs`]
pub struct MergePairs<S: TermSource> {
    merge: MergeIterator<S>,
}

impl<S: TermSource> Iterator for MergePairs<S> {
    type Item = Result<(S::Key, DocFreq)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.merge.next() {
            Ok(true) => self
                .merge
                .term()
                .cloned()
                .map(|term| Ok((term, self.merge.doc_freq()))),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
