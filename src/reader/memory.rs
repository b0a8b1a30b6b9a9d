//! In-memory shard reader
//!
//! Stores inverted lists per field in sorted maps so that term sources come
//! out in ascending order without further work.
//!
//! # Example
//!
//! ```rust
//! use ftgs_engine::reader::{MemoryReader, ShardReader, TermSource};
//!
//! let reader = MemoryReader::builder(4)
//!     .int_term("price", 10, &[0, 2])
//!     .int_term("price", 20, &[1])
//!     .string_term("country", "us", &[0, 1, 3])
//!     .build();
//!
//! let mut terms = reader.int_terms("price").unwrap();
//! assert!(terms.next().unwrap());
//! assert_eq!(*terms.term(), 10);
//! assert_eq!(terms.doc_freq(), 2);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{IntTermSource, ShardReader, StatLookup, StringTermSource, TermSource};
use crate::error::{Error, Result};
use crate::types::{DocFreq, DocId, TermKey};

/// Metric name that evaluates to 1 for every document
pub const COUNT_METRIC: &str = "count()";

// ============================================================================
// MemoryTermSource
// ============================================================================

#[derive(Debug, Clone)]
struct TermEntry<K> {
    term: K,
    doc_freq: DocFreq,
    docs: Arc<Vec<DocId>>,
}

/// Term source over a pre-sorted list of terms
#[derive(Debug, Clone)]
pub struct MemoryTermSource<K> {
    entries: Vec<TermEntry<K>>,
    /// Index of the current term plus one (0 = before first)
    position: usize,
    doc_cursor: usize,
}

impl<K: TermKey> MemoryTermSource<K> {
    /// Create from `(term, doc_freq)` pairs with no document lists
    ///
    /// Terms are sorted; duplicates are not allowed.
    pub fn from_freqs(mut pairs: Vec<(K, DocFreq)>) -> Self {
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            entries: pairs
                .into_iter()
                .map(|(term, doc_freq)| TermEntry {
                    term,
                    doc_freq,
                    docs: Arc::new(Vec::new()),
                })
                .collect(),
            position: 0,
            doc_cursor: 0,
        }
    }

    /// Create from `(term, doc ids)` pairs; doc frequency is the list length
    pub fn from_postings(mut postings: Vec<(K, Vec<DocId>)>) -> Self {
        postings.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            entries: postings
                .into_iter()
                .map(|(term, docs)| TermEntry {
                    term,
                    doc_freq: docs.len() as DocFreq,
                    docs: Arc::new(docs),
                })
                .collect(),
            position: 0,
            doc_cursor: 0,
        }
    }

    /// Number of terms in the source
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the source has no terms
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn current(&self) -> &TermEntry<K> {
        &self.entries[self.position - 1]
    }
}

impl<K: TermKey + 'static> TermSource for MemoryTermSource<K> {
    type Key = K;

    fn next(&mut self) -> Result<bool> {
        if self.position >= self.entries.len() {
            self.position = self.entries.len() + 1;
            return Ok(false);
        }
        self.position += 1;
        self.doc_cursor = 0;
        Ok(true)
    }

    fn term(&self) -> &K {
        &self.current().term
    }

    fn doc_freq(&self) -> DocFreq {
        self.current().doc_freq
    }

    fn read_doc_ids(&mut self, buf: &mut [DocId]) -> Result<usize> {
        if self.position == 0 || self.position > self.entries.len() {
            return Ok(0);
        }
        let docs = Arc::clone(&self.entries[self.position - 1].docs);
        let remaining = &docs[self.doc_cursor.min(docs.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.doc_cursor += n;
        Ok(n)
    }
}

// ============================================================================
// MemoryStatLookup
// ============================================================================

/// Dense per-document stat values
#[derive(Debug, Clone)]
pub struct MemoryStatLookup {
    values: Vec<i64>,
}

impl MemoryStatLookup {
    /// Wrap a dense value array indexed by document id
    pub fn new(values: Vec<i64>) -> Self {
        Self { values }
    }
}

impl StatLookup for MemoryStatLookup {
    fn num_docs(&self) -> usize {
        self.values.len()
    }

    fn lookup(&self, doc_ids: &[DocId], values: &mut [i64]) {
        for (slot, &doc) in values.iter_mut().zip(doc_ids) {
            *slot = self.values[doc as usize];
        }
    }

    fn memory_used(&self) -> u64 {
        8 * self.values.len() as u64
    }
}

// ============================================================================
// MemoryReader
// ============================================================================

/// In-memory shard
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    num_docs: usize,
    int_fields: BTreeMap<String, BTreeMap<i64, Vec<DocId>>>,
    string_fields: BTreeMap<String, BTreeMap<Vec<u8>, Vec<DocId>>>,
}

impl MemoryReader {
    /// Start building a shard with `num_docs` documents
    pub fn builder(num_docs: usize) -> MemoryReaderBuilder {
        MemoryReaderBuilder {
            reader: MemoryReader {
                num_docs,
                ..Default::default()
            },
        }
    }

    /// Build a shard where each document has exactly one value per int field
    ///
    /// `columns` maps field name to the dense per-document values.
    pub fn from_int_columns(num_docs: usize, columns: &[(&str, Vec<i64>)]) -> Self {
        let mut builder = Self::builder(num_docs);
        for (field, values) in columns {
            for (doc, &value) in values.iter().enumerate() {
                builder = builder.int_term(field, value, &[doc as DocId]);
            }
        }
        builder.build()
    }
}

impl ShardReader for MemoryReader {
    fn num_docs(&self) -> usize {
        self.num_docs
    }

    fn int_fields(&self) -> Vec<String> {
        self.int_fields.keys().cloned().collect()
    }

    fn string_fields(&self) -> Vec<String> {
        self.string_fields.keys().cloned().collect()
    }

    fn int_terms(&self, field: &str) -> Result<IntTermSource> {
        let postings = self
            .int_fields
            .get(field)
            .map(|terms| terms.iter().map(|(t, d)| (*t, d.clone())).collect())
            .unwrap_or_default();
        Ok(Box::new(MemoryTermSource::from_postings(postings)))
    }

    fn string_terms(&self, field: &str) -> Result<StringTermSource> {
        let postings = self
            .string_fields
            .get(field)
            .map(|terms| terms.iter().map(|(t, d)| (t.clone(), d.clone())).collect())
            .unwrap_or_default();
        Ok(Box::new(MemoryTermSource::from_postings(postings)))
    }

    fn stat_lookup(&self, metric: &str) -> Result<Arc<dyn StatLookup>> {
        if metric == COUNT_METRIC {
            return Ok(Arc::new(MemoryStatLookup::new(vec![1; self.num_docs])));
        }

        let terms = self
            .int_fields
            .get(metric)
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown metric: {}", metric)))?;

        // Terms ascend, so a multi-valued document keeps its largest value
        let mut values = vec![0i64; self.num_docs];
        for (&term, docs) in terms {
            for &doc in docs {
                values[doc as usize] = term;
            }
        }
        Ok(Arc::new(MemoryStatLookup::new(values)))
    }
}

/// Builder for [`MemoryReader`]
#[derive(Debug)]
pub struct MemoryReaderBuilder {
    reader: MemoryReader,
}

impl MemoryReaderBuilder {
    /// Add documents to an integer term
    pub fn int_term(mut self, field: &str, term: i64, docs: &[DocId]) -> Self {
        let list = self
            .reader
            .int_fields
            .entry(field.to_string())
            .or_default()
            .entry(term)
            .or_default();
        list.extend_from_slice(docs);
        list.sort_unstable();
        list.dedup();
        self
    }

    /// Add documents to a string term
    pub fn string_term(mut self, field: &str, term: &str, docs: &[DocId]) -> Self {
        let list = self
            .reader
            .string_fields
            .entry(field.to_string())
            .or_default()
            .entry(term.as_bytes().to_vec())
            .or_default();
        list.extend_from_slice(docs);
        list.sort_unstable();
        list.dedup();
        self
    }

    /// Finish building
    pub fn build(self) -> MemoryReader {
        self.reader
    }
}
