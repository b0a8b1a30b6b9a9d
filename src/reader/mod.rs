//! Columnar reader collaborator interfaces
//!
//! The aggregation core never touches on-disk index formats. It consumes a
//! shard through three narrow capabilities:
//!
//! - [`TermSource`]: the sorted terms of one field in one shard, each with a
//!   document frequency and an enumeration of the documents holding it
//! - [`StatLookup`]: per-document integer values for one statistic
//! - [`ShardReader`]: the shard itself, handing out the two above
//!
//! [`MemoryReader`] is a complete in-memory implementation used by tests,
//! benches and small embedded deployments.

pub mod memory;

pub use memory::{MemoryReader, MemoryReaderBuilder, MemoryStatLookup, MemoryTermSource, COUNT_METRIC};

use std::sync::Arc;

use crate::error::Result;
use crate::types::{DocFreq, DocId, TermKey};

// =============================================================================
// TermSource Trait
// =============================================================================

/// Sorted term cursor over one field of one shard
///
/// A fresh source is positioned before its first term. Terms are produced in
/// strictly ascending order of [`TermSource::Key`].
pub trait TermSource: Send {
    /// Term key type (`i64` for integer fields, `Vec<u8>` for string fields)
    type Key: TermKey;

    /// Advance to the next term; `false` once the source is exhausted
    fn next(&mut self) -> Result<bool>;

    /// Current term. Only valid after `next` returned `true`.
    fn term(&self) -> &Self::Key;

    /// Document frequency of the current term
    fn doc_freq(&self) -> DocFreq;

    /// Read the next document ids of the current term into `buf`
    ///
    /// Returns the number of ids written; 0 means the current term's
    /// documents are exhausted. Advancing the term restarts enumeration.
    fn read_doc_ids(&mut self, buf: &mut [DocId]) -> Result<usize>;

    /// Release any resources held by the source
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: TermSource + ?Sized> TermSource for Box<S> {
    type Key = S::Key;

    fn next(&mut self) -> Result<bool> {
        (**self).next()
    }

    fn term(&self) -> &Self::Key {
        (**self).term()
    }

    fn doc_freq(&self) -> DocFreq {
        (**self).doc_freq()
    }

    fn read_doc_ids(&mut self, buf: &mut [DocId]) -> Result<usize> {
        (**self).read_doc_ids(buf)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Boxed integer-keyed term source
pub type IntTermSource = Box<dyn TermSource<Key = i64>>;

/// Boxed byte-string-keyed term source
pub type StringTermSource = Box<dyn TermSource<Key = Vec<u8>>>;

// =============================================================================
// StatLookup Trait
// =============================================================================

/// Per-document values of one statistic
pub trait StatLookup: Send + Sync {
    /// Number of documents covered
    fn num_docs(&self) -> usize;

    /// Write the value of each document in `doc_ids` into `values`
    ///
    /// `values` is at least as long as `doc_ids`.
    fn lookup(&self, doc_ids: &[DocId], values: &mut [i64]);

    /// Value for a single document
    fn get(&self, doc: DocId) -> i64 {
        let mut value = [0i64; 1];
        self.lookup(&[doc], &mut value);
        value[0]
    }

    /// Approximate resident bytes
    fn memory_used(&self) -> u64 {
        0
    }
}

// =============================================================================
// ShardReader Trait
// =============================================================================

/// One shard of a columnar index
pub trait ShardReader: Send + Sync {
    /// Number of documents in the shard
    fn num_docs(&self) -> usize;

    /// Integer field names, in the order the shard exposes them
    fn int_fields(&self) -> Vec<String>;

    /// String field names, in the order the shard exposes them
    fn string_fields(&self) -> Vec<String>;

    /// Term source for an integer field (empty for unknown fields)
    fn int_terms(&self, field: &str) -> Result<IntTermSource>;

    /// Term source for a string field (empty for unknown fields)
    fn string_terms(&self, field: &str) -> Result<StringTermSource>;

    /// Value lookup for a metric
    fn stat_lookup(&self, metric: &str) -> Result<Arc<dyn StatLookup>>;
}
