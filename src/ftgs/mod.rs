//! FTGS streams: field → term → group → stats
//!
//! An FTGS stream is a four-level nested cursor. Fields come in the order the
//! producer chose, terms ascend within a field, groups ascend within a term,
//! and every group carries exactly `num_stats` signed 64-bit values.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   ┌────────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ ShardFtgs     │──▶│ FtgsSplitter   │──▶│ FtgsWriter   │──▶│ FtgsReader  │
//! │ (per shard)   │   │ K-way fan-out  │   │ wire encode  │   │ wire decode │
//! └───────────────┘   └────────────────┘   └──────────────┘   └──────┬──────┘
//!                                                                    ▼
//!                                                           ┌────────────────┐
//!                                                           │ FtgsMerger     │
//!                                                           │ per-split sum  │
//!                                                           └────────────────┘
//! ```

pub mod local;
pub mod memory;
pub mod wire;

pub use local::ShardFtgs;
pub use memory::{collect_ftgs, FtgsField, FtgsGroup, FtgsTerm, MemoryFtgs};
pub use wire::{FtgsReader, FtgsSink, FtgsWriter};

use crate::error::Result;
use crate::types::{DocFreq, Field, GroupId, TermRef};

/// Nested cursor over an FTGS stream
///
/// Advancing an outer level skips whatever remains of the inner levels.
pub trait FtgsIterator: Send {
    /// Stats carried by every group
    fn num_stats(&self) -> usize;

    /// Upper bound (exclusive) on group ids in the stream
    fn num_groups(&self) -> u32;

    /// Move to the next field; `false` at end of stream
    fn next_field(&mut self) -> Result<bool>;

    /// Current field
    fn field(&self) -> &Field;

    /// Move to the next term of the current field; `false` at end of field
    fn next_term(&mut self) -> Result<bool>;

    /// Current term
    fn term(&self) -> TermRef<'_>;

    /// Document frequency of the current term
    fn term_doc_freq(&self) -> DocFreq;

    /// Move to the next group of the current term; `false` at end of term
    fn next_group(&mut self) -> Result<bool>;

    /// Current group
    fn group(&self) -> GroupId;

    /// Copy the current group's stats into `stats` (length `num_stats`)
    fn group_stats(&self, stats: &mut [i64]);

    /// Release resources held by the stream
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<I: FtgsIterator + ?Sized> FtgsIterator for Box<I> {
    fn num_stats(&self) -> usize {
        (**self).num_stats()
    }

    fn num_groups(&self) -> u32 {
        (**self).num_groups()
    }

    fn next_field(&mut self) -> Result<bool> {
        (**self).next_field()
    }

    fn field(&self) -> &Field {
        (**self).field()
    }

    fn next_term(&mut self) -> Result<bool> {
        (**self).next_term()
    }

    fn term(&self) -> TermRef<'_> {
        (**self).term()
    }

    fn term_doc_freq(&self) -> DocFreq {
        (**self).term_doc_freq()
    }

    fn next_group(&mut self) -> Result<bool> {
        (**self).next_group()
    }

    fn group(&self) -> GroupId {
        (**self).group()
    }

    fn group_stats(&self, stats: &mut [i64]) {
        (**self).group_stats(stats)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Boxed FTGS stream
pub type BoxedFtgs = Box<dyn FtgsIterator>;
