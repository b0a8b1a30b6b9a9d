//! Deterministic hash splitting of FTGS streams
//!
//! [`FtgsSplitter`] fans one FTGS stream out into K streams. Every field
//! switch goes to all K outputs; each term, with all of its groups and stats,
//! goes to exactly one output chosen by the partition function in [`hash`].
//!
//! ```text
//!                      ┌──▶ split 0: field a, t3, t9 ...  field b, "x" ...
//!   FTGS ──▶ splitter ─┼──▶ split 1: field a, t1 ...      field b, "q" ...
//!                      └──▶ split 2: field a, t4, t7 ...  field b ...
//! ```
//!
//! Any node can recompute a term's split index from the term value, the
//! configured large prime and K alone.

pub mod hash;
pub mod spill;

pub use hash::{murmur_hash32, split_index_bytes, split_index_int, DEFAULT_LARGE_PRIME};
pub use spill::{SpillBudget, SpillBuffer, SpillWriter, WriteLimitExceeded};

use std::io::Cursor;

use tracing::{debug, warn};

use crate::error::{CloseErrors, Error, Result};
use crate::ftgs::{FtgsIterator, FtgsReader, FtgsSink, FtgsWriter};
use crate::metrics::record_split_term;
use crate::types::TermRef;

/// Reader over one spilled split
pub type SpilledSplit = FtgsReader<Cursor<Vec<u8>>>;

/// Routes FTGS terms to K outputs
#[derive(Debug, Clone, Copy)]
pub struct FtgsSplitter {
    large_prime: i32,
}

impl Default for FtgsSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_LARGE_PRIME)
    }
}

impl FtgsSplitter {
    /// Splitter using `large_prime` in the partition function
    pub fn new(large_prime: i32) -> Self {
        Self { large_prime }
    }

    /// Configured prime
    pub fn large_prime(&self) -> i32 {
        self.large_prime
    }

    /// Split index of `term` among `num_splits`
    #[inline]
    pub fn split_index(&self, term: TermRef<'_>, num_splits: usize) -> usize {
        match term {
            TermRef::Int(t) => split_index_int(t, self.large_prime, num_splits),
            TermRef::Bytes(b) => split_index_bytes(b, self.large_prime, num_splits),
        }
    }

    /// Drain `input` into `outputs`, one output per split
    ///
    /// On success every output is flushed and closed. On failure every
    /// output is closed before the error is returned. The input is closed in
    /// both cases. A shared spill budget running out surfaces as
    /// [`Error::CapacityExceeded`].
    pub fn split<I, W>(&self, input: &mut I, outputs: Vec<W>) -> Result<()>
    where
        I: FtgsIterator + ?Sized,
        W: FtgsSink,
    {
        if outputs.is_empty() {
            if let Err(e) = input.close() {
                warn!(error = %e, "Failed to close split input");
            }
            return Err(Error::InvalidArgument(
                "split requires at least one output".to_string(),
            ));
        }

        let num_stats = input.num_stats();
        let mut writers: Vec<FtgsWriter<W>> = outputs
            .into_iter()
            .map(|output| FtgsWriter::new(output, num_stats))
            .collect();

        let result = match self.route(input, &mut writers) {
            Ok(terms) => {
                let mut errors = CloseErrors::new();
                for writer in &mut writers {
                    errors.record("split_output", writer.close());
                }
                debug!(
                    terms,
                    num_splits = writers.len(),
                    "Split FTGS stream"
                );
                errors.finish()
            }
            Err(e) => {
                record_split_term(false);
                warn!(error = %e, num_splits = writers.len(), "Split failed, closing outputs");
                let mut errors = CloseErrors::new();
                for writer in &mut writers {
                    errors.record("split_output", writer.abort());
                }
                Err(e)
            }
        };

        if let Err(e) = input.close() {
            warn!(error = %e, "Failed to close split input");
        }
        result.map_err(spill::classify)
    }

    fn route<I, W>(&self, input: &mut I, writers: &mut [FtgsWriter<W>]) -> Result<u64>
    where
        I: FtgsIterator + ?Sized,
        W: FtgsSink,
    {
        let num_splits = writers.len();
        let mut stats = vec![0i64; input.num_stats()];
        let mut terms = 0u64;

        while input.next_field()? {
            let field = input.field().clone();
            for writer in writers.iter_mut() {
                writer.switch_field(&field)?;
            }
            while input.next_term()? {
                let index = self.split_index(input.term(), num_splits);
                writers[index].copy_term(input, &mut stats)?;
                record_split_term(true);
                terms += 1;
            }
        }
        Ok(terms)
    }

    /// Split into in-memory buffers and return a reader per split
    ///
    /// All buffers draw from `budget` when one is given.
    pub fn split_in_memory<I>(
        &self,
        input: &mut I,
        num_splits: usize,
        budget: Option<SpillBudget>,
    ) -> Result<Vec<SpilledSplit>>
    where
        I: FtgsIterator + ?Sized,
    {
        let num_stats = input.num_stats();
        let num_groups = input.num_groups();
        let buffers: Vec<SpillBuffer> = (0..num_splits).map(|_| SpillBuffer::new()).collect();
        let writers: Vec<SpillWriter> = buffers
            .iter()
            .map(|buffer| buffer.writer(budget.clone()))
            .collect();

        self.split(input, writers)?;

        Ok(buffers
            .iter()
            .map(|buffer| FtgsReader::new(Cursor::new(buffer.take()), num_stats, num_groups))
            .collect())
    }
}
