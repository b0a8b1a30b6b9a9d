//! Bounded in-memory spill buffers
//!
//! Split outputs that are read back locally are spilled into per-split
//! buffers that share one byte budget. Running out of budget is reported as a
//! [`WriteLimitExceeded`] I/O error, which the splitter turns into
//! [`Error::CapacityExceeded`].

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error as ThisError;

use crate::error::Error;
use crate::ftgs::FtgsSink;

/// A spill write would exceed the shared budget
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
#[error("spill write limit of {limit} bytes exceeded")]
pub struct WriteLimitExceeded {
    /// Budget the write ran into
    pub limit: u64,
}

/// Byte budget shared by every buffer of one split set
#[derive(Debug, Clone)]
pub struct SpillBudget {
    remaining: Arc<AtomicU64>,
    limit: u64,
}

impl SpillBudget {
    /// Budget of `limit` bytes
    pub fn new(limit: u64) -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(limit)),
            limit,
        }
    }

    /// Take `bytes` from the budget; `false` leaves the budget unchanged
    pub fn try_consume(&self, bytes: u64) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(bytes))
            .is_ok()
    }

    /// Bytes still available
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Total budget
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

/// Shared handle to one spilled split
#[derive(Debug, Clone, Default)]
pub struct SpillBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SpillBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer appending to this buffer, charged against `budget`
    pub fn writer(&self, budget: Option<SpillBudget>) -> SpillWriter {
        SpillWriter {
            data: Arc::clone(&self.data),
            budget,
        }
    }

    /// Bytes spilled so far
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Whether nothing was spilled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the spilled bytes, leaving the buffer empty
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.data.lock())
    }
}

/// Write end of a [`SpillBuffer`]
#[derive(Debug)]
pub struct SpillWriter {
    data: Arc<Mutex<Vec<u8>>>,
    budget: Option<SpillBudget>,
}

impl Write for SpillWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(budget) = &self.budget {
            if !budget.try_consume(buf.len() as u64) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    WriteLimitExceeded {
                        limit: budget.limit(),
                    },
                ));
            }
        }
        self.data.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FtgsSink for SpillWriter {}

/// Map a spill write-limit failure to [`Error::CapacityExceeded`]
pub fn classify(err: Error) -> Error {
    match err {
        Error::Io(io_err) => {
            let limit = io_err
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<WriteLimitExceeded>())
                .map(|exceeded| exceeded.limit);
            match limit {
                Some(limit) => Error::CapacityExceeded { limit },
                None => Error::Io(io_err),
            }
        }
        other => other,
    }
}
