//! Error types for the aggregation core

use thiserror::Error;
use tracing::warn;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// A claim against the shared memory reservation failed
    #[error("Out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory {
        /// Bytes requested by the failed claim
        requested: u64,
        /// Bytes still available under the ceiling
        available: u64,
    },

    /// A bounded split/spill target ran out of room
    #[error("Capacity exceeded: limit is {limit} bytes")]
    CapacityExceeded {
        /// Configured byte limit
        limit: u64,
    },

    /// Operation over two differently sized group structures
    #[error("Size mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        /// Size of the source structure
        expected: usize,
        /// Size of the destination structure
        actual: usize,
    },

    /// Operation attempted after teardown
    #[error("Closed: {0}")]
    Closed(String),

    /// Transport-level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller passed an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed FTGS wire data
    #[error("Corrupt FTGS stream: {0}")]
    Corrupt(String),

    /// Shared aggregation round failed on another thread
    #[error("Aggregation failed: {0}")]
    Aggregation(String),

    /// Memory still claimed when the owner was torn down
    #[error("Memory leak detected: {bytes} bytes still claimed")]
    MemoryLeak {
        /// Outstanding bytes
        bytes: u64,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether this error is the out-of-memory kind
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }

    /// Whether this error is the capacity-exceeded kind
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Collects failures during best-effort teardown
///
/// Every failure is logged; the first one is kept and returned by
/// [`CloseErrors::finish`]. Recording never short-circuits the caller.
#[derive(Debug, Default)]
pub struct CloseErrors {
    first: Option<Error>,
    count: usize,
}

impl CloseErrors {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of closing one resource
    pub fn record(&mut self, what: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!(resource = what, error = %e, "Failed to close resource");
            crate::metrics::record_close_failure(what);
            self.count += 1;
            if self.first.is_none() {
                self.first = Some(e);
            }
        }
    }

    /// Number of failures recorded so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// First failure, if any
    pub fn finish(self) -> Result<()> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::OutOfMemory {
            requested: 100,
            available: 10,
        };
        assert!(err.to_string().contains("100"));
        assert!(err.is_out_of_memory());
        assert!(!err.is_capacity_exceeded());
    }

    #[test]
    fn test_close_errors_keeps_first() {
        let mut errors = CloseErrors::new();
        errors.record("a", Ok(()));
        errors.record("b", Err(Error::Closed("first".into())));
        errors.record("c", Err(Error::Closed("second".into())));
        assert_eq!(errors.count(), 2);

        match errors.finish() {
            Err(Error::Closed(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_close_errors_empty_is_ok() {
        assert!(CloseErrors::new().finish().is_ok());
    }
}
