//! Memory accounting
//!
//! [`MemoryReservation`] is the process-wide byte budget. A
//! [`MemoryContext`] tracks what one multi-session and its shards claimed
//! from it, so teardown can return everything and report leftovers.
//!
//! ```text
//!   MemoryReservation (ceiling 8 GiB, used = Σ contexts)
//!        ▲ claim/release
//!   MemoryContext (used by this multi-session)
//!        ▲ claim/release
//!   ShardSession lookup + stats, ShardCache snapshots, multi-session claim,
//!   per-group buffers held through MemoryClaim
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::metrics::{record_memory_leak, update_memory_claimed};

// ============================================================================
// MemoryReservation
// ============================================================================

/// Shared byte counter bounded by a ceiling
#[derive(Debug)]
pub struct MemoryReservation {
    ceiling: u64,
    used: AtomicU64,
}

impl MemoryReservation {
    /// Reservation allowing at most `ceiling` bytes outstanding
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            used: AtomicU64::new(0),
        }
    }

    /// Claim `bytes`; fails without side effects if the ceiling would be
    /// exceeded
    pub fn claim(&self, bytes: u64) -> Result<()> {
        let ceiling = self.ceiling;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&next| next <= ceiling)
            })
            .map_err(|used| Error::OutOfMemory {
                requested: bytes,
                available: ceiling.saturating_sub(used),
            })?;
        update_memory_claimed(self.used());
        Ok(())
    }

    /// Return `bytes` claimed earlier
    pub fn release(&self, bytes: u64) {
        let result = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
        if let Ok(previous) = result {
            if previous < bytes {
                warn!(released = bytes, outstanding = previous, "Released more memory than claimed");
            }
        }
        update_memory_claimed(self.used());
    }

    /// Bytes currently claimed
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Configured ceiling
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Bytes still claimable
    pub fn available(&self) -> u64 {
        self.ceiling.saturating_sub(self.used())
    }
}

// ============================================================================
// MemoryContext
// ============================================================================

/// Claims made on behalf of one owner
#[derive(Debug)]
pub struct MemoryContext {
    parent: Arc<MemoryReservation>,
    used: AtomicU64,
}

impl MemoryContext {
    /// Track claims against `parent`
    pub fn new(parent: Arc<MemoryReservation>) -> Self {
        Self {
            parent,
            used: AtomicU64::new(0),
        }
    }

    /// Claim `bytes` from the parent reservation
    pub fn claim(&self, bytes: u64) -> Result<()> {
        self.parent.claim(bytes)?;
        self.used.fetch_add(bytes, Ordering::AcqRel);
        Ok(())
    }

    /// Return `bytes` to the parent reservation
    pub fn release(&self, bytes: u64) {
        let released = match self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            }) {
            Ok(previous) => previous.min(bytes),
            Err(_) => 0,
        };
        if released < bytes {
            warn!(requested = bytes, released, "Context released more than it claimed");
        }
        self.parent.release(released);
    }

    /// Bytes claimed through this context and not yet released
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Parent reservation
    pub fn reservation(&self) -> &Arc<MemoryReservation> {
        &self.parent
    }

    /// Return any outstanding claim to the parent
    ///
    /// Outstanding bytes mean some owner never released what it claimed;
    /// that is reported as [`Error::MemoryLeak`] after the bytes are returned.
    pub fn close(&self) -> Result<()> {
        let outstanding = self.used.swap(0, Ordering::AcqRel);
        if outstanding == 0 {
            return Ok(());
        }
        error!(bytes = outstanding, "Memory leak detected at teardown");
        record_memory_leak();
        self.parent.release(outstanding);
        Err(Error::MemoryLeak { bytes: outstanding })
    }
}

// ============================================================================
// MemoryClaim
// ============================================================================

/// Bytes held against a [`MemoryContext`] until dropped
#[derive(Debug)]
pub struct MemoryClaim {
    context: Arc<MemoryContext>,
    bytes: u64,
}

impl MemoryClaim {
    /// Claim `bytes` from `context`
    pub fn new(context: &Arc<MemoryContext>, bytes: u64) -> Result<Self> {
        context.claim(bytes)?;
        Ok(Self {
            context: Arc::clone(context),
            bytes,
        })
    }

    /// Bytes held
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        self.context.release(self.bytes);
    }
}
