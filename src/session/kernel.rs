//! Aggregation kernels
//!
//! The kernel is the piece that turns a set of per-shard snapshots into K
//! split outputs. [`PortableKernel`] merges the shards' FTGS streams and
//! routes every term through [`FtgsSplitter`]; accelerated kernels can be
//! installed process-wide with [`initialize`] and removed with [`shutdown`].
//!
//! ```text
//!   ShardCache 0 ──▶ ShardFtgs ─┐
//!   ShardCache 1 ──▶ ShardFtgs ─┼──▶ FtgsMerger ──▶ FtgsSplitter ──▶ outputs[0..K]
//!   ShardCache n ──▶ ShardFtgs ─┘
//! ```

use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::local::ShardSession;
use super::memory::{MemoryClaim, MemoryContext};
use crate::error::{CloseErrors, Error, Result};
use crate::ftgs::{FtgsIterator, FtgsSink, ShardFtgs};
use crate::group::GroupLookup;
use crate::merge::FtgsMerger;
use crate::reader::{ShardReader, StatLookup};
use crate::split::FtgsSplitter;
use crate::types::Field;

// ============================================================================
// ShardCache
// ============================================================================

/// Frozen view of one shard for a single aggregation round
///
/// The group assignment is copied so regroups issued after the round started
/// cannot change what the round sees. The copy is claimed from the session's
/// memory context and released on drop.
pub struct ShardCache {
    reader: Arc<dyn ShardReader>,
    lookup: Arc<GroupLookup>,
    stats: Vec<Arc<dyn StatLookup>>,
    batch_size: usize,
    claimed: u64,
    memory: Arc<MemoryContext>,
}

impl ShardCache {
    /// Snapshot `session`
    pub fn build(session: &ShardSession) -> Result<Self> {
        if session.is_closed() {
            return Err(Error::Closed("shard session".to_string()));
        }
        let source = session.group_lookup();
        let claimed = GroupLookup::memory_for_size(source.size());
        session.memory().claim(claimed)?;

        let mut lookup = GroupLookup::new(source.size(), 0);
        if let Err(e) = source.copy_into(&mut lookup) {
            session.memory().release(claimed);
            return Err(e);
        }

        Ok(Self {
            reader: Arc::clone(session.reader()),
            lookup: Arc::new(lookup),
            stats: session.stat_lookups().to_vec(),
            batch_size: session.batch_size(),
            claimed,
            memory: Arc::clone(session.memory()),
        })
    }

    /// Snapshotted group assignment
    pub fn group_lookup(&self) -> &GroupLookup {
        &self.lookup
    }

    /// Stats active when the snapshot was taken
    pub fn num_stats(&self) -> usize {
        self.stats.len()
    }

    /// Memory context the snapshot and its streams are claimed from
    pub fn memory(&self) -> &Arc<MemoryContext> {
        &self.memory
    }

    /// Local FTGS stream over `fields`; its per-group buffers are claimed
    /// until the stream is dropped
    pub fn ftgs(&self, fields: &[Field]) -> Result<ShardFtgs> {
        let claim = MemoryClaim::new(
            &self.memory,
            ShardFtgs::memory_for(self.lookup.num_groups(), self.stats.len()),
        )?;
        Ok(ShardFtgs::new(
            Arc::clone(&self.reader),
            Arc::clone(&self.lookup),
            self.stats.clone(),
            fields.to_vec(),
            self.batch_size,
        )?
        .with_claim(claim))
    }
}

impl Drop for ShardCache {
    fn drop(&mut self) {
        self.memory.release(self.claimed);
    }
}

// ============================================================================
// AggregationKernel
// ============================================================================

/// Produces the K split outputs of one aggregation round
pub trait AggregationKernel: Send + Sync {
    /// Kernel name for logs
    fn name(&self) -> &str;

    /// Write split `i` of the merged FTGS stream over `caches` into
    /// `outputs[i]`
    ///
    /// The kernel owns closing every output, whether it succeeds or fails.
    fn run(
        &self,
        caches: &[ShardCache],
        fields: &[Field],
        large_prime: i32,
        outputs: &mut [Box<dyn FtgsSink>],
    ) -> Result<()>;
}

/// Reference kernel built on [`FtgsMerger`] and [`FtgsSplitter`]
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableKernel;

impl PortableKernel {
    fn close_outputs(outputs: &mut [Box<dyn FtgsSink>]) {
        let mut errors = CloseErrors::new();
        for output in outputs.iter_mut() {
            errors.record("split_output", output.close().map_err(Error::from));
        }
        let _ = errors.finish();
    }
}

impl AggregationKernel for PortableKernel {
    fn name(&self) -> &str {
        "portable"
    }

    fn run(
        &self,
        caches: &[ShardCache],
        fields: &[Field],
        large_prime: i32,
        outputs: &mut [Box<dyn FtgsSink>],
    ) -> Result<()> {
        let streams: Result<Vec<ShardFtgs>> = caches.iter().map(|c| c.ftgs(fields)).collect();
        let merged = streams.and_then(|streams| {
            let num_groups = streams.iter().map(|s| s.num_groups()).max().unwrap_or(1);
            let num_stats = streams.first().map_or(0, |s| s.num_stats());
            let claim = match caches.first() {
                Some(cache) => Some(MemoryClaim::new(
                    cache.memory(),
                    FtgsMerger::<ShardFtgs>::memory_for(num_groups, num_stats),
                )?),
                None => None,
            };
            let merger = FtgsMerger::new(streams)?;
            Ok(match claim {
                Some(claim) => merger.with_claim(claim),
                None => merger,
            })
        });
        let mut merged = match merged {
            Ok(merged) => merged,
            Err(e) => {
                Self::close_outputs(outputs);
                return Err(e);
            }
        };

        debug!(
            shards = caches.len(),
            fields = fields.len(),
            num_splits = outputs.len(),
            "Running portable kernel"
        );
        let sinks: Vec<&mut Box<dyn FtgsSink>> = outputs.iter_mut().collect();
        FtgsSplitter::new(large_prime).split(&mut merged, sinks)
    }
}

// ============================================================================
// Process-wide kernel
// ============================================================================

lazy_static! {
    static ref INSTALLED: RwLock<Option<Arc<dyn AggregationKernel>>> = RwLock::new(None);
}

/// Install `kernel` for every multi-session created afterwards
///
/// Fails if a kernel is already installed; call [`shutdown`] first.
pub fn initialize(kernel: Arc<dyn AggregationKernel>) -> Result<()> {
    let mut slot = INSTALLED.write();
    if let Some(current) = slot.as_ref() {
        return Err(Error::Configuration(format!(
            "aggregation kernel '{}' is already installed",
            current.name()
        )));
    }
    info!(kernel = kernel.name(), "Installed aggregation kernel");
    *slot = Some(kernel);
    Ok(())
}

/// Remove the installed kernel; returns whether one was installed
pub fn shutdown() -> bool {
    match INSTALLED.write().take() {
        Some(kernel) => {
            info!(kernel = kernel.name(), "Removed aggregation kernel");
            true
        }
        None => {
            warn!("Kernel shutdown requested but none is installed");
            false
        }
    }
}

/// Currently installed kernel
pub fn installed() -> Option<Arc<dyn AggregationKernel>> {
    INSTALLED.read().clone()
}

/// Installed kernel, or [`PortableKernel`] when none is
pub fn current() -> Arc<dyn AggregationKernel> {
    installed().unwrap_or_else(|| Arc::new(PortableKernel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::ftgs::{collect_ftgs, FtgsReader};
    use crate::reader::{MemoryReader, COUNT_METRIC};
    use crate::session::memory::MemoryReservation;
    use crate::split::SpillBuffer;
    use std::io::Cursor;

    fn open(reservation: &Arc<MemoryReservation>, reader: MemoryReader) -> ShardSession {
        let memory = Arc::new(MemoryContext::new(Arc::clone(reservation)));
        let mut session =
            ShardSession::new(Arc::new(reader), memory, &ExecutorConfig::default()).unwrap();
        session.push_stat(COUNT_METRIC).unwrap();
        session
    }

    #[test]
    fn test_cache_claims_and_releases_snapshot() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let session = open(&reservation, MemoryReader::builder(10).build());
        let before = reservation.used();

        let cache = ShardCache::build(&session).unwrap();
        assert_eq!(reservation.used(), before + 40);
        assert_eq!(cache.group_lookup(), session.group_lookup());
        assert_eq!(cache.num_stats(), 1);
        drop(cache);
        assert_eq!(reservation.used(), before);
    }

    #[test]
    fn test_portable_kernel_splits_merged_shards() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let a = open(
            &reservation,
            MemoryReader::builder(2).int_term("f", 1, &[0]).int_term("f", 2, &[1]).build(),
        );
        let b = open(
            &reservation,
            MemoryReader::builder(2).int_term("f", 1, &[0, 1]).build(),
        );
        let caches = vec![ShardCache::build(&a).unwrap(), ShardCache::build(&b).unwrap()];

        let buffers: Vec<SpillBuffer> = (0..2).map(|_| SpillBuffer::new()).collect();
        let mut outputs: Vec<Box<dyn FtgsSink>> = buffers
            .iter()
            .map(|b| Box::new(b.writer(None)) as Box<dyn FtgsSink>)
            .collect();
        PortableKernel
            .run(&caches, &[Field::int("f")], 2_147_483_629, &mut outputs)
            .unwrap();

        let mut seen = Vec::new();
        for buffer in &buffers {
            let mut reader = FtgsReader::new(Cursor::new(buffer.take()), 1, 2);
            for field in collect_ftgs(&mut reader).unwrap() {
                for term in field.terms {
                    seen.push((term.term, term.doc_freq, term.groups[0].stats[0]));
                }
            }
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                (crate::types::Term::Int(1), 3, 3),
                (crate::types::Term::Int(2), 1, 1)
            ]
        );
    }

    #[test]
    fn test_cache_ftgs_claims_group_buffers() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let session = open(&reservation, MemoryReader::builder(4).int_term("f", 1, &[0]).build());
        let cache = ShardCache::build(&session).unwrap();
        let before = reservation.used();

        let stream = cache.ftgs(&[Field::int("f")]).unwrap();
        assert_eq!(reservation.used(), before + ShardFtgs::memory_for(2, 1));
        drop(stream);
        assert_eq!(reservation.used(), before);
    }

    #[test]
    fn test_portable_kernel_closes_outputs_when_out_of_memory() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let session = open(&reservation, MemoryReader::builder(4).int_term("f", 1, &[0]).build());
        let cache = ShardCache::build(&session).unwrap();

        // leave room for the shard stream but not the merger
        let spare = reservation.ceiling() - reservation.used() - ShardFtgs::memory_for(2, 1);
        reservation.claim(spare).unwrap();

        let buffer = SpillBuffer::new();
        let mut outputs: Vec<Box<dyn FtgsSink>> = vec![Box::new(buffer.writer(None))];
        let err = PortableKernel
            .run(&[cache], &[Field::int("f")], 2_147_483_629, &mut outputs)
            .unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(buffer.is_empty());
        reservation.release(spare);
    }
}
