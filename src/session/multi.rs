//! Multi-shard session coordination
//!
//! A [`MultiSession`] fans every operation out over its shard sessions on a
//! shared rayon pool, and gathers split requests into aggregation rounds.
//!
//! # Split rendezvous
//!
//! A distributed FTGS request asks for all K splits of the same stream, one
//! caller per split, usually from K different threads. Each caller registers
//! its output in a slot table of size K and blocks. The caller that fills the
//! last slot takes every output, re-arms the table for the next round, and
//! runs the aggregation kernel once for all K outputs. Every caller of the
//! round then returns the round's outcome.
//!
//! ```text
//!   split 0 ──register──┐                       ┌──▶ wake: Ok / Err
//!   split 1 ──register──┼─▶ [slot table, K=3] ──┤
//!   split 2 ──register──┘        │ last party   └──▶ wake: Ok / Err
//!                                ▼
//!                 ShardCache × shards ──▶ kernel ──▶ outputs[0..3]
//! ```
//!
//! A failed round closes the whole multi-session. Closing sweeps any outputs
//! still waiting in the table and wakes their callers with [`Error::Closed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, error, info, warn};

use super::kernel::{self, AggregationKernel, ShardCache};
use super::local::ShardSession;
use super::memory::{MemoryClaim, MemoryContext};
use crate::config::Config;
use crate::error::{CloseErrors, Error, Result};
use crate::ftgs::{FtgsIterator, FtgsSink, ShardFtgs};
use crate::group::{GroupMultiRemapRule, GroupRemapRule};
use crate::merge::FtgsMerger;
use crate::metrics::record_aggregation_round;
use crate::types::{DocFreq, Field, GroupId};

// ============================================================================
// Rounds
// ============================================================================

#[derive(Debug, Clone)]
enum RoundOutcome {
    Completed,
    Failed(String),
    Closed,
}

/// Completion signal shared by the parties of one round
#[derive(Default)]
struct Round {
    outcome: Mutex<Option<RoundOutcome>>,
    finished: Condvar,
}

impl Round {
    /// Publish the outcome; only the first call counts
    fn finish(&self, outcome: RoundOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.finished.notify_all();
        }
    }

    fn wait(&self) -> Result<()> {
        let mut slot = self.outcome.lock();
        while slot.is_none() {
            self.finished.wait(&mut slot);
        }
        match slot.as_ref() {
            Some(RoundOutcome::Completed) => Ok(()),
            Some(RoundOutcome::Failed(msg)) => Err(Error::Aggregation(msg.clone())),
            Some(RoundOutcome::Closed) | None => Err(Error::Closed("multi-session".to_string())),
        }
    }
}

/// Slot table of the round currently gathering parties
struct Rendezvous {
    round: Arc<Round>,
    slots: Vec<Option<Box<dyn FtgsSink>>>,
    fields: Vec<Field>,
    arrived: usize,
}

impl Rendezvous {
    fn new() -> Self {
        Self {
            round: Arc::new(Round::default()),
            slots: Vec::new(),
            fields: Vec::new(),
            arrived: 0,
        }
    }

    /// Take the registered outputs and start a fresh round
    fn rearm(&mut self) -> (Arc<Round>, Vec<Option<Box<dyn FtgsSink>>>, Vec<Field>) {
        let previous = std::mem::replace(self, Self::new());
        (previous.round, previous.slots, previous.fields)
    }
}

fn close_outputs(outputs: impl IntoIterator<Item = Box<dyn FtgsSink>>, errors: &mut CloseErrors) {
    for mut output in outputs {
        errors.record("split_output", output.close().map_err(Error::from));
    }
}

// ============================================================================
// MultiSession
// ============================================================================

/// Coordinates the shard sessions of one query
pub struct MultiSession {
    sessions: Vec<Mutex<ShardSession>>,
    memory: Arc<MemoryContext>,
    pool: Arc<ThreadPool>,
    kernel: Arc<dyn AggregationKernel>,
    large_prime: i32,
    /// Fan-out used when a caller does not name one
    num_splits: usize,
    claimed: u64,
    closed: AtomicBool,
    rendezvous: Mutex<Rendezvous>,
    /// Held shared by running rounds, exclusively by teardown
    in_flight: RwLock<()>,
}

impl MultiSession {
    /// Take ownership of `sessions`
    ///
    /// `memory` must be the context the sessions claim from and must not be
    /// shared with other multi-sessions: teardown reports anything it still
    /// holds as a leak. If the fixed multi-session claim cannot be made, the
    /// sessions are closed and [`Error::OutOfMemory`] is returned.
    pub fn new(
        sessions: Vec<ShardSession>,
        memory: Arc<MemoryContext>,
        pool: Arc<ThreadPool>,
        config: &Config,
    ) -> Result<Self> {
        let claimed = config.memory.multi_session_claim_bytes;
        let failure = if sessions.is_empty() {
            Some(Error::InvalidArgument(
                "multi-session requires at least one shard".to_string(),
            ))
        } else {
            memory.claim(claimed).err()
        };
        if let Some(e) = failure {
            let mut errors = CloseErrors::new();
            for mut session in sessions {
                errors.record("shard_session", session.close());
            }
            let _ = errors.finish();
            return Err(e);
        }

        info!(
            shards = sessions.len(),
            claimed,
            "Opened multi-session"
        );
        Ok(Self {
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            memory,
            pool,
            kernel: kernel::current(),
            large_prime: config.split.large_prime,
            num_splits: config.split.num_splits,
            claimed,
            closed: AtomicBool::new(false),
            rendezvous: Mutex::new(Rendezvous::new()),
            in_flight: RwLock::new(()),
        })
    }

    /// Replace the aggregation kernel
    pub fn with_kernel(mut self, kernel: Arc<dyn AggregationKernel>) -> Self {
        self.kernel = kernel;
        self
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("multi-session".to_string()));
        }
        Ok(())
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of shards
    pub fn num_shards(&self) -> usize {
        self.sessions.len()
    }

    /// Memory context shared with the shard sessions
    pub fn memory(&self) -> &Arc<MemoryContext> {
        &self.memory
    }

    /// Largest group count over all shards
    pub fn num_groups(&self) -> u32 {
        self.sessions
            .iter()
            .map(|s| s.lock().num_groups())
            .max()
            .unwrap_or(1)
    }

    // ------------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------------

    /// Run `f` on every shard in parallel; results come back in shard order
    ///
    /// The first failing shard closes the whole multi-session and its error
    /// is returned.
    pub fn execute<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&mut ShardSession) -> Result<T> + Sync + Send,
    {
        self.check_open()?;
        let results: Vec<Result<T>> = self.pool.install(|| {
            self.sessions
                .par_iter()
                .map(|session| f(&mut session.lock()))
                .collect()
        });

        let mut values = Vec::with_capacity(results.len());
        let mut failure = None;
        for (shard, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => values.push(value),
                Err(e) if failure.is_none() => failure = Some((shard, e)),
                Err(_) => {}
            }
        }
        let Some((shard, e)) = failure else {
            return Ok(values);
        };
        // Values may hold memory claims; release them before teardown
        drop(values);
        warn!(shard, error = %e, "Shard operation failed, closing multi-session");
        if let Err(close_err) = self.close() {
            warn!(error = %close_err, "Close after shard failure reported an error");
        }
        Err(e)
    }

    fn max_groups(counts: Vec<u32>) -> u32 {
        counts.into_iter().max().unwrap_or(1)
    }

    /// Rule-based regroup on every shard; returns the largest group count
    pub fn regroup(&self, rules: &[GroupRemapRule]) -> Result<u32> {
        self.execute(|s| s.regroup(rules)).map(Self::max_groups)
    }

    /// Multi-condition regroup on every shard
    pub fn multisplit_regroup(
        &self,
        rules: &[GroupMultiRemapRule],
        error_on_collisions: bool,
    ) -> Result<u32> {
        self.execute(|s| s.multisplit_regroup(rules, error_on_collisions))
            .map(Self::max_groups)
    }

    /// Integer term-set regroup on every shard
    pub fn int_or_regroup(
        &self,
        field: &str,
        terms: &[i64],
        target_group: GroupId,
        negative_group: GroupId,
        positive_group: GroupId,
    ) -> Result<u32> {
        self.execute(|s| {
            s.int_or_regroup(field, terms, target_group, negative_group, positive_group)?;
            Ok(s.num_groups())
        })
        .map(Self::max_groups)
    }

    /// String term-set regroup on every shard
    pub fn string_or_regroup(
        &self,
        field: &str,
        terms: &[&str],
        target_group: GroupId,
        negative_group: GroupId,
        positive_group: GroupId,
    ) -> Result<u32> {
        self.execute(|s| {
            s.string_or_regroup(field, terms, target_group, negative_group, positive_group)?;
            Ok(s.num_groups())
        })
        .map(Self::max_groups)
    }

    /// Salted pseudo-random regroup on every shard
    #[allow(clippy::too_many_arguments)]
    pub fn random_regroup(
        &self,
        field: &str,
        is_int: bool,
        salt: &str,
        p: f64,
        target_group: GroupId,
        negative_group: GroupId,
        positive_group: GroupId,
    ) -> Result<u32> {
        self.execute(|s| {
            s.random_regroup(
                field,
                is_int,
                salt,
                p,
                target_group,
                negative_group,
                positive_group,
            )?;
            Ok(s.num_groups())
        })
        .map(Self::max_groups)
    }

    /// Metric bucketing on every shard
    pub fn metric_regroup(
        &self,
        stat_index: usize,
        min: i64,
        max: i64,
        interval: i64,
        no_gutters: bool,
    ) -> Result<u32> {
        self.execute(|s| s.metric_regroup(stat_index, min, max, interval, no_gutters))
            .map(Self::max_groups)
    }

    /// Metric range filter on every shard
    pub fn metric_filter(&self, stat_index: usize, min: i64, max: i64, negate: bool) -> Result<u32> {
        self.execute(|s| s.metric_filter(stat_index, min, max, negate))
            .map(Self::max_groups)
    }

    /// Threshold split of `target_group` into `result_groups` on every shard
    pub fn random_multi_regroup(
        &self,
        field: &str,
        is_int: bool,
        salt: &str,
        target_group: GroupId,
        percentages: &[f64],
        result_groups: &[GroupId],
    ) -> Result<u32> {
        self.execute(|s| {
            s.random_multi_regroup(field, is_int, salt, target_group, percentages, result_groups)
        })
        .map(Self::max_groups)
    }

    /// Stat range split of `target_group` on every shard
    #[allow(clippy::too_many_arguments)]
    pub fn targeted_metric_filter(
        &self,
        stat_index: usize,
        min: i64,
        max: i64,
        target_group: GroupId,
        negative_group: GroupId,
        positive_group: GroupId,
    ) -> Result<u32> {
        self.execute(|s| {
            s.targeted_metric_filter(stat_index, min, max, target_group, negative_group, positive_group)
        })
        .map(Self::max_groups)
    }

    /// Group rename on every shard
    pub fn remap_groups(
        &self,
        from: &[GroupId],
        to: &[GroupId],
        filter_out_not_targeted: bool,
    ) -> Result<u32> {
        self.execute(|s| s.remap_groups(from, to, filter_out_not_targeted))
            .map(Self::max_groups)
    }

    /// Put every document of every shard back into group 1
    pub fn reset_groups(&self) -> Result<u32> {
        self.execute(|s| s.reset_groups()).map(Self::max_groups)
    }

    /// Push `metric` on every shard; returns the new stack depth
    pub fn push_stat(&self, metric: &str) -> Result<usize> {
        let depths = self.execute(|s| s.push_stat(metric))?;
        Ok(depths.into_iter().max().unwrap_or(0))
    }

    /// Pop the most recent stat on every shard; returns the new stack depth
    pub fn pop_stat(&self) -> Result<usize> {
        let depths = self.execute(|s| s.pop_stat())?;
        Ok(depths.into_iter().max().unwrap_or(0))
    }

    /// Per-group sum of stat `stat_index` over all shards
    pub fn group_stats(&self, stat_index: usize) -> Result<Vec<i64>> {
        let per_shard = self.execute(|s| s.group_stats(stat_index))?;
        let len = per_shard.iter().map(Vec::len).max().unwrap_or(0);
        let mut totals = vec![0i64; len];
        for shard in per_shard {
            for (total, value) in totals.iter_mut().zip(shard) {
                *total = total.wrapping_add(value);
            }
        }
        Ok(totals)
    }

    /// Sum of document frequencies of the given fields over all shards
    pub fn total_doc_freq(&self, int_fields: &[&str], string_fields: &[&str]) -> Result<DocFreq> {
        let per_shard = self.execute(|s| s.total_doc_freq(int_fields, string_fields))?;
        Ok(per_shard.into_iter().fold(0, DocFreq::saturating_add))
    }

    /// Per-group count of distinct terms of `field` over all shards
    ///
    /// Terms are counted on the merged stream, so a term present in several
    /// shards counts once per group.
    pub fn distinct(&self, field: &str, is_int: bool) -> Result<Vec<i64>> {
        let mut merged = if is_int {
            self.ftgs_iterator(&[field], &[])?
        } else {
            self.ftgs_iterator(&[], &[field])?
        };
        let mut counts = vec![0i64; merged.num_groups() as usize];
        let walked = (|| {
            while merged.next_field()? {
                while merged.next_term()? {
                    while merged.next_group()? {
                        if let Some(count) = counts.get_mut(merged.group() as usize) {
                            *count += 1;
                        }
                    }
                }
            }
            Ok::<(), Error>(())
        })();
        let closed = merged.close();
        walked.and(closed)?;
        Ok(counts)
    }

    /// Local FTGS over every shard, merged into one stream
    ///
    /// The merger's accumulators are claimed from the shared memory context
    /// until it is dropped.
    pub fn ftgs_iterator(
        &self,
        int_fields: &[&str],
        string_fields: &[&str],
    ) -> Result<FtgsMerger<ShardFtgs>> {
        let fields = build_fields(int_fields, string_fields);
        let streams = self.execute(|s| s.ftgs(fields.clone()))?;
        let num_groups = streams.iter().map(|s| s.num_groups()).max().unwrap_or(1);
        let num_stats = streams.first().map_or(0, |s| s.num_stats());
        let claim = MemoryClaim::new(
            &self.memory,
            FtgsMerger::<ShardFtgs>::memory_for(num_groups, num_stats),
        )?;
        Ok(FtgsMerger::new(streams)?.with_claim(claim))
    }

    // ------------------------------------------------------------------------
    // Split rendezvous
    // ------------------------------------------------------------------------

    /// Contribute the output for split `split_index` of `num_splits`
    ///
    /// Blocks until every split of the round has registered and the round
    /// has run. The output is closed in every case.
    pub fn write_ftgs_split(
        &self,
        int_fields: &[&str],
        string_fields: &[&str],
        split_index: usize,
        num_splits: usize,
        out: Box<dyn FtgsSink>,
    ) -> Result<()> {
        let fields = build_fields(int_fields, string_fields);
        let registered = self.register(fields, split_index, num_splits, out);
        match registered {
            Ok(Registration::Wait(round)) => round.wait(),
            Ok(Registration::Run(round, outputs, fields)) => self.run_round(&round, outputs, fields),
            Err(e) => Err(e),
        }
    }

    /// Configured fan-out of a split request
    pub fn default_num_splits(&self) -> usize {
        self.num_splits
    }

    /// [`write_ftgs_split`](Self::write_ftgs_split) with the configured
    /// fan-out
    pub fn write_ftgs_default_split(
        &self,
        int_fields: &[&str],
        string_fields: &[&str],
        split_index: usize,
        out: Box<dyn FtgsSink>,
    ) -> Result<()> {
        self.write_ftgs_split(int_fields, string_fields, split_index, self.num_splits, out)
    }

    fn reject(out: Box<dyn FtgsSink>, e: Error) -> Result<Registration> {
        let mut errors = CloseErrors::new();
        close_outputs(Some(out), &mut errors);
        Err(e)
    }

    fn register(
        &self,
        fields: Vec<Field>,
        split_index: usize,
        num_splits: usize,
        out: Box<dyn FtgsSink>,
    ) -> Result<Registration> {
        if let Err(e) = self.check_open() {
            return Self::reject(out, e);
        }
        if num_splits == 0 || split_index >= num_splits {
            return Self::reject(
                out,
                Error::InvalidArgument(format!(
                    "split index {} outside [0, {})",
                    split_index, num_splits
                )),
            );
        }

        let mut table = self.rendezvous.lock();
        if table.arrived == 0 {
            table.slots = (0..num_splits).map(|_| None).collect();
            table.fields = fields;
        } else if table.slots.len() != num_splits || table.fields != fields {
            drop(table);
            return Self::reject(
                out,
                Error::InvalidArgument(format!(
                    "split {} of {} does not match the round in progress",
                    split_index, num_splits
                )),
            );
        } else if table.slots[split_index].is_some() {
            drop(table);
            return Self::reject(
                out,
                Error::InvalidArgument(format!(
                    "split {} registered twice in one round",
                    split_index
                )),
            );
        }

        table.slots[split_index] = Some(out);
        table.arrived += 1;
        debug!(split_index, arrived = table.arrived, num_splits, "Registered split output");

        // close() sets the flag before it sweeps the table
        if self.closed.load(Ordering::Acquire) {
            let (round, slots, _) = table.rearm();
            drop(table);
            let mut errors = CloseErrors::new();
            close_outputs(slots.into_iter().flatten(), &mut errors);
            round.finish(RoundOutcome::Closed);
            return Err(Error::Closed("multi-session".to_string()));
        }

        if table.arrived < num_splits {
            return Ok(Registration::Wait(Arc::clone(&table.round)));
        }
        let (round, slots, fields) = table.rearm();
        Ok(Registration::Run(round, slots.into_iter().flatten().collect(), fields))
    }

    fn run_round(
        &self,
        round: &Round,
        mut outputs: Vec<Box<dyn FtgsSink>>,
        fields: Vec<Field>,
    ) -> Result<()> {
        let result = {
            let _running = self.in_flight.read();
            self.aggregate(&fields, &mut outputs)
        };

        match &result {
            Ok(()) => {
                record_aggregation_round(true);
                debug!(num_splits = outputs.len(), kernel = self.kernel.name(), "Aggregation round completed");
                round.finish(RoundOutcome::Completed);
            }
            Err(e) => {
                record_aggregation_round(false);
                error!(error = %e, kernel = self.kernel.name(), "Aggregation round failed");
                round.finish(RoundOutcome::Failed(e.to_string()));
                if let Err(close_err) = self.close() {
                    warn!(error = %close_err, "Close after failed round reported an error");
                }
            }
        }
        result
    }

    fn aggregate(&self, fields: &[Field], outputs: &mut [Box<dyn FtgsSink>]) -> Result<()> {
        let caches: Result<Vec<ShardCache>> = self.pool.install(|| {
            self.sessions
                .par_iter()
                .map(|session| ShardCache::build(&session.lock()))
                .collect()
        });
        match caches {
            Ok(caches) => self.kernel.run(&caches, fields, self.large_prime, outputs),
            Err(e) => {
                let mut errors = CloseErrors::new();
                for output in outputs.iter_mut() {
                    errors.record("split_output", output.close().map_err(Error::from));
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Tear down; only the first call does any work
    ///
    /// Closes outputs still waiting for their round, then every shard
    /// session, then returns the fixed claim. Memory still held by the
    /// context afterwards is reported as [`Error::MemoryLeak`].
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let mut errors = CloseErrors::new();
        let (round, slots, _) = self.rendezvous.lock().rearm();
        close_outputs(slots.into_iter().flatten(), &mut errors);
        round.finish(RoundOutcome::Closed);

        {
            let _exclusive = self.in_flight.write();
            for session in &self.sessions {
                errors.record("shard_session", session.lock().close());
            }
        }

        self.memory.release(self.claimed);
        errors.record("memory", self.memory.close());
        info!(shards = self.sessions.len(), failures = errors.count(), "Closed multi-session");
        errors.finish()
    }
}

enum Registration {
    Wait(Arc<Round>),
    Run(Arc<Round>, Vec<Box<dyn FtgsSink>>, Vec<Field>),
}

fn build_fields(int_fields: &[&str], string_fields: &[&str]) -> Vec<Field> {
    int_fields
        .iter()
        .map(|name| Field::int(*name))
        .chain(string_fields.iter().map(|name| Field::string(*name)))
        .collect()
}

impl Drop for MultiSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Multi-session teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::reader::{MemoryReader, COUNT_METRIC};
    use crate::session::memory::MemoryReservation;

    fn pool() -> Arc<ThreadPool> {
        Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap())
    }

    fn multi(reservation: &Arc<MemoryReservation>, claim: u64) -> Result<MultiSession> {
        let memory = Arc::new(MemoryContext::new(Arc::clone(reservation)));
        let sessions = (0..3)
            .map(|shard| {
                let reader = MemoryReader::builder(2)
                    .int_term("f", shard, &[0])
                    .int_term("f", 10, &[1])
                    .build();
                ShardSession::new(Arc::new(reader), Arc::clone(&memory), &ExecutorConfig::default())
                    .unwrap()
            })
            .collect();
        let mut config = Config::default();
        config.memory.multi_session_claim_bytes = claim;
        MultiSession::new(sessions, memory, pool(), &config)
    }

    #[test]
    fn test_construction_claim_failure_closes_sessions() {
        let reservation = Arc::new(MemoryReservation::new(30));
        let err = multi(&reservation, 1000).err().unwrap();
        assert!(err.is_out_of_memory());
        assert_eq!(reservation.used(), 0);
    }

    #[test]
    fn test_fan_out_and_stat_sum() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let session = multi(&reservation, 100).unwrap();
        assert_eq!(session.push_stat(COUNT_METRIC).unwrap(), 1);
        assert_eq!(session.int_or_regroup("f", &[10], 1, 1, 2).unwrap(), 3);
        assert_eq!(session.group_stats(0).unwrap(), vec![0, 3, 3]);

        session.close().unwrap();
        assert_eq!(reservation.used(), 0);
        assert!(matches!(session.push_stat(COUNT_METRIC), Err(Error::Closed(_))));
    }

    #[test]
    fn test_shard_failure_closes_multi_session() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let session = multi(&reservation, 0).unwrap();
        assert!(session.push_stat("missing").is_err());
        assert!(session.is_closed());
        assert_eq!(reservation.used(), 0);
    }

    #[test]
    fn test_bad_split_index_rejected_without_blocking() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let session = multi(&reservation, 0).unwrap();
        let err = session
            .write_ftgs_split(&["f"], &[], 3, 2, Box::new(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(!session.is_closed());
    }

    #[test]
    fn test_registration_table() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let session = multi(&reservation, 0).unwrap();
        let fields = vec![Field::int("f")];
        let sink = || Box::new(Vec::<u8>::new()) as Box<dyn FtgsSink>;

        let first = session.register(fields.clone(), 0, 2, sink()).unwrap();
        let Registration::Wait(waiting) = first else {
            panic!("first party should wait");
        };

        // Different split count or a repeated slot is rejected
        assert!(matches!(
            session.register(fields.clone(), 1, 3, sink()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.register(fields.clone(), 0, 2, sink()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.register(vec![Field::int("g")], 1, 2, sink()),
            Err(Error::InvalidArgument(_))
        ));

        let last = session.register(fields.clone(), 1, 2, sink()).unwrap();
        let Registration::Run(round, outputs, round_fields) = last else {
            panic!("last party should run");
        };
        assert!(Arc::ptr_eq(&round, &waiting));
        assert_eq!(outputs.len(), 2);
        assert_eq!(round_fields, fields);

        session.run_round(&round, outputs, round_fields).unwrap();
        waiting.wait().unwrap();

        // Table re-armed for a new round
        assert!(matches!(
            session.register(fields, 0, 4, sink()),
            Ok(Registration::Wait(_))
        ));
        session.close().unwrap();
    }

    #[test]
    fn test_single_split_round_runs_inline() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let session = multi(&reservation, 0).unwrap();
        session.push_stat(COUNT_METRIC).unwrap();
        session
            .write_ftgs_split(&["f"], &[], 0, 1, Box::new(Vec::new()))
            .unwrap();
        session.close().unwrap();
        assert_eq!(reservation.used(), 0);
    }

    #[test]
    fn test_distinct_counts_terms_once_across_shards() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let session = multi(&reservation, 0).unwrap();
        let before = reservation.used();

        assert_eq!(session.total_doc_freq(&["f"], &["missing"]).unwrap(), 6);
        // terms 0, 1, 2 and the shared 10
        assert_eq!(session.distinct("f", true).unwrap(), vec![0, 4]);
        session.int_or_regroup("f", &[10], 1, 1, 2).unwrap();
        assert_eq!(session.distinct("f", true).unwrap(), vec![0, 3, 1]);
        assert_eq!(reservation.used(), before);
        session.close().unwrap();
    }

    #[test]
    fn test_targeted_and_random_multi_fan_out() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let session = multi(&reservation, 0).unwrap();
        session.push_stat(COUNT_METRIC).unwrap();
        session.int_or_regroup("f", &[10], 1, 1, 2).unwrap();

        assert_eq!(session.targeted_metric_filter(0, 1, 1, 2, 0, 3).unwrap(), 4);
        assert_eq!(session.group_stats(0).unwrap(), vec![0, 3, 0, 3]);
        assert_eq!(
            session
                .random_multi_regroup("f", true, "salt", 1, &[1.0], &[2, 5])
                .unwrap(),
            4
        );
        assert_eq!(session.group_stats(0).unwrap(), vec![0, 0, 3, 3]);
        session.close().unwrap();
        assert_eq!(reservation.used(), 0);
    }

    #[test]
    fn test_ftgs_iterator_claims_until_dropped() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let session = multi(&reservation, 0).unwrap();
        session.push_stat(COUNT_METRIC).unwrap();
        let before = reservation.used();

        let merged = session.ftgs_iterator(&["f"], &[]).unwrap();
        assert_eq!(merged.claimed(), FtgsMerger::<ShardFtgs>::memory_for(2, 1));
        // three lookup snapshots, three shard buffers and the merger
        let shard = 8 + ShardFtgs::memory_for(2, 1);
        assert_eq!(reservation.used(), before + 3 * shard + merged.claimed());

        drop(merged);
        assert_eq!(reservation.used(), before);
        session.close().unwrap();
    }

    #[test]
    fn test_default_split_uses_configured_fan_out() {
        let reservation = Arc::new(MemoryReservation::new(1 << 20));
        let memory = Arc::new(MemoryContext::new(Arc::clone(&reservation)));
        let reader = MemoryReader::builder(2).int_term("f", 1, &[0, 1]).build();
        let shard =
            ShardSession::new(Arc::new(reader), Arc::clone(&memory), &ExecutorConfig::default())
                .unwrap();
        let mut config = Config::default();
        config.split.num_splits = 1;
        let session = MultiSession::new(vec![shard], memory, pool(), &config).unwrap();
        assert_eq!(session.default_num_splits(), 1);

        session.push_stat(COUNT_METRIC).unwrap();
        session
            .write_ftgs_default_split(&["f"], &[], 0, Box::new(Vec::new()))
            .unwrap();
        assert!(matches!(
            session.write_ftgs_default_split(&["f"], &[], 1, Box::new(Vec::new())),
            Err(Error::InvalidArgument(_))
        ));
        session.close().unwrap();
        assert_eq!(reservation.used(), 0);
    }
}
