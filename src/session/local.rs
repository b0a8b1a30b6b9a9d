//! Single-shard session
//!
//! A [`ShardSession`] owns the group assignment and the stat stack of one
//! shard. Everything it allocates is claimed from a [`MemoryContext`] and
//! returned on [`ShardSession::close`].

use std::sync::Arc;

use tracing::debug;

use super::memory::{MemoryClaim, MemoryContext};
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::ftgs::ShardFtgs;
use crate::group::regroup::{self, MetricBuckets};
use crate::group::stats::{distinct_by_group, sum_by_group, total_doc_freq};
use crate::group::{GroupLookup, GroupMultiRemapRule, GroupRemapRule, ScratchBuffers, StatStack};
use crate::reader::ShardReader;
use crate::types::{DocFreq, Field, FieldType, GroupId, Term};

/// Regroup and stat state of one shard
pub struct ShardSession {
    reader: Arc<dyn ShardReader>,
    lookup: GroupLookup,
    stats: StatStack,
    /// Bytes claimed for each pushed stat, parallel to `stats`
    stat_claims: Vec<u64>,
    lookup_claim: u64,
    scratch: ScratchBuffers,
    memory: Arc<MemoryContext>,
    closed: bool,
}

impl ShardSession {
    /// Open a session over `reader` with every document in the configured
    /// initial group
    pub fn new(
        reader: Arc<dyn ShardReader>,
        memory: Arc<MemoryContext>,
        config: &ExecutorConfig,
    ) -> Result<Self> {
        let num_docs = reader.num_docs();
        let lookup_claim = GroupLookup::memory_for_size(num_docs);
        memory.claim(lookup_claim)?;
        debug!(num_docs, bytes = lookup_claim, "Opened shard session");

        Ok(Self {
            lookup: GroupLookup::new(num_docs, config.initial_group),
            reader,
            stats: StatStack::new(),
            stat_claims: Vec::new(),
            lookup_claim,
            scratch: ScratchBuffers::new(config.doc_batch_size),
            memory,
            closed: false,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("shard session".to_string()));
        }
        Ok(())
    }

    /// Underlying shard
    pub fn reader(&self) -> &Arc<dyn ShardReader> {
        &self.reader
    }

    /// Current group assignment
    pub fn group_lookup(&self) -> &GroupLookup {
        &self.lookup
    }

    /// Memory context this session claims from
    pub fn memory(&self) -> &Arc<MemoryContext> {
        &self.memory
    }

    /// Documents in the shard
    pub fn num_docs(&self) -> usize {
        self.lookup.size()
    }

    /// Current group count
    pub fn num_groups(&self) -> u32 {
        self.lookup.num_groups()
    }

    /// Active stat count
    pub fn num_stats(&self) -> usize {
        self.stats.len()
    }

    /// Active stat lookups in push order
    pub fn stat_lookups(&self) -> &[Arc<dyn crate::reader::StatLookup>] {
        self.stats.lookups()
    }

    /// Documents per scan batch
    pub fn batch_size(&self) -> usize {
        self.scratch.batch_size()
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ------------------------------------------------------------------------
    // Regroups
    // ------------------------------------------------------------------------

    /// Rule-based regroup; returns the new group count
    pub fn regroup(&mut self, rules: &[GroupRemapRule]) -> Result<u32> {
        self.check_open()?;
        regroup::regroup(&mut self.lookup, self.reader.as_ref(), &mut self.scratch, rules)
    }

    /// Multi-condition regroup; returns the new group count
    pub fn multisplit_regroup(
        &mut self,
        rules: &[GroupMultiRemapRule],
        error_on_collisions: bool,
    ) -> Result<u32> {
        self.check_open()?;
        regroup::multisplit_regroup(
            &mut self.lookup,
            self.reader.as_ref(),
            &mut self.scratch,
            rules,
            error_on_collisions,
        )
    }

    /// Split `target_group` by membership in a set of integer terms
    pub fn int_or_regroup(
        &mut self,
        field: &str,
        terms: &[i64],
        target_group: GroupId,
        negative_group: GroupId,
        positive_group: GroupId,
    ) -> Result<()> {
        self.check_open()?;
        let terms: Vec<Term> = terms.iter().map(|&t| Term::Int(t)).collect();
        regroup::term_or_regroup(
            &mut self.lookup,
            self.reader.as_ref(),
            &mut self.scratch,
            &Field::int(field),
            &terms,
            target_group,
            negative_group,
            positive_group,
        )
    }

    /// Split `target_group` by membership in a set of string terms
    pub fn string_or_regroup(
        &mut self,
        field: &str,
        terms: &[&str],
        target_group: GroupId,
        negative_group: GroupId,
        positive_group: GroupId,
    ) -> Result<()> {
        self.check_open()?;
        let terms: Vec<Term> = terms.iter().map(|&t| Term::from(t)).collect();
        regroup::term_or_regroup(
            &mut self.lookup,
            self.reader.as_ref(),
            &mut self.scratch,
            &Field::string(field),
            &terms,
            target_group,
            negative_group,
            positive_group,
        )
    }

    /// Salted pseudo-random split of `target_group`
    #[allow(clippy::too_many_arguments)]
    pub fn random_regroup(
        &mut self,
        field: &str,
        is_int: bool,
        salt: &str,
        p: f64,
        target_group: GroupId,
        negative_group: GroupId,
        positive_group: GroupId,
    ) -> Result<()> {
        self.check_open()?;
        let field_type = if is_int { FieldType::Int } else { FieldType::String };
        regroup::random_regroup(
            &mut self.lookup,
            self.reader.as_ref(),
            &mut self.scratch,
            &Field::new(field, field_type),
            salt,
            p,
            target_group,
            negative_group,
            positive_group,
        )
    }

    /// Bucketise by the value of pushed stat `stat_index`
    pub fn metric_regroup(
        &mut self,
        stat_index: usize,
        min: i64,
        max: i64,
        interval: i64,
        no_gutters: bool,
    ) -> Result<u32> {
        self.check_open()?;
        let stat = Arc::clone(self.stats.get(stat_index)?);
        regroup::metric_regroup(
            &mut self.lookup,
            stat.as_ref(),
            &mut self.scratch,
            MetricBuckets {
                min,
                max,
                interval,
                no_gutters,
            },
        )
    }

    /// Keep documents by the value of pushed stat `stat_index`
    pub fn metric_filter(
        &mut self,
        stat_index: usize,
        min: i64,
        max: i64,
        negate: bool,
    ) -> Result<u32> {
        self.check_open()?;
        let stat = Arc::clone(self.stats.get(stat_index)?);
        regroup::metric_filter(&mut self.lookup, stat.as_ref(), &mut self.scratch, min, max, negate)
    }

    /// Split `target_group` into `result_groups` by salted hash thresholds
    ///
    /// `percentages` are ascending cut points; a document lands in the first
    /// group whose cut point exceeds its hash fraction.
    pub fn random_multi_regroup(
        &mut self,
        field: &str,
        is_int: bool,
        salt: &str,
        target_group: GroupId,
        percentages: &[f64],
        result_groups: &[GroupId],
    ) -> Result<u32> {
        self.check_open()?;
        let field_type = if is_int { FieldType::Int } else { FieldType::String };
        regroup::random_multi_regroup(
            &mut self.lookup,
            self.reader.as_ref(),
            &mut self.scratch,
            &Field::new(field, field_type),
            salt,
            target_group,
            percentages,
            result_groups,
        )
    }

    /// Split `target_group` by whether stat `stat_index` lies in `[min, max]`
    #[allow(clippy::too_many_arguments)]
    pub fn targeted_metric_filter(
        &mut self,
        stat_index: usize,
        min: i64,
        max: i64,
        target_group: GroupId,
        negative_group: GroupId,
        positive_group: GroupId,
    ) -> Result<u32> {
        self.check_open()?;
        let stat = Arc::clone(self.stats.get(stat_index)?);
        regroup::targeted_metric_filter(
            &mut self.lookup,
            stat.as_ref(),
            &mut self.scratch,
            min,
            max,
            target_group,
            negative_group,
            positive_group,
        )
    }

    /// Rename groups
    pub fn remap_groups(
        &mut self,
        from: &[GroupId],
        to: &[GroupId],
        filter_out_not_targeted: bool,
    ) -> Result<u32> {
        self.check_open()?;
        regroup::remap_groups(&mut self.lookup, from, to, filter_out_not_targeted)
    }

    /// Put every document back into group 1
    pub fn reset_groups(&mut self) -> Result<u32> {
        self.check_open()?;
        self.lookup.fill(1);
        self.lookup.recalculate_num_groups();
        Ok(self.lookup.num_groups())
    }

    // ------------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------------

    /// Push `metric`; returns the new stack depth
    pub fn push_stat(&mut self, metric: &str) -> Result<usize> {
        self.check_open()?;
        let lookup = self.reader.stat_lookup(metric)?;
        let bytes = lookup.memory_used();
        self.memory.claim(bytes)?;
        self.stat_claims.push(bytes);
        Ok(self.stats.push(metric, lookup))
    }

    /// Pop the most recent stat; returns the new stack depth
    pub fn pop_stat(&mut self) -> Result<usize> {
        self.check_open()?;
        self.stats.pop()?;
        if let Some(bytes) = self.stat_claims.pop() {
            self.memory.release(bytes);
        }
        Ok(self.stats.len())
    }

    /// Per-group sum of stat `stat_index`; group 0 stays 0
    pub fn group_stats(&mut self, stat_index: usize) -> Result<Vec<i64>> {
        self.check_open()?;
        let stat = Arc::clone(self.stats.get(stat_index)?);
        let _claim = MemoryClaim::new(&self.memory, 8 * self.lookup.num_groups() as u64)?;
        Ok(sum_by_group(&self.lookup, stat.as_ref(), &mut self.scratch))
    }

    /// Sum of document frequencies over every term of the given fields
    pub fn total_doc_freq(&self, int_fields: &[&str], string_fields: &[&str]) -> Result<DocFreq> {
        self.check_open()?;
        let fields: Vec<Field> = int_fields
            .iter()
            .map(|&name| Field::int(name))
            .chain(string_fields.iter().map(|&name| Field::string(name)))
            .collect();
        total_doc_freq(self.reader.as_ref(), &fields)
    }

    /// Per-group count of distinct terms of `field`; group 0 stays 0
    pub fn distinct(&mut self, field: &str, is_int: bool) -> Result<Vec<i64>> {
        self.check_open()?;
        let field_type = if is_int { FieldType::Int } else { FieldType::String };
        let _claim = MemoryClaim::new(
            &self.memory,
            ShardFtgs::memory_for(self.lookup.num_groups(), 1),
        )?;
        distinct_by_group(
            &self.lookup,
            self.reader.as_ref(),
            &mut self.scratch,
            &Field::new(field, field_type),
        )
    }

    // ------------------------------------------------------------------------
    // FTGS
    // ------------------------------------------------------------------------

    /// Local FTGS stream over `fields` under a snapshot of the current groups
    pub fn ftgs(&self, fields: Vec<Field>) -> Result<ShardFtgs> {
        self.check_open()?;
        let bytes = GroupLookup::memory_for_size(self.lookup.size())
            + ShardFtgs::memory_for(self.lookup.num_groups(), self.stats.len());
        let claim = MemoryClaim::new(&self.memory, bytes)?;
        Ok(ShardFtgs::new(
            Arc::clone(&self.reader),
            Arc::new(self.lookup.clone()),
            self.stats.lookups().to_vec(),
            fields,
            self.scratch.batch_size(),
        )?
        .with_claim(claim))
    }

    /// Release everything this session claimed; later calls are no-ops
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let stat_bytes: u64 = self.stat_claims.drain(..).sum();
        while self.stats.pop().is_ok() {}
        self.memory.release(self.lookup_claim + stat_bytes);
        debug!(
            bytes = self.lookup_claim + stat_bytes,
            "Closed shard session"
        );
        Ok(())
    }
}

impl Drop for ShardSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for ShardSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSession")
            .field("num_docs", &self.lookup.size())
            .field("num_groups", &self.lookup.num_groups())
            .field("stats", &self.stats)
            .field("closed", &self.closed)
            .finish()
    }
}
