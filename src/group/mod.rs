//! Regroup engine
//!
//! Per-shard document → group assignment plus the operations that rewrite it.
//!
//! - [`lookup`]: the [`GroupLookup`] array and its batched hot-path callbacks
//! - [`rules`]: remap rules and their dense per-group [`RuleTable`]
//! - [`regroup`]: rule, term-set, random and metric regroups over a shard
//! - [`stats`]: the active statistic stack and per-group sums
//! - [`bits`]: fixed-size bitsets used by the passes above

pub mod bits;
pub mod lookup;
pub mod regroup;
pub mod rules;
pub mod stats;

pub use bits::{DocBitSet, GroupsSeen};
pub use lookup::{check_groups, GroupLookup, ScratchBuffers};
pub use regroup::MetricBuckets;
pub use rules::{GroupMultiRemapRule, GroupRemapRule, RegroupCondition, RuleTable};
pub use stats::StatStack;
