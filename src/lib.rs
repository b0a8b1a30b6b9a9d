//! FTGS engine - aggregation core of a columnar analytics server
//!
//! This library provides the pieces that turn per-shard postings into
//! grouped, summed statistics:
//! - k-way term merging across shards ([`merge`])
//! - deterministic hash splitting of FTGS streams for distributed fan-out ([`split`])
//! - per-document group assignment and the regroup operations ([`group`])
//! - shard and multi-shard sessions with memory accounting ([`session`])
//!
//! FTGS stands for Field, Term, Group, Stats: the nested stream
//!
//! ```text
//! for field in fields:
//!     for term in field (ascending):
//!         for group in groups present for term (ascending, never 0):
//!             emit stats[0..num_stats]
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Shard reader abstractions and the in-memory shard
pub mod reader;

/// k-way merge of sorted term sources and FTGS streams
pub mod merge;

/// FTGS iterator trait, wire codec and per-shard generation
pub mod ftgs;

/// Deterministic hash splitting
pub mod split;

/// Group lookup and regroup engine
pub mod group;

/// Shard sessions, multi-session coordination and memory accounting
pub mod session;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result};
pub use ftgs::{FtgsIterator, FtgsReader, FtgsSink, FtgsWriter};
pub use group::GroupLookup;
pub use merge::{FtgsMerger, MergeIterator};
pub use session::{MemoryContext, MemoryReservation, MultiSession, ShardSession};
pub use split::FtgsSplitter;
pub use types::{DocId, Field, FieldType, GroupId, Term, TermRef};
