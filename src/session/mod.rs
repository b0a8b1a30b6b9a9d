//! Sessions
//!
//! - [`local`]: [`ShardSession`], the regroup and stat state of one shard
//! - [`multi`]: [`MultiSession`], fan-out over shards and split rendezvous
//! - [`kernel`]: per-round shard snapshots and the aggregation kernels
//! - [`memory`]: byte accounting against a shared ceiling

pub mod kernel;
pub mod local;
pub mod memory;
pub mod multi;

pub use kernel::{AggregationKernel, PortableKernel, ShardCache};
pub use local::ShardSession;
pub use memory::{MemoryClaim, MemoryContext, MemoryReservation};
pub use multi::MultiSession;
