//! Process-wide kernel installation
//!
//! Kept in its own test binary: the installed kernel is global state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ftgs_engine::config::Config;
use ftgs_engine::ftgs::FtgsSink;
use ftgs_engine::reader::MemoryReader;
use ftgs_engine::session::kernel::{self, AggregationKernel, PortableKernel, ShardCache};
use ftgs_engine::session::{MemoryContext, MemoryReservation, MultiSession, ShardSession};
use ftgs_engine::{Field, Result};

struct TaggedKernel {
    runs: AtomicUsize,
}

impl AggregationKernel for TaggedKernel {
    fn name(&self) -> &str {
        "tagged"
    }

    fn run(
        &self,
        caches: &[ShardCache],
        fields: &[Field],
        large_prime: i32,
        outputs: &mut [Box<dyn FtgsSink>],
    ) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        PortableKernel.run(caches, fields, large_prime, outputs)
    }
}

#[test]
fn test_installed_kernel_is_used_until_shutdown() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ftgs_engine=debug")
        .with_test_writer()
        .try_init();

    assert!(kernel::installed().is_none());
    assert_eq!(kernel::current().name(), "portable");

    let tagged = Arc::new(TaggedKernel {
        runs: AtomicUsize::new(0),
    });
    kernel::initialize(Arc::clone(&tagged) as Arc<dyn AggregationKernel>).unwrap();
    // A second install is refused
    assert!(kernel::initialize(Arc::new(PortableKernel)).is_err());
    assert_eq!(kernel::current().name(), "tagged");

    let reservation = Arc::new(MemoryReservation::new(1 << 20));
    let memory = Arc::new(MemoryContext::new(Arc::clone(&reservation)));
    let mut config = Config::default();
    config.executor.worker_threads = 1;
    let reader = MemoryReader::from_int_columns(3, &[("f", vec![1, 2, 3])]);
    let shard = ShardSession::new(Arc::new(reader), Arc::clone(&memory), &config.executor).unwrap();
    let pool = config.executor.build_pool().unwrap();
    let session = MultiSession::new(vec![shard], memory, pool, &config).unwrap();

    session
        .write_ftgs_split(&["f"], &[], 0, 1, Box::new(Vec::new()))
        .unwrap();
    assert_eq!(tagged.runs.load(Ordering::SeqCst), 1);
    session.close().unwrap();

    assert!(kernel::shutdown());
    assert!(!kernel::shutdown());
    assert!(kernel::installed().is_none());
    assert_eq!(reservation.used(), 0);
}
