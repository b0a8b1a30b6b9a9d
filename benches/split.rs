use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ftgs_engine::ftgs::ShardFtgs;
use ftgs_engine::group::GroupLookup;
use ftgs_engine::reader::{MemoryReader, ShardReader, COUNT_METRIC};
use ftgs_engine::split::{split_index_bytes, split_index_int, FtgsSplitter, DEFAULT_LARGE_PRIME};
use ftgs_engine::Field;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn create_shard(num_docs: usize) -> Arc<dyn ShardReader> {
    let mut rng = StdRng::seed_from_u64(7);
    let values: Vec<i64> = (0..num_docs).map(|_| rng.gen_range(0..5_000)).collect();
    Arc::new(MemoryReader::from_int_columns(num_docs, &[("clicks", values)]))
}

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    let ints: Vec<i64> = (0..10_000).map(|i| i * 7919).collect();
    let words: Vec<Vec<u8>> = (0..10_000).map(|i| format!("term-{}", i).into_bytes()).collect();
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("int", |b| {
        b.iter(|| {
            ints.iter()
                .map(|&t| split_index_int(black_box(t), DEFAULT_LARGE_PRIME, 16))
                .sum::<usize>()
        })
    });
    group.bench_function("bytes", |b| {
        b.iter(|| {
            words
                .iter()
                .map(|w| split_index_bytes(black_box(w), DEFAULT_LARGE_PRIME, 16))
                .sum::<usize>()
        })
    });

    group.finish();
}

fn bench_shard_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("shard_split");
    let splitter = FtgsSplitter::default();

    for num_docs in [10_000usize, 100_000].iter() {
        let reader = create_shard(*num_docs);
        let lookup = Arc::new(GroupLookup::new(*num_docs, 1));
        let stats = vec![
            reader.stat_lookup(COUNT_METRIC).unwrap(),
            reader.stat_lookup("clicks").unwrap(),
        ];

        group.bench_with_input(BenchmarkId::from_parameter(num_docs), num_docs, |b, _| {
            b.iter(|| {
                let mut ftgs = ShardFtgs::new(
                    Arc::clone(&reader),
                    Arc::clone(&lookup),
                    stats.clone(),
                    vec![Field::int("clicks")],
                    4096,
                )
                .unwrap();
                black_box(splitter.split_in_memory(&mut ftgs, 8, None).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_partition, bench_shard_split);
criterion_main!(benches);
