use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ftgs_engine::ftgs::{FtgsField, FtgsGroup, FtgsIterator, FtgsTerm, MemoryFtgs};
use ftgs_engine::merge::{FtgsMerger, MergeIterator};
use ftgs_engine::reader::MemoryTermSource;
use ftgs_engine::split::FtgsSplitter;
use ftgs_engine::{Field, Term};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn create_sources(count: usize, terms_per_source: usize) -> Vec<Vec<(i64, u64)>> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|_| {
            let mut terms: Vec<i64> = (0..terms_per_source)
                .map(|_| rng.gen_range(0..(terms_per_source as i64 * 4)))
                .collect();
            terms.sort_unstable();
            terms.dedup();
            terms.into_iter().map(|t| (t, rng.gen_range(1..100))).collect()
        })
        .collect()
}

fn create_stream(terms: i64) -> Vec<FtgsField> {
    vec![FtgsField {
        field: Field::int("id"),
        terms: (0..terms)
            .map(|t| FtgsTerm {
                term: Term::Int(t),
                doc_freq: 1,
                groups: vec![FtgsGroup::new(1, vec![t, 1])],
            })
            .collect(),
    }]
}

fn bench_term_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("term_merge");

    for sources in [2usize, 8, 32].iter() {
        let data = create_sources(*sources, 10_000);

        group.bench_with_input(BenchmarkId::from_parameter(sources), sources, |b, _| {
            b.iter(|| {
                let inputs: Vec<_> = data.iter().cloned().map(MemoryTermSource::from_freqs).collect();
                let mut merge = MergeIterator::new(inputs).unwrap();
                let mut total = 0u64;
                while merge.next().unwrap() {
                    total += merge.doc_freq();
                }
                black_box(total)
            });
        });
    }

    group.finish();
}

fn bench_ftgs_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("ftgs_merge");
    let splitter = FtgsSplitter::default();
    let stream = create_stream(20_000);

    for splits in [4usize, 16].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(splits), splits, |b, &splits| {
            b.iter(|| {
                let mut input = MemoryFtgs::new(stream.clone(), 2);
                let readers = splitter.split_in_memory(&mut input, splits, None).unwrap();
                let mut merged = FtgsMerger::new(readers).unwrap();
                let mut terms = 0usize;
                while merged.next_field().unwrap() {
                    while merged.next_term().unwrap() {
                        terms += 1;
                    }
                }
                black_box(terms)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_term_merge, bench_ftgs_merge);
criterion_main!(benches);
