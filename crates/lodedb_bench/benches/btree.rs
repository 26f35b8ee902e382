//! B-tree operation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lodedb_bench::{bench_env, preload, random_data, shuffled_keys};
use lodedb_core::TxnOptions;

/// Benchmark single-record put transactions.
fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_put");

    for size in [16, 128, 1024, 8192].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (env, db) = bench_env(4096);
            let value = random_data(size);
            let mut next = 0u32;

            b.iter(|| {
                let mut txn = env.begin(TxnOptions::new()).unwrap();
                db.put(&mut txn, &next.to_be_bytes(), black_box(&value))
                    .unwrap();
                env.commit(&mut txn).unwrap();
                next = next.wrapping_add(1);
            });
        });
    }
    group.finish();
}

/// Benchmark many puts in one transaction, sequential versus random order.
fn bench_batch_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_batch_put");
    group.sample_size(20);
    let count = 5_000u32;
    group.throughput(Throughput::Elements(count as u64));

    group.bench_function("sequential", |b| {
        let value = random_data(64);
        b.iter(|| {
            let (env, db) = bench_env(4096);
            let mut txn = env.begin(TxnOptions::new()).unwrap();
            for i in 0..count {
                db.put(&mut txn, &i.to_be_bytes(), &value).unwrap();
            }
            env.commit(&mut txn).unwrap();
        });
    });

    group.bench_function("random", |b| {
        let value = random_data(64);
        let keys = shuffled_keys(count);
        b.iter(|| {
            let (env, db) = bench_env(4096);
            let mut txn = env.begin(TxnOptions::new()).unwrap();
            for key in &keys {
                db.put(&mut txn, key, &value).unwrap();
            }
            env.commit(&mut txn).unwrap();
        });
    });
    group.finish();
}

/// Benchmark point reads against trees of growing size.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_get");

    for count in [1_000u32, 10_000, 100_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let (env, db) = bench_env(4096);
            preload(&env, &db, count, 64);
            let keys = shuffled_keys(count);
            let mut i = 0usize;

            b.iter(|| {
                let mut txn = env.begin(TxnOptions::new()).unwrap();
                let value = db.get(&mut txn, black_box(&keys[i % keys.len()])).unwrap();
                env.commit(&mut txn).unwrap();
                i += 1;
                black_box(value);
            });
        });
    }
    group.finish();
}

/// Benchmark full scans.
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_scan");
    group.sample_size(20);
    let count = 20_000u32;
    group.throughput(Throughput::Elements(count as u64));

    group.bench_function("dump", |b| {
        let (env, db) = bench_env(4096);
        preload(&env, &db, count, 32);
        b.iter(|| {
            let mut txn = env.begin(TxnOptions::new()).unwrap();
            let all = db.dump(&mut txn).unwrap();
            env.commit(&mut txn).unwrap();
            black_box(all);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_put, bench_batch_put, bench_get, bench_scan);
criterion_main!(benches);
