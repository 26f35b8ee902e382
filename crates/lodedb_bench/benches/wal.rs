//! Write-ahead log benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lodedb_bench::update_record;
use lodedb_core::wal::LogManager;
use tempfile::TempDir;

/// Benchmark appends to the in-memory log buffer.
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append");

    for size in [16, 256, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let log = LogManager::in_memory(64 * 1024 * 1024, 1 << 20);
            let record = update_record(1, size);

            b.iter(|| {
                let lsn = log.append(black_box(&record)).unwrap();
                black_box(lsn);
            });
        });
    }
    group.finish();
}

/// Benchmark append followed by a durable flush, as a commit does.
fn bench_append_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append_flush");
    group.sample_size(20);

    for batch in [1usize, 16, 128].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::new("file", batch), batch, |b, &batch| {
            let dir = TempDir::new().unwrap();
            let log = LogManager::open(dir.path(), 64 * 1024 * 1024, 1 << 20).unwrap();
            let record = update_record(1, 128);

            b.iter(|| {
                let mut last = None;
                for _ in 0..batch {
                    last = Some(log.append(&record).unwrap());
                }
                if let Some(lsn) = last {
                    log.flush(lsn).unwrap();
                }
            });
        });
    }
    group.finish();
}

/// Benchmark reading the log back from the start.
fn bench_iterate(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_iterate");
    let count = 10_000u64;
    group.throughput(Throughput::Elements(count));

    group.bench_function("in_memory", |b| {
        let log = LogManager::in_memory(64 * 1024 * 1024, 1 << 20);
        for txid in 0..count {
            log.append(&update_record(txid + 1, 64)).unwrap();
        }
        log.flush_all().unwrap();
        b.iter(|| {
            let n = log.iter_from(log.first_lsn()).count();
            black_box(n);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_append, bench_append_flush, bench_iterate);
criterion_main!(benches);
