//! Write-ahead log benchmarks.
//!
//! Measures:
//! - Buffered append throughput by record size
//! - Commit latency with a single writer
//! - Group commit throughput with concurrent committers

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ruzu_storage::storage::{
    LogPayload, LogStore, PageId, WalConfig, WalManager, PAGE_HEADER_SIZE,
};
use tempfile::TempDir;

fn start_wal(dir: &Path, config: WalConfig) -> Arc<WalManager> {
    let store = LogStore::open(&dir.join("wal.log")).expect("open log store");
    Arc::new(WalManager::start(store, 1, config).expect("start wal"))
}

/// Benchmark buffered appends of update records
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append");

    for size in &[16usize, 256, 1024] {
        let temp_dir = TempDir::new().expect("create temp dir");
        let wal = start_wal(temp_dir.path(), WalConfig::default());
        let image = vec![0xABu8; *size];

        group.throughput(Throughput::Bytes(*size as u64 * 2 * 100));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut last = 0;
                for _ in 0..100 {
                    let payload = LogPayload::update(
                        PageId::new(0),
                        PAGE_HEADER_SIZE,
                        image.clone(),
                        image.clone(),
                    )
                    .expect("build update");
                    last = wal.append(1, payload).expect("append");
                }
                // Keep the buffer bounded between iterations
                wal.flush_up_to(last).expect("flush");
                black_box(last)
            });
        });
    }

    group.finish();
}

/// Benchmark a single committer: one sync per commit
fn bench_single_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_commit");
    group.sample_size(20);

    let temp_dir = TempDir::new().expect("create temp dir");
    let config = WalConfig {
        group_commit_window: Duration::ZERO,
        ..WalConfig::default()
    };
    let wal = start_wal(temp_dir.path(), config);

    group.bench_function("single_writer", |b| {
        let mut txn = 0;
        b.iter(|| {
            txn += 1;
            wal.append(txn, LogPayload::Begin).expect("append begin");
            let lsn = wal.append(txn, LogPayload::Commit).expect("append commit");
            wal.flush_up_to(lsn).expect("flush");
        });
    });

    group.finish();
}

/// Benchmark concurrent committers sharing syncs
fn bench_group_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_group_commit");
    group.sample_size(10);

    for threads in &[1u64, 4, 16] {
        let temp_dir = TempDir::new().expect("create temp dir");
        let wal = start_wal(temp_dir.path(), WalConfig::default());
        let commits_per_thread = 20u64;

        group.throughput(Throughput::Elements(threads * commits_per_thread));
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let wal = Arc::clone(&wal);
                        std::thread::spawn(move || {
                            for i in 0..commits_per_thread {
                                let lsn = wal
                                    .append(t * 1000 + i + 1, LogPayload::Commit)
                                    .expect("append");
                                wal.flush_up_to(lsn).expect("flush");
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().expect("committer panicked");
                }
            });
        });

        let stats = wal.stats();
        println!(
            "{threads} threads: {} records, {} syncs",
            stats.records_appended, stats.sync_calls
        );
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_single_commit, bench_group_commit);
criterion_main!(benches);
