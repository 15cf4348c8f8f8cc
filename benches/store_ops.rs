//! Benchmarks for memory store operations and scheduler passes

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use stagemem::config::SchedulerConfig;
use stagemem::events::NullSink;
use stagemem::{MemoryEntry, MemoryStore, Stage, StageScheduler};

fn populated(size: usize) -> MemoryStore {
    let store = MemoryStore::new();
    for i in 0..size {
        store
            .put(
                MemoryEntry::with_id(format!("entry-{}", i), json!({ "n": i }))
                    .importance((i % 100) as f32 / 100.0),
            )
            .unwrap();
    }
    store
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_put");
    group.throughput(Throughput::Elements(1));

    group.bench_function("generated_id", |b| {
        let store = MemoryStore::new();
        b.iter(|| {
            store
                .put(MemoryEntry::new(json!("Test content for benchmarking purposes")))
                .unwrap()
        })
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_get");
    group.throughput(Throughput::Elements(1));

    for size in [100, 1_000, 10_000] {
        let store = populated(size);
        group.bench_with_input(BenchmarkId::new("get", size), &size, |b, &size| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 1) % size;
                black_box(store.get(&format!("entry-{}", i)).unwrap())
            })
        });
        group.bench_with_input(BenchmarkId::new("peek", size), &size, |b, &size| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 1) % size;
                black_box(store.peek(&format!("entry-{}", i)).unwrap())
            })
        });
    }

    group.finish();
}

fn bench_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_list_by_stage");

    for size in [100, 1_000, 10_000] {
        let store = populated(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &store, |b, store| {
            b.iter(|| black_box(store.list_by_stage(Stage::Working)))
        });
    }

    group.finish();
}

fn bench_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_pass");

    for size in [100, 1_000, 10_000] {
        let store = Arc::new(populated(size));
        let scheduler = StageScheduler::new(
            store.clone(),
            SchedulerConfig {
                // keep entries in place so every iteration sees the same state
                importance_threshold: 1.0,
                access_threshold: u64::MAX,
                long_term_access_threshold: u64::MAX,
                ..Default::default()
            },
            Arc::new(NullSink),
        );
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(scheduler.run_pass()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_put, bench_get, bench_list, bench_pass);
criterion_main!(benches);
