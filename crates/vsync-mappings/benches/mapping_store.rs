//! Criterion benchmarks for name derivation and the Mapping Store
//!
//! Name derivation runs on every reconcile; `record` and the lookups sit on
//! the hot path of every create and every physical-side event.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::prelude::*;
use tokio::runtime::Runtime;

use vsync_common::{ObjectIdentity, ResourceKind};
use vsync_mappings::naming::hashed_name;
use vsync_mappings::{MappingStore, MemoryBackend};

// =============================================================================
// Test Fixtures
// =============================================================================

fn virtual_cm(i: usize) -> ObjectIdentity {
    ObjectIdentity::namespaced(
        ResourceKind::core("ConfigMap"),
        format!("team-{}", i % 50),
        format!("cfg-{i}"),
    )
}

fn physical_cm(i: usize) -> ObjectIdentity {
    ObjectIdentity::namespaced(
        ResourceKind::core("ConfigMap"),
        "host-ns",
        hashed_name("tenant-1", &format!("team-{}", i % 50), &format!("cfg-{i}")),
    )
}

fn populated_store(rt: &Runtime, size: usize) -> MappingStore {
    rt.block_on(async {
        let store = MappingStore::open(Arc::new(MemoryBackend::new()))
            .await
            .expect("open store");
        for i in 0..size {
            store
                .record(&virtual_cm(i), &physical_cm(i))
                .await
                .expect("record");
        }
        store
    })
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_hashed_name(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashed_name");
    group.throughput(Throughput::Elements(1));

    group.bench_function("short", |b| {
        b.iter(|| hashed_name(black_box("tenant-1"), black_box("team-a"), black_box("cfg")));
    });

    let long = "a".repeat(253);
    group.bench_function("truncated", |b| {
        b.iter(|| hashed_name(black_box("tenant-1"), black_box("team-a"), black_box(&long)));
    });

    group.finish();
}

fn bench_record(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("record");

    for size in [100usize, 1000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("sequential", size), &size, |b, &size| {
            b.iter_batched(
                || (0..size).map(|i| (virtual_cm(i), physical_cm(i))).collect::<Vec<_>>(),
                |pairs| {
                    rt.block_on(async {
                        let store = MappingStore::open(Arc::new(MemoryBackend::new()))
                            .await
                            .expect("open store");
                        for (v, p) in &pairs {
                            store.record(v, p).await.expect("record");
                        }
                        black_box(store.len())
                    })
                },
                criterion::BatchSize::LargeInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("concurrent", size), &size, |b, &size| {
            b.iter_batched(
                || (0..size).map(|i| (virtual_cm(i), physical_cm(i))).collect::<Vec<_>>(),
                |pairs| {
                    rt.block_on(async {
                        let store = Arc::new(
                            MappingStore::open(Arc::new(MemoryBackend::new()))
                                .await
                                .expect("open store"),
                        );
                        let handles: Vec<_> = pairs
                            .into_iter()
                            .map(|(v, p)| {
                                let store = store.clone();
                                tokio::spawn(async move { store.record(&v, &p).await })
                            })
                            .collect();
                        for handle in handles {
                            handle.await.expect("join").expect("record");
                        }
                        black_box(store.len())
                    })
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("lookup");

    for size in [100usize, 10_000] {
        group.throughput(Throughput::Elements(1));
        let store = populated_store(&rt, size);

        group.bench_with_input(BenchmarkId::new("forward", size), &size, |b, &size| {
            let mut rng = rand::thread_rng();
            b.iter(|| {
                let v = virtual_cm(rng.gen_range(0..size));
                black_box(store.lookup(&v).ok());
            });
        });

        group.bench_with_input(BenchmarkId::new("reverse", size), &size, |b, &size| {
            let mut rng = rand::thread_rng();
            b.iter(|| {
                let p = physical_cm(rng.gen_range(0..size));
                black_box(store.reverse_lookup(&p).ok());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_hashed_name, bench_record, bench_lookup);
criterion_main!(benches);
