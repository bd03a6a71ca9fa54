//! Connection registry benchmarks.
//!
//! Measures reuse lookups and LRU churn when the device count exceeds capacity.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use cloudctl_core::agent::MockConnector;
use cloudctl_core::directory::{DeviceRecord, MemoryDirectory};
use cloudctl_core::pool::{ConnectionRegistry, RegistryConfig};
use cloudctl_core::scheduler::{WorkerPool, WorkerPoolConfig};

fn registry(max_size: usize, devices: usize) -> ConnectionRegistry {
    let directory = Arc::new(MemoryDirectory::with_records(
        (0..devices).map(|i| DeviceRecord::mock(format!("dev-{i}"))),
    ));
    let workers = Arc::new(WorkerPool::new(WorkerPoolConfig::with_threads(4)).unwrap());
    ConnectionRegistry::new(
        RegistryConfig {
            max_size,
            ..RegistryConfig::default()
        },
        directory,
        Arc::new(MockConnector::default()),
        workers,
    )
}

fn bench_reuse(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("registry_reuse");

    for size in [100usize, 1000] {
        let registry = registry(size, size);
        runtime.block_on(async {
            for i in 0..size {
                registry.acquire(&format!("dev-{i}")).await.unwrap();
            }
        });
        let ids: Vec<String> = (0..size).map(|i| format!("dev-{i}")).collect();

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("acquire", size), |b| {
            let mut i = 0usize;
            b.iter(|| {
                let handle = runtime.block_on(registry.acquire(&ids[i % ids.len()]));
                i += 1;
                handle
            })
        });
    }

    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("registry_churn");
    group.sample_size(10);

    // 1200 devices cycling through a pool of 1000: every acquire past the
    // first lap builds a connection and evicts one.
    let registry = registry(1000, 1200);
    let ids: Vec<String> = (0..1200).map(|i| format!("dev-{i}")).collect();

    group.throughput(Throughput::Elements(ids.len() as u64));
    group.bench_function("lap_1200_over_1000", |b| {
        b.iter(|| {
            runtime.block_on(async {
                for id in &ids {
                    registry.acquire(id).await.unwrap();
                }
            })
        })
    });

    group.finish();
}

criterion_group!(benches, bench_reuse, bench_churn);
criterion_main!(benches);
