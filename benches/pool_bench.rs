//! Benchmarks for acquire/release and execute throughput.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;

use esox_resourcepool::{AlwaysHealthy, BoxError, PoolConfiguration, ResourcePool};
use tokio::runtime::Runtime;

fn pool(max: usize) -> ResourcePool<u64> {
    ResourcePool::new(
        || async { Ok::<_, BoxError>(42u64) },
        AlwaysHealthy,
        PoolConfiguration::new()
            .with_min_capacity(max)
            .with_max_capacity(max),
    )
    .unwrap()
}

fn bench_acquire_release(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pool = pool(8);
    rt.block_on(pool.warmup()).unwrap();

    c.bench_function("acquire_release_idle", |b| {
        b.to_async(&rt).iter(|| async {
            let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
            black_box(*handle);
        });
    });
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_acquire");
    let rt = Runtime::new().unwrap();

    for tasks in [4usize, 16, 64] {
        let pool = pool(4);
        rt.block_on(pool.warmup()).unwrap();
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.to_async(&rt).iter(|| {
                let pool = pool.clone();
                async move {
                    let mut joins = Vec::with_capacity(tasks);
                    for _ in 0..tasks {
                        let pool = pool.clone();
                        joins.push(tokio::spawn(async move {
                            let handle = pool.acquire(Duration::from_secs(5)).await.unwrap();
                            black_box(*handle);
                        }));
                    }
                    for join in joins {
                        join.await.unwrap();
                    }
                }
            });
        });
    }
    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pool = pool(4);
    rt.block_on(pool.warmup()).unwrap();

    c.bench_function("execute_success", |b| {
        b.to_async(&rt).iter(|| async {
            let value = pool
                .execute(|client| async move { Ok::<_, BoxError>(*client + 1) }, 0)
                .await
                .unwrap();
            black_box(value);
        });
    });
}

criterion_group!(benches, bench_acquire_release, bench_contended, bench_execute);
criterion_main!(benches);
