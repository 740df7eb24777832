//! Distribution benchmarks
//!
//! Measures the pairing policy on its own and the full submit → execute →
//! resolve path through a manager with in-process workers.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

use workpool::{
    default_distribution, PoolConfig, PoolManager, Result, Task, TaskOptions, Worker,
    WorkerBehavior,
};

struct Echo;

#[async_trait]
impl WorkerBehavior for Echo {
    async fn execute_task(&self, _worker: &Worker, content: &Value) -> Result<Value> {
        Ok(content.clone())
    }
}

/// Pairing cost with a mix of pinned and unpinned tasks
fn bench_default_distribution(c: &mut Criterion) {
    let mut group = c.benchmark_group("distribution/pairing");

    for size in [8usize, 64, 512] {
        let workers: Vec<Worker> = (0..size)
            .map(|i| Worker::with_name(format!("worker-{i}")))
            .collect();
        let tasks: Vec<Task> = (0..size * 2)
            .map(|i| {
                let options = if i % 4 == 0 {
                    TaskOptions::default().with_pinned_worker(workers[i % size].clone())
                } else {
                    TaskOptions::default()
                };
                Task::new(json!({ "index": i }), options)
            })
            .collect();

        group.throughput(Throughput::Elements(tasks.len() as u64));
        group.bench_with_input(BenchmarkId::new("workers", size), &size, |b, _| {
            b.iter(|| default_distribution(&workers, &tasks))
        });
    }
    group.finish();
}

/// End-to-end throughput through the manager
fn bench_manager_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("distribution/manager");
    group.measurement_time(Duration::from_secs(5));

    for worker_count in [1usize, 4, 16] {
        group.throughput(Throughput::Elements(100));
        group.bench_with_input(
            BenchmarkId::new("workers", worker_count),
            &worker_count,
            |b, &worker_count| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let manager = PoolManager::new(PoolConfig::default());
                    let workers: Vec<Worker> =
                        (0..worker_count).map(|_| manager.add_worker(Echo)).collect();
                    manager.start_pools(&workers, None).await.unwrap();

                    let start = Instant::now();
                    for _ in 0..iters {
                        let tasks: Vec<Task> = (0..100)
                            .map(|i| manager.proceed_raw_task(json!({ "index": i }), TaskOptions::default()))
                            .collect();
                        for task in tasks {
                            task.wait().await;
                        }
                    }
                    let elapsed = start.elapsed();

                    manager.shutdown().await;
                    elapsed
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_default_distribution, bench_manager_throughput);
criterion_main!(benches);
