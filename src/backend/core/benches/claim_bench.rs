//! Benchmarks for the enqueue and claim paths of the in-memory backend.
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use uno_jobs::jobs::{Enqueuer, InMemoryStorage, JobFilter, JobMetrics, JobStatus, JobStorage, NewJob, Priority};

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let storage: Arc<dyn JobStorage> = Arc::new(InMemoryStorage::new());
    let enqueuer = Enqueuer::new(Arc::clone(&storage), Arc::new(JobMetrics::new()));
    group.bench_function("single", |b| {
        b.iter(|| { rt.block_on(async { black_box(enqueuer.enqueue(NewJob::new("noop").queue("bench")).await.unwrap()); }); });
    });
    group.finish();
}

fn bench_enqueue_then_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_then_claim");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for depth in [100, 1_000] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &n| {
            b.iter(|| { rt.block_on(async {
                let storage = InMemoryStorage::new();
                for i in 0..n {
                    let priority = Priority::ALL[i % Priority::ALL.len()];
                    storage.persist(&NewJob::new("noop").priority(priority).into_job(Utc::now())).await.unwrap();
                }
                while let Some(job) = storage.claim_next("default", "bench-worker").await.unwrap() { black_box(job); }
            }); });
        });
    }
    group.finish();
}

fn bench_claim_from_deep_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_from_deep_queue");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for depth in [1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &n| {
            let storage = InMemoryStorage::new();
            rt.block_on(async {
                for _ in 0..n { storage.persist(&NewJob::new("noop").into_job(Utc::now())).await.unwrap(); }
            });
            // each claimed job is replaced so the queue depth stays constant
            b.iter(|| { rt.block_on(async {
                let job = storage.claim_next("default", "bench-worker").await.unwrap();
                black_box(job);
                storage.persist(&NewJob::new("noop").into_job(Utc::now())).await.unwrap();
            }); });
        });
    }
    group.finish();
}

fn bench_listing(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_jobs");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let storage = InMemoryStorage::new();
    rt.block_on(async {
        for i in 0..10_000 {
            let queue = if i % 2 == 0 { "even" } else { "odd" };
            storage.persist(&NewJob::new("noop").queue(queue).into_job(Utc::now())).await.unwrap();
        }
    });
    let filters = [
        ("all", JobFilter::default()),
        ("by_queue", JobFilter::default().queue("even")),
        ("by_status", JobFilter::default().status(JobStatus::Pending).page(1_000, 0)),
    ];
    for (label, filter) in &filters {
        group.bench_with_input(BenchmarkId::from_parameter(label), filter, |b, f| {
            b.iter(|| { rt.block_on(async { black_box(storage.get_jobs_by_status(f).await.unwrap()); }); });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_enqueue_then_claim, bench_claim_from_deep_queue, bench_listing);
criterion_main!(benches);
