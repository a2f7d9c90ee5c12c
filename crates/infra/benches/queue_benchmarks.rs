use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sluice_core::{JobKind, JobPolicies};
use sluice_infra::jobs::{InMemoryJobStore, JobStore, NewJob};
use sluice_infra::ranking::{
    InMemoryArtifactSource, InMemoryRankingDataset, RankingConfig, RankingSchedules,
    ranking_pipeline,
};
use sluice_ranking::{SourceArtifact, SymbolReference};
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Full lifecycle of one job against an otherwise empty queue.
fn bench_job_lifecycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("job_lifecycle");
    group.sample_size(1000);

    group.bench_function("enqueue_dequeue_complete", |b| {
        let store = InMemoryJobStore::new(JobPolicies::default());
        b.to_async(&rt).iter(|| async {
            let id = store
                .enqueue(NewJob::new(JobKind::PermissionsSync, "repo"))
                .await
                .unwrap();
            store.dequeue(JobKind::PermissionsSync, "bench").await.unwrap();
            black_box(store.mark_complete(id, "bench").await.unwrap());
        });
    });

    group.finish();
}

/// Dequeue cost as the backlog of eligible jobs grows.
fn bench_dequeue_backlog(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("dequeue_backlog");
    group.throughput(Throughput::Elements(1));

    for backlog in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("dequeue_release", backlog), backlog, |b, &size| {
            let store = InMemoryJobStore::new(JobPolicies::default());
            rt.block_on(async {
                for i in 0..size {
                    store
                        .enqueue(NewJob::new(JobKind::CodeIntelIndex, format!("upload-{i}")))
                        .await
                        .unwrap();
                }
            });

            b.to_async(&rt).iter(|| async {
                let job = store
                    .dequeue(JobKind::CodeIntelIndex, "bench")
                    .await
                    .unwrap()
                    .unwrap();
                store.release(job.id, "bench").await.unwrap();
                black_box(job.id);
            });
        });
    }

    group.finish();
}

/// One full ranking pass over a fresh dataset.
fn bench_ranking_pass(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("ranking_pass");
    group.sample_size(20);

    for artifacts in [10, 100].iter() {
        group.throughput(Throughput::Elements(*artifacts as u64));
        group.bench_with_input(BenchmarkId::new("run_until_idle", artifacts), artifacts, |b, &count| {
            let source: Arc<InMemoryArtifactSource> = Arc::new(
                (0..count)
                    .map(|id| SourceArtifact {
                        artifact_id: id,
                        repository: format!("repo-{id}"),
                        references: (0..50)
                            .map(|s| SymbolReference::new(format!("sym{}", (s * 7 + id) % 40), "main.go"))
                            .collect(),
                    })
                    .collect(),
            );

            b.to_async(&rt).iter(|| {
                let source = source.clone();
                async move {
                    let clock = Arc::new(sluice_core::SystemClock);
                    let pipeline = ranking_pipeline(
                        &RankingConfig::new("bench"),
                        RankingSchedules::default(),
                        "bench",
                        source,
                        InMemoryRankingDataset::arc(),
                        Arc::new(InMemoryJobStore::new(JobPolicies::default())),
                        clock,
                    );
                    black_box(pipeline.run_until_idle(1000).await.unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_job_lifecycle,
    bench_dequeue_backlog,
    bench_ranking_pass
);
criterion_main!(benches);
