use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use jtd_core::delivery::DeliveryReceipt;
use jtd_core::{Actor, Channel, JobStatus, NewJob, TenantId};
use jtd_infra::{InMemoryPipelineStore, Pipeline, PipelineConfig};
use std::sync::Arc;
use tokio::runtime::Runtime;

type BenchPipeline = Pipeline<Arc<InMemoryPipelineStore>>;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn request(tenant: TenantId, n: usize) -> NewJob {
    NewJob::new(
        tenant,
        Channel::Email,
        "user.invited",
        "user_invite",
        format!("inv-{n}"),
    )
    .with_email("bench@example.com")
    .with_priority((n % 10) as i32)
}

async fn seeded(count: usize) -> BenchPipeline {
    let pipeline = Pipeline::new(InMemoryPipelineStore::arc(), PipelineConfig::default());
    let tenant = TenantId::new();
    for n in 0..count {
        pipeline.create_job(request(tenant, n)).await.unwrap();
    }
    pipeline
}

fn bench_create_job(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("create_job");
    group.throughput(Throughput::Elements(1));

    group.bench_function("admit_and_enqueue", |b| {
        let pipeline = rt.block_on(seeded(0));
        let tenant = TenantId::new();
        let mut n = 0;
        b.iter(|| {
            n += 1;
            let outcome = rt.block_on(pipeline.create_job(request(tenant, n))).unwrap();
            black_box(outcome);
        });
    });

    group.finish();
}

fn bench_lease_ack_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lease_ack_throughput");
    let worker = Actor::worker("bench");

    for depth in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, &depth| {
            b.iter_batched(
                || rt.block_on(seeded(depth)),
                |pipeline| {
                    rt.block_on(async {
                        while let Some(lease) = pipeline.lease(&worker).await.unwrap() {
                            let outcome = pipeline
                                .report_success(&worker, &lease, DeliveryReceipt::new("bench"))
                                .await
                                .unwrap();
                            debug_assert_eq!(outcome.job().current_status, JobStatus::Sent);
                        }
                    });
                    black_box(pipeline);
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_metrics_snapshot(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("metrics_snapshot");

    for depth in [100usize, 1000].iter() {
        let pipeline = rt.block_on(seeded(*depth));
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, _| {
            b.iter(|| black_box(rt.block_on(pipeline.metrics()).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_create_job,
    bench_lease_ack_throughput,
    bench_metrics_snapshot
);
criterion_main!(benches);
