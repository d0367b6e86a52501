use criterion::{black_box, criterion_group, criterion_main, Criterion};
use link_pipeline::links::{DupLink, InputQueue, NullLink, NullSourceLink, NullSourceParams};
use link_pipeline::{
    MultiStageScheduler, PipelineBuilder, StageHost, StageId, StageRegistry, SystemConfig,
};
use std::sync::Arc;
use std::time::Duration;

const SRC: StageId = StageId::new(0, 1);
const MID: StageId = StageId::new(0, 2);
const SINK: StageId = StageId::new(0, 3);
const SINK2: StageId = StageId::new(0, 4);

fn source(next: StageId) -> NullSourceLink {
    NullSourceLink::new(NullSourceParams {
        num_buffers: 32,
        payload_size: 256,
        buffers_per_cycle: 4,
        next: Some(next),
        ..Default::default()
    })
}

fn dup_link() -> DupLink {
    DupLink::new(InputQueue::new(SRC, 0), vec![SINK, SINK2])
}

fn builder() -> PipelineBuilder {
    PipelineBuilder::new(Arc::new(StageRegistry::new()), SystemConfig::default())
}

fn drive(builder: PipelineBuilder, cycles: usize) {
    let pipeline = builder.build().expect("Build failed");
    pipeline.start().expect("Start failed");
    for _ in 0..cycles {
        // A full mailbox already carries a NEW_DATA
        let _ = pipeline.notify(black_box(SRC));
    }
    pipeline.stop().expect("Stop failed");
    pipeline.delete().expect("Delete failed");
}

fn benchmark_source_to_sink(c: &mut Criterion) {
    c.bench_function("source_to_sink_1000_cycles", |b| {
        b.iter(|| {
            let builder = builder()
                .add_stage(SRC, source(SINK), StageHost::Thread)
                .add_stage(SINK, NullLink::new(vec![InputQueue::new(SRC, 0)]), StageHost::Thread);
            drive(builder, 1000);
        });
    });
}

fn benchmark_dup_fan_out(c: &mut Criterion) {
    c.bench_function("dup_fan_out_1000_cycles", |b| {
        b.iter(|| {
            let builder = builder()
                .add_stage(SRC, source(MID), StageHost::Thread)
                .add_stage(MID, dup_link(), StageHost::Thread)
                .add_stage(SINK, NullLink::new(vec![InputQueue::new(MID, 0)]), StageHost::Thread)
                .add_stage(SINK2, NullLink::new(vec![InputQueue::new(MID, 1)]), StageHost::Thread);
            drive(builder, 1000);
        });
    });
}

fn benchmark_scheduled(c: &mut Criterion) {
    c.bench_function("scheduled_source_to_sink_1000_cycles", |b| {
        b.iter(|| {
            let config = SystemConfig::default();
            let scheduler =
                MultiStageScheduler::new("bench", &config.scheduler).expect("Scheduler failed");
            let host = |priority| StageHost::Scheduled {
                scheduler: Arc::clone(&scheduler),
                priority,
            };
            let builder = PipelineBuilder::new(Arc::new(StageRegistry::new()), config)
                .add_stage(SRC, source(SINK), host(0))
                .add_stage(SINK, NullLink::new(vec![InputQueue::new(SRC, 0)]), host(1));
            drive(builder, 1000);
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_source_to_sink, benchmark_dup_fan_out, benchmark_scheduled
);
criterion_main!(benches);
