//! Two-processor topology bridged by an IPC channel
//!
//! Processor 0 (one thread per stage):
//! 1. Source: numbered buffers
//! 2. Dup: one copy to a local sink, one across the channel
//! 3. Local sink
//! 4. IPC out
//!
//! Processor 1 (all stages on one cooperative scheduler):
//! 5. IPC in
//! 6. Algorithm: a plugin that byte-swaps the sequence number
//! 7. Remote sink
//!
//! Usage: cargo run --example ipc_topology [config.toml]
//!        RUST_LOG=link_pipeline=debug for state transitions

use link_pipeline::links::{DupLink, InputQueue, NullLink, NullSourceLink, NullSourceParams};
use link_pipeline::plugin::{AlgorithmParams, MemRecord, PluginInput, PluginOutput};
use link_pipeline::{
    AlgorithmLink, AlgorithmPlugin, BufferType, IpcChannel, IpcInLink, IpcOutLink,
    MultiStageScheduler, PipelineBuilder, Result as LinkResult, StageHost, StageId,
    StageRegistry, SystemConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SRC: StageId = StageId::new(0, 1);
const DUP: StageId = StageId::new(0, 2);
const LOCAL_SINK: StageId = StageId::new(0, 3);
const IPC_OUT: StageId = StageId::new(0, 4);
const IPC_IN: StageId = StageId::new(1, 1);
const ALG: StageId = StageId::new(1, 2);
const REMOTE_SINK: StageId = StageId::new(1, 3);

/// Reverses the payload bytes
struct ByteSwap;

impl AlgorithmPlugin for ByteSwap {
    fn name(&self) -> &str {
        "byte-swap"
    }

    fn num_resource_requests(&self) -> usize {
        0
    }

    fn allocate_resources(&mut self, _records: &mut [MemRecord]) -> LinkResult<()> {
        Ok(())
    }

    fn initialize(&mut self, _records: &mut [MemRecord]) -> LinkResult<()> {
        Ok(())
    }

    fn process(
        &mut self,
        _scratch: &mut [MemRecord],
        input: &PluginInput<'_>,
        output: &mut PluginOutput<'_>,
    ) -> LinkResult<()> {
        let n = input.payload.len().min(output.payload.len());
        for (out, byte) in output.payload[..n].iter_mut().zip(input.payload.iter().rev()) {
            *out = *byte;
        }
        output.desc.payload_size = n as u32;
        Ok(())
    }

    fn free(&mut self, _records: &mut [MemRecord]) -> LinkResult<()> {
        Ok(())
    }
}

fn main() -> LinkResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };
    println!("IPC Topology");
    println!("============");
    println!("ipc ring: {} x {} bytes\n", config.ipc.max_elements, config.ipc.element_size);

    let registry = Arc::new(StageRegistry::new());
    let channel = IpcChannel::new(&config.ipc)?;
    let proc1 = MultiStageScheduler::new("proc1", &config.scheduler)?;
    let on_proc1 = |priority| StageHost::Scheduled {
        scheduler: Arc::clone(&proc1),
        priority,
    };

    let local_sink = NullLink::new(vec![InputQueue::new(DUP, 0)]);
    let remote_sink = NullLink::new(vec![InputQueue::new(ALG, 0)]);
    let (local_log, remote_log) = (local_sink.log(), remote_sink.log());

    let pipeline = PipelineBuilder::new(registry, config)
        .add_stage(
            SRC,
            NullSourceLink::new(NullSourceParams {
                num_buffers: 4,
                num_channels: 2,
                next: Some(DUP),
                ..Default::default()
            }),
            StageHost::Thread,
        )
        .add_stage(
            DUP,
            DupLink::new(InputQueue::new(SRC, 0), vec![LOCAL_SINK, IPC_OUT]),
            StageHost::Thread,
        )
        .add_stage(LOCAL_SINK, local_sink, StageHost::Thread)
        .add_stage(
            IPC_OUT,
            IpcOutLink::new(InputQueue::new(DUP, 1), channel.clone(), IPC_IN),
            StageHost::Thread,
        )
        .add_stage(IPC_IN, IpcInLink::new(channel, IPC_OUT, Some(ALG), 8), on_proc1(0))
        .add_stage(
            ALG,
            AlgorithmLink::new(
                ByteSwap,
                AlgorithmParams {
                    input: InputQueue::new(IPC_IN, 0),
                    num_output_buffers: 4,
                    output_payload_size: 16,
                    output_type: BufferType::Metadata,
                    next: Some(REMOTE_SINK),
                },
            ),
            on_proc1(1),
        )
        .add_stage(REMOTE_SINK, remote_sink, on_proc1(1))
        .build()?;

    pipeline.start()?;
    for _ in 0..20 {
        // A full mailbox already carries a NEW_DATA
        let _ = pipeline.notify(SRC);
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(50));
    pipeline.stop()?;

    println!("Local sink received {} buffers", local_log.lock().len());
    println!("Remote sink received {} buffers", remote_log.lock().len());
    if let Some(last) = remote_log.lock().last() {
        println!(
            "Last remote buffer: ch {} seq {} payload {:02x?}",
            last.ch_num, last.src_timestamp, last.payload
        );
    }
    println!();
    println!("{}", pipeline.stats_summary());

    pipeline.delete()?;
    println!("Topology deleted");
    Ok(())
}
