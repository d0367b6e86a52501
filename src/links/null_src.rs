use super::{release_logged, OutputQueues};
use crate::buffer::{BufferPool, BufferType};
use crate::error::{LinkError, Result};
use crate::memory::PoolId;
use crate::registry::{ChannelInfo, LinkInfo, LinkOps, QueueInfo, StageId};
use crate::stage::{Link, StageContext};
use std::sync::Arc;
use std::time::Instant;

/// Configuration of a [`NullSourceLink`]
#[derive(Debug, Clone)]
pub struct NullSourceParams {
    /// Buffers in the source's pool
    pub num_buffers: usize,
    /// Payload bytes per buffer
    pub payload_size: usize,
    /// Channels produced round-robin
    pub num_channels: u32,
    /// Payload kind of every buffer
    pub buf_type: BufferType,
    /// Buffers produced per NEW_DATA
    pub buffers_per_cycle: usize,
    /// Consumer to notify, if any
    pub next: Option<StageId>,
}

impl Default for NullSourceParams {
    fn default() -> Self {
        Self {
            num_buffers: 8,
            payload_size: 64,
            num_channels: 1,
            buf_type: BufferType::VideoFrame,
            buffers_per_cycle: 1,
            next: None,
        }
    }
}

/// Source stage producing numbered buffers
///
/// Each NEW_DATA (from a timer or the application) fills up to
/// `buffers_per_cycle` free buffers: channels round-robin, the running
/// sequence number in `src_timestamp` and, little-endian, at the start of
/// the payload.
pub struct NullSourceLink {
    params: NullSourceParams,
    outputs: Arc<OutputQueues>,
    pool: Option<Arc<BufferPool>>,
    sequence: u64,
    epoch: Instant,
}

impl NullSourceLink {
    /// Source with `params`; nothing is allocated until CREATE
    pub fn new(params: NullSourceParams) -> Self {
        Self {
            params,
            outputs: Arc::new(OutputQueues::new()),
            pool: None,
            sequence: 0,
            epoch: Instant::now(),
        }
    }

    fn produce(&mut self, ctx: &StageContext, pool: &Arc<BufferPool>) -> Result<usize> {
        let mut produced = 0;
        for _ in 0..self.params.buffers_per_cycle {
            let Some(buf) = pool.acquire() else {
                tracing::trace!(stage = %ctx.id(), "pool exhausted, waiting for returns");
                break;
            };
            let seq = self.sequence;
            let bytes = seq.to_le_bytes();
            let written = buf.with_payload_mut(|p| {
                let n = p.len().min(bytes.len());
                p[..n].copy_from_slice(&bytes[..n]);
                n
            })?;
            let now = self.epoch.elapsed().as_micros() as u64;
            let buf_type = self.params.buf_type;
            let channels = self.params.num_channels;
            buf.update(|d| {
                d.buf_type = buf_type;
                d.ch_num = (seq % u64::from(channels)) as u32;
                d.src_timestamp = seq;
                d.local_timestamp = now;
                d.payload_size = written as u32;
            })?;
            self.sequence += 1;

            match self.outputs.push(0, buf) {
                Ok(()) => produced += 1,
                Err(buf) => {
                    ctx.stats().record_dropped(1);
                    release_logged(ctx.id(), buf);
                }
            }
        }
        Ok(produced)
    }
}

impl Link for NullSourceLink {
    fn name(&self) -> &str {
        "null-source"
    }

    fn ops(&self) -> Arc<dyn LinkOps> {
        self.outputs.clone()
    }

    fn create(&mut self, ctx: &StageContext) -> Result<()> {
        let p = &self.params;
        if p.num_channels == 0 || p.num_channels > crate::buffer::MAX_CHANNELS {
            return Err(LinkError::invalid(format!(
                "null source: {} channels",
                p.num_channels
            )));
        }
        if p.buffers_per_cycle == 0 {
            return Err(LinkError::invalid("null source: zero buffers per cycle"));
        }
        let pool = BufferPool::new(
            ctx.id(),
            p.num_buffers,
            p.payload_size,
            Arc::clone(ctx.allocator()),
            PoolId::FRAME,
            ctx.config().buffers.max_derived,
        )?;
        let channel = ChannelInfo {
            buf_type: p.buf_type,
            max_payload_size: p.payload_size as u32,
            flags: 0,
        };
        let info = LinkInfo {
            queues: vec![QueueInfo {
                channels: vec![channel; p.num_channels as usize],
            }],
        };
        self.outputs.open(
            ctx.id(),
            info,
            p.num_buffers,
            ctx.config().buffers.max_in_list,
        )?;
        self.pool = Some(pool);
        self.sequence = 0;
        Ok(())
    }

    fn process(&mut self, ctx: &StageContext) -> Result<()> {
        let Some(pool) = self.pool.clone() else {
            return Err(LinkError::violation("null source processing before create"));
        };
        let produced = self.produce(ctx, &pool)?;
        ctx.stats().record_received(produced);
        if produced > 0 {
            ctx.stats().record_forwarded(produced);
            if let Some(next) = self.params.next {
                ctx.notify(next)?;
            }
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &StageContext) -> Result<()> {
        for buf in self.outputs.close() {
            release_logged(ctx.id(), buf);
        }
        if let Some(pool) = self.pool.take() {
            let status = pool.status();
            if status.outstanding > 0 {
                tracing::warn!(
                    stage = %ctx.id(),
                    outstanding = status.outstanding,
                    "deleted with buffers still out"
                );
            }
        }
        Ok(())
    }
}
