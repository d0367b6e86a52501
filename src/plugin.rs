//! Hosting of processing plugins.
//!
//! A plugin never sees the stage protocol. [`AlgorithmLink`] drives it
//! through a fixed sequence: resource negotiation and `initialize` on
//! CREATE, `activate`/`process`/`deactivate` around every input buffer on
//! NEW_DATA, and `free` on DELETE. Working memory is requested through
//! [`MemRecord`]s, allocated by the host and lent back on every call.

use crate::buffer::{BufferDescriptor, BufferPool, BufferRef, BufferType};
use crate::error::{LinkError, Result};
use crate::links::{release_logged, InputQueue, OutputQueues};
use crate::memory::{MemBlock, PoolId};
use crate::registry::{ChannelInfo, LinkInfo, LinkOps, QueueInfo, StageId};
use crate::stage::{Link, StageContext};
use parking_lot::Mutex;
use std::sync::Arc;

/// One working-memory request and, after CREATE, its allocation
#[derive(Debug)]
pub struct MemRecord {
    /// Pool to allocate from
    pub pool: PoolId,
    /// Requested bytes; zero means the slot is unused
    pub size: usize,
    /// Requested alignment, a power of two
    pub align: usize,
    /// Filled in by the host before `initialize`
    pub block: Option<MemBlock>,
}

impl Default for MemRecord {
    fn default() -> Self {
        Self {
            pool: PoolId::ALGORITHM,
            size: 0,
            align: 1,
            block: None,
        }
    }
}

impl MemRecord {
    /// Allocated bytes, empty before CREATE
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self.block.as_mut() {
            Some(block) => block.as_mut_slice(),
            None => &mut [],
        }
    }
}

/// Input buffer as a plugin sees it
#[derive(Debug)]
pub struct PluginInput<'a> {
    /// Metadata of the input buffer
    pub desc: BufferDescriptor,
    /// Valid payload bytes; empty for a payload held elsewhere
    pub payload: &'a [u8],
}

/// Output buffer a plugin fills
#[derive(Debug)]
pub struct PluginOutput<'a> {
    /// Metadata to publish; starts as the input's with the output type and
    /// full capacity as `payload_size`
    pub desc: BufferDescriptor,
    /// Whole output payload area
    pub payload: &'a mut [u8],
}

/// Call contract of a processing algorithm
pub trait AlgorithmPlugin: Send + 'static {
    /// Name used in logs
    fn name(&self) -> &str;

    /// How many [`MemRecord`]s `allocate_resources` fills
    fn num_resource_requests(&self) -> usize;

    /// Describe the working memory needed
    fn allocate_resources(&mut self, records: &mut [MemRecord]) -> Result<()>;

    /// Set up with the allocated memory
    fn initialize(&mut self, records: &mut [MemRecord]) -> Result<()>;

    /// Acquire per-call resources before `process`
    fn activate(&mut self) -> Result<()> {
        Ok(())
    }

    /// Turn one input into one output
    fn process(
        &mut self,
        scratch: &mut [MemRecord],
        input: &PluginInput<'_>,
        output: &mut PluginOutput<'_>,
    ) -> Result<()>;

    /// Give back what `activate` took
    fn deactivate(&mut self) -> Result<()> {
        Ok(())
    }

    /// Algorithm-specific runtime command
    fn control(&mut self, cmd: u32, params: &[u8], reply: &mut Vec<u8>) -> Result<()> {
        let _ = (params, reply);
        Err(LinkError::invalid(format!(
            "{}: unsupported control command {cmd:#x}",
            self.name()
        )))
    }

    /// Drop every reference into `records` before the host frees them
    fn free(&mut self, records: &mut [MemRecord]) -> Result<()>;
}

/// Output side of an [`AlgorithmLink`]
#[derive(Debug, Clone)]
pub struct AlgorithmParams {
    /// Input to consume
    pub input: InputQueue,
    /// Output buffers in the stage's pool
    pub num_output_buffers: usize,
    /// Payload bytes per output buffer
    pub output_payload_size: usize,
    /// Type of every output buffer
    pub output_type: BufferType,
    /// Consumer to notify, if any
    pub next: Option<StageId>,
}

struct Hosted<P> {
    plugin: P,
    records: Vec<MemRecord>,
}

/// Runtime control of a plugin hosted by an [`AlgorithmLink`]
///
/// Shares the plugin with the stage, so a command waits for any cycle in
/// progress.
pub struct PluginControl<P> {
    hosted: Arc<Mutex<Hosted<P>>>,
}

impl<P: AlgorithmPlugin> PluginControl<P> {
    /// Forward `cmd` to the plugin
    pub fn control(&self, cmd: u32, params: &[u8]) -> Result<Vec<u8>> {
        let mut reply = Vec::new();
        self.hosted.lock().plugin.control(cmd, params, &mut reply)?;
        Ok(reply)
    }
}

/// Stage hosting one [`AlgorithmPlugin`] with one input and one output
pub struct AlgorithmLink<P> {
    params: AlgorithmParams,
    hosted: Arc<Mutex<Hosted<P>>>,
    outputs: Arc<OutputQueues>,
    pool: Option<Arc<BufferPool>>,
}

impl<P: AlgorithmPlugin> AlgorithmLink<P> {
    /// Stage around `plugin`
    pub fn new(plugin: P, params: AlgorithmParams) -> Self {
        Self {
            params,
            hosted: Arc::new(Mutex::new(Hosted {
                plugin,
                records: Vec::new(),
            })),
            outputs: Arc::new(OutputQueues::new()),
            pool: None,
        }
    }

    /// Control handle usable from any thread
    pub fn controller(&self) -> PluginControl<P> {
        PluginControl {
            hosted: Arc::clone(&self.hosted),
        }
    }

    fn free_records(ctx: &StageContext, records: &mut Vec<MemRecord>) -> Result<()> {
        let mut first_err = None;
        for record in records.drain(..) {
            if let Some(block) = record.block {
                if let Err(e) = ctx.allocator().free(block) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Run the plugin over one input buffer into `output`
    fn transform(
        &self,
        hosted: &mut Hosted<P>,
        input: &BufferRef,
        output: &BufferRef,
    ) -> Result<()> {
        let in_desc = input.descriptor()?;
        let out_desc = BufferDescriptor {
            buf_type: self.params.output_type,
            payload_size: self.params.output_payload_size as u32,
            ..in_desc
        };
        let Hosted { plugin, records } = hosted;

        plugin.activate()?;
        // Input payload lock first, then the output payload
        let processed = input.with_payload(|payload| {
            let plugin_in = PluginInput {
                desc: in_desc,
                payload,
            };
            output.with_payload_mut(|out| {
                let mut plugin_out = PluginOutput {
                    desc: out_desc,
                    payload: out,
                };
                plugin
                    .process(records, &plugin_in, &mut plugin_out)
                    .map(|()| plugin_out.desc)
            })
        });
        let deactivated = plugin.deactivate();
        let desc = processed.and_then(|r| r).and_then(|r| r)?;
        deactivated?;

        output.update(|d| {
            *d = BufferDescriptor {
                payload_addr: d.payload_addr,
                ..desc
            }
        })
    }
}

impl<P: AlgorithmPlugin> Link for AlgorithmLink<P> {
    fn name(&self) -> &str {
        "algorithm"
    }

    fn ops(&self) -> Arc<dyn LinkOps> {
        self.outputs.clone()
    }

    fn create(&mut self, ctx: &StageContext) -> Result<()> {
        let prev_info = self.params.input.validate(ctx.registry())?;
        let channels = prev_info.queue(self.params.input.queue)?.channels.len().max(1);

        let mut hosted = self.hosted.lock();
        let mut records: Vec<MemRecord> = (0..hosted.plugin.num_resource_requests())
            .map(|_| MemRecord::default())
            .collect();
        hosted.plugin.allocate_resources(&mut records)?;
        for record in records.iter_mut().filter(|r| r.size > 0) {
            match ctx.allocator().alloc(record.pool, record.size, record.align) {
                Ok(block) => record.block = Some(block),
                Err(e) => {
                    Self::free_records(ctx, &mut records)?;
                    return Err(e);
                }
            }
        }
        if let Err(e) = hosted.plugin.initialize(&mut records) {
            Self::free_records(ctx, &mut records)?;
            return Err(e);
        }

        let pool = BufferPool::new(
            ctx.id(),
            self.params.num_output_buffers,
            self.params.output_payload_size,
            Arc::clone(ctx.allocator()),
            PoolId::FRAME,
            ctx.config().buffers.max_derived,
        );
        let pool = match pool {
            Ok(pool) => pool,
            Err(e) => {
                hosted.plugin.free(&mut records)?;
                Self::free_records(ctx, &mut records)?;
                return Err(e);
            }
        };
        let channel = ChannelInfo {
            buf_type: self.params.output_type,
            max_payload_size: self.params.output_payload_size as u32,
            flags: 0,
        };
        let info = LinkInfo {
            queues: vec![QueueInfo {
                channels: vec![channel; channels],
            }],
        };
        if let Err(e) = self.outputs.open(
            ctx.id(),
            info,
            self.params.num_output_buffers,
            ctx.config().buffers.max_in_list,
        ) {
            hosted.plugin.free(&mut records)?;
            Self::free_records(ctx, &mut records)?;
            return Err(e);
        }

        tracing::debug!(
            stage = %ctx.id(),
            plugin = hosted.plugin.name(),
            records = records.len(),
            "plugin initialized"
        );
        hosted.records = records;
        self.pool = Some(pool);
        Ok(())
    }

    fn process(&mut self, ctx: &StageContext) -> Result<()> {
        let Some(pool) = self.pool.clone() else {
            return Err(LinkError::violation("algorithm link processing before create"));
        };
        let input = self.params.input;
        let list = ctx.get_full_buffers(input.prev, input.queue)?;
        if list.is_empty() {
            return Ok(());
        }

        let mut produced = 0;
        {
            let mut hosted = self.hosted.lock();
            for buf in list.iter() {
                let Some(output) = pool.acquire() else {
                    tracing::trace!(stage = %ctx.id(), "no free output buffer, input skipped");
                    ctx.stats().record_dropped(1);
                    continue;
                };
                match self.transform(&mut hosted, buf, &output) {
                    Ok(()) => match self.outputs.push(0, output) {
                        Ok(()) => produced += 1,
                        Err(output) => {
                            ctx.stats().record_dropped(1);
                            release_logged(ctx.id(), output);
                        }
                    },
                    Err(e) => {
                        tracing::error!(
                            stage = %ctx.id(),
                            plugin = hosted.plugin.name(),
                            error = %e,
                            "plugin process failed"
                        );
                        ctx.stats().record_error();
                        release_logged(ctx.id(), output);
                    }
                }
            }
        }

        ctx.put_empty_buffers(input.prev, input.queue, list)?;
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
        self.pool = None;
        let mut hosted = self.hosted.lock();
        let Hosted { plugin, records } = &mut *hosted;
        let freed = plugin.free(records);
        Self::free_records(ctx, records)?;
        freed
    }
}
