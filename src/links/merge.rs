use super::forward::ForwardQueues;
use super::{release_logged, InputQueue};
use crate::buffer::{BufferList, BufferRef, MAX_CHANNELS};
use crate::error::{LinkError, Result};
use crate::registry::{LinkInfo, LinkOps, QueueInfo, StageId};
use crate::stage::{Link, StageContext};
use std::sync::Arc;

/// Fan-in stage: buffers from every input leave on one output queue
///
/// Channels are numbered input by input, so input 1's channel 0 follows
/// the last channel of input 0. Buffers are not copied; a consumer's
/// return goes back to the producer the buffer came from.
pub struct MergeLink {
    inputs: Vec<InputQueue>,
    next: Option<StageId>,
    queues: Arc<ForwardQueues>,
    first_channel: Vec<u32>,
    num_channels: Vec<u32>,
}

impl MergeLink {
    /// Merge `inputs` in order, waking `next`
    pub fn new(inputs: Vec<InputQueue>, next: Option<StageId>) -> Self {
        Self {
            inputs,
            next,
            queues: Arc::new(ForwardQueues::new()),
            first_channel: Vec::new(),
            num_channels: Vec::new(),
        }
    }

    fn out_channel(&self, input: usize, buf: &BufferRef) -> Result<u32> {
        let ch_num = buf.descriptor()?.ch_num;
        if ch_num >= self.num_channels[input] {
            return Err(LinkError::invalid(format!(
                "input {input} sent channel {ch_num}, it publishes {}",
                self.num_channels[input]
            )));
        }
        Ok(self.first_channel[input] + ch_num)
    }
}

impl Link for MergeLink {
    fn name(&self) -> &str {
        "merge"
    }

    fn ops(&self) -> Arc<dyn LinkOps> {
        self.queues.clone()
    }

    fn create(&mut self, ctx: &StageContext) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(LinkError::invalid("merge link needs at least one input"));
        }
        let mut channels = Vec::new();
        self.first_channel.clear();
        self.num_channels.clear();
        for input in &self.inputs {
            let info = input.validate(ctx.registry())?;
            let queue = info.queue(input.queue)?;
            self.first_channel.push(channels.len() as u32);
            self.num_channels.push(queue.channels.len() as u32);
            channels.extend_from_slice(&queue.channels);
        }
        if channels.len() > MAX_CHANNELS as usize {
            return Err(LinkError::invalid(format!(
                "merged inputs carry {} channels, at most {MAX_CHANNELS} fit",
                channels.len()
            )));
        }
        let info = LinkInfo {
            queues: vec![QueueInfo { channels }],
        };
        self.queues.open(ctx, self.inputs.clone(), info)
    }

    fn process(&mut self, ctx: &StageContext) -> Result<()> {
        let mut forwarded = 0;
        for (index, input) in self.inputs.iter().enumerate() {
            let list = ctx.get_full_buffers(input.prev, input.queue)?;
            let mut rejected = BufferList::new();
            for buf in list {
                let out_ch = match self.out_channel(index, &buf) {
                    Ok(out_ch) => out_ch,
                    Err(e) => {
                        tracing::error!(
                            stage = %ctx.id(),
                            input = index,
                            error = %e,
                            "buffer sent back"
                        );
                        ctx.stats().record_error();
                        if let Err(buf) = rejected.push(buf) {
                            release_logged(ctx.id(), buf);
                        }
                        continue;
                    }
                };
                match self.queues.forward(index, 0, out_ch, buf) {
                    Ok(true) => forwarded += 1,
                    Ok(false) => ctx.stats().record_dropped(1),
                    Err(e) => {
                        tracing::error!(
                            stage = %ctx.id(),
                            input = index,
                            error = %e,
                            "forward failed"
                        );
                        ctx.stats().record_error();
                    }
                }
            }
            ctx.put_empty_buffers(input.prev, input.queue, rejected)?;
        }

        if forwarded > 0 {
            ctx.stats().record_forwarded(forwarded);
            if let Some(next) = self.next {
                ctx.notify(next)?;
            }
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &StageContext) -> Result<()> {
        if let Err(e) = self.queues.close() {
            tracing::debug!(stage = %ctx.id(), error = %e, "queued buffers released directly");
        }
        Ok(())
    }
}
