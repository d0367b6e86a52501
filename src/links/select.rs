use super::forward::ForwardQueues;
use super::{release_logged, InputQueue};
use crate::buffer::BufferList;
use crate::error::{LinkError, Result};
use crate::registry::{LinkInfo, LinkOps, QueueInfo, StageId};
use crate::stage::{Link, StageContext};
use std::sync::Arc;

/// One output queue of a [`SelectLink`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectOutput {
    /// Input channels carried, in output channel order
    pub channels: Vec<u32>,
    /// Consumer to notify, if any
    pub next: Option<StageId>,
}

/// Splits one input across several output queues by channel
///
/// Output channel `i` of a queue carries the input channel listed at
/// position `i` of its [`SelectOutput`]. Buffers on channels no output
/// selects go straight back to the producer.
pub struct SelectLink {
    input: InputQueue,
    outputs: Vec<SelectOutput>,
    queues: Arc<ForwardQueues>,
    // Indexed by input channel: (output queue, output channel)
    map: Vec<Option<(usize, u32)>>,
}

impl SelectLink {
    /// Select from `input` onto one queue per entry of `outputs`
    pub fn new(input: InputQueue, outputs: Vec<SelectOutput>) -> Self {
        Self {
            input,
            outputs,
            queues: Arc::new(ForwardQueues::new()),
            map: Vec::new(),
        }
    }
}

impl Link for SelectLink {
    fn name(&self) -> &str {
        "select"
    }

    fn ops(&self) -> Arc<dyn LinkOps> {
        self.queues.clone()
    }

    fn create(&mut self, ctx: &StageContext) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(LinkError::invalid("select link needs at least one output"));
        }
        let prev_info = self.input.validate(ctx.registry())?;
        let in_channels = &prev_info.queue(self.input.queue)?.channels;

        let mut map = vec![None; in_channels.len()];
        let mut queues = Vec::with_capacity(self.outputs.len());
        for (queue, output) in self.outputs.iter().enumerate() {
            let mut channels = Vec::with_capacity(output.channels.len());
            for (out_ch, &in_ch) in output.channels.iter().enumerate() {
                let info = in_channels.get(in_ch as usize).ok_or_else(|| {
                    LinkError::invalid(format!(
                        "output {queue} selects channel {in_ch}, input has {}",
                        in_channels.len()
                    ))
                })?;
                if let Some((other, _)) = map[in_ch as usize] {
                    return Err(LinkError::invalid(format!(
                        "channel {in_ch} selected by outputs {other} and {queue}"
                    )));
                }
                map[in_ch as usize] = Some((queue, out_ch as u32));
                channels.push(*info);
            }
            queues.push(QueueInfo { channels });
        }

        self.queues.open(ctx, vec![self.input], LinkInfo { queues })?;
        self.map = map;
        Ok(())
    }

    fn process(&mut self, ctx: &StageContext) -> Result<()> {
        let list = ctx.get_full_buffers(self.input.prev, self.input.queue)?;
        if list.is_empty() {
            return Ok(());
        }

        let mut unselected = BufferList::new();
        let mut forwarded = vec![0usize; self.outputs.len()];
        for buf in list {
            let target = buf
                .descriptor()
                .map(|d| self.map.get(d.ch_num as usize).copied().flatten());
            let target = match target {
                Ok(target) => target,
                Err(e) => {
                    tracing::error!(stage = %ctx.id(), error = %e, "unreadable buffer sent back");
                    ctx.stats().record_error();
                    None
                }
            };
            let Some((queue, out_ch)) = target else {
                if let Err(buf) = unselected.push(buf) {
                    release_logged(ctx.id(), buf);
                }
                continue;
            };
            match self.queues.forward(0, queue, out_ch, buf) {
                Ok(true) => forwarded[queue] += 1,
                Ok(false) => ctx.stats().record_dropped(1),
                Err(e) => {
                    tracing::error!(stage = %ctx.id(), queue, error = %e, "forward failed");
                    ctx.stats().record_error();
                }
            }
        }
        ctx.put_empty_buffers(self.input.prev, self.input.queue, unselected)?;

        for (output, count) in self.outputs.iter().zip(forwarded) {
            if count == 0 {
                continue;
            }
            ctx.stats().record_forwarded(count);
            if let Some(next) = output.next {
                ctx.notify(next)?;
            }
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &StageContext) -> Result<()> {
        if let Err(e) = self.queues.close() {
            tracing::debug!(stage = %ctx.id(), error = %e, "queued buffers released directly");
        }
        self.map.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::links::OutputQueues;
    use crate::mailbox::Mailbox;
    use crate::memory::HeapAllocator;
    use crate::registry::{ChannelInfo, StageRegistry};

    fn setup(channels: usize) -> (StageContext, InputQueue) {
        let registry = Arc::new(StageRegistry::new());
        let prev = StageId::new(0, 1);
        let outputs = Arc::new(OutputQueues::new());
        let info = LinkInfo {
            queues: vec![QueueInfo {
                channels: vec![ChannelInfo::default(); channels],
            }],
        };
        outputs.open(prev, info, 8, 8).unwrap();
        registry
            .register(prev, outputs, Mailbox::new(prev, 4).unwrap())
            .unwrap();
        let ctx = StageContext::new(
            StageId::new(0, 2),
            registry,
            SystemConfig::default(),
            Arc::new(HeapAllocator::new()),
        );
        (ctx, InputQueue::new(prev, 0))
    }

    fn output(channels: Vec<u32>) -> SelectOutput {
        SelectOutput {
            channels,
            next: None,
        }
    }

    #[test]
    fn test_publishes_selected_channels() {
        let (ctx, input) = setup(3);
        let mut select = SelectLink::new(input, vec![output(vec![2, 0]), output(vec![1])]);
        select.create(&ctx).unwrap();

        let info = select.ops().link_info();
        assert_eq!(info.queues.len(), 2);
        assert_eq!(info.queues[0].channels.len(), 2);
        assert_eq!(info.queues[1].channels.len(), 1);
        select.delete(&ctx).unwrap();
    }

    #[test]
    fn test_bad_selections_rejected() {
        let (ctx, input) = setup(2);
        let mut twice = SelectLink::new(input, vec![output(vec![0]), output(vec![0])]);
        assert!(matches!(twice.create(&ctx), Err(LinkError::InvalidParams(_))));

        let mut missing = SelectLink::new(input, vec![output(vec![5])]);
        assert!(matches!(missing.create(&ctx), Err(LinkError::InvalidParams(_))));

        let mut none = SelectLink::new(input, Vec::new());
        assert!(none.create(&ctx).is_err());
    }
}
