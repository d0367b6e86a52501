use super::{release_logged, InputQueue, OutputQueues};
use crate::buffer::BufferList;
use crate::error::{LinkError, Result};
use crate::registry::{LinkInfo, LinkOps, StageId};
use crate::stage::{Link, StageContext};
use std::sync::Arc;

/// Fan-out stage: every input buffer is duplicated onto each output queue
///
/// The original goes straight back to the predecessor after duplication.
/// Its payload stays in use until the last duplicate is released by a
/// consumer, at which point the predecessor's pool gets it back.
pub struct DupLink {
    input: InputQueue,
    next: Vec<StageId>,
    outputs: Arc<OutputQueues>,
}

impl DupLink {
    /// Duplicate `input` onto one output queue per entry of `next`;
    /// output queue `i` feeds `next[i]`
    pub fn new(input: InputQueue, next: Vec<StageId>) -> Self {
        Self {
            input,
            next,
            outputs: Arc::new(OutputQueues::new()),
        }
    }
}

impl Link for DupLink {
    fn name(&self) -> &str {
        "dup"
    }

    fn ops(&self) -> Arc<dyn LinkOps> {
        self.outputs.clone()
    }

    fn create(&mut self, ctx: &StageContext) -> Result<()> {
        if self.next.is_empty() {
            return Err(LinkError::invalid("dup link needs at least one output"));
        }
        let prev_info = self.input.validate(ctx.registry())?;
        let queue = prev_info.queue(self.input.queue)?.clone();
        let info = LinkInfo {
            queues: vec![queue; self.next.len()],
        };
        self.outputs.open(
            ctx.id(),
            info,
            ctx.config().buffers.max_derived,
            ctx.config().buffers.max_in_list,
        )
    }

    fn process(&mut self, ctx: &StageContext) -> Result<()> {
        let list: BufferList = ctx.get_full_buffers(self.input.prev, self.input.queue)?;
        if list.is_empty() {
            return Ok(());
        }

        let mut forwarded = vec![0usize; self.next.len()];
        for original in list.iter() {
            for (queue, count) in forwarded.iter_mut().enumerate() {
                let dup = match original.duplicate() {
                    Ok(dup) => dup,
                    Err(e) => {
                        tracing::warn!(
                            stage = %ctx.id(),
                            queue,
                            error = %e,
                            "duplicate failed, output skipped"
                        );
                        ctx.stats().record_dropped(1);
                        continue;
                    }
                };
                match self.outputs.push(queue, dup) {
                    Ok(()) => *count += 1,
                    Err(dup) => {
                        ctx.stats().record_dropped(1);
                        release_logged(ctx.id(), dup);
                    }
                }
            }
        }

        ctx.put_empty_buffers(self.input.prev, self.input.queue, list)?;

        for (next, count) in self.next.iter().zip(forwarded) {
            if count > 0 {
                ctx.stats().record_forwarded(count);
                ctx.notify(*next)?;
            }
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &StageContext) -> Result<()> {
        for dup in self.outputs.close() {
            release_logged(ctx.id(), dup);
        }
        Ok(())
    }
}
