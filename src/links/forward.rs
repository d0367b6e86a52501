//! Output queues of stages that pass their inputs' buffers on instead of
//! producing their own.
//!
//! A forwarded buffer is renumbered onto an output channel and tagged with
//! a private word holding the input it came from and its original channel.
//! When a consumer hands it back, the tag routes it to that input's
//! producer with the channel restored.

use super::{release_logged, InputQueue, OutputQueues};
use crate::buffer::{BufferList, BufferRef};
use crate::error::{LinkError, Result};
use crate::registry::{LinkInfo, LinkOps, StageId, StageRegistry};
use crate::stage::StageContext;
use parking_lot::RwLock;
use std::sync::Arc;

fn tag(input: usize, ch_num: u32) -> u64 {
    ((input as u64) << 32) | u64::from(ch_num)
}

fn untag(word: u64) -> (usize, u32) {
    ((word >> 32) as usize, word as u32)
}

struct Route {
    owner: StageId,
    registry: Arc<StageRegistry>,
    inputs: Vec<InputQueue>,
}

/// Output queues plus the way home for every buffer queued on them
#[derive(Default)]
pub(crate) struct ForwardQueues {
    outputs: OutputQueues,
    route: RwLock<Option<Route>>,
}

impl ForwardQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Publish `info` and remember `inputs` for returns
    pub(crate) fn open(
        &self,
        ctx: &StageContext,
        inputs: Vec<InputQueue>,
        info: LinkInfo,
    ) -> Result<()> {
        self.outputs.open(
            ctx.id(),
            info,
            ctx.config().buffers.max_derived,
            ctx.config().buffers.max_in_list,
        )?;
        *self.route.write() = Some(Route {
            owner: ctx.id(),
            registry: Arc::clone(ctx.registry()),
            inputs,
        });
        Ok(())
    }

    /// Send everything still queued home and stop routing
    pub(crate) fn close(&self) -> Result<()> {
        let queued = self.outputs.close();
        let returned = self.return_home(queued);
        *self.route.write() = None;
        returned
    }

    /// Queue `buf`, taken from input `input`, on output `queue` as channel
    /// `out_ch`
    ///
    /// `Ok(false)` means the queue was full and the buffer went straight
    /// home. On error the buffer has been sent home too.
    pub(crate) fn forward(
        &self,
        input: usize,
        queue: usize,
        out_ch: u32,
        buf: BufferRef,
    ) -> Result<bool> {
        let owner = self.route.read().as_ref().map(|r| r.owner);
        let Some(owner) = owner else {
            release_logged(buf.owner(), buf);
            return Err(LinkError::violation("forwarding through closed queues"));
        };
        let tagged = buf
            .descriptor()
            .and_then(|d| buf.set_private(owner, tag(input, d.ch_num)))
            .and_then(|()| buf.update(|d| d.ch_num = out_ch));
        if let Err(e) = tagged {
            if let Err(home) = self.return_home(std::iter::once(buf)) {
                tracing::debug!(stage = %owner, error = %home, "untagged buffer released directly");
            }
            return Err(e);
        }
        match self.outputs.push(queue, buf) {
            Ok(()) => Ok(true),
            Err(buf) => {
                self.return_home(std::iter::once(buf))?;
                Ok(false)
            }
        }
    }

    /// Restore each buffer's channel and hand it to the producer it came
    /// from, in one list per input
    ///
    /// A buffer that carries no tag of this stage is released directly.
    fn return_home(&self, bufs: impl IntoIterator<Item = BufferRef>) -> Result<()> {
        let route = self.route.read();
        let Some(route) = route.as_ref() else {
            for buf in bufs {
                release_logged(buf.owner(), buf);
            }
            return Err(LinkError::violation("buffers returned to closed queues"));
        };

        let mut first_err = None;
        let mut lists: Vec<BufferList> = route.inputs.iter().map(|_| BufferList::new()).collect();
        for buf in bufs {
            let input = match Self::restore(route, &buf) {
                Ok(input) => input,
                Err(e) => {
                    tracing::error!(stage = %route.owner, error = %e, "cannot route buffer home");
                    first_err.get_or_insert(e);
                    release_logged(route.owner, buf);
                    continue;
                }
            };
            if let Err(buf) = lists[input].push(buf) {
                let full = std::mem::take(&mut lists[input]);
                if let Err(e) = Self::hand_back(route, input, full) {
                    first_err.get_or_insert(e);
                }
                if let Err(buf) = lists[input].push(buf) {
                    release_logged(route.owner, buf);
                }
            }
        }
        for (input, list) in lists.into_iter().enumerate() {
            if list.is_empty() {
                continue;
            }
            if let Err(e) = Self::hand_back(route, input, list) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn restore(route: &Route, buf: &BufferRef) -> Result<usize> {
        let word = buf.private(route.owner)?.ok_or_else(|| {
            LinkError::violation(format!(
                "buffer of stage {} never passed through stage {}",
                buf.owner(),
                route.owner
            ))
        })?;
        let (input, ch_num) = untag(word);
        if input >= route.inputs.len() {
            return Err(LinkError::violation(format!(
                "stage {} has no input {input}",
                route.owner
            )));
        }
        buf.update(|d| d.ch_num = ch_num)?;
        Ok(input)
    }

    fn hand_back(route: &Route, input: usize, list: BufferList) -> Result<()> {
        let InputQueue { prev, queue } = route.inputs[input];
        route.registry.put_empty_buffers(prev, queue, list)
    }
}

impl LinkOps for ForwardQueues {
    fn get_full_buffers(&self, queue: usize) -> Result<BufferList> {
        self.outputs.get_full_buffers(queue)
    }

    fn put_empty_buffers(&self, queue: usize, list: BufferList) -> Result<()> {
        let published = self.outputs.link_info().queues.len();
        let returned = self.return_home(list);
        if queue >= published {
            return Err(LinkError::invalid(format!("no output queue {queue}")));
        }
        returned
    }

    fn link_info(&self) -> LinkInfo {
        self.outputs.link_info()
    }
}

