//! Stock stages and the output-queue plumbing every producing stage shares.

mod dup;
mod forward;
mod merge;
mod null;
mod null_src;
mod select;

pub use dup::DupLink;
pub use merge::MergeLink;
pub use null::{NullLink, Received, ReceivedLog};
pub use null_src::{NullSourceLink, NullSourceParams};
pub use select::{SelectLink, SelectOutput};

use crate::buffer::{BufferList, BufferRef};
use crate::error::{LinkError, Result};
use crate::frame_queue::FrameQueue;
use crate::registry::{LinkInfo, LinkOps, StageId, StageRegistry};
use parking_lot::RwLock;

/// One input of a consuming stage: output queue `queue` of stage `prev`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputQueue {
    /// Producing stage
    pub prev: StageId,
    /// Output queue of the producer
    pub queue: usize,
}

impl InputQueue {
    /// Input wired to `prev`'s output queue `queue`
    pub fn new(prev: StageId, queue: usize) -> Self {
        Self { prev, queue }
    }

    /// Check that the producer exists and publishes this queue
    pub fn validate(&self, registry: &StageRegistry) -> Result<LinkInfo> {
        let info = registry.link_info(self.prev)?;
        info.queue(self.queue)?;
        Ok(info)
    }
}

struct Opened {
    owner: StageId,
    queues: Vec<FrameQueue>,
    info: LinkInfo,
    list_capacity: usize,
}

/// Output queues of a producing stage, published as its [`LinkOps`]
///
/// Starts closed: consumers see empty lists until the owner opens it
/// during CREATE.
#[derive(Default)]
pub struct OutputQueues {
    opened: RwLock<Option<Opened>>,
}

impl OutputQueues {
    /// Closed set of queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Create one FIFO of `depth` buffers per queue in `info`
    pub fn open(
        &self,
        owner: StageId,
        info: LinkInfo,
        depth: usize,
        list_capacity: usize,
    ) -> Result<()> {
        let queues = (0..info.queues.len())
            .map(|_| FrameQueue::new(depth))
            .collect::<Result<Vec<_>>>()?;
        // Surface a bad capacity now instead of on the first pull
        BufferList::with_capacity(list_capacity)?;
        let mut opened = self.opened.write();
        if opened.is_some() {
            return Err(LinkError::violation(format!(
                "stage {owner}: output queues opened twice"
            )));
        }
        *opened = Some(Opened {
            owner,
            queues,
            info,
            list_capacity,
        });
        Ok(())
    }

    /// Close and hand back whatever is still queued
    pub fn close(&self) -> Vec<BufferRef> {
        match self.opened.write().take() {
            Some(opened) => opened.queues.iter().flat_map(FrameQueue::take_all).collect(),
            None => Vec::new(),
        }
    }

    /// Queue a full buffer on output `queue`
    ///
    /// The buffer comes back if the queue is full, closed or unknown; the
    /// caller decides how to drop it.
    pub fn push(&self, queue: usize, buf: BufferRef) -> std::result::Result<(), BufferRef> {
        let opened = self.opened.read();
        match opened.as_ref().and_then(|o| o.queues.get(queue)) {
            Some(q) => q.push(buf),
            None => Err(buf),
        }
    }

    /// Number of queued buffers on output `queue`
    pub fn queued(&self, queue: usize) -> usize {
        self.opened
            .read()
            .as_ref()
            .and_then(|o| o.queues.get(queue))
            .map(FrameQueue::len)
            .unwrap_or(0)
    }
}

/// Give a buffer back to its pool, logging instead of failing
pub(crate) fn release_logged(owner: StageId, buf: BufferRef) {
    if let Err(e) = buf.release() {
        tracing::error!(stage = %owner, error = %e, "buffer release failed");
    }
}

impl LinkOps for OutputQueues {
    fn get_full_buffers(&self, queue: usize) -> Result<BufferList> {
        let opened = self.opened.read();
        let Some(opened) = opened.as_ref() else {
            return Ok(BufferList::new());
        };
        let q = opened.queues.get(queue).ok_or_else(|| {
            LinkError::invalid(format!(
                "stage {} has no output queue {queue}",
                opened.owner
            ))
        })?;
        let mut list = BufferList::with_capacity(opened.list_capacity)?;
        q.drain_into(&mut list);
        Ok(list)
    }

    fn put_empty_buffers(&self, queue: usize, list: BufferList) -> Result<()> {
        let mut first_err = None;
        {
            let opened = self.opened.read();
            if let Some(o) = opened.as_ref() {
                if queue >= o.queues.len() {
                    first_err = Some(LinkError::invalid(format!(
                        "stage {} has no output queue {queue}",
                        o.owner
                    )));
                }
            }
        }
        // Buffers go home even when the queue id was wrong
        for buf in list {
            if let Err(e) = buf.release() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn link_info(&self) -> LinkInfo {
        self.opened
            .read()
            .as_ref()
            .map(|o| o.info.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::memory::{HeapAllocator, PoolId};
    use crate::registry::QueueInfo;
    use std::sync::Arc;

    fn info(queues: usize) -> LinkInfo {
        LinkInfo {
            queues: vec![QueueInfo::default(); queues],
        }
    }

    #[test]
    fn test_closed_queues_report_nothing() {
        let out = OutputQueues::new();
        assert!(out.get_full_buffers(0).unwrap().is_empty());
        assert_eq!(out.link_info(), LinkInfo::default());
    }

    #[test]
    fn test_pull_and_return() {
        let owner = StageId::new(0, 1);
        let pool = BufferPool::new(owner, 3, 0, Arc::new(HeapAllocator::new()), PoolId::FRAME, 0)
            .unwrap();
        let out = OutputQueues::new();
        out.open(owner, info(2), 4, 2).unwrap();
        for _ in 0..3 {
            out.push(1, pool.acquire().unwrap()).unwrap();
        }
        assert!(matches!(
            out.get_full_buffers(2),
            Err(LinkError::InvalidParams(_))
        ));

        let first = out.get_full_buffers(1).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(out.queued(1), 1);
        out.put_empty_buffers(1, first).unwrap();
        assert_eq!(pool.status().free, 2);

        let rest = out.get_full_buffers(1).unwrap();
        assert!(matches!(
            out.put_empty_buffers(5, rest),
            Err(LinkError::InvalidParams(_))
        ));
        assert_eq!(pool.status().free, 3);
    }

    #[test]
    fn test_close_returns_queued() {
        let owner = StageId::new(0, 2);
        let pool = BufferPool::new(owner, 2, 0, Arc::new(HeapAllocator::new()), PoolId::FRAME, 0)
            .unwrap();
        let out = OutputQueues::new();
        out.open(owner, info(1), 4, 4).unwrap();
        out.push(0, pool.acquire().unwrap()).unwrap();
        out.push(0, pool.acquire().unwrap()).unwrap();
        let left = out.close();
        assert_eq!(left.len(), 2);
        for buf in left {
            buf.release().unwrap();
        }
        let rejected = out.push(0, pool.acquire().unwrap()).unwrap_err();
        rejected.release().unwrap();
    }
}
