use crate::buffer::{BufferList, BufferRef};
use crate::error::{LinkError, Result};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free FIFO of full buffers waiting on one output queue of a stage
///
/// The producing stage pushes; consumers drain it through the registry's
/// `get_full_buffers`. Buffers come out in the order they were pushed.
#[derive(Debug)]
pub struct FrameQueue {
    queue: ArrayQueue<BufferRef>,
    pushed: AtomicU64,
    rejected: AtomicU64,
}

impl FrameQueue {
    /// Create a queue holding up to `capacity` buffers
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(LinkError::invalid("frame queue capacity must be non-zero"));
        }
        Ok(Self {
            queue: ArrayQueue::new(capacity),
            pushed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Queue a full buffer, handing it back if the queue is full
    pub fn push(&self, buf: BufferRef) -> std::result::Result<(), BufferRef> {
        match self.queue.push(buf) {
            Ok(()) => {
                self.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(buf) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(buf)
            }
        }
    }

    /// Pop the oldest buffer
    pub fn pop(&self) -> Option<BufferRef> {
        self.queue.pop()
    }

    /// Move as many buffers as fit into `list`, oldest first
    pub fn drain_into(&self, list: &mut BufferList) -> usize {
        let mut moved = 0;
        while !list.is_full() {
            let Some(buf) = self.queue.pop() else { break };
            if let Err(buf) = list.push(buf) {
                // `is_full` was checked above and only this call pushes
                let _ = self.queue.push(buf);
                break;
            }
            moved += 1;
        }
        moved
    }

    /// Remove every queued buffer
    pub fn take_all(&self) -> Vec<BufferRef> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }

    /// Number of queued buffers
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of queued buffers
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Fill level as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() as u32 * 100) / self.capacity() as u32).min(100)
    }

    /// Buffers accepted since creation
    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Pushes refused because the queue was full
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
