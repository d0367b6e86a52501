use super::{InputQueue, OutputQueues};
use crate::buffer::{BufferList, BufferType};
use crate::error::{LinkError, Result};
use crate::registry::LinkOps;
use crate::stage::{Link, StageContext};
use parking_lot::Mutex;
use std::sync::Arc;

/// What a [`NullLink`] saw of one buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Input the buffer came from
    pub input: usize,
    /// Payload kind
    pub buf_type: BufferType,
    /// Channel
    pub ch_num: u32,
    /// Source timestamp (the sequence number, for a null source)
    pub src_timestamp: u64,
    /// Valid payload bytes as seen locally
    pub payload: Vec<u8>,
}

/// Shared record of everything a [`NullLink`] consumed
pub type ReceivedLog = Arc<Mutex<Vec<Received>>>;

/// Sink stage: takes every available buffer, records it and returns it
pub struct NullLink {
    inputs: Vec<InputQueue>,
    outputs: Arc<OutputQueues>,
    log: ReceivedLog,
}

impl NullLink {
    /// Sink draining `inputs`
    pub fn new(inputs: Vec<InputQueue>) -> Self {
        Self {
            inputs,
            outputs: Arc::new(OutputQueues::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle on the record of consumed buffers
    pub fn log(&self) -> ReceivedLog {
        Arc::clone(&self.log)
    }

    fn record(&self, input: usize, list: &BufferList) -> Result<()> {
        let mut log = self.log.lock();
        for buf in list.iter() {
            let desc = buf.descriptor()?;
            log.push(Received {
                input,
                buf_type: desc.buf_type,
                ch_num: desc.ch_num,
                src_timestamp: desc.src_timestamp,
                payload: buf.with_payload(|p| p.to_vec())?,
            });
        }
        Ok(())
    }
}

impl Link for NullLink {
    fn name(&self) -> &str {
        "null"
    }

    fn ops(&self) -> Arc<dyn LinkOps> {
        self.outputs.clone()
    }

    fn create(&mut self, ctx: &StageContext) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(LinkError::invalid("null link needs at least one input"));
        }
        for input in &self.inputs {
            input.validate(ctx.registry())?;
        }
        Ok(())
    }

    fn process(&mut self, ctx: &StageContext) -> Result<()> {
        for (index, input) in self.inputs.iter().enumerate() {
            let list = ctx.get_full_buffers(input.prev, input.queue)?;
            if list.is_empty() {
                continue;
            }
            let recorded = self.record(index, &list);
            ctx.put_empty_buffers(input.prev, input.queue, list)?;
            recorded?;
        }
        Ok(())
    }

    fn delete(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }
}
