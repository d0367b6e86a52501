//! Process-wide stage table.
//!
//! Stages never hold references to each other. A consumer pulls from its
//! producer by id through [`StageRegistry::get_full_buffers`], returns the
//! buffers through [`StageRegistry::put_empty_buffers`] and wakes its
//! successors with [`StageRegistry::notify`]. Rewiring a topology means
//! changing ids, not code.

use crate::buffer::{BufferList, BufferType};
use crate::error::{LinkError, Result};
use crate::mailbox::{Command, Mailbox, Message};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const LINK_INDEX_MASK: u32 = 0xFF;
const PROC_ID_SHIFT: u32 = 8;
const PROC_ID_MASK: u32 = 0xF;

/// Stage identifier: processor id in bits 8..12, link index in bits 0..8
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u32);

impl StageId {
    /// Compose an id from a processor id (`< 16`) and a link index (`< 256`)
    pub const fn new(proc_id: u32, link_index: u32) -> Self {
        StageId(((proc_id & PROC_ID_MASK) << PROC_ID_SHIFT) | (link_index & LINK_INDEX_MASK))
    }

    /// Processor the stage runs on
    pub const fn proc_id(self) -> u32 {
        (self.0 >> PROC_ID_SHIFT) & PROC_ID_MASK
    }

    /// Index of the stage on its processor
    pub const fn link_index(self) -> u32 {
        self.0 & LINK_INDEX_MASK
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}:L{}", self.proc_id(), self.link_index())
    }
}

/// What one channel of an output queue carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelInfo {
    /// Payload kind
    pub buf_type: BufferType,
    /// Largest payload the channel produces
    pub max_payload_size: u32,
    /// Producer-defined flags
    pub flags: u32,
}

/// Channels of one output queue
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueInfo {
    /// Channel metadata, indexed by channel number
    pub channels: Vec<ChannelInfo>,
}

/// Output topology a stage publishes to its consumers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkInfo {
    /// Output queues, indexed by queue id
    pub queues: Vec<QueueInfo>,
}

impl LinkInfo {
    /// Look up output queue `queue`, failing if the producer has none
    pub fn queue(&self, queue: usize) -> Result<&QueueInfo> {
        self.queues.get(queue).ok_or_else(|| {
            LinkError::invalid(format!(
                "output queue {queue} does not exist ({} published)",
                self.queues.len()
            ))
        })
    }
}

/// Callbacks a stage publishes so that neighbours can exchange buffers
/// with it
pub trait LinkOps: Send + Sync {
    /// Hand over whatever full buffers are ready on output queue `queue`
    ///
    /// Never blocks; an empty list means "try later".
    fn get_full_buffers(&self, queue: usize) -> Result<BufferList>;

    /// Take back buffers previously handed out from output queue `queue`
    fn put_empty_buffers(&self, queue: usize, list: BufferList) -> Result<()>;

    /// Current output topology
    fn link_info(&self) -> LinkInfo;
}

struct Entry {
    ops: Arc<dyn LinkOps>,
    mailbox: Mailbox,
}

/// Table mapping a [`StageId`] to its callbacks and mailbox
///
/// Built once per process and shared by `Arc`. Entries are added when a
/// stage is spawned and removed when it exits.
#[derive(Default)]
pub struct StageRegistry {
    entries: RwLock<HashMap<StageId, Entry>>,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.ids())
            .finish()
    }
}

impl StageRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a stage's callbacks and mailbox
    pub fn register(&self, id: StageId, ops: Arc<dyn LinkOps>, mailbox: Mailbox) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return Err(LinkError::DuplicateStage(id));
        }
        entries.insert(id, Entry { ops, mailbox });
        tracing::debug!(stage = %id, "registered");
        Ok(())
    }

    /// Remove a stage and close its mailbox
    pub fn unregister(&self, id: StageId) -> Result<()> {
        let entry = self
            .entries
            .write()
            .remove(&id)
            .ok_or(LinkError::NotRegistered(id))?;
        entry.mailbox.close();
        tracing::debug!(stage = %id, "unregistered");
        Ok(())
    }

    /// True if `id` is in the table
    pub fn is_registered(&self, id: StageId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> Vec<StageId> {
        let mut ids: Vec<_> = self.entries.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered stages
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if no stage is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn ops(&self, id: StageId) -> Result<Arc<dyn LinkOps>> {
        self.entries
            .read()
            .get(&id)
            .map(|e| Arc::clone(&e.ops))
            .ok_or(LinkError::NotRegistered(id))
    }

    fn mailbox(&self, id: StageId) -> Result<Mailbox> {
        self.entries
            .read()
            .get(&id)
            .map(|e| e.mailbox.clone())
            .ok_or(LinkError::NotRegistered(id))
    }

    /// Pull ready buffers from output queue `queue` of stage `id`
    pub fn get_full_buffers(&self, id: StageId, queue: usize) -> Result<BufferList> {
        self.ops(id)?.get_full_buffers(queue)
    }

    /// Return buffers to output queue `queue` of stage `id`
    ///
    /// If the stage is gone the buffers are released directly so that
    /// their pools still see them come back.
    pub fn put_empty_buffers(&self, id: StageId, queue: usize, list: BufferList) -> Result<()> {
        match self.ops(id) {
            Ok(ops) => ops.put_empty_buffers(queue, list),
            Err(e) => {
                for buf in list {
                    if let Err(release_err) = buf.release() {
                        tracing::error!(
                            stage = %id,
                            error = %release_err,
                            "orphaned buffer release failed"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Output topology of stage `id`
    pub fn link_info(&self, id: StageId) -> Result<LinkInfo> {
        Ok(self.ops(id)?.link_info())
    }

    /// Tell stage `id` that new data is ready, without waiting
    ///
    /// A full mailbox gives `Again`; the stage still has a NEW_DATA queued
    /// and will pull everything available when it handles it.
    pub fn notify(&self, id: StageId) -> Result<()> {
        self.mailbox(id)?.try_post(Message::new(Command::NewData))
    }

    /// Send `cmd` to stage `id` and wait for its acknowledgement
    pub fn send_command(&self, id: StageId, cmd: Command) -> Result<()> {
        let mailbox = self.mailbox(id)?;
        let (msg, reply) = Message::with_ack(cmd);
        mailbox.post(msg)?;
        reply.recv().map_err(|_| LinkError::MailboxClosed(id))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOutputs;

    impl LinkOps for NoOutputs {
        fn get_full_buffers(&self, _queue: usize) -> Result<BufferList> {
            Ok(BufferList::new())
        }

        fn put_empty_buffers(&self, _queue: usize, _list: BufferList) -> Result<()> {
            Ok(())
        }

        fn link_info(&self) -> LinkInfo {
            LinkInfo {
                queues: vec![QueueInfo::default()],
            }
        }
    }

    fn entry(id: StageId) -> (Arc<dyn LinkOps>, Mailbox) {
        (Arc::new(NoOutputs), Mailbox::new(id, 2).unwrap())
    }

    #[test]
    fn test_stage_id_fields() {
        let id = StageId::new(3, 0x42);
        assert_eq!(id.0, 0x342);
        assert_eq!(id.proc_id(), 3);
        assert_eq!(id.link_index(), 0x42);
        assert_eq!(id.to_string(), "P3:L66");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = StageRegistry::new();
        let id = StageId::new(0, 1);
        let (ops, mbx) = entry(id);
        registry.register(id, ops, mbx).unwrap();
        let (ops, mbx) = entry(id);
        assert!(matches!(
            registry.register(id, ops, mbx),
            Err(LinkError::DuplicateStage(dup)) if dup == id
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dispatch_to_unknown_stage() {
        let registry = StageRegistry::new();
        let id = StageId::new(1, 9);
        assert!(matches!(
            registry.get_full_buffers(id, 0),
            Err(LinkError::NotRegistered(_))
        ));
        assert!(matches!(registry.notify(id), Err(LinkError::NotRegistered(_))));
    }

    #[test]
    fn test_unregister_closes_mailbox() {
        let registry = StageRegistry::new();
        let id = StageId::new(0, 2);
        let (ops, mbx) = entry(id);
        registry.register(id, ops, mbx.clone()).unwrap();
        registry.notify(id).unwrap();
        registry.unregister(id).unwrap();
        assert!(mbx.is_closed());
        assert!(!registry.is_registered(id));
        assert!(matches!(
            registry.unregister(id),
            Err(LinkError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_notify_reports_full_mailbox() {
        let registry = StageRegistry::new();
        let id = StageId::new(0, 3);
        let (ops, mbx) = entry(id);
        registry.register(id, ops, mbx.clone()).unwrap();
        registry.notify(id).unwrap();
        registry.notify(id).unwrap();
        assert!(matches!(registry.notify(id), Err(LinkError::Again)));
        assert_eq!(mbx.try_recv().map(|m| m.command()), Some(Command::NewData));
    }

    #[test]
    fn test_link_info_lookup() {
        let registry = StageRegistry::new();
        let id = StageId::new(0, 4);
        let (ops, mbx) = entry(id);
        registry.register(id, ops, mbx).unwrap();
        let info = registry.link_info(id).unwrap();
        assert!(info.queue(0).is_ok());
        assert!(matches!(info.queue(1), Err(LinkError::InvalidParams(_))));
    }
}
