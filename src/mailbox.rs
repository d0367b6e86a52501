//! Stage mailboxes: the only way control and data notifications reach a
//! stage's state machine.

use crate::error::{LinkError, Result};
use crate::registry::StageId;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The five commands a stage understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Allocate resources and validate wiring; must come first
    Create,
    /// Begin accepting data
    Start,
    /// Input is available on a predecessor queue
    NewData,
    /// Stop accepting data
    Stop,
    /// Release everything and exit
    Delete,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Create => "CREATE",
            Command::Start => "START",
            Command::NewData => "NEW_DATA",
            Command::Stop => "STOP",
            Command::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A command plus the optional reply channel of a waiting sender
#[derive(Debug)]
pub struct Message {
    cmd: Command,
    ack: Option<Sender<Result<()>>>,
}

impl Message {
    /// Fire-and-forget message
    pub fn new(cmd: Command) -> Self {
        Self { cmd, ack: None }
    }

    /// Message whose outcome is reported on the returned receiver
    pub fn with_ack(cmd: Command) -> (Self, Receiver<Result<()>>) {
        let (tx, rx) = channel::bounded(1);
        (Self { cmd, ack: Some(tx) }, rx)
    }

    /// The carried command
    pub fn command(&self) -> Command {
        self.cmd
    }

    /// True if a sender is waiting on the outcome
    pub fn wants_ack(&self) -> bool {
        self.ack.is_some()
    }

    /// Report the outcome to the waiting sender, if any
    pub fn acknowledge(self, result: Result<()>) {
        if let Some(ack) = self.ack {
            // The sender may have given up waiting
            let _ = ack.send(result);
        }
    }
}

/// Hook run after a message lands in the mailbox
pub type Waker = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Bounded message queue of one stage
///
/// Cloning gives another handle onto the same queue.
#[derive(Clone)]
pub struct Mailbox {
    id: StageId,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    closed: Arc<AtomicBool>,
    waker: Arc<RwLock<Option<Waker>>>,
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.id)
            .field("pending", &self.rx.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Mailbox {
    /// Create a mailbox for stage `id` holding up to `depth` messages
    pub fn new(id: StageId, depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(LinkError::Config(format!(
                "mailbox of stage {id} needs a non-zero depth"
            )));
        }
        let (tx, rx) = channel::bounded(depth);
        Ok(Self {
            id,
            tx,
            rx,
            closed: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(RwLock::new(None)),
        })
    }

    /// Owning stage
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Maximum number of pending messages
    pub fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(usize::MAX)
    }

    /// Messages waiting to be handled
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Post without blocking; a full mailbox gives `Again`
    pub fn try_post(&self, msg: Message) -> Result<()> {
        self.ensure_open()?;
        match self.tx.try_send(msg) {
            Ok(()) => self.wake(),
            Err(TrySendError::Full(_)) => Err(LinkError::Again),
            Err(TrySendError::Disconnected(_)) => Err(LinkError::MailboxClosed(self.id)),
        }
    }

    /// Post, blocking while the mailbox is full
    pub fn post(&self, msg: Message) -> Result<()> {
        self.ensure_open()?;
        self.tx
            .send(msg)
            .map_err(|_| LinkError::MailboxClosed(self.id))?;
        self.wake()
    }

    /// Block until a message arrives
    pub fn recv(&self) -> Option<Message> {
        self.rx.recv().ok()
    }

    /// Take a message if one is waiting
    pub fn try_recv(&self) -> Option<Message> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Refuse further posts
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// True once [`Mailbox::close`] was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Install or clear the hook run after every successful post
    pub fn set_waker(&self, waker: Option<Waker>) {
        *self.waker.write() = waker;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(LinkError::MailboxClosed(self.id))
        } else {
            Ok(())
        }
    }

    fn wake(&self) -> Result<()> {
        let waker = self.waker.read().clone();
        match waker {
            Some(wake) => wake(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_full_mailbox_returns_again() {
        let mbx = Mailbox::new(StageId::new(0, 1), 1).unwrap();
        mbx.try_post(Message::new(Command::NewData)).unwrap();
        assert!(matches!(
            mbx.try_post(Message::new(Command::NewData)),
            Err(LinkError::Again)
        ));
        assert_eq!(mbx.pending(), 1);
    }

    #[test]
    fn test_closed_mailbox_rejects_posts() {
        let mbx = Mailbox::new(StageId::new(0, 2), 4).unwrap();
        mbx.close();
        assert!(matches!(
            mbx.post(Message::new(Command::Start)),
            Err(LinkError::MailboxClosed(_))
        ));
    }

    #[test]
    fn test_ack_reaches_sender() {
        let mbx = Mailbox::new(StageId::new(0, 3), 4).unwrap();
        let (msg, reply) = Message::with_ack(Command::Create);
        mbx.post(msg).unwrap();
        let received = mbx.try_recv().unwrap();
        assert_eq!(received.command(), Command::Create);
        assert!(received.wants_ack());
        received.acknowledge(Err(LinkError::invalid("bad wiring")));
        assert!(matches!(reply.recv().unwrap(), Err(LinkError::InvalidParams(_))));
    }

    #[test]
    fn test_waker_runs_per_post() {
        let mbx = Mailbox::new(StageId::new(0, 4), 4).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        mbx.set_waker(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));
        mbx.post(Message::new(Command::Start)).unwrap();
        mbx.try_post(Message::new(Command::NewData)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        mbx.set_waker(None);
        mbx.post(Message::new(Command::Stop)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_depth_rejected() {
        assert!(matches!(
            Mailbox::new(StageId::new(0, 5), 0),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::NewData.to_string(), "NEW_DATA");
        assert_eq!(Command::Delete.to_string(), "DELETE");
    }
}
