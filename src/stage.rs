use crate::buffer::BufferList;
use crate::config::SystemConfig;
use crate::error::{LinkError, Result};
use crate::mailbox::{Command, Mailbox, Message};
use crate::memory::MemAllocator;
use crate::metrics::LinkStats;
use crate::registry::{LinkOps, StageId, StageRegistry};
use crate::scheduler::MultiStageScheduler;
use crossbeam::channel::Receiver;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Behaviour of one processing stage
///
/// The state machine calls these in protocol order only: `create` first,
/// `process` only while running, `delete` last. A link never sees an
/// out-of-order call.
pub trait Link: Send + 'static {
    /// Human-readable name used in logs
    fn name(&self) -> &str;

    /// Callbacks published in the registry when the stage is spawned
    ///
    /// Neighbours may call them before `create` runs, so they must cope with
    /// an uncreated stage (typically by reporting no buffers).
    fn ops(&self) -> Arc<dyn LinkOps>;

    /// Allocate resources and validate wiring
    fn create(&mut self, ctx: &StageContext) -> Result<()>;

    /// Called on every transition into running
    fn start(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Handle one NEW_DATA notification
    fn process(&mut self, ctx: &StageContext) -> Result<()>;

    /// Called when leaving running
    fn stop(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Release everything allocated in `create`
    fn delete(&mut self, ctx: &StageContext) -> Result<()>;
}

/// What a running stage can reach: its id, the registry, its counters and
/// the system limits
#[derive(Clone)]
pub struct StageContext {
    id: StageId,
    registry: Arc<StageRegistry>,
    stats: LinkStats,
    config: SystemConfig,
    allocator: Arc<dyn MemAllocator>,
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}

impl StageContext {
    /// Context for stage `id`
    pub fn new(
        id: StageId,
        registry: Arc<StageRegistry>,
        config: SystemConfig,
        allocator: Arc<dyn MemAllocator>,
    ) -> Self {
        Self {
            id,
            registry,
            stats: LinkStats::new(),
            config,
            allocator,
        }
    }

    /// This stage's id
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Shared stage table
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// This stage's counters
    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// System limits
    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Allocator for pools and plugin memory
    pub fn allocator(&self) -> &Arc<dyn MemAllocator> {
        &self.allocator
    }

    /// Pull from a predecessor's output queue
    pub fn get_full_buffers(&self, prev: StageId, queue: usize) -> Result<BufferList> {
        let list = self.registry.get_full_buffers(prev, queue)?;
        self.stats.record_received(list.len());
        Ok(list)
    }

    /// Hand buffers back to the predecessor they came from
    pub fn put_empty_buffers(&self, prev: StageId, queue: usize, list: BufferList) -> Result<()> {
        let n = list.len();
        if n == 0 {
            return Ok(());
        }
        self.registry.put_empty_buffers(prev, queue, list)?;
        self.stats.record_released(n);
        Ok(())
    }

    /// Wake a successor
    ///
    /// A full mailbox already holds a NEW_DATA for it, so `Again` is fine.
    pub fn notify(&self, next: StageId) -> Result<()> {
        match self.registry.notify(next) {
            Err(LinkError::Again) => {
                tracing::trace!(
                    stage = %self.id,
                    %next,
                    "successor mailbox full, already notified"
                );
                Ok(())
            }
            other => other,
        }
    }
}

/// Lifecycle state of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Spawned and registered, waiting for CREATE
    Idle,
    /// Resources allocated
    Created,
    /// Accepting NEW_DATA
    Running,
    /// Not accepting NEW_DATA; may be restarted
    Stopped,
    /// Terminal
    Deleted,
}

/// Whether the host should keep feeding messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Wait for the next message
    Continue,
    /// The stage is gone; stop hosting it
    Exit,
}

/// Command-driven state machine around one [`Link`]
pub struct StageMachine {
    link: Box<dyn Link>,
    ctx: StageContext,
    state: StageState,
}

impl fmt::Debug for StageMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageMachine")
            .field("id", &self.ctx.id)
            .field("link", &self.link.name())
            .field("state", &self.state)
            .finish()
    }
}

impl StageMachine {
    /// Machine in `Idle` state
    pub fn new(link: Box<dyn Link>, ctx: StageContext) -> Self {
        Self {
            link,
            ctx,
            state: StageState::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> StageState {
        self.state
    }

    /// Stage id
    pub fn id(&self) -> StageId {
        self.ctx.id
    }

    /// Context shared with the link
    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Apply one message and acknowledge it if the sender waits
    pub fn handle(&mut self, msg: Message) -> Flow {
        use StageState::*;

        let cmd = msg.command();
        match (self.state, cmd) {
            (Idle, Command::Create) => {
                let result = self.link.create(&self.ctx);
                match &result {
                    Ok(()) => {
                        tracing::info!(stage = %self.ctx.id, link = self.link.name(), "created");
                        self.transition(Created);
                    }
                    Err(e) => {
                        tracing::error!(
                            stage = %self.ctx.id,
                            link = self.link.name(),
                            error = %e,
                            "create failed"
                        );
                    }
                }
                msg.acknowledge(result);
                Flow::Continue
            }
            (Created | Stopped, Command::Start) => {
                let result = self.link.start(&self.ctx);
                if result.is_ok() {
                    self.transition(Running);
                }
                msg.acknowledge(result);
                Flow::Continue
            }
            (Running, Command::NewData) => {
                self.run_cycle();
                msg.acknowledge(Ok(()));
                Flow::Continue
            }
            (Created | Stopped, Command::NewData) => {
                tracing::trace!(
                    stage = %self.ctx.id,
                    state = ?self.state,
                    "NEW_DATA while not running, dropped"
                );
                msg.acknowledge(Ok(()));
                Flow::Continue
            }
            (Running, Command::Stop) => {
                let result = self.link.stop(&self.ctx);
                if let Err(e) = &result {
                    tracing::error!(stage = %self.ctx.id, error = %e, "stop failed");
                }
                self.transition(Stopped);
                msg.acknowledge(result);
                Flow::Continue
            }
            (Created | Stopped, Command::Stop) => {
                self.transition(Stopped);
                msg.acknowledge(Ok(()));
                Flow::Continue
            }
            (Created | Running | Stopped, Command::Delete) => {
                if self.state == Running {
                    if let Err(e) = self.link.stop(&self.ctx) {
                        tracing::error!(
                            stage = %self.ctx.id,
                            error = %e,
                            "stop before delete failed"
                        );
                    }
                }
                let result = self.link.delete(&self.ctx);
                self.finish();
                tracing::info!(stage = %self.ctx.id, link = self.link.name(), "deleted");
                msg.acknowledge(result);
                Flow::Exit
            }
            (state, cmd) => {
                let err = LinkError::violation(format!(
                    "stage {}: {cmd} not accepted in state {state:?}",
                    self.ctx.id
                ));
                tracing::error!(
                    stage = %self.ctx.id,
                    link = self.link.name(),
                    error = %err,
                    "aborting stage"
                );
                self.finish();
                msg.acknowledge(Err(err));
                Flow::Exit
            }
        }
    }

    /// Block on `mailbox` until the stage exits
    pub fn run(mut self, mailbox: Mailbox) {
        while let Some(msg) = mailbox.recv() {
            if self.handle(msg) == Flow::Exit {
                break;
            }
        }
    }

    fn run_cycle(&mut self) {
        let start = Instant::now();
        if let Err(e) = self.link.process(&self.ctx) {
            self.ctx.stats.record_error();
            tracing::error!(
                stage = %self.ctx.id,
                link = self.link.name(),
                error = %e,
                "processing failed"
            );
        }
        self.ctx.stats.record_cycle(start.elapsed());
    }

    fn transition(&mut self, next: StageState) {
        tracing::debug!(stage = %self.ctx.id, from = ?self.state, to = ?next, "state change");
        self.state = next;
    }

    fn finish(&mut self) {
        self.transition(StageState::Deleted);
        if let Err(e) = self.ctx.registry.unregister(self.ctx.id) {
            tracing::warn!(stage = %self.ctx.id, error = %e, "unregister on exit failed");
        }
    }
}

/// Where a stage's state machine runs
#[derive(Clone)]
pub enum StageHost {
    /// A dedicated thread blocked on the stage mailbox
    Thread,
    /// A shared thread multiplexing several stages
    Scheduled {
        /// Scheduler to attach to
        scheduler: Arc<MultiStageScheduler>,
        /// Pending-queue priority, 0 highest
        priority: usize,
    },
}

impl fmt::Debug for StageHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageHost::Thread => f.write_str("Thread"),
            StageHost::Scheduled { scheduler, priority } => f
                .debug_struct("Scheduled")
                .field("scheduler", &scheduler.name())
                .field("priority", priority)
                .finish(),
        }
    }
}

enum HandleKind {
    Thread(JoinHandle<()>),
    Scheduled {
        scheduler: Arc<MultiStageScheduler>,
        done: Receiver<()>,
    },
}

/// Owner's handle on a spawned stage
pub struct StageHandle {
    id: StageId,
    name: String,
    stats: LinkStats,
    kind: HandleKind,
}

impl fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl StageHandle {
    /// Stage id
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Link name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stage's counters
    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Wait for the stage to exit, then release its host
    ///
    /// Only returns once the stage has handled DELETE (or aborted).
    pub fn join(self) -> Result<()> {
        match self.kind {
            HandleKind::Thread(handle) => handle
                .join()
                .map_err(|_| LinkError::ThreadError(format!("stage {} panicked", self.id))),
            HandleKind::Scheduled { scheduler, done } => {
                // Disconnected means the scheduler already dropped the stage
                let _ = done.recv();
                scheduler.detach(self.id)
            }
        }
    }
}

/// Register `link` under `ctx.id()` and start hosting its state machine
///
/// The stage is left in `Idle`; the first command it accepts is CREATE.
pub fn spawn_stage(
    link: Box<dyn Link>,
    ctx: StageContext,
    host: &StageHost,
) -> Result<StageHandle> {
    let id = ctx.id;
    let name = link.name().to_string();
    let stats = ctx.stats.clone();
    let registry = Arc::clone(&ctx.registry);

    let mailbox = Mailbox::new(id, ctx.config.mailbox.depth)?;
    registry.register(id, link.ops(), mailbox.clone())?;
    let machine = StageMachine::new(link, ctx);

    let kind = match host {
        StageHost::Thread => {
            let spawned = thread::Builder::new()
                .name(format!("link-{}-{}", id.proc_id(), id.link_index()))
                .spawn(move || machine.run(mailbox));
            match spawned {
                Ok(handle) => HandleKind::Thread(handle),
                Err(e) => {
                    let _ = registry.unregister(id);
                    return Err(LinkError::ThreadError(format!(
                        "failed to spawn stage {id}: {e}"
                    )));
                }
            }
        }
        StageHost::Scheduled {
            scheduler,
            priority,
        } => match scheduler.attach(machine, mailbox, *priority) {
            Ok(done) => HandleKind::Scheduled {
                scheduler: Arc::clone(scheduler),
                done,
            },
            Err(e) => {
                let _ = registry.unregister(id);
                return Err(e);
            }
        },
    };

    tracing::debug!(stage = %id, link = %name, host = ?host, "spawned");
    Ok(StageHandle {
        id,
        name,
        stats,
        kind,
    })
}
