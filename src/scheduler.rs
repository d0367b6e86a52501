//! Cooperative scheduler running many stage state machines on one thread.
//!
//! Posting to an attached stage's mailbox pushes the stage id onto its
//! priority's pending queue and posts the shared semaphore once. The loop
//! wakes on the semaphore and empties pending queues from highest priority
//! (0) down, handling one message per queued id. The thread exists only
//! while at least one stage is attached.

use crate::config::SchedulerConfig;
use crate::error::{LinkError, Result};
use crate::mailbox::{Mailbox, Waker};
use crate::registry::StageId;
use crate::stage::{Flow, StageMachine};
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Upper bound on pending-queue priorities
pub const MAX_PRIORITY_QUEUES: usize = 4;

/// Counting semaphore
#[derive(Debug, Default)]
struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn post(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }
}

struct Attached {
    machine: Mutex<StageMachine>,
    mailbox: Mailbox,
    priority: usize,
    done: Sender<()>,
}

struct Shared {
    name: String,
    sem: Semaphore,
    pending: Vec<ArrayQueue<StageId>>,
    stages: RwLock<HashMap<StageId, Arc<Attached>>>,
    exit: AtomicBool,
}

impl Shared {
    fn trigger(&self, id: StageId, priority: usize) -> Result<()> {
        self.pending[priority].push(id).map_err(|_| {
            LinkError::exhausted(format!(
                "scheduler {}: pending queue {priority} is full",
                self.name
            ))
        })?;
        self.sem.post();
        Ok(())
    }

    fn run(&self) {
        tracing::debug!(scheduler = %self.name, "loop started");
        loop {
            self.sem.wait();
            if self.exit.load(Ordering::Acquire) {
                break;
            }
            for queue in &self.pending {
                while let Some(id) = queue.pop() {
                    self.dispatch(id);
                }
            }
        }
        tracing::debug!(scheduler = %self.name, "loop exited");
    }

    fn dispatch(&self, id: StageId) {
        let Some(stage) = self.stages.read().get(&id).cloned() else {
            tracing::trace!(scheduler = %self.name, stage = %id, "stage detached, entry skipped");
            return;
        };
        let Some(msg) = stage.mailbox.try_recv() else {
            return;
        };
        let flow = stage.machine.lock().handle(msg);
        if flow == Flow::Exit {
            stage.mailbox.set_waker(None);
            self.stages.write().remove(&id);
            let _ = stage.done.send(());
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    refs: usize,
    thread: Option<JoinHandle<()>>,
}

/// Shared execution context for several stages
pub struct MultiStageScheduler {
    shared: Arc<Shared>,
    queue_depth: usize,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for MultiStageScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiStageScheduler")
            .field("name", &self.shared.name)
            .field("priorities", &self.shared.pending.len())
            .field("attached", &self.attached())
            .finish()
    }
}

impl MultiStageScheduler {
    /// Create an idle scheduler; its thread starts on the first attach
    pub fn new(name: impl Into<String>, config: &SchedulerConfig) -> Result<Arc<Self>> {
        let name = name.into();
        if config.priority_queues == 0 || config.priority_queues > MAX_PRIORITY_QUEUES {
            return Err(LinkError::Config(format!(
                "scheduler {name}: priority_queues must be in 1..={MAX_PRIORITY_QUEUES}, got {}",
                config.priority_queues
            )));
        }
        if config.queue_depth == 0 {
            return Err(LinkError::Config(format!(
                "scheduler {name}: queue_depth must be non-zero"
            )));
        }
        Ok(Arc::new(Self {
            shared: Arc::new(Shared {
                name,
                sem: Semaphore::default(),
                pending: (0..config.priority_queues)
                    .map(|_| ArrayQueue::new(config.queue_depth))
                    .collect(),
                stages: RwLock::new(HashMap::new()),
                exit: AtomicBool::new(false),
            }),
            queue_depth: config.queue_depth,
            lifecycle: Mutex::new(Lifecycle::default()),
        }))
    }

    /// Scheduler name, also the thread name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of priority levels
    pub fn priorities(&self) -> usize {
        self.shared.pending.len()
    }

    /// Stages currently attached
    pub fn attached(&self) -> usize {
        self.lifecycle.lock().refs
    }

    /// True while the shared thread exists
    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().thread.is_some()
    }

    /// Start dispatching `mailbox` messages to `machine` at `priority`
    ///
    /// A priority beyond the configured range is clamped to the lowest. The
    /// returned receiver fires once the stage exits.
    pub fn attach(
        &self,
        machine: StageMachine,
        mailbox: Mailbox,
        priority: usize,
    ) -> Result<Receiver<()>> {
        let id = machine.id();
        let lowest = self.shared.pending.len() - 1;
        let priority = if priority > lowest {
            tracing::warn!(
                scheduler = %self.shared.name,
                stage = %id,
                priority,
                lowest,
                "priority out of range, clamped"
            );
            lowest
        } else {
            priority
        };

        let mut lifecycle = self.lifecycle.lock();
        let mut stages = self.shared.stages.write();
        if stages.contains_key(&id) {
            return Err(LinkError::DuplicateStage(id));
        }
        // Every pending entry stands for one queued message
        let reserved: usize = stages
            .values()
            .filter(|s| s.priority == priority)
            .map(|s| s.mailbox.capacity())
            .sum();
        if reserved + mailbox.capacity() > self.queue_depth {
            return Err(LinkError::exhausted(format!(
                "scheduler {}: priority {priority} would need {} pending slots, {} configured",
                self.shared.name,
                reserved + mailbox.capacity(),
                self.queue_depth
            )));
        }

        let (done_tx, done_rx) = channel::bounded(1);
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let waker: Waker = Arc::new(move || match weak.upgrade() {
            Some(shared) => shared.trigger(id, priority),
            None => Err(LinkError::MailboxClosed(id)),
        });
        mailbox.set_waker(Some(waker));
        stages.insert(
            id,
            Arc::new(Attached {
                machine: Mutex::new(machine),
                mailbox: mailbox.clone(),
                priority,
                done: done_tx,
            }),
        );

        if lifecycle.refs == 0 {
            self.shared.exit.store(false, Ordering::Release);
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(self.shared.name.clone())
                .spawn(move || shared.run());
            match spawned {
                Ok(handle) => lifecycle.thread = Some(handle),
                Err(e) => {
                    stages.remove(&id);
                    mailbox.set_waker(None);
                    return Err(LinkError::ThreadError(format!(
                        "scheduler {}: {e}",
                        self.shared.name
                    )));
                }
            }
            tracing::info!(scheduler = %self.shared.name, "thread started");
        }
        lifecycle.refs += 1;
        tracing::debug!(
            scheduler = %self.shared.name,
            stage = %id,
            priority,
            refs = lifecycle.refs,
            "attached"
        );

        // Messages posted before the waker was installed
        for _ in 0..mailbox.pending() {
            self.shared.trigger(id, priority)?;
        }
        Ok(done_rx)
    }

    /// Drop one attachment; the last one stops and joins the thread
    ///
    /// A stage that has not exited yet is removed without further messages.
    pub fn detach(&self, id: StageId) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.refs == 0 {
            return Err(LinkError::violation(format!(
                "scheduler {}: detach of {id} with nothing attached",
                self.shared.name
            )));
        }
        if let Some(stage) = self.shared.stages.write().remove(&id) {
            stage.mailbox.set_waker(None);
            tracing::warn!(scheduler = %self.shared.name, stage = %id, "detached before exit");
        }
        lifecycle.refs -= 1;
        tracing::debug!(
            scheduler = %self.shared.name,
            stage = %id,
            refs = lifecycle.refs,
            "detached"
        );

        if lifecycle.refs == 0 {
            self.shared.exit.store(true, Ordering::Release);
            self.shared.sem.post();
            if let Some(handle) = lifecycle.thread.take() {
                handle.join().map_err(|_| {
                    LinkError::ThreadError(format!("scheduler {} panicked", self.shared.name))
                })?;
            }
            tracing::info!(scheduler = %self.shared.name, "thread stopped");
        }
        Ok(())
    }
}
