//! Message-driven processing stages that exchange buffers across processors.
//!
//! A topology is a set of stages, each a [`Link`] driven by a
//! [`StageMachine`] through CREATE, START, NEW_DATA, STOP and DELETE.
//! Producers publish full buffers on output queues; consumers pull them as a
//! [`BufferList`], process them and hand them back. Buffers can be
//! duplicated or split without copying; the original returns to its pool
//! only after every derived descriptor is released.
//!
//! Stages on different processors communicate through [`IpcQueue`]s, ring
//! queues of fixed-size records in a [`SharedRegion`]. The IPC-out and
//! IPC-in stages in [`ipc`] bridge a topology across such a channel.
//!
//! Each stage runs either on its own thread or, with many others, on a
//! [`MultiStageScheduler`] that dispatches pending messages by priority.
//!
//! # Features
//!
//! - Ring queue with lap-bit full/empty disambiguation
//! - Generation-checked buffer handles with duplicate/split reference counts
//! - Strict per-stage command protocol; violations abort only that stage
//! - Cooperative priority scheduler multiplexing stages on one thread
//! - TOML configuration validated before anything is spawned
//! - Per-stage counters and NEW_DATA latency percentiles
//!
//! # Example
//!
//! ```ignore
//! use link_pipeline::links::{InputQueue, NullLink, NullSourceLink, NullSourceParams};
//! use link_pipeline::{PipelineBuilder, StageHost, StageId, StageRegistry, SystemConfig};
//! use std::sync::Arc;
//!
//! let src = StageId::new(0, 1);
//! let sink = StageId::new(0, 2);
//! let params = NullSourceParams {
//!     next: Some(sink),
//!     ..Default::default()
//! };
//! let pipeline = PipelineBuilder::new(Arc::new(StageRegistry::new()), SystemConfig::default())
//!     .add_stage(src, NullSourceLink::new(params), StageHost::Thread)
//!     .add_stage(sink, NullLink::new(vec![InputQueue::new(src, 0)]), StageHost::Thread)
//!     .build()?;
//!
//! pipeline.start()?;
//! pipeline.notify(src)?;
//! pipeline.stop()?;
//! pipeline.delete()?;
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod frame_queue;
pub mod ipc;
pub mod ipc_queue;
pub mod links;
pub mod mailbox;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod plugin;
pub mod registry;
pub mod scheduler;
pub mod stage;

// Re-exports for convenience
pub use buffer::{BufferDescriptor, BufferList, BufferPool, BufferRef, BufferType, Release};
pub use config::SystemConfig;
pub use error::{LinkError, Result};
pub use ipc::{IpcChannel, IpcInLink, IpcOutLink};
pub use ipc_queue::{IpcQueue, SharedRegion};
pub use mailbox::{Command, Mailbox, Message};
pub use memory::{HeapAllocator, MemAllocator, PoolId};
pub use metrics::{LinkStats, StatsSnapshot};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use plugin::{AlgorithmLink, AlgorithmPlugin};
pub use registry::{LinkInfo, LinkOps, StageId, StageRegistry};
pub use scheduler::MultiStageScheduler;
pub use stage::{Link, StageContext, StageHost, StageMachine, StageState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
