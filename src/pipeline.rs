use crate::config::SystemConfig;
use crate::error::{LinkError, Result};
use crate::mailbox::Command;
use crate::memory::{HeapAllocator, MemAllocator};
use crate::metrics::LinkStats;
use crate::registry::{StageId, StageRegistry};
use crate::stage::{spawn_stage, Link, StageContext, StageHandle, StageHost};
use std::collections::HashSet;
use std::sync::Arc;

/// A stage waiting to be spawned
struct PendingStage {
    id: StageId,
    link: Box<dyn Link>,
    host: StageHost,
}

/// Builder for a topology of stages
///
/// Stages are added in data-flow order: producers before their consumers.
pub struct PipelineBuilder {
    registry: Arc<StageRegistry>,
    config: SystemConfig,
    allocator: Arc<dyn MemAllocator>,
    stages: Vec<PendingStage>,
}

impl PipelineBuilder {
    /// Create a builder registering its stages in `registry`
    pub fn new(registry: Arc<StageRegistry>, config: SystemConfig) -> Self {
        Self {
            registry,
            config,
            allocator: Arc::new(HeapAllocator::new()),
            stages: Vec::new(),
        }
    }

    /// Allocate pools and plugin memory from `allocator`
    pub fn with_allocator(mut self, allocator: Arc<dyn MemAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Add a stage
    pub fn add_stage(mut self, id: StageId, link: impl Link, host: StageHost) -> Self {
        self.stages.push(PendingStage {
            id,
            link: Box::new(link),
            host,
        });
        self
    }

    /// Spawn every stage and CREATE them in data-flow order
    ///
    /// Any failure tears down what was already spawned, so a misconfigured
    /// topology leaves nothing registered behind.
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        if self.stages.is_empty() {
            return Err(LinkError::Config("pipeline has no stages".into()));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id) {
                return Err(LinkError::DuplicateStage(stage.id));
            }
        }

        let mut pipeline = Pipeline {
            registry: Arc::clone(&self.registry),
            stages: Vec::with_capacity(self.stages.len()),
        };

        for stage in self.stages {
            let ctx = StageContext::new(
                stage.id,
                Arc::clone(&self.registry),
                self.config,
                Arc::clone(&self.allocator),
            );
            match spawn_stage(stage.link, ctx, &stage.host) {
                Ok(handle) => pipeline.stages.push(handle),
                Err(e) => {
                    tracing::error!(stage = %stage.id, error = %e, "spawn failed, tearing down");
                    pipeline.abort();
                    return Err(e);
                }
            }
        }

        for index in 0..pipeline.stages.len() {
            let id = pipeline.stages[index].id();
            if let Err(e) = pipeline.registry.send_command(id, Command::Create) {
                tracing::error!(stage = %id, error = %e, "create failed, tearing down");
                pipeline.abort();
                return Err(e);
            }
        }

        tracing::info!(stages = pipeline.stages.len(), "pipeline created");
        Ok(pipeline)
    }
}

/// A created topology of stages
///
/// Dropping it deletes every stage still alive.
pub struct Pipeline {
    registry: Arc<StageRegistry>,
    stages: Vec<StageHandle>,
}

impl Pipeline {
    /// Start every stage, consumers before producers
    pub fn start(&self) -> Result<()> {
        for stage in self.stages.iter().rev() {
            self.registry.send_command(stage.id(), Command::Start)?;
        }
        Ok(())
    }

    /// Stop every stage, producers before consumers
    ///
    /// NEW_DATA a producer posted before stopping is handled by its
    /// consumer before that consumer stops.
    pub fn stop(&self) -> Result<()> {
        for stage in &self.stages {
            self.registry.send_command(stage.id(), Command::Stop)?;
        }
        Ok(())
    }

    /// Delete every stage in data-flow order and wait for them to exit
    pub fn delete(mut self) -> Result<()> {
        self.teardown()
    }

    /// Post NEW_DATA to `id`, typically a source
    ///
    /// `Again` means the stage already has a full mailbox.
    pub fn notify(&self, id: StageId) -> Result<()> {
        self.registry.notify(id)
    }

    /// Stage ids in data-flow order
    pub fn ids(&self) -> Vec<StageId> {
        self.stages.iter().map(StageHandle::id).collect()
    }

    /// Counters of stage `id`
    pub fn stats(&self, id: StageId) -> Option<&LinkStats> {
        self.stages.iter().find(|s| s.id() == id).map(StageHandle::stats)
    }

    /// Get a summary of all stage counters
    pub fn stats_summary(&self) -> String {
        let mut summary = String::from("Pipeline Stats Summary:\n");
        for stage in &self.stages {
            summary.push_str(&format!(
                "  {} ({}): {}\n",
                stage.id(),
                stage.name(),
                stage.stats().snapshot().format()
            ));
        }
        summary
    }

    /// The registry the stages live in
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    fn teardown(&mut self) -> Result<()> {
        let mut first_err = None;
        for stage in &self.stages {
            if !self.registry.is_registered(stage.id()) {
                continue;
            }
            if let Err(e) = self.registry.send_command(stage.id(), Command::Delete) {
                tracing::error!(stage = %stage.id(), error = %e, "delete failed");
                first_err.get_or_insert(e);
            }
        }
        for stage in self.stages.drain(..) {
            let id = stage.id();
            if let Err(e) = stage.join() {
                tracing::error!(stage = %id, error = %e, "join failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Teardown after a failed build; stages still idle abort on DELETE
    fn abort(&mut self) {
        for stage in &self.stages {
            let _ = self.registry.send_command(stage.id(), Command::Delete);
        }
        for stage in self.stages.drain(..) {
            let _ = stage.join();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.stages.is_empty() {
            return;
        }
        if let Err(e) = self.teardown() {
            tracing::warn!(error = %e, "pipeline teardown on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::{InputQueue, NullLink, NullSourceLink, NullSourceParams};

    fn source(next: StageId) -> NullSourceLink {
        NullSourceLink::new(NullSourceParams {
            next: Some(next),
            ..Default::default()
        })
    }

    #[test]
    fn test_no_stages_error() {
        let registry = Arc::new(StageRegistry::new());
        let result = PipelineBuilder::new(registry, SystemConfig::default()).build();
        assert!(matches!(result, Err(LinkError::Config(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let registry = Arc::new(StageRegistry::new());
        let mut config = SystemConfig::default();
        config.mailbox.depth = 0;
        let src = StageId::new(0, 1);
        let result = PipelineBuilder::new(Arc::clone(&registry), config)
            .add_stage(src, source(src), StageHost::Thread)
            .build();
        assert!(matches!(result, Err(LinkError::Config(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = Arc::new(StageRegistry::new());
        let id = StageId::new(0, 1);
        let result = PipelineBuilder::new(Arc::clone(&registry), SystemConfig::default())
            .add_stage(id, source(id), StageHost::Thread)
            .add_stage(id, NullLink::new(vec![InputQueue::new(id, 0)]), StageHost::Thread)
            .build();
        assert!(matches!(result, Err(LinkError::DuplicateStage(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_bad_wiring_tears_down() {
        let registry = Arc::new(StageRegistry::new());
        let src = StageId::new(0, 1);
        let sink = StageId::new(0, 2);
        let result = PipelineBuilder::new(Arc::clone(&registry), SystemConfig::default())
            .add_stage(src, source(sink), StageHost::Thread)
            .add_stage(sink, NullLink::new(vec![InputQueue::new(src, 3)]), StageHost::Thread)
            .build();
        assert!(matches!(result, Err(LinkError::InvalidParams(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lifecycle() {
        let registry = Arc::new(StageRegistry::new());
        let src = StageId::new(0, 1);
        let sink = StageId::new(0, 2);
        let null = NullLink::new(vec![InputQueue::new(src, 0)]);
        let log = null.log();
        let pipeline = PipelineBuilder::new(Arc::clone(&registry), SystemConfig::default())
            .add_stage(src, source(sink), StageHost::Thread)
            .add_stage(sink, null, StageHost::Thread)
            .build()
            .unwrap();
        assert_eq!(pipeline.ids(), vec![src, sink]);
        assert_eq!(registry.len(), 2);

        pipeline.start().unwrap();
        pipeline.notify(src).unwrap();
        pipeline.stop().unwrap();
        assert_eq!(log.lock().len(), 1);
        assert_eq!(pipeline.stats(src).unwrap().total_forwarded(), 1);
        assert!(pipeline.stats_summary().contains("P0:L2"));

        pipeline.delete().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_deletes_stages() {
        let registry = Arc::new(StageRegistry::new());
        let src = StageId::new(1, 1);
        {
            let pipeline = PipelineBuilder::new(Arc::clone(&registry), SystemConfig::default())
                .add_stage(src, source(StageId::new(1, 9)), StageHost::Thread)
                .build()
                .unwrap();
            pipeline.start().unwrap();
        }
        assert!(registry.is_empty());
    }
}
