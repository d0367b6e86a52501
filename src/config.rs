//! Topology limits loaded from TOML.
//!
//! Queue depth, element size and list capacity are fixed once a topology is
//! built. Everything here is validated up front so that a bad value fails
//! at creation time instead of at the first data transfer.
//!
//! ```toml
//! [ipc]
//! max_elements = 64
//! element_size = 64
//!
//! [mailbox]
//! depth = 32
//!
//! [scheduler]
//! priority_queues = 2
//! queue_depth = 128
//!
//! [buffers]
//! max_in_list = 64
//! max_derived = 128
//! ```

use crate::buffer::MAX_BUFFERS_IN_LIST;
use crate::error::{LinkError, Result};
use crate::ipc::PROXY_HEADER_SIZE;
use crate::scheduler::MAX_PRIORITY_QUEUES;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Ring Queue geometry shared by both sides of an IPC channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Number of slots in each ring
    #[serde(default = "default_max_elements")]
    pub max_elements: u32,
    /// Size of one slot in bytes
    #[serde(default = "default_element_size")]
    pub element_size: u32,
}

/// Stage mailbox sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Pending messages a mailbox holds before senders see `Again`
    #[serde(default = "default_mailbox_depth")]
    pub depth: usize,
}

/// Cooperative scheduler sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of priority-ordered pending queues
    #[serde(default = "default_priority_queues")]
    pub priority_queues: usize,
    /// Capacity of each pending queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

/// Buffer exchange limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Capacity of every [`crate::BufferList`]
    #[serde(default = "default_max_in_list")]
    pub max_in_list: usize,
    /// Duplicate/split descriptor slots per pool
    #[serde(default = "default_max_derived")]
    pub max_derived: usize,
}

/// Complete set of topology limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    /// IPC ring geometry
    #[serde(default)]
    pub ipc: IpcConfig,
    /// Mailbox sizing
    #[serde(default)]
    pub mailbox: MailboxConfig,
    /// Scheduler sizing
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Buffer exchange limits
    #[serde(default)]
    pub buffers: BufferConfig,
}

fn default_max_elements() -> u32 {
    64
}

fn default_element_size() -> u32 {
    64
}

fn default_mailbox_depth() -> usize {
    32
}

fn default_priority_queues() -> usize {
    2
}

fn default_queue_depth() -> usize {
    128
}

fn default_max_in_list() -> usize {
    MAX_BUFFERS_IN_LIST
}

fn default_max_derived() -> usize {
    128
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_elements: default_max_elements(),
            element_size: default_element_size(),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            depth: default_mailbox_depth(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            priority_queues: default_priority_queues(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_in_list: default_max_in_list(),
            max_derived: default_max_derived(),
        }
    }
}

impl SystemConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| LinkError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: SystemConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every limit; the first bad value is reported
    pub fn validate(&self) -> Result<()> {
        if self.ipc.max_elements == 0 || self.ipc.max_elements > (1 << 30) {
            return Err(LinkError::Config(format!(
                "ipc.max_elements must be in 1..=2^30, got {}",
                self.ipc.max_elements
            )));
        }
        if (self.ipc.element_size as usize) < PROXY_HEADER_SIZE {
            return Err(LinkError::Config(format!(
                "ipc.element_size must hold a {}-byte proxy record, got {}",
                PROXY_HEADER_SIZE, self.ipc.element_size
            )));
        }
        if self.mailbox.depth == 0 {
            return Err(LinkError::Config("mailbox.depth must be non-zero".into()));
        }
        if self.scheduler.priority_queues == 0
            || self.scheduler.priority_queues > MAX_PRIORITY_QUEUES
        {
            return Err(LinkError::Config(format!(
                "scheduler.priority_queues must be in 1..={}, got {}",
                MAX_PRIORITY_QUEUES, self.scheduler.priority_queues
            )));
        }
        if self.scheduler.queue_depth == 0 {
            return Err(LinkError::Config(
                "scheduler.queue_depth must be non-zero".into(),
            ));
        }
        if self.buffers.max_in_list == 0 || self.buffers.max_in_list > MAX_BUFFERS_IN_LIST {
            return Err(LinkError::Config(format!(
                "buffers.max_in_list must be in 1..={}, got {}",
                MAX_BUFFERS_IN_LIST, self.buffers.max_in_list
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffers.max_in_list, 64);
        assert_eq!(config.scheduler.priority_queues, 2);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SystemConfig::from_toml(
            r#"
            [ipc]
            max_elements = 4
            element_size = 48
            "#,
        )
        .unwrap();
        assert_eq!(config.ipc.max_elements, 4);
        assert_eq!(config.ipc.element_size, 48);
        assert_eq!(config.mailbox.depth, 32);
    }

    #[test]
    fn test_list_capacity_above_hard_cap_rejected() {
        let result = SystemConfig::from_toml("[buffers]\nmax_in_list = 65\n");
        assert!(matches!(result, Err(LinkError::Config(_))));
    }

    #[test]
    fn test_element_too_small_for_proxy_record() {
        let result = SystemConfig::from_toml("[ipc]\nelement_size = 8\n");
        assert!(matches!(result, Err(LinkError::Config(_))));
    }

    #[test]
    fn test_zero_priority_queues_rejected() {
        let result = SystemConfig::from_toml("[scheduler]\npriority_queues = 0\n");
        assert!(matches!(result, Err(LinkError::Config(_))));
    }

    #[test]
    fn test_malformed_toml() {
        let result = SystemConfig::from_toml("[ipc\nmax_elements = ");
        assert!(matches!(result, Err(LinkError::ConfigParse(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = SystemConfig::load("/nonexistent/link-pipeline.toml");
        assert!(matches!(result, Err(LinkError::ConfigRead { .. })));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = SystemConfig::default();
        let text = toml::to_string(&config).unwrap();
        assert_eq!(SystemConfig::from_toml(&text).unwrap(), config);
    }
}
