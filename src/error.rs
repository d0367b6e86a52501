use crate::registry::StageId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for link pipeline operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors that can occur while building or running a link topology
#[derive(Error, Debug)]
pub enum LinkError {
    /// Malformed call; not retryable without fixing the arguments
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Transient unavailability (queue full or empty); retry later
    #[error("resource temporarily unavailable, try again")]
    Again,

    /// Command out of state-machine order, or a descriptor released twice
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Descriptor pool, buffer list or queue capacity exceeded
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No stage is registered under this id
    #[error("stage {0} is not registered")]
    NotRegistered(StageId),

    /// Another stage already owns this id
    #[error("stage {0} is already registered")]
    DuplicateStage(StageId),

    /// The stage mailbox is gone (stage deleted or aborted)
    #[error("mailbox of stage {0} is closed")]
    MailboxClosed(StageId),

    /// Thread spawn or join error
    #[error("thread error: {0}")]
    ThreadError(String),

    /// Configuration rejected by validation
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be read
    #[error("failed to read config '{path}': {source}")]
    ConfigRead {
        /// Path of the file that could not be read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for [`crate::SystemConfig`]
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl LinkError {
    /// True only for [`LinkError::Again`]; everything else needs a fix, not a retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::Again)
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        LinkError::InvalidParams(msg.into())
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        LinkError::ProtocolViolation(msg.into())
    }

    pub(crate) fn exhausted(msg: impl Into<String>) -> Self {
        LinkError::ResourceExhausted(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_again_is_retryable() {
        assert!(LinkError::Again.is_retryable());
        assert!(!LinkError::invalid("zero size").is_retryable());
        assert!(!LinkError::violation("double release").is_retryable());
        assert!(!LinkError::exhausted("pool").is_retryable());
    }

    #[test]
    fn test_display_names_stage() {
        let err = LinkError::NotRegistered(StageId::new(1, 7));
        assert_eq!(err.to_string(), "stage P1:L7 is not registered");
    }
}
