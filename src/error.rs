//! Error types for stagemem

use thiserror::Error;

use crate::types::Stage;

/// Result type alias for stagemem operations
pub type Result<T> = std::result::Result<T, StageMemError>;

/// Main error type for stagemem
#[derive(Error, Debug)]
pub enum StageMemError {
    #[error("Duplicate entry id: {0}")]
    DuplicateId(String),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for {id}: {message}")]
    InvalidTransition { id: String, message: String },

    #[error("No available agent for task kind: {0}")]
    NoAvailableAgent(String),

    #[error("Unclassifiable request: {0}")]
    UnclassifiableRequest(String),

    #[error("Duplicate agent id: {0}")]
    DuplicateAgentId(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    Timeout { task_id: String, timeout_ms: u64 },

    #[error("Agent execution error: {0}")]
    AgentExecution(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StageMemError {
    pub(crate) fn boundary(id: &str, stage: Stage, direction: &str) -> Self {
        StageMemError::InvalidTransition {
            id: id.to_string(),
            message: format!("cannot {} from {}", direction, stage),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageMemError::Timeout { .. } | StageMemError::AgentExecution(_)
        )
    }

    /// Stable numeric code for external reporting
    pub fn code(&self) -> i64 {
        match self {
            StageMemError::DuplicateId(_) => -32010,
            StageMemError::NotFound(_) => -32001,
            StageMemError::InvalidTransition { .. } => -32011,
            StageMemError::NoAvailableAgent(_) => -32020,
            StageMemError::UnclassifiableRequest(_) => -32602,
            StageMemError::DuplicateAgentId(_) => -32021,
            StageMemError::AgentNotFound(_) => -32022,
            StageMemError::TaskNotFound(_) => -32030,
            StageMemError::Timeout { .. } => -32031,
            StageMemError::AgentExecution(_) => -32032,
            StageMemError::InvalidInput(_) => -32602,
            StageMemError::Config(_) => -32040,
            _ => -32000,
        }
    }
}
