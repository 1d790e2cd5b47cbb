//! Error types for the illustration pipeline.

use crate::types::{PageId, StoryId, TaskId};
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Pipeline errors. Provider variants mirror the failure taxonomy a caller may want
/// to report; the retry budget treats all of them the same.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Story not found: {0}")]
    StoryNotFound(StoryId),

    #[error("Invalid status transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Provider request failed: {0}")]
    ProviderRequestFailed(String),

    #[error("Provider request timed out: {0}")]
    ProviderTimeout(String),

    #[error("Provider authentication failed: {0}")]
    ProviderAuthFailed(String),

    #[error("Provider rate limit exceeded: {0}")]
    ProviderRateLimit(String),

    #[error("Provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("Failed to embed illustration: {0}")]
    EmbedFailed(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Engine closed before story {0} could run")]
    EngineClosed(StoryId),
}

impl PipelineError {
    /// Whether a failure is expected to clear on its own. Used for log severity only;
    /// every failure consumes the same attempt budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::ProviderRequestFailed(_)
                | PipelineError::ProviderTimeout(_)
                | PipelineError::ProviderRateLimit(_)
                | PipelineError::ProviderError(_)
                | PipelineError::StorageError(_)
        )
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        PipelineError::StorageError(err.to_string())
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::ConfigError(err.to_string())
    }
}
