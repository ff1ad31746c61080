//! Error taxonomy for the agent.
//!
//! None of these ever reach the host application's recording path: `record`,
//! `enqueue` and session lookups are infallible and report degraded
//! conditions as values. Errors surface only from construction
//! (configuration, filter registration, opening storage) and from the
//! export side of a flush cycle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The exporter (network/backend) rejected or failed a batch. Transient.
    #[error("export failed: {0}")]
    ExportFailed(String),

    /// The export did not complete within the flush timeout. Handled exactly
    /// like `ExportFailed`.
    #[error("export timed out after {timeout_ms}ms")]
    ExportTimeout { timeout_ms: u64 },

    /// Local storage could not persist a record; it is retained in memory only.
    #[error("persistence degraded: {0}")]
    PersistenceDegraded(String),

    /// A filter stage was rejected at registration time.
    #[error("invalid filter stage '{stage}': {reason}")]
    InvalidFilterStage { stage: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether a flush that failed with this error should requeue its batch and back off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::ExportFailed(_) | AgentError::ExportTimeout { .. }
        )
    }

    pub(crate) fn invalid_stage(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentError::InvalidFilterStage {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
