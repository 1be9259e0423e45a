use std::io;

use keel_ai::KeelAiError;
use thiserror::Error;

use crate::limits::LimitScope;

/// Errors raised by [`crate::StateStore`] backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stale checkpoint for thread '{thread_id}': expected version {expected}, found {actual}")]
    Stale {
        thread_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("store IO error: {0}")]
    Io(#[from] io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid thread id '{0}'")]
    InvalidThreadId(String),
}

/// Every public engine call returns a completed result, an interrupted
/// result, or one of these.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid decision: {0}")]
    InvalidDecision(String),

    #[error("thread '{0}' has no pending interrupt")]
    NoPendingInterrupt(String),

    #[error("thread '{0}' is waiting for review decisions; resume it first")]
    PendingInterrupt(String),

    #[error("middleware '{middleware}' requested jump to '{target}' from {phase}, which is not allowed")]
    InvalidJump {
        middleware: String,
        phase: &'static str,
        target: String,
    },

    #[error("{resource} call limit exceeded ({scope} limit {limit})")]
    LimitExceeded {
        resource: String,
        scope: LimitScope,
        limit: u64,
    },

    #[error("recursion limit of {limit} reached without a final answer")]
    RecursionLimitExceeded { limit: u32 },

    #[error("stale checkpoint for thread '{thread_id}': expected version {expected}, found {actual}")]
    StaleCheckpoint {
        thread_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: KeelAiError,
    },

    #[error("model invocation failed: {0}")]
    Model(#[source] KeelAiError),

    #[error("tool '{tool_name}' failed fatally: {message}")]
    ToolFatal { tool_name: String, message: String },

    #[error(transparent)]
    Store(StoreError),

    #[error("run cancelled")]
    Cancelled,
}

impl From<StoreError> for AgentError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Stale {
                thread_id,
                expected,
                actual,
            } => AgentError::StaleCheckpoint {
                thread_id,
                expected,
                actual,
            },
            other => AgentError::Store(other),
        }
    }
}
