use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::Notify;

use crate::limits::{ExitBehavior, LimitScope};

/// Progress notifications emitted while a thread executes.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    RunStart {
        thread_id: String,
        resumed: bool,
    },
    RunEnd {
        thread_id: String,
        version: u64,
        interrupted: bool,
    },
    ModelCallStart {
        thread_id: String,
        iteration: u64,
    },
    ModelCallEnd {
        thread_id: String,
        tool_calls: usize,
        duration_ms: u64,
    },
    RetryScheduled {
        operation: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error: String,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
        duration_ms: u64,
    },
    LimitExceeded {
        resource: String,
        scope: LimitScope,
        limit: u64,
        exit_behavior: ExitBehavior,
    },
    Interrupted {
        thread_id: String,
        action_requests: usize,
    },
    CheckpointSaved {
        thread_id: String,
        version: u64,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "run_start",
            Self::RunEnd { .. } => "run_end",
            Self::ModelCallStart { .. } => "model_call_start",
            Self::ModelCallEnd { .. } => "model_call_end",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::ToolExecutionStart { .. } => "tool_execution_start",
            Self::ToolExecutionEnd { .. } => "tool_execution_end",
            Self::LimitExceeded { .. } => "limit_exceeded",
            Self::Interrupted { .. } => "interrupted",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
        }
    }
}

pub type EventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}

/// Requests cancellation. The loop observes it only between steps and
/// during retry backoff, never inside an in-flight model or tool call.
pub struct AbortController {
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                inner: Arc::new(AbortInner {
                    aborted: AtomicBool::new(false),
                    notify: Notify::new(),
                }),
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self) {
        self.signal.inner.aborted.store(true, Ordering::SeqCst);
        self.signal.inner.notify.notify_waiters();
    }
}
