//! Checkpointed agent execution loop built on top of `keel-ai`.

mod error;
mod events;
mod execution_loop;
mod interrupt;
mod limits;
pub mod middleware;
mod retry;
mod state;
mod store;
mod tool;

pub use error::{AgentError, StoreError};
pub use events::{AbortController, AbortSignal, AgentEvent, EventSink};
pub use execution_loop::{
    DEFAULT_MAX_CONCURRENT_TOOLS, DEFAULT_RECURSION_LIMIT, ExecutionLoop, ExecutionLoopBuilder,
    RunResult,
};
pub use interrupt::{
    ActionRequest, Decision, DecisionType, Disposition, InterruptController, InterruptRequest,
    PendingInterrupt, ResolvedBatch, ReviewConfig, ToolBatch,
};
pub use limits::{
    ExitBehavior, LimitCheck, LimitEnforcer, LimitScope, LimitViolation, ModelCallLimit, Resource,
    ToolCallLimit,
};
pub use middleware::{
    Capabilities, ContextEditingMiddleware, HookPhase, HumanInTheLoopMiddleware, Middleware,
    MiddlewareChain, MiddlewareRegistration, ModelNext, Runtime, SummarizationMiddleware, ToolNext,
};
pub use retry::{OnFailure, RetryController, RetryOn, RetryOutcome, RetryPolicy, RetryPredicate};
pub use state::{
    Checkpoint, Counters, EDITED_TOOL_CALLS_KEY, JumpTo, MessageOp, STRUCTURED_RESPONSE_KEY, State,
    StateUpdate,
};
pub use store::{
    JsonlStateStore, MemoryStateStore, StateStore, StateStoreRef, ThreadSummary,
    validate_thread_id,
};
pub use tool::{
    Tool, ToolCallRequest, ToolExecutor, ToolExecutorRef, ToolFuture, ToolOutcome, ToolRegistry,
};
