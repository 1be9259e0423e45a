mod chain;
mod context_editing;
mod human_in_the_loop;
mod summarization;

pub use chain::{
    Capabilities, HookPhase, Middleware, MiddlewareChain, MiddlewareRegistration, ModelNext,
    Runtime, ToolNext,
};
pub use context_editing::{ContextEditingMiddleware, DEFAULT_CLEARED_PLACEHOLDER};
pub use human_in_the_loop::HumanInTheLoopMiddleware;
pub use summarization::{DEFAULT_SUMMARY_PROMPT, SummarizationMiddleware, approximate_token_count};
