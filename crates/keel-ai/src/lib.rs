//! Message model and collaborator interfaces shared by the keel execution engine.

mod error;
mod invoker;
mod providers;
mod types;
mod validation;

pub use error::{KeelAiError, KeelAiErrorCode};
pub use invoker::{ModelFuture, ModelInvoker, ModelInvokerRef};
pub use providers::{
    OpenAiCompatConfig, OpenAiCompatInvoker, build_chat_payload, parse_chat_response,
};
pub use types::{Message, ModelRequest, ModelResponse, ToolCall, ToolSpec, Usage};
pub use validation::{ArgumentValidator, ArgumentViolation};
