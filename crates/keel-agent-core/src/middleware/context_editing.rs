use std::collections::BTreeSet;

use async_trait::async_trait;
use keel_ai::{KeelAiError, Message, ModelRequest, ModelResponse};
use tracing::debug;

use super::chain::{Capabilities, Middleware, ModelNext, Runtime};
use super::summarization::approximate_token_count;

pub const DEFAULT_CLEARED_PLACEHOLDER: &str = "[cleared]";

/// Clears old tool results from the model request once it grows past
/// `trigger_tokens`. Persisted state keeps the full results.
pub struct ContextEditingMiddleware {
    trigger_tokens: usize,
    keep_tool_results: usize,
    placeholder: String,
    exclude_tools: BTreeSet<String>,
}

impl ContextEditingMiddleware {
    pub fn new(trigger_tokens: usize, keep_tool_results: usize) -> Self {
        Self {
            trigger_tokens,
            keep_tool_results,
            placeholder: DEFAULT_CLEARED_PLACEHOLDER.to_string(),
            exclude_tools: BTreeSet::new(),
        }
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }

    pub fn with_excluded_tools(mut self, tools: impl IntoIterator<Item = String>) -> Self {
        self.exclude_tools = tools.into_iter().collect();
        self
    }

    /// Returns how many tool results were cleared.
    fn clear_tool_results(&self, messages: &mut [Message]) -> usize {
        let tool_indices = messages
            .iter()
            .enumerate()
            .filter_map(|(index, message)| match message {
                Message::Tool { tool_name, .. } if !self.exclude_tools.contains(tool_name) => {
                    Some(index)
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        let clear_count = tool_indices.len().saturating_sub(self.keep_tool_results);

        let mut cleared = 0;
        for index in tool_indices.into_iter().take(clear_count) {
            if let Message::Tool { content, .. } = &mut messages[index] {
                if *content != self.placeholder {
                    *content = self.placeholder.clone();
                    cleared += 1;
                }
            }
        }
        cleared
    }
}

#[async_trait]
impl Middleware for ContextEditingMiddleware {
    fn name(&self) -> &str {
        "context_editing"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_wrap_model_call: true,
            ..Capabilities::default()
        }
    }

    async fn wrap_model_call(
        &self,
        mut request: ModelRequest,
        runtime: &Runtime,
        next: ModelNext<'_>,
    ) -> Result<ModelResponse, KeelAiError> {
        let tokens = approximate_token_count(&request.messages);
        if tokens > self.trigger_tokens {
            let cleared = self.clear_tool_results(&mut request.messages);
            debug!(
                thread_id = runtime.thread_id.as_str(),
                tokens,
                cleared,
                "cleared old tool results from model request"
            );
        }
        next.run(request).await
    }
}
