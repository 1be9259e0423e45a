use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::info;

use super::chain::{Capabilities, Middleware, Runtime, ToolNext};
use crate::interrupt::{ActionRequest, InterruptRequest, ReviewConfig};
use crate::tool::{ToolCallRequest, ToolOutcome};

const DEFAULT_DESCRIPTION_PREFIX: &str = "Tool execution requires approval";

/// Suspends calls to the configured tools until a reviewer decides on them.
pub struct HumanInTheLoopMiddleware {
    interrupt_on: BTreeMap<String, ReviewConfig>,
    description_prefix: String,
}

impl HumanInTheLoopMiddleware {
    pub fn new(review_configs: impl IntoIterator<Item = ReviewConfig>) -> Self {
        Self {
            interrupt_on: review_configs
                .into_iter()
                .map(|config| (config.action_name.clone(), config))
                .collect(),
            description_prefix: DEFAULT_DESCRIPTION_PREFIX.to_string(),
        }
    }

    pub fn with_description_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.description_prefix = prefix.into();
        self
    }

    pub fn reviews(&self, tool_name: &str) -> bool {
        self.interrupt_on.contains_key(tool_name)
    }
}

#[async_trait]
impl Middleware for HumanInTheLoopMiddleware {
    fn name(&self) -> &str {
        "human_in_the_loop"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_wrap_tool_call: true,
            ..Capabilities::default()
        }
    }

    async fn wrap_tool_call(
        &self,
        request: ToolCallRequest,
        runtime: &Runtime,
        next: ToolNext<'_>,
    ) -> ToolOutcome {
        let review_config = match self.interrupt_on.get(&request.call.name) {
            Some(config) if !request.reviewed => config.clone(),
            _ => return next.run(request).await,
        };

        info!(
            thread_id = runtime.thread_id.as_str(),
            tool_name = request.call.name.as_str(),
            tool_call_id = request.call.id.as_str(),
            "tool call awaiting review"
        );
        let description = format!(
            "{}\n\nTool: {}\nArgs: {}",
            self.description_prefix, request.call.name, request.call.args
        );
        ToolOutcome::Interrupt(InterruptRequest {
            action_request: ActionRequest {
                tool_name: request.call.name,
                args: request.call.args,
                description,
            },
            review_config,
        })
    }
}
