use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use keel_ai::{ArgumentValidator, KeelAiError, KeelAiErrorCode, ToolCall, ToolSpec};
use serde_json::Value;

use crate::error::AgentError;
use crate::interrupt::InterruptRequest;

/// Result crossing the tool boundary. `Failure` is recoverable content for
/// the model, `Fatal` aborts the run, `Interrupt` suspends it for review.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Ok(String),
    Failure(KeelAiError),
    Fatal(String),
    Interrupt(InterruptRequest),
}

/// A tool call on its way to execution. `reviewed` is set once a human
/// decision has been applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call: ToolCall,
    pub reviewed: bool,
}

impl ToolCallRequest {
    pub fn new(call: ToolCall) -> Self {
        Self {
            call,
            reviewed: false,
        }
    }

    pub fn reviewed(call: ToolCall) -> Self {
        Self {
            call,
            reviewed: true,
        }
    }
}

pub type ToolFuture = Pin<Box<dyn Future<Output = ToolOutcome> + Send>>;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, request: ToolCallRequest) -> ToolOutcome;
}

#[async_trait]
impl<F> ToolExecutor for F
where
    F: Fn(ToolCallRequest) -> ToolFuture + Send + Sync + 'static,
{
    async fn execute(&self, request: ToolCallRequest) -> ToolOutcome {
        (self)(request).await
    }
}

pub type ToolExecutorRef = Arc<dyn ToolExecutor>;

#[derive(Clone)]
pub struct Tool {
    pub spec: ToolSpec,
    pub executor: ToolExecutorRef,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        executor: impl ToolExecutor + 'static,
    ) -> Self {
        Self {
            spec: ToolSpec {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            executor: Arc::new(executor),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Tools in registration order, looked up by name. Parameter schemas are
/// compiled here, so a malformed schema fails the build instead of a call.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    specs: Vec<ToolSpec>,
    validators: Vec<ArgumentValidator>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Tool>) -> Result<Self, AgentError> {
        for (index, tool) in tools.iter().enumerate() {
            if tool.name().trim().is_empty() {
                return Err(AgentError::Validation("tool name must not be empty".to_string()));
            }
            if tools[..index].iter().any(|other| other.name() == tool.name()) {
                return Err(AgentError::Validation(format!(
                    "tool '{}' is registered twice",
                    tool.name()
                )));
            }
        }
        let specs = tools.iter().map(|tool| tool.spec.clone()).collect();
        let validators = tools
            .iter()
            .map(|tool| ArgumentValidator::compile(&tool.spec))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| AgentError::Validation(error.message))?;
        Ok(Self {
            tools,
            specs,
            validators,
        })
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validates the arguments against the tool's schema, then runs it.
    pub async fn execute(&self, request: ToolCallRequest) -> ToolOutcome {
        let Some(index) = self
            .tools
            .iter()
            .position(|tool| tool.name() == request.call.name)
        else {
            let available = self.tools.iter().map(Tool::name).collect::<Vec<_>>();
            return ToolOutcome::Failure(
                KeelAiError::new(
                    KeelAiErrorCode::ToolNotFound,
                    format!(
                        "tool '{}' is not available; known tools: {}",
                        request.call.name,
                        available.join(", ")
                    ),
                )
                .with_details(serde_json::json!({
                    "tool": request.call.name,
                    "callId": request.call.id,
                    "available": available,
                })),
            );
        };
        if let Err(error) = self.validators[index].check(&request.call) {
            return ToolOutcome::Failure(error);
        }
        self.tools[index].executor.execute(request).await
    }
}
