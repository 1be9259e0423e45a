use std::sync::Arc;

use async_trait::async_trait;
use keel_ai::{KeelAiError, ModelInvoker, ModelRequest, ModelResponse};
use serde_json::Value;
use tracing::debug;

use crate::error::AgentError;
use crate::state::{JumpTo, State, StateUpdate};
use crate::tool::{ToolCallRequest, ToolOutcome, ToolRegistry};

/// Hooks a middleware implements, declared once at registration. The chain
/// only dispatches to declared hooks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub has_before_agent: bool,
    pub has_before_model: bool,
    pub has_wrap_model_call: bool,
    pub has_after_model: bool,
    pub has_after_agent: bool,
    pub has_wrap_tool_call: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            has_before_agent: true,
            has_before_model: true,
            has_wrap_model_call: true,
            has_after_model: true,
            has_after_agent: true,
            has_wrap_tool_call: true,
        }
    }

    pub fn has(&self, phase: HookPhase) -> bool {
        match phase {
            HookPhase::BeforeAgent => self.has_before_agent,
            HookPhase::BeforeModel => self.has_before_model,
            HookPhase::AfterModel => self.has_after_model,
            HookPhase::AfterAgent => self.has_after_agent,
        }
    }
}

/// Node-style hook phases. `before_*` run in registration order, `after_*`
/// in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    BeforeAgent,
    BeforeModel,
    AfterModel,
    AfterAgent,
}

impl HookPhase {
    pub fn name(self) -> &'static str {
        match self {
            HookPhase::BeforeAgent => "before_agent",
            HookPhase::BeforeModel => "before_model",
            HookPhase::AfterModel => "after_model",
            HookPhase::AfterAgent => "after_agent",
        }
    }

    pub fn allows(self, target: JumpTo) -> bool {
        match self {
            HookPhase::BeforeAgent => matches!(target, JumpTo::End),
            HookPhase::BeforeModel => matches!(target, JumpTo::End | JumpTo::Model),
            HookPhase::AfterModel => true,
            HookPhase::AfterAgent => false,
        }
    }

    fn is_reversed(self) -> bool {
        matches!(self, HookPhase::AfterModel | HookPhase::AfterAgent)
    }
}

/// Per-call data visible to every hook.
#[derive(Debug, Clone, PartialEq)]
pub struct Runtime {
    pub thread_id: String,
    pub context: Value,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn before_agent(
        &self,
        _state: &State,
        _runtime: &Runtime,
    ) -> Result<Option<StateUpdate>, AgentError> {
        Ok(None)
    }

    async fn before_model(
        &self,
        _state: &State,
        _runtime: &Runtime,
    ) -> Result<Option<StateUpdate>, AgentError> {
        Ok(None)
    }

    async fn after_model(
        &self,
        _state: &State,
        _runtime: &Runtime,
    ) -> Result<Option<StateUpdate>, AgentError> {
        Ok(None)
    }

    async fn after_agent(
        &self,
        _state: &State,
        _runtime: &Runtime,
    ) -> Result<Option<StateUpdate>, AgentError> {
        Ok(None)
    }

    async fn wrap_model_call(
        &self,
        request: ModelRequest,
        _runtime: &Runtime,
        next: ModelNext<'_>,
    ) -> Result<ModelResponse, KeelAiError> {
        next.run(request).await
    }

    async fn wrap_tool_call(
        &self,
        request: ToolCallRequest,
        _runtime: &Runtime,
        next: ToolNext<'_>,
    ) -> ToolOutcome {
        next.run(request).await
    }
}

/// The rest of the model-call onion; the innermost layer is the invoker.
#[derive(Clone, Copy)]
pub struct ModelNext<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    runtime: &'a Runtime,
    invoker: &'a dyn ModelInvoker,
}

impl<'a> ModelNext<'a> {
    pub async fn run(self, request: ModelRequest) -> Result<ModelResponse, KeelAiError> {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                let next = ModelNext {
                    remaining: rest,
                    ..self
                };
                head.wrap_model_call(request, self.runtime, next).await
            }
            None => self.invoker.invoke(request).await,
        }
    }
}

/// The rest of the tool-call onion; the innermost layer is the registry.
#[derive(Clone, Copy)]
pub struct ToolNext<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    runtime: &'a Runtime,
    registry: &'a ToolRegistry,
}

impl<'a> ToolNext<'a> {
    pub async fn run(self, request: ToolCallRequest) -> ToolOutcome {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                let next = ToolNext {
                    remaining: rest,
                    ..self
                };
                head.wrap_tool_call(request, self.runtime, next).await
            }
            None => self.registry.execute(request).await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareRegistration {
    pub order_index: usize,
    pub name: String,
    pub capabilities: Capabilities,
}

#[derive(Clone)]
struct Entry {
    middleware: Arc<dyn Middleware>,
    registration: MiddlewareRegistration,
}

/// Ordered middleware registry. Order is fixed at construction.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    entries: Vec<Entry>,
    model_wrappers: Vec<Arc<dyn Middleware>>,
    tool_wrappers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Result<Self, AgentError> {
        let mut entries: Vec<Entry> = Vec::with_capacity(middlewares.len());
        for (order_index, middleware) in middlewares.into_iter().enumerate() {
            let name = middleware.name().to_string();
            if entries.iter().any(|entry| entry.registration.name == name) {
                return Err(AgentError::Validation(format!(
                    "middleware '{name}' is registered twice"
                )));
            }
            let capabilities = middleware.capabilities();
            debug!(order_index, middleware = name.as_str(), ?capabilities, "middleware registered");
            entries.push(Entry {
                middleware,
                registration: MiddlewareRegistration {
                    order_index,
                    name,
                    capabilities,
                },
            });
        }

        let model_wrappers = entries
            .iter()
            .filter(|entry| entry.registration.capabilities.has_wrap_model_call)
            .map(|entry| Arc::clone(&entry.middleware))
            .collect();
        let tool_wrappers = entries
            .iter()
            .filter(|entry| entry.registration.capabilities.has_wrap_tool_call)
            .map(|entry| Arc::clone(&entry.middleware))
            .collect();

        Ok(Self {
            entries,
            model_wrappers,
            tool_wrappers,
        })
    }

    pub fn registrations(&self) -> Vec<MiddlewareRegistration> {
        self.entries
            .iter()
            .map(|entry| entry.registration.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs one phase, merging each update into `state` before the next hook
    /// sees it. The first hook that requests a jump ends the phase.
    pub async fn run_phase(
        &self,
        phase: HookPhase,
        state: &mut State,
        runtime: &Runtime,
    ) -> Result<Option<JumpTo>, AgentError> {
        let mut ordered = self
            .entries
            .iter()
            .filter(|entry| entry.registration.capabilities.has(phase))
            .collect::<Vec<_>>();
        if phase.is_reversed() {
            ordered.reverse();
        }

        for entry in ordered {
            let middleware = &entry.middleware;
            let update = match phase {
                HookPhase::BeforeAgent => middleware.before_agent(state, runtime).await?,
                HookPhase::BeforeModel => middleware.before_model(state, runtime).await?,
                HookPhase::AfterModel => middleware.after_model(state, runtime).await?,
                HookPhase::AfterAgent => middleware.after_agent(state, runtime).await?,
            };
            let Some(update) = update else {
                continue;
            };

            let jump_to = update.jump_to;
            if let Some(target) = jump_to {
                if !phase.allows(target) {
                    return Err(AgentError::InvalidJump {
                        middleware: entry.registration.name.clone(),
                        phase: phase.name(),
                        target: target.to_string(),
                    });
                }
            }
            state.apply(update)?;
            if let Some(target) = jump_to {
                debug!(
                    thread_id = runtime.thread_id.as_str(),
                    middleware = entry.registration.name.as_str(),
                    phase = phase.name(),
                    target = %target,
                    "middleware requested jump"
                );
                return Ok(Some(target));
            }
        }
        Ok(None)
    }

    pub async fn call_model(
        &self,
        request: ModelRequest,
        runtime: &Runtime,
        invoker: &dyn ModelInvoker,
    ) -> Result<ModelResponse, KeelAiError> {
        ModelNext {
            remaining: &self.model_wrappers,
            runtime,
            invoker,
        }
        .run(request)
        .await
    }

    pub async fn call_tool(
        &self,
        request: ToolCallRequest,
        runtime: &Runtime,
        registry: &ToolRegistry,
    ) -> ToolOutcome {
        ToolNext {
            remaining: &self.tool_wrappers,
            runtime,
            registry,
        }
        .run(request)
        .await
    }
}
