use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use keel_ai::{Message, ModelInvokerRef, ModelRequest};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::events::{AbortSignal, AgentEvent, EventSink};
use crate::interrupt::{
    Decision, Disposition, InterruptController, InterruptRequest, PendingInterrupt, ToolBatch,
};
use crate::limits::{
    ExitBehavior, LimitCheck, LimitEnforcer, LimitScope, LimitViolation, ModelCallLimit, Resource,
    ToolCallLimit,
};
use crate::middleware::{HookPhase, Middleware, MiddlewareChain, MiddlewareRegistration, Runtime};
use crate::retry::{OnFailure, RetryController, RetryOutcome, RetryPolicy};
use crate::state::{Checkpoint, JumpTo, STRUCTURED_RESPONSE_KEY, State};
use crate::store::{MemoryStateStore, StateStoreRef, ThreadSummary};
use crate::tool::{Tool, ToolCallRequest, ToolOutcome, ToolRegistry};

pub const DEFAULT_RECURSION_LIMIT: u32 = 30;
pub const DEFAULT_MAX_CONCURRENT_TOOLS: usize = 8;

const LOOP_ITERATIONS_KEY: &str = "loop_iterations";
const NOT_EXECUTED_MESSAGE: &str =
    "Tool call was not executed because the previous run stopped before it completed.";

/// What `run`, `resume` and `recover` hand back: either a finished thread or
/// one suspended on `interrupt`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub thread_id: String,
    pub version: u64,
    pub messages: Vec<Message>,
    pub structured_response: Option<Value>,
    pub interrupt: Option<PendingInterrupt>,
}

impl RunResult {
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_some()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

pub struct ExecutionLoopBuilder {
    invoker: ModelInvokerRef,
    store: Option<StateStoreRef>,
    tools: Vec<Tool>,
    middlewares: Vec<Arc<dyn Middleware>>,
    model_limits: Vec<ModelCallLimit>,
    tool_limits: Vec<ToolCallLimit>,
    model_retry: RetryPolicy,
    tool_retry: RetryPolicy,
    recursion_limit: u32,
    system_prompt: Option<String>,
    response_format: Option<Value>,
    events: Option<EventSink>,
    signal: Option<AbortSignal>,
    max_concurrent_tools: usize,
}

impl ExecutionLoopBuilder {
    pub fn new(invoker: ModelInvokerRef) -> Self {
        Self {
            invoker,
            store: None,
            tools: Vec::new(),
            middlewares: Vec::new(),
            model_limits: Vec::new(),
            tool_limits: Vec::new(),
            model_retry: RetryPolicy {
                on_failure: OnFailure::Raise,
                ..RetryPolicy::default()
            },
            tool_retry: RetryPolicy::default(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            system_prompt: None,
            response_format: None,
            events: None,
            signal: None,
            max_concurrent_tools: DEFAULT_MAX_CONCURRENT_TOOLS,
        }
    }

    pub fn store(mut self, store: StateStoreRef) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Tool>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Registration order is dispatch order.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn model_limit(mut self, limit: ModelCallLimit) -> Self {
        self.model_limits.push(limit);
        self
    }

    pub fn tool_limit(mut self, limit: ToolCallLimit) -> Self {
        self.tool_limits.push(limit);
        self
    }

    pub fn model_retry(mut self, policy: RetryPolicy) -> Self {
        self.model_retry = policy;
        self
    }

    pub fn tool_retry(mut self, policy: RetryPolicy) -> Self {
        self.tool_retry = policy;
        self
    }

    pub fn recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn response_format(mut self, format: Value) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn event_sink(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn abort_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn max_concurrent_tools(mut self, max: usize) -> Self {
        self.max_concurrent_tools = max;
        self
    }

    pub fn build(self) -> Result<ExecutionLoop, AgentError> {
        if self.recursion_limit == 0 {
            return Err(AgentError::Validation(
                "recursion_limit must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_tools == 0 {
            return Err(AgentError::Validation(
                "max_concurrent_tools must be at least 1".to_string(),
            ));
        }
        self.model_retry.validate()?;
        self.tool_retry.validate()?;

        Ok(ExecutionLoop {
            invoker: self.invoker,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryStateStore::new())),
            tools: ToolRegistry::new(self.tools)?,
            chain: MiddlewareChain::new(self.middlewares)?,
            limits: LimitEnforcer::new(self.model_limits, self.tool_limits)?,
            model_retry: self.model_retry,
            tool_retry: self.tool_retry,
            recursion_limit: self.recursion_limit,
            system_prompt: self.system_prompt,
            response_format: self.response_format,
            events: self.events,
            signal: self.signal,
            max_concurrent_tools: self.max_concurrent_tools,
        })
    }
}

/// Drives threads through the model/tool cycle. Holds only read-mostly
/// configuration; all per-thread data lives in the store.
pub struct ExecutionLoop {
    invoker: ModelInvokerRef,
    store: StateStoreRef,
    tools: ToolRegistry,
    chain: MiddlewareChain,
    limits: LimitEnforcer,
    model_retry: RetryPolicy,
    tool_retry: RetryPolicy,
    recursion_limit: u32,
    system_prompt: Option<String>,
    response_format: Option<Value>,
    events: Option<EventSink>,
    signal: Option<AbortSignal>,
    max_concurrent_tools: usize,
}

impl ExecutionLoop {
    pub fn builder(invoker: ModelInvokerRef) -> ExecutionLoopBuilder {
        ExecutionLoopBuilder::new(invoker)
    }

    pub fn registrations(&self) -> Vec<MiddlewareRegistration> {
        self.chain.registrations()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Appends `input` to the thread (creating it if needed) and runs until
    /// the model stops calling tools, a hook ends the run, or a tool call is
    /// suspended for review.
    pub async fn run(
        &self,
        thread_id: &str,
        input: Vec<Message>,
        context: Value,
    ) -> Result<RunResult, AgentError> {
        let (mut state, version) = match self.store.get(thread_id).await? {
            Some(checkpoint) => (checkpoint.state, checkpoint.version),
            None => (State::default(), 0),
        };
        if state.pending.is_some() {
            return Err(AgentError::PendingInterrupt(thread_id.to_string()));
        }

        info!(thread_id, version, input = input.len(), "run started");
        self.emit(AgentEvent::RunStart {
            thread_id: thread_id.to_string(),
            resumed: false,
        });
        close_unanswered_tool_calls(&mut state, thread_id);
        state.counters.reset_run();
        state.messages.extend(input);

        let mut runner = LoopRunner::new(self, thread_id, version, state, context);
        runner.save().await?;
        let step = match self
            .chain
            .run_phase(HookPhase::BeforeAgent, &mut runner.state, &runner.runtime)
            .await?
        {
            Some(JumpTo::End) => Step::AfterAgent,
            _ => Step::BeforeModel,
        };
        runner.drive(step).await
    }

    /// Applies one decision per pending action request, in order, then
    /// continues from the suspended tool dispatch. An invalid batch changes
    /// nothing.
    pub async fn resume(
        &self,
        thread_id: &str,
        decisions: Vec<Decision>,
        context: Value,
    ) -> Result<RunResult, AgentError> {
        let Some(checkpoint) = self.store.get(thread_id).await? else {
            return Err(AgentError::NoPendingInterrupt(thread_id.to_string()));
        };
        let mut state = checkpoint.state;
        let Some(pending) = state.pending.take() else {
            return Err(AgentError::NoPendingInterrupt(thread_id.to_string()));
        };
        let resolved = InterruptController::apply(pending, decisions)?;

        info!(
            thread_id,
            version = checkpoint.version,
            decisions = resolved.dispositions.len(),
            "resuming suspended tool calls"
        );
        self.emit(AgentEvent::RunStart {
            thread_id: thread_id.to_string(),
            resumed: true,
        });

        let mut batch = resolved.batch;
        let mut work = Vec::new();
        for (index, disposition) in resolved.dispositions {
            match disposition {
                Disposition::Execute(call) => {
                    if batch.calls[index].args != call.args {
                        state.replace_tool_call_args(&call.id, call.args.clone());
                        batch.calls[index] = call.clone();
                    }
                    work.push((index, ToolCallRequest::reviewed(call)));
                }
                Disposition::Rejected(message) => batch.results[index] = Some(message),
            }
        }

        let mut runner = LoopRunner::new(self, thread_id, checkpoint.version, state, context);
        match runner.dispatch(batch, work).await? {
            Some(step) => runner.drive(step).await,
            None => Ok(runner.into_result()),
        }
    }

    /// Re-executes tool calls left without results by a run that stopped
    /// mid-step. A thread with nothing outstanding is returned unchanged.
    pub async fn recover(&self, thread_id: &str, context: Value) -> Result<RunResult, AgentError> {
        let Some(checkpoint) = self.store.get(thread_id).await? else {
            return Err(AgentError::Validation(format!(
                "thread '{thread_id}' does not exist"
            )));
        };
        if checkpoint.state.pending.is_some() {
            return Err(AgentError::PendingInterrupt(thread_id.to_string()));
        }
        let runner = LoopRunner::new(
            self,
            thread_id,
            checkpoint.version,
            checkpoint.state,
            context,
        );
        if runner.state.unanswered_tool_calls().is_empty() {
            return Ok(runner.into_result());
        }
        info!(thread_id, version = runner.version, "recovering unanswered tool calls");
        runner.drive(Step::Tools).await
    }

    pub async fn state(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        Ok(self.store.get(thread_id).await?)
    }

    pub async fn history(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Checkpoint>, AgentError> {
        Ok(self.store.history(thread_id, limit).await?)
    }

    pub async fn list_threads(&self) -> Result<Vec<ThreadSummary>, AgentError> {
        Ok(self.store.list_threads().await?)
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<bool, AgentError> {
        let deleted = self.store.delete_thread(thread_id).await?;
        info!(thread_id, deleted, "thread deleted");
        Ok(deleted)
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            events(event);
        }
    }

    fn emit_limit(&self, violation: &LimitViolation) {
        self.emit(AgentEvent::LimitExceeded {
            resource: violation.resource.key(),
            scope: violation.scope,
            limit: violation.limit,
            exit_behavior: violation.exit_behavior,
        });
    }

    fn is_aborted(&self) -> bool {
        self.signal.as_ref().is_some_and(AbortSignal::is_aborted)
    }

    async fn execute_tool(
        &self,
        request: ToolCallRequest,
        runtime: &Runtime,
    ) -> Result<ToolCallDone, AgentError> {
        let call = request.call.clone();
        self.emit(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.args.clone(),
        });
        let started = Instant::now();
        let operation = format!("tool '{}'", call.name);

        let outcome = RetryController::new(&self.tool_retry, &operation)
            .with_signal(self.signal.as_ref())
            .with_events(self.events.as_ref())
            .run(|_| {
                let request = request.clone();
                async move {
                    match self.chain.call_tool(request, runtime, &self.tools).await {
                        ToolOutcome::Failure(error) => Err(error),
                        other => Ok(other),
                    }
                }
            })
            .await?;

        let message = match outcome {
            RetryOutcome::Success(ToolOutcome::Ok(content)) => Message::tool_result(&call, content),
            RetryOutcome::Success(ToolOutcome::Interrupt(request)) => {
                debug!(
                    thread_id = runtime.thread_id.as_str(),
                    tool_name = call.name.as_str(),
                    tool_call_id = call.id.as_str(),
                    "tool call interrupted"
                );
                return Ok(ToolCallDone::Interrupt(request));
            }
            RetryOutcome::Success(ToolOutcome::Fatal(message)) => {
                warn!(
                    thread_id = runtime.thread_id.as_str(),
                    tool_name = call.name.as_str(),
                    message = message.as_str(),
                    "tool failed fatally"
                );
                return Err(AgentError::ToolFatal {
                    tool_name: call.name,
                    message,
                });
            }
            RetryOutcome::Success(ToolOutcome::Failure(error)) | RetryOutcome::NotRetryable(error) => {
                Message::tool_error(&call, format!("Error: {}", error.message))
            }
            RetryOutcome::Exhausted { attempts, error } => match self.tool_retry.on_failure {
                OnFailure::ReturnMessage => Message::tool_error(
                    &call,
                    format!(
                        "Tool '{}' failed after {attempts} attempts: {}",
                        call.name, error.message
                    ),
                ),
                OnFailure::Raise => {
                    return Err(AgentError::RetriesExhausted {
                        operation,
                        attempts,
                        source: error,
                    });
                }
            },
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let is_error = matches!(message, Message::Tool { is_error: true, .. });
        debug!(
            thread_id = runtime.thread_id.as_str(),
            tool_name = call.name.as_str(),
            tool_call_id = call.id.as_str(),
            duration_ms,
            is_error,
            "tool execution finished"
        );
        self.emit(AgentEvent::ToolExecutionEnd {
            tool_call_id: call.id,
            tool_name: call.name,
            is_error,
            duration_ms,
        });
        Ok(ToolCallDone::Message(message))
    }
}

enum ToolCallDone {
    Message(Message),
    Interrupt(InterruptRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    BeforeModel,
    ModelCall,
    AfterModel,
    Tools,
    AfterAgent,
}

/// Closes tool calls that never got a result (the process stopped mid-step)
/// so the transcript stays well-formed for the next model call.
fn close_unanswered_tool_calls(state: &mut State, thread_id: &str) {
    let unanswered = state.unanswered_tool_calls();
    if unanswered.is_empty() {
        return;
    }
    warn!(
        thread_id,
        count = unanswered.len(),
        "closing tool calls left unanswered by an earlier run"
    );
    state.messages.extend(
        unanswered
            .iter()
            .map(|call| Message::tool_error(call, NOT_EXECUTED_MESSAGE)),
    );
}

struct LoopRunner<'a> {
    engine: &'a ExecutionLoop,
    runtime: Runtime,
    version: u64,
    state: State,
    structured_response: Option<Value>,
}

impl<'a> LoopRunner<'a> {
    fn new(
        engine: &'a ExecutionLoop,
        thread_id: &str,
        version: u64,
        state: State,
        context: Value,
    ) -> Self {
        Self {
            engine,
            runtime: Runtime {
                thread_id: thread_id.to_string(),
                context,
            },
            version,
            state,
            structured_response: None,
        }
    }

    fn thread_id(&self) -> &str {
        &self.runtime.thread_id
    }

    async fn drive(mut self, mut step: Step) -> Result<RunResult, AgentError> {
        loop {
            debug!(thread_id = self.thread_id(), ?step, "entering step");
            step = match step {
                Step::BeforeModel => self.before_model().await?,
                Step::ModelCall => self.call_model().await?,
                Step::AfterModel => self.after_model().await?,
                Step::Tools => match self.run_tools().await? {
                    Some(next) => next,
                    None => return Ok(self.into_result()),
                },
                Step::AfterAgent => return self.finish().await,
            };
        }
    }

    async fn save(&mut self) -> Result<(), AgentError> {
        let version = self
            .engine
            .store
            .put(&self.runtime.thread_id, self.version, &self.state)
            .await?;
        self.version = version;
        debug!(thread_id = self.thread_id(), version, "checkpoint saved");
        self.engine.emit(AgentEvent::CheckpointSaved {
            thread_id: self.runtime.thread_id.clone(),
            version,
        });
        Ok(())
    }

    async fn stop_if_aborted(&mut self) -> Result<(), AgentError> {
        if !self.engine.is_aborted() {
            return Ok(());
        }
        info!(thread_id = self.thread_id(), "run cancelled at step boundary");
        self.save().await?;
        Err(AgentError::Cancelled)
    }

    async fn before_model(&mut self) -> Result<Step, AgentError> {
        self.stop_if_aborted().await?;

        let iteration = self
            .state
            .counters
            .increment(LimitScope::Run, LOOP_ITERATIONS_KEY);
        let limit = self.engine.recursion_limit;
        if iteration > u64::from(limit) {
            warn!(
                thread_id = self.thread_id(),
                limit, "recursion limit exceeded"
            );
            self.save().await?;
            return Err(AgentError::RecursionLimitExceeded { limit });
        }

        let jump = self
            .engine
            .chain
            .run_phase(HookPhase::BeforeModel, &mut self.state, &self.runtime)
            .await?;
        Ok(match jump {
            Some(JumpTo::End) => Step::AfterAgent,
            Some(JumpTo::Model) => Step::BeforeModel,
            _ => Step::ModelCall,
        })
    }

    async fn call_model(&mut self) -> Result<Step, AgentError> {
        let engine = self.engine;
        let check = engine.limits.check_and_increment(
            &mut self.state.counters,
            &Resource::Model,
            &self.runtime.thread_id,
        );
        if let LimitCheck::Exceeded(violation) = check {
            engine.emit_limit(&violation);
            if violation.exit_behavior == ExitBehavior::Error {
                return Err(violation.into_error());
            }
            self.state.messages.push(Message::ai(violation.message()));
            return Ok(Step::AfterAgent);
        }

        let request = ModelRequest {
            system_prompt: engine.system_prompt.clone(),
            messages: self.state.messages.clone(),
            tools: engine.tools.specs().to_vec(),
            response_format: engine.response_format.clone(),
        };
        let iteration = self.state.counters.get(LimitScope::Run, LOOP_ITERATIONS_KEY);
        engine.emit(AgentEvent::ModelCallStart {
            thread_id: self.runtime.thread_id.clone(),
            iteration,
        });
        let started = Instant::now();

        let runtime = &self.runtime;
        let outcome = RetryController::new(&engine.model_retry, "model")
            .with_signal(engine.signal.as_ref())
            .with_events(engine.events.as_ref())
            .run(|_| {
                let request = request.clone();
                async move {
                    engine
                        .chain
                        .call_model(request, runtime, engine.invoker.as_ref())
                        .await
                }
            })
            .await?;

        let message = match outcome {
            RetryOutcome::Success(response) => {
                if let Some(structured) = response.structured.clone() {
                    self.state
                        .custom_fields
                        .insert(STRUCTURED_RESPONSE_KEY.to_string(), structured.clone());
                    self.structured_response = Some(structured);
                }
                response.into_message()
            }
            RetryOutcome::Exhausted { attempts, error } => match engine.model_retry.on_failure {
                OnFailure::ReturnMessage => Message::ai(format!(
                    "Model call failed after {attempts} attempts: {}",
                    error.message
                )),
                OnFailure::Raise => {
                    return Err(AgentError::RetriesExhausted {
                        operation: "model".to_string(),
                        attempts,
                        source: error,
                    });
                }
            },
            RetryOutcome::NotRetryable(error) => return Err(AgentError::Model(error)),
        };

        let tool_calls = message.tool_calls().len();
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            thread_id = self.thread_id(),
            iteration, tool_calls, duration_ms, "model call finished"
        );
        engine.emit(AgentEvent::ModelCallEnd {
            thread_id: self.runtime.thread_id.clone(),
            tool_calls,
            duration_ms,
        });
        self.state.messages.push(message);
        self.save().await?;
        Ok(Step::AfterModel)
    }

    async fn after_model(&mut self) -> Result<Step, AgentError> {
        let jump = self
            .engine
            .chain
            .run_phase(HookPhase::AfterModel, &mut self.state, &self.runtime)
            .await?;
        Ok(match jump {
            Some(JumpTo::End) => Step::AfterAgent,
            Some(JumpTo::Model) => Step::BeforeModel,
            Some(JumpTo::Tools) => Step::Tools,
            None if self.state.unanswered_tool_calls().is_empty() => Step::AfterAgent,
            None => Step::Tools,
        })
    }

    /// `None` means the batch was suspended and the thread checkpointed.
    async fn run_tools(&mut self) -> Result<Option<Step>, AgentError> {
        self.stop_if_aborted().await?;

        let calls = self.state.unanswered_tool_calls();
        if calls.is_empty() {
            return Ok(Some(Step::BeforeModel));
        }
        self.save().await?;

        let engine = self.engine;
        let mut batch = ToolBatch::new(calls);
        let mut work = Vec::with_capacity(batch.calls.len());
        let mut stop = None;
        // committed only if the batch is dispatched
        let mut counters = self.state.counters.clone();
        for (index, call) in batch.calls.iter().enumerate() {
            let resource = Resource::Tool(Some(call.name.clone()));
            match engine.limits.check_and_increment(
                &mut counters,
                &resource,
                &self.runtime.thread_id,
            ) {
                LimitCheck::Ok => work.push((index, ToolCallRequest::new(call.clone()))),
                LimitCheck::Exceeded(violation) => {
                    engine.emit_limit(&violation);
                    match violation.exit_behavior {
                        ExitBehavior::Continue => {
                            batch.results[index] =
                                Some(Message::tool_error(call, violation.message()));
                        }
                        ExitBehavior::Error => return Err(violation.into_error()),
                        ExitBehavior::End => {
                            stop = Some(violation);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(violation) = stop {
            let text = violation.message();
            self.state
                .messages
                .extend(batch.calls.iter().map(|call| Message::tool_error(call, &text)));
            self.state.messages.push(Message::ai(text));
            return Ok(Some(Step::AfterAgent));
        }

        self.state.counters = counters;
        self.dispatch(batch, work).await
    }

    /// Executes `work` concurrently, reassembles results in request order and
    /// either appends them or suspends on the collected interrupts.
    async fn dispatch(
        &mut self,
        mut batch: ToolBatch,
        work: Vec<(usize, ToolCallRequest)>,
    ) -> Result<Option<Step>, AgentError> {
        let engine = self.engine;
        let runtime = &self.runtime;
        let outcomes = stream::iter(work.into_iter().map(|(index, request)| async move {
            (index, engine.execute_tool(request, runtime).await)
        }))
        .buffered(engine.max_concurrent_tools)
        .collect::<Vec<_>>()
        .await;

        let mut interrupts = Vec::new();
        for (index, outcome) in outcomes {
            match outcome? {
                ToolCallDone::Message(message) => batch.results[index] = Some(message),
                ToolCallDone::Interrupt(request) => interrupts.push((index, request)),
            }
        }

        if !interrupts.is_empty() {
            let pending = InterruptController::raise_interrupt(batch, interrupts);
            let action_requests = pending.action_requests.len();
            info!(
                thread_id = self.thread_id(),
                action_requests, "run suspended for review"
            );
            self.state.pending = Some(pending);
            self.save().await?;
            engine.emit(AgentEvent::Interrupted {
                thread_id: self.runtime.thread_id.clone(),
                action_requests,
            });
            engine.emit(AgentEvent::RunEnd {
                thread_id: self.runtime.thread_id.clone(),
                version: self.version,
                interrupted: true,
            });
            return Ok(None);
        }

        let Some(messages) = batch.into_messages() else {
            return Err(AgentError::Validation(
                "tool batch finished with calls that have no result".to_string(),
            ));
        };
        self.state.messages.extend(messages);
        self.save().await?;
        Ok(Some(Step::BeforeModel))
    }

    async fn finish(mut self) -> Result<RunResult, AgentError> {
        let jump = self
            .engine
            .chain
            .run_phase(HookPhase::AfterAgent, &mut self.state, &self.runtime)
            .await?;
        debug_assert!(jump.is_none());
        self.state.pending = None;
        self.save().await?;
        info!(
            thread_id = self.thread_id(),
            version = self.version,
            messages = self.state.messages.len(),
            "run finished"
        );
        self.engine.emit(AgentEvent::RunEnd {
            thread_id: self.runtime.thread_id.clone(),
            version: self.version,
            interrupted: false,
        });
        Ok(self.into_result())
    }

    fn into_result(self) -> RunResult {
        RunResult {
            thread_id: self.runtime.thread_id,
            version: self.version,
            messages: self.state.messages,
            structured_response: self.structured_response,
            interrupt: self.state.pending,
        }
    }
}
