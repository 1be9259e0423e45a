#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keel_agent_core::{AgentEvent, EventSink, Tool, ToolCallRequest, ToolFuture, ToolOutcome};
use keel_ai::{KeelAiError, ModelInvoker, ModelRequest, ModelResponse, ToolCall};
use serde_json::{Value, json};

/// Replays queued responses in order and records every request it saw.
#[derive(Default)]
pub struct ScriptedInvoker {
    responses: Mutex<VecDeque<Result<ModelResponse, KeelAiError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedInvoker {
    pub fn new(responses: impl IntoIterator<Item = ModelResponse>) -> Arc<Self> {
        Self::with_results(responses.into_iter().map(Ok))
    }

    pub fn with_results(
        results: impl IntoIterator<Item = Result<ModelResponse, KeelAiError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(results.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("lock requests").clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().expect("lock requests").len()
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, KeelAiError> {
        self.requests.lock().expect("lock requests").push(request);
        self.responses
            .lock()
            .expect("lock responses")
            .pop_front()
            .unwrap_or_else(|| Ok(ModelResponse::text("done")))
    }
}

pub fn call(id: &str, name: &str, args: Value) -> ToolCall {
    ToolCall::new(id, name, args)
}

pub fn calls(content: &str, tool_calls: Vec<ToolCall>) -> ModelResponse {
    ModelResponse::with_tool_calls(content, tool_calls)
}

pub fn number_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "a": { "type": "number" },
            "b": { "type": "number" }
        },
        "required": ["a", "b"]
    })
}

/// `add(a, b)`; counts invocations in `executions`.
pub fn add_tool(executions: Arc<AtomicUsize>) -> Tool {
    let executor = move |request: ToolCallRequest| -> ToolFuture {
        executions.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let a = request.call.args["a"].as_f64().unwrap_or_default();
            let b = request.call.args["b"].as_f64().unwrap_or_default();
            ToolOutcome::Ok(format!("{}", a + b))
        })
    };
    Tool::new("add", "Add two numbers", number_schema(), executor)
}

/// Free-form tool that echoes its `q` argument.
pub fn echo_tool(name: &str, executions: Arc<AtomicUsize>) -> Tool {
    let tool_name = name.to_string();
    let executor = move |request: ToolCallRequest| -> ToolFuture {
        executions.fetch_add(1, Ordering::SeqCst);
        let tool_name = tool_name.clone();
        Box::pin(async move {
            ToolOutcome::Ok(format!("{tool_name}: {}", request.call.args["q"]))
        })
    };
    Tool::new(
        name,
        "Echo the query",
        json!({ "type": "object", "properties": { "q": {} } }),
        executor,
    )
}

pub fn event_recorder() -> (EventSink, Arc<Mutex<Vec<AgentEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink: EventSink = Arc::new(move |event| {
        sink_events.lock().expect("lock events").push(event);
    });
    (sink, events)
}
