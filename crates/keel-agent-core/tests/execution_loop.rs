mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_agent_core::{
    AbortController, AgentError, AgentEvent, Decision, DecisionType, ExecutionLoop,
    HumanInTheLoopMiddleware, MemoryStateStore, ReviewConfig, STRUCTURED_RESPONSE_KEY, State,
    StateStore, StateStoreRef, Tool, ToolCallRequest, ToolFuture, ToolOutcome,
};
use keel_ai::{KeelAiError, KeelAiErrorCode, Message, ModelResponse};
use serde_json::{Value, json};
use support::{ScriptedInvoker, add_tool, call, calls, echo_tool, event_recorder};

fn human(text: &str) -> Vec<Message> {
    vec![Message::human(text)]
}

fn approval_loop(
    invoker: Arc<ScriptedInvoker>,
    executions: Arc<AtomicUsize>,
    store: StateStoreRef,
) -> ExecutionLoop {
    ExecutionLoop::builder(invoker)
        .store(store)
        .tool(add_tool(executions))
        .middleware(Arc::new(HumanInTheLoopMiddleware::new([ReviewConfig::all(
            "add",
        )])))
        .build()
        .expect("build loop")
}

#[tokio::test]
async fn tool_call_round_trip_produces_answer() {
    let invoker = ScriptedInvoker::new([
        calls("", vec![call("c1", "add", json!({ "a": 3, "b": 5 }))]),
        ModelResponse::text("8"),
    ]);
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = ExecutionLoop::builder(invoker.clone())
        .tool(add_tool(executions.clone()))
        .build()
        .expect("build loop");

    let result = engine
        .run("t1", human("What's 3+5?"), Value::Null)
        .await
        .expect("run");

    assert!(!result.is_interrupted());
    assert_eq!(result.messages.len(), 4);
    assert_eq!(result.messages[0].content(), "What's 3+5?");
    assert_eq!(result.messages[1].tool_calls()[0].name, "add");
    assert!(matches!(
        &result.messages[2],
        Message::Tool { content, is_error: false, tool_call_id, .. }
            if content == "8" && tool_call_id == "c1"
    ));
    assert_eq!(result.messages[3].content(), "8");
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // second model call sees the tool result and the registered tool specs
    let requests = invoker.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 3);
    assert_eq!(requests[1].tools[0].name, "add");

    let checkpoint = engine
        .state("t1")
        .await
        .expect("state")
        .expect("checkpoint exists");
    assert_eq!(checkpoint.version, result.version);
    assert_eq!(checkpoint.state.messages, result.messages);
    let history = engine.history("t1", None).await.expect("history");
    assert_eq!(history.len() as u64, result.version);
}

#[tokio::test]
async fn second_run_continues_the_same_thread() {
    let invoker = ScriptedInvoker::new([ModelResponse::text("hello"), ModelResponse::text("bye")]);
    let engine = ExecutionLoop::builder(invoker.clone())
        .system_prompt("be brief")
        .build()
        .expect("build loop");

    let first = engine.run("t1", human("hi"), Value::Null).await.expect("first run");
    let second = engine
        .run("t1", human("goodbye"), Value::Null)
        .await
        .expect("second run");

    assert!(second.version > first.version);
    assert_eq!(second.messages.len(), 4);
    assert_eq!(second.messages[..2], first.messages[..]);
    let requests = invoker.requests();
    assert_eq!(requests[1].messages.len(), 3);
    assert_eq!(requests[1].system_prompt.as_deref(), Some("be brief"));
}

#[tokio::test]
async fn rejected_call_is_never_executed() {
    let invoker = ScriptedInvoker::new([
        calls("", vec![call("c1", "add", json!({ "a": 3, "b": 5 }))]),
        ModelResponse::text("ok, skipping"),
    ]);
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = approval_loop(
        invoker.clone(),
        executions.clone(),
        Arc::new(MemoryStateStore::new()),
    );

    let suspended = engine
        .run("t2", human("What's 3+5?"), Value::Null)
        .await
        .expect("run");
    let interrupt = suspended.interrupt.as_ref().expect("interrupt raised");
    assert_eq!(interrupt.action_requests.len(), 1);
    assert_eq!(interrupt.action_requests[0].tool_name, "add");
    assert_eq!(interrupt.action_requests[0].args, json!({ "a": 3, "b": 5 }));
    assert!(interrupt.action_requests[0]
        .description
        .contains("requires approval"));
    assert_eq!(executions.load(Ordering::SeqCst), 0);

    let result = engine
        .resume("t2", vec![Decision::reject("not needed")], Value::Null)
        .await
        .expect("resume");

    assert!(!result.is_interrupted());
    assert_eq!(executions.load(Ordering::SeqCst), 0);
    assert!(matches!(
        &result.messages[2],
        Message::Tool { content, is_error: true, .. } if content.contains("not needed")
    ));
    assert_eq!(
        result.last_message().map(Message::content),
        Some("ok, skipping")
    );
    let checkpoint = engine.state("t2").await.expect("state").expect("checkpoint");
    assert!(checkpoint.state.pending.is_none());
}

#[tokio::test]
async fn approved_and_edited_calls_run_once() {
    let invoker = ScriptedInvoker::new([
        calls("", vec![call("c1", "add", json!({ "a": 3, "b": 5 }))]),
        ModelResponse::text("15"),
    ]);
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = approval_loop(
        invoker.clone(),
        executions.clone(),
        Arc::new(MemoryStateStore::new()),
    );

    engine
        .run("t1", human("What's 3+5?"), Value::Null)
        .await
        .expect("run");
    let result = engine
        .resume(
            "t1",
            vec![Decision::edit(json!({ "a": 10, "b": 5 }))],
            Value::Null,
        )
        .await
        .expect("resume");

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(result.messages[1].tool_calls()[0].args, json!({ "a": 10, "b": 5 }));
    assert_eq!(result.messages[2].content(), "15");
    let checkpoint = engine.state("t1").await.expect("state").expect("checkpoint");
    assert_eq!(
        checkpoint.state.edited_tool_call_args("c1"),
        Some(&json!({ "a": 3, "b": 5 }))
    );

    let invoker = ScriptedInvoker::new([
        calls("", vec![call("c1", "add", json!({ "a": 1, "b": 1 }))]),
        ModelResponse::text("2"),
    ]);
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = approval_loop(invoker, executions.clone(), Arc::new(MemoryStateStore::new()));
    engine.run("t1", human("1+1?"), Value::Null).await.expect("run");
    let result = engine
        .resume("t1", vec![Decision::approve()], Value::Null)
        .await
        .expect("resume");
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(result.messages[2].content(), "2");
}

#[tokio::test]
async fn invalid_decisions_leave_the_checkpoint_untouched() {
    let invoker = ScriptedInvoker::new([calls(
        "",
        vec![
            call("c1", "add", json!({ "a": 1, "b": 2 })),
            call("c2", "add", json!({ "a": 3, "b": 4 })),
        ],
    )]);
    let executions = Arc::new(AtomicUsize::new(0));
    let store: StateStoreRef = Arc::new(MemoryStateStore::new());
    let engine = ExecutionLoop::builder(invoker)
        .store(store.clone())
        .tool(add_tool(executions.clone()))
        .middleware(Arc::new(HumanInTheLoopMiddleware::new([ReviewConfig::new(
            "add",
            [DecisionType::Approve, DecisionType::Reject],
        )])))
        .build()
        .expect("build loop");

    let suspended = engine.run("t1", human("sums"), Value::Null).await.expect("run");
    assert_eq!(
        suspended
            .interrupt
            .as_ref()
            .map(|pending| pending.action_requests.len()),
        Some(2)
    );

    let wrong_count = engine
        .resume("t1", vec![Decision::approve()], Value::Null)
        .await;
    assert!(matches!(wrong_count, Err(AgentError::InvalidDecision(_))));

    let not_allowed = engine
        .resume(
            "t1",
            vec![Decision::approve(), Decision::edit(json!({ "a": 0, "b": 0 }))],
            Value::Null,
        )
        .await;
    assert!(matches!(not_allowed, Err(AgentError::InvalidDecision(_))));

    let checkpoint = store.get("t1").await.expect("get").expect("checkpoint");
    assert_eq!(checkpoint.version, suspended.version);
    assert!(checkpoint.state.pending.is_some());
    assert_eq!(executions.load(Ordering::SeqCst), 0);

    let blocked = engine.run("t1", human("again"), Value::Null).await;
    assert!(matches!(blocked, Err(AgentError::PendingInterrupt(_))));
}

#[tokio::test]
async fn resume_without_pending_interrupt_is_rejected() {
    let engine = ExecutionLoop::builder(ScriptedInvoker::new([]))
        .build()
        .expect("build loop");

    let missing = engine.resume("nobody", vec![], Value::Null).await;
    assert!(matches!(missing, Err(AgentError::NoPendingInterrupt(_))));

    engine.run("t1", human("hi"), Value::Null).await.expect("run");
    let finished = engine
        .resume("t1", vec![Decision::approve()], Value::Null)
        .await;
    assert!(matches!(finished, Err(AgentError::NoPendingInterrupt(_))));
}

#[tokio::test]
async fn approved_calls_are_not_replayed_after_a_failed_model_call() {
    let invoker = ScriptedInvoker::with_results([
        Ok(calls("", vec![call("c1", "add", json!({ "a": 3, "b": 5 }))])),
        Err(KeelAiError::new(KeelAiErrorCode::ProviderHttp, "bad request")),
    ]);
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = approval_loop(invoker, executions.clone(), Arc::new(MemoryStateStore::new()));

    let suspended = engine
        .run("t1", human("What's 3+5?"), Value::Null)
        .await
        .expect("run");
    assert!(suspended.is_interrupted());

    let failed = engine
        .resume("t1", vec![Decision::approve()], Value::Null)
        .await;
    assert!(matches!(failed, Err(AgentError::Model(_))));
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let checkpoint = engine.state("t1").await.expect("state").expect("checkpoint");
    assert!(checkpoint.state.pending.is_none());
    assert!(matches!(
        checkpoint.state.messages.last(),
        Some(Message::Tool { content, is_error: false, .. }) if content == "8"
    ));

    let again = engine
        .resume("t1", vec![Decision::approve()], Value::Null)
        .await;
    assert!(matches!(again, Err(AgentError::NoPendingInterrupt(_))));
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tool_results_survive_a_failed_model_call() {
    let invoker = ScriptedInvoker::with_results([
        Ok(calls("", vec![call("c1", "add", json!({ "a": 3, "b": 5 }))])),
        Err(KeelAiError::new(KeelAiErrorCode::ProviderHttp, "bad request")),
        Ok(ModelResponse::text("8")),
    ]);
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = ExecutionLoop::builder(invoker)
        .tool(add_tool(executions.clone()))
        .build()
        .expect("build loop");

    let failed = engine.run("t1", human("What's 3+5?"), Value::Null).await;
    assert!(matches!(failed, Err(AgentError::Model(_))));

    let checkpoint = engine.state("t1").await.expect("state").expect("checkpoint");
    assert!(checkpoint.state.unanswered_tool_calls().is_empty());
    assert!(matches!(
        checkpoint.state.messages.last(),
        Some(Message::Tool { content, is_error: false, .. }) if content == "8"
    ));

    let result = engine
        .run("t1", human("again please"), Value::Null)
        .await
        .expect("second run");
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(result
        .messages
        .iter()
        .all(|message| !message.content().contains("was not executed")));
    assert_eq!(result.last_message().map(Message::content), Some("8"));
}

#[tokio::test]
async fn mixed_batch_keeps_results_of_unreviewed_calls() {
    let invoker = ScriptedInvoker::new([
        calls(
            "",
            vec![
                call("c1", "search", json!({ "q": "rust" })),
                call("c2", "add", json!({ "a": 2, "b": 2 })),
            ],
        ),
        ModelResponse::text("done"),
    ]);
    let searches = Arc::new(AtomicUsize::new(0));
    let adds = Arc::new(AtomicUsize::new(0));
    let engine = ExecutionLoop::builder(invoker)
        .tool(echo_tool("search", searches.clone()))
        .tool(add_tool(adds.clone()))
        .middleware(Arc::new(HumanInTheLoopMiddleware::new([ReviewConfig::all(
            "add",
        )])))
        .build()
        .expect("build loop");

    let suspended = engine.run("t1", human("go"), Value::Null).await.expect("run");
    assert!(suspended.is_interrupted());
    assert_eq!(searches.load(Ordering::SeqCst), 1);
    assert_eq!(adds.load(Ordering::SeqCst), 0);
    // results are only appended once the whole batch is resolved
    assert_eq!(suspended.messages.len(), 2);

    let result = engine
        .resume("t1", vec![Decision::approve()], Value::Null)
        .await
        .expect("resume");
    assert_eq!(searches.load(Ordering::SeqCst), 1);
    assert_eq!(adds.load(Ordering::SeqCst), 1);
    let tool_ids = result
        .messages
        .iter()
        .filter_map(Message::tool_call_id)
        .collect::<Vec<_>>();
    assert_eq!(tool_ids, vec!["c1", "c2"]);
}

#[tokio::test]
async fn concurrent_tool_results_keep_request_order() {
    let slow = |request: ToolCallRequest| -> ToolFuture {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ToolOutcome::Ok(format!("slow {}", request.call.id))
        })
    };
    let fast = |request: ToolCallRequest| -> ToolFuture {
        Box::pin(async move { ToolOutcome::Ok(format!("fast {}", request.call.id)) })
    };
    let schema = json!({ "type": "object" });
    let invoker = ScriptedInvoker::new([calls(
        "",
        vec![
            call("c1", "slow", json!({})),
            call("c2", "fast", json!({})),
            call("c3", "slow", json!({})),
        ],
    )]);
    let engine = ExecutionLoop::builder(invoker)
        .tool(Tool::new("slow", "Slow tool", schema.clone(), slow))
        .tool(Tool::new("fast", "Fast tool", schema, fast))
        .build()
        .expect("build loop");

    let result = engine.run("t1", human("go"), Value::Null).await.expect("run");
    let contents = result.messages[2..5]
        .iter()
        .map(Message::content)
        .collect::<Vec<_>>();
    assert_eq!(contents, vec!["slow c1", "fast c2", "slow c3"]);
}

#[tokio::test]
async fn invalid_arguments_become_error_results() {
    let invoker = ScriptedInvoker::new([
        calls("", vec![call("c1", "add", json!({ "a": "three" }))]),
        ModelResponse::text("sorry"),
    ]);
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = ExecutionLoop::builder(invoker)
        .tool(add_tool(executions.clone()))
        .build()
        .expect("build loop");

    let result = engine.run("t1", human("add"), Value::Null).await.expect("run");
    assert_eq!(executions.load(Ordering::SeqCst), 0);
    assert!(matches!(
        &result.messages[2],
        Message::Tool { is_error: true, .. }
    ));
    assert_eq!(result.messages.len(), 4);
}

#[tokio::test]
async fn fatal_tool_failure_aborts_the_run() {
    let explode = |_request: ToolCallRequest| -> ToolFuture {
        Box::pin(async { ToolOutcome::Fatal("disk on fire".to_string()) })
    };
    let invoker = ScriptedInvoker::new([calls("", vec![call("c1", "explode", json!({}))])]);
    let engine = ExecutionLoop::builder(invoker)
        .tool(Tool::new("explode", "Fails", json!({ "type": "object" }), explode))
        .build()
        .expect("build loop");

    let error = engine
        .run("t1", human("go"), Value::Null)
        .await
        .expect_err("fatal tool error");
    assert!(matches!(
        error,
        AgentError::ToolFatal { ref tool_name, .. } if tool_name == "explode"
    ));

    // the checkpoint taken before tool execution still holds the call
    let checkpoint = engine.state("t1").await.expect("state").expect("checkpoint");
    assert_eq!(checkpoint.state.unanswered_tool_calls().len(), 1);
}

#[tokio::test]
async fn recursion_limit_stops_endless_tool_loops() {
    let invoker = ScriptedInvoker::new(
        (0..5).map(|index| calls("", vec![call(&format!("c{index}"), "search", json!({ "q": index }))])),
    );
    let engine = ExecutionLoop::builder(invoker.clone())
        .tool(echo_tool("search", Arc::new(AtomicUsize::new(0))))
        .recursion_limit(2)
        .build()
        .expect("build loop");

    let error = engine
        .run("t3", human("loop forever"), Value::Null)
        .await
        .expect_err("recursion limit");
    assert!(matches!(error, AgentError::RecursionLimitExceeded { limit: 2 }));
    assert_eq!(invoker.call_count(), 2);

    let checkpoint = engine.state("t3").await.expect("state").expect("checkpoint");
    assert_eq!(checkpoint.state.messages.len(), 5);
}

#[tokio::test]
async fn structured_response_is_exposed_and_persisted() {
    let answer = json!({ "sum": 8 });
    let invoker = ScriptedInvoker::new([ModelResponse {
        structured: Some(answer.clone()),
        ..ModelResponse::text(r#"{"sum":8}"#)
    }]);
    let format = json!({ "type": "json_schema", "json_schema": { "name": "sum" } });
    let engine = ExecutionLoop::builder(invoker.clone())
        .response_format(format.clone())
        .build()
        .expect("build loop");

    let result = engine.run("t1", human("3+5"), Value::Null).await.expect("run");

    assert_eq!(result.structured_response, Some(answer.clone()));
    assert_eq!(invoker.requests()[0].response_format, Some(format));
    let checkpoint = engine.state("t1").await.expect("state").expect("checkpoint");
    assert_eq!(
        checkpoint.state.custom_fields.get(STRUCTURED_RESPONSE_KEY),
        Some(&answer)
    );
}

async fn seed_dangling_thread(store: &StateStoreRef) {
    let state = State::with_messages(vec![
        Message::human("What's 3+5?"),
        Message::ai_with_tool_calls("", vec![call("c1", "add", json!({ "a": 3, "b": 5 }))]),
    ]);
    store.put("t1", 0, &state).await.expect("seed checkpoint");
}

#[tokio::test]
async fn new_run_closes_calls_left_by_a_crashed_run() {
    let store: StateStoreRef = Arc::new(MemoryStateStore::new());
    seed_dangling_thread(&store).await;
    let executions = Arc::new(AtomicUsize::new(0));
    let invoker = ScriptedInvoker::new([ModelResponse::text("starting over")]);
    let engine = ExecutionLoop::builder(invoker.clone())
        .store(store)
        .tool(add_tool(executions.clone()))
        .build()
        .expect("build loop");

    let result = engine.run("t1", human("hello?"), Value::Null).await.expect("run");

    assert_eq!(executions.load(Ordering::SeqCst), 0);
    assert!(matches!(
        &result.messages[2],
        Message::Tool { is_error: true, tool_call_id, .. } if tool_call_id == "c1"
    ));
    assert_eq!(result.messages[3].content(), "hello?");
    assert_eq!(invoker.requests()[0].messages.len(), 4);
}

#[tokio::test]
async fn recover_executes_unanswered_calls() {
    let store: StateStoreRef = Arc::new(MemoryStateStore::new());
    seed_dangling_thread(&store).await;
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = ExecutionLoop::builder(ScriptedInvoker::new([ModelResponse::text("8")]))
        .store(store)
        .tool(add_tool(executions.clone()))
        .build()
        .expect("build loop");

    let result = engine.recover("t1", Value::Null).await.expect("recover");
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(result.messages[2].content(), "8");
    assert_eq!(result.last_message().map(Message::content), Some("8"));

    // nothing left to recover
    let again = engine.recover("t1", Value::Null).await.expect("recover again");
    assert_eq!(again.version, result.version);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn abort_stops_at_step_boundary_and_keeps_progress() {
    let controller = AbortController::new();
    controller.abort();
    let invoker = ScriptedInvoker::new([ModelResponse::text("never")]);
    let engine = ExecutionLoop::builder(invoker.clone())
        .abort_signal(controller.signal())
        .build()
        .expect("build loop");

    let error = engine
        .run("t1", human("hi"), Value::Null)
        .await
        .expect_err("cancelled");
    assert!(matches!(error, AgentError::Cancelled));
    assert_eq!(invoker.call_count(), 0);
    let checkpoint = engine.state("t1").await.expect("state").expect("checkpoint");
    assert_eq!(checkpoint.state.messages.len(), 1);
}

#[tokio::test]
async fn events_trace_the_run() {
    let (sink, events) = event_recorder();
    let invoker = ScriptedInvoker::new([
        calls("", vec![call("c1", "add", json!({ "a": 1, "b": 2 }))]),
        ModelResponse::text("3"),
    ]);
    let engine = ExecutionLoop::builder(invoker)
        .tool(add_tool(Arc::new(AtomicUsize::new(0))))
        .event_sink(sink)
        .build()
        .expect("build loop");

    engine.run("t1", human("1+2"), Value::Null).await.expect("run");

    let kinds = events
        .lock()
        .expect("lock events")
        .iter()
        .map(AgentEvent::kind)
        .filter(|kind| *kind != "checkpoint_saved")
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            "run_start",
            "model_call_start",
            "model_call_end",
            "tool_execution_start",
            "tool_execution_end",
            "model_call_start",
            "model_call_end",
            "run_end",
        ]
    );
}

#[tokio::test]
async fn thread_management_wraps_the_store() {
    let engine = ExecutionLoop::builder(ScriptedInvoker::new([]))
        .build()
        .expect("build loop");
    engine.run("a", human("hi"), Value::Null).await.expect("run a");
    engine.run("b", human("hi"), Value::Null).await.expect("run b");

    let threads = engine.list_threads().await.expect("list");
    assert_eq!(
        threads
            .iter()
            .map(|summary| summary.thread_id.as_str())
            .collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    assert!(engine.delete_thread("a").await.expect("delete"));
    assert!(!engine.delete_thread("a").await.expect("delete again"));
    assert!(engine.state("a").await.expect("state").is_none());

    let invalid = engine.run("../etc", human("hi"), Value::Null).await;
    assert!(matches!(invalid, Err(AgentError::Store(_))));
}

#[tokio::test]
async fn context_reaches_middleware() {
    use async_trait::async_trait;
    use keel_agent_core::{Capabilities, Middleware, Runtime, StateUpdate};

    struct ContextRecorder(Arc<Mutex<Vec<Value>>>);

    #[async_trait]
    impl Middleware for ContextRecorder {
        fn name(&self) -> &str {
            "context_recorder"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                has_before_model: true,
                ..Capabilities::default()
            }
        }

        async fn before_model(
            &self,
            _state: &State,
            runtime: &Runtime,
        ) -> Result<Option<StateUpdate>, AgentError> {
            self.0.lock().expect("lock seen").push(runtime.context.clone());
            Ok(None)
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let engine = ExecutionLoop::builder(ScriptedInvoker::new([]))
        .middleware(Arc::new(ContextRecorder(seen.clone())))
        .build()
        .expect("build loop");
    engine
        .run("t1", human("hi"), json!({ "user": "ada" }))
        .await
        .expect("run");
    assert_eq!(*seen.lock().expect("lock seen"), vec![json!({ "user": "ada" })]);
}
