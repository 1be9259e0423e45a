mod support;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_agent_core::{
    AbortController, AgentError, AgentEvent, ExecutionLoop, OnFailure, RetryController, RetryOn,
    RetryOutcome, RetryPolicy, Tool, ToolCallRequest, ToolFuture, ToolOutcome,
};
use keel_ai::{KeelAiError, KeelAiErrorCode, Message, ModelResponse};
use serde_json::{Value, json};
use support::{ScriptedInvoker, call, calls, event_recorder};
use tokio::time::Instant;

fn transport_error() -> KeelAiError {
    KeelAiError::new(KeelAiErrorCode::ProviderTransport, "connection reset")
}

fn policy(max_retries: u32, initial_ms: u64, on_failure: OnFailure) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        retry_on: RetryOn::Transient,
        initial_delay: Duration::from_millis(initial_ms),
        backoff_factor: 2.0,
        max_delay: Duration::from_secs(60),
        on_failure,
    }
}

/// Fails with a transient error `failures` times, then returns "ok".
fn flaky_tool(failures: usize, attempts: Arc<AtomicUsize>) -> Tool {
    let executor = move |_request: ToolCallRequest| -> ToolFuture {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            if attempt <= failures {
                ToolOutcome::Failure(KeelAiError::transient_tool("upstream busy"))
            } else {
                ToolOutcome::Ok("ok".to_string())
            }
        })
    };
    Tool::new("flaky", "Sometimes fails", json!({ "type": "object" }), executor)
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_between_attempts() {
    let policy = policy(3, 1_000, OnFailure::Raise);
    let (sink, events) = event_recorder();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let outcome = RetryController::new(&policy, "model")
        .with_events(Some(&sink))
        .run(|attempt| {
            let attempts = attempts.clone();
            async move {
                attempts.lock().expect("lock attempts").push((attempt, Instant::now()));
                Err::<(), _>(transport_error())
            }
        })
        .await
        .expect("no abort");

    assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 4, .. }));
    let attempts = attempts.lock().expect("lock attempts");
    assert_eq!(
        attempts.iter().map(|(attempt, _)| *attempt).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    let gaps = attempts
        .windows(2)
        .map(|pair| pair[1].1 - pair[0].1)
        .collect::<Vec<_>>();
    for (gap, expected_secs) in gaps.iter().zip([1, 2, 4]) {
        let expected = Duration::from_secs(expected_secs);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(50),
            "gap {gap:?}, expected {expected:?}"
        );
    }

    let delays = events
        .lock()
        .expect("lock events")
        .iter()
        .filter_map(|event| match event {
            AgentEvent::RetryScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(delays, vec![1_000, 2_000, 4_000]);
}

#[test]
fn delay_is_capped_at_max_delay() {
    let policy = RetryPolicy {
        max_delay: Duration::from_millis(1_500),
        ..policy(3, 1_000, OnFailure::Raise)
    };
    assert_eq!(policy.delay_for(0), Duration::from_millis(1_000));
    assert_eq!(policy.delay_for(1), Duration::from_millis(1_500));
    assert_eq!(policy.delay_for(5), Duration::from_millis(1_500));
}

#[tokio::test]
async fn errors_outside_retry_on_are_not_retried() {
    let codes_policy = RetryPolicy {
        retry_on: RetryOn::Codes(HashSet::from([KeelAiErrorCode::ProviderRateLimited])),
        ..policy(3, 1, OnFailure::Raise)
    };
    let invocations = AtomicUsize::new(0);

    let outcome = RetryController::new(&codes_policy, "model")
        .run(|_| {
            invocations.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(transport_error()) }
        })
        .await
        .expect("no abort");

    assert!(matches!(outcome, RetryOutcome::NotRetryable(_)));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let custom = RetryPolicy {
        retry_on: RetryOn::Custom(Arc::new(|error: &KeelAiError| {
            error.message.contains("reset")
        })),
        ..policy(1, 1, OnFailure::Raise)
    };
    let outcome = RetryController::new(&custom, "model")
        .run(|_| async { Err::<(), _>(transport_error()) })
        .await
        .expect("no abort");
    assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 2, .. }));
}

#[tokio::test(start_paused = true)]
async fn abort_during_backoff_cancels() {
    let policy = policy(3, 1_000, OnFailure::Raise);
    let controller = AbortController::new();
    let signal = controller.signal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        controller.abort();
    });

    let result = RetryController::new(&policy, "model")
        .with_signal(Some(&signal))
        .run(|_| async { Err::<(), _>(transport_error()) })
        .await;

    assert!(matches!(result, Err(AgentError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn transient_tool_failures_are_retried_inside_the_loop() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let invoker = ScriptedInvoker::new([
        calls("", vec![call("c1", "flaky", json!({}))]),
        ModelResponse::text("done"),
    ]);
    let engine = ExecutionLoop::builder(invoker)
        .tool(flaky_tool(2, attempts.clone()))
        .tool_retry(policy(2, 100, OnFailure::ReturnMessage))
        .build()
        .expect("build loop");

    let result = engine
        .run("t1", vec![Message::human("go")], Value::Null)
        .await
        .expect("run");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(matches!(
        &result.messages[2],
        Message::Tool { content, is_error: false, .. } if content == "ok"
    ));
}

#[tokio::test(start_paused = true)]
async fn exhausted_tool_retries_return_message_or_raise() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let invoker = ScriptedInvoker::new([
        calls("", vec![call("c1", "flaky", json!({}))]),
        ModelResponse::text("gave up"),
    ]);
    let engine = ExecutionLoop::builder(invoker)
        .tool(flaky_tool(usize::MAX, attempts.clone()))
        .tool_retry(policy(2, 100, OnFailure::ReturnMessage))
        .build()
        .expect("build loop");

    let result = engine
        .run("t1", vec![Message::human("go")], Value::Null)
        .await
        .expect("run");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(matches!(
        &result.messages[2],
        Message::Tool { content, is_error: true, .. } if content.contains("failed after 3 attempts")
    ));
    assert_eq!(result.last_message().map(Message::content), Some("gave up"));

    let attempts = Arc::new(AtomicUsize::new(0));
    let engine = ExecutionLoop::builder(ScriptedInvoker::new([calls(
        "",
        vec![call("c1", "flaky", json!({}))],
    )]))
    .tool(flaky_tool(usize::MAX, attempts.clone()))
    .tool_retry(policy(1, 100, OnFailure::Raise))
    .build()
    .expect("build loop");

    let error = engine
        .run("t1", vec![Message::human("go")], Value::Null)
        .await
        .expect_err("retries exhausted");
    assert!(matches!(
        error,
        AgentError::RetriesExhausted { attempts: 2, .. }
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn model_retries_recover_from_transient_errors() {
    let invoker = ScriptedInvoker::with_results([
        Err(transport_error()),
        Err(KeelAiError::new(KeelAiErrorCode::ProviderRateLimited, "slow down")),
        Ok(ModelResponse::text("finally")),
    ]);
    let engine = ExecutionLoop::builder(invoker.clone())
        .model_retry(policy(2, 1_000, OnFailure::Raise))
        .build()
        .expect("build loop");

    let result = engine
        .run("t1", vec![Message::human("hi")], Value::Null)
        .await
        .expect("run");
    assert_eq!(invoker.call_count(), 3);
    assert_eq!(result.last_message().map(Message::content), Some("finally"));
}

#[tokio::test(start_paused = true)]
async fn model_failures_follow_on_failure() {
    let permanent = KeelAiError::new(KeelAiErrorCode::ProviderHttp, "bad request")
        .with_details(json!({ "status": 400 }));
    let engine = ExecutionLoop::builder(ScriptedInvoker::with_results([Err(permanent)]))
        .build()
        .expect("build loop");
    let error = engine
        .run("t1", vec![Message::human("hi")], Value::Null)
        .await
        .expect_err("permanent model error");
    assert!(matches!(error, AgentError::Model(ref source) if source.http_status() == Some(400)));

    let engine = ExecutionLoop::builder(ScriptedInvoker::with_results([
        Err(transport_error()),
        Err(transport_error()),
    ]))
    .model_retry(policy(1, 10, OnFailure::ReturnMessage))
    .build()
    .expect("build loop");
    let result = engine
        .run("t1", vec![Message::human("hi")], Value::Null)
        .await
        .expect("run");
    let last = result.last_message().expect("final message");
    assert!(last.is_ai());
    assert!(last.content().contains("failed after 2 attempts"));
}

#[test]
fn invalid_policies_are_rejected_at_build_time() {
    let shrinking = RetryPolicy {
        backoff_factor: 0.5,
        ..RetryPolicy::default()
    };
    let result = ExecutionLoop::builder(ScriptedInvoker::new([]))
        .tool_retry(shrinking)
        .build();
    assert!(matches!(result, Err(AgentError::Validation(_))));
}
