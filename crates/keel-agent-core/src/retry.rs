use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keel_ai::{KeelAiError, KeelAiErrorCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::events::{AbortSignal, AgentEvent, EventSink};

pub type RetryPredicate = Arc<dyn Fn(&KeelAiError) -> bool + Send + Sync>;

/// Which failures are worth another attempt.
#[derive(Clone)]
pub enum RetryOn {
    /// [`KeelAiError::is_transient`].
    Transient,
    Codes(HashSet<KeelAiErrorCode>),
    Custom(RetryPredicate),
}

impl RetryOn {
    pub fn matches(&self, error: &KeelAiError) -> bool {
        match self {
            RetryOn::Transient => error.is_transient(),
            RetryOn::Codes(codes) => codes.contains(&error.code),
            RetryOn::Custom(predicate) => predicate(error),
        }
    }
}

impl Debug for RetryOn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryOn::Transient => f.write_str("Transient"),
            RetryOn::Codes(codes) => f.debug_tuple("Codes").field(codes).finish(),
            RetryOn::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Turn the final error into a message and keep the loop going.
    ReturnMessage,
    Raise,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_on: RetryOn,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub on_failure: OnFailure,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_on: RetryOn::Transient,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            on_failure: OnFailure::ReturnMessage,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, failures handled per `on_failure`.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(AgentError::Validation(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(AgentError::Validation(
                "max_delay must not be shorter than initial_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// `min(max_delay, initial_delay * backoff_factor^retry)`, `retry` counted from 0.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let seconds = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(seconds)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Success(T),
    Exhausted { attempts: u32, error: KeelAiError },
    NotRetryable(KeelAiError),
}

/// Runs one operation under a [`RetryPolicy`].
pub struct RetryController<'a> {
    policy: &'a RetryPolicy,
    operation: &'a str,
    signal: Option<&'a AbortSignal>,
    events: Option<&'a EventSink>,
}

impl<'a> RetryController<'a> {
    pub fn new(policy: &'a RetryPolicy, operation: &'a str) -> Self {
        Self {
            policy,
            operation,
            signal: None,
            events: None,
        }
    }

    pub fn with_signal(mut self, signal: Option<&'a AbortSignal>) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_events(mut self, events: Option<&'a EventSink>) -> Self {
        self.events = events;
        self
    }

    /// `attempt` passed to `operation` starts at 1. Only an abort during a
    /// backoff wait produces `Err`.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<RetryOutcome<T>, AgentError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, KeelAiError>>,
    {
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => return Ok(RetryOutcome::Success(value)),
                Err(error) => error,
            };

            if !self.policy.retry_on.matches(&error) {
                debug!(
                    operation = self.operation,
                    attempt,
                    code = ?error.code,
                    "failure is not retryable"
                );
                return Ok(RetryOutcome::NotRetryable(error));
            }
            if attempt >= max_attempts {
                warn!(
                    operation = self.operation,
                    attempts = attempt,
                    error = error.as_compact_json().as_str(),
                    "retries exhausted"
                );
                return Ok(RetryOutcome::Exhausted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.policy.delay_for(attempt - 1);
            let delay_ms = delay.as_millis() as u64;
            warn!(
                operation = self.operation,
                attempt,
                max_attempts,
                delay_ms,
                "scheduling retry"
            );
            if let Some(events) = self.events {
                events(AgentEvent::RetryScheduled {
                    operation: self.operation.to_string(),
                    attempt,
                    max_attempts,
                    delay_ms,
                    error: error.as_compact_json(),
                });
            }
            self.wait(delay).await?;
        }
    }

    async fn wait(&self, delay: Duration) -> Result<(), AgentError> {
        if delay.is_zero() {
            return Ok(());
        }
        if let Some(signal) = self.signal {
            tokio::select! {
                _ = signal.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
