use std::collections::HashSet;

use async_trait::async_trait;
use keel_ai::{Message, ModelInvokerRef, ModelRequest};
use tracing::{info, warn};

use super::chain::{Capabilities, Middleware, Runtime};
use crate::error::AgentError;
use crate::state::{State, StateUpdate};

const CHARS_PER_TOKEN: usize = 4;
const TOKENS_PER_MESSAGE: usize = 3;
const DEFAULT_TRIM_TOKENS_TO_SUMMARIZE: usize = 60_000;
const DEFAULT_BUFFER_RATIO: f64 = 0.3;
const MIN_BUFFER_TOKENS: usize = 4_000;

pub const DEFAULT_SUMMARY_PROMPT: &str = "\
Your sole objective is to extract the most relevant context from the conversation history below.
The history will be replaced with what you extract, so record everything that matters for the overall goal \
and avoid losing track of actions that were already completed.
Respond ONLY with the extracted context.

Messages to summarize:
{messages}";

const SUMMARY_PREFIX: &str = "Here is a summary of the conversation to date:";

/// Rough token estimate: four characters per token plus a fixed per-message overhead.
pub fn approximate_token_count(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|message| {
            let mut chars = message.content().chars().count() + message.role().len();
            for call in message.tool_calls() {
                chars += call.name.len() + call.args.to_string().len();
            }
            chars.div_ceil(CHARS_PER_TOKEN) + TOKENS_PER_MESSAGE
        })
        .sum()
}

/// Replaces older history with a model-written summary once the transcript
/// grows past `max_tokens_before_summary`.
pub struct SummarizationMiddleware {
    invoker: ModelInvokerRef,
    max_tokens_before_summary: usize,
    messages_to_keep: usize,
    trim_tokens_to_summarize: usize,
    buffer_ratio: f64,
    summary_prompt: String,
}

impl SummarizationMiddleware {
    pub fn new(
        invoker: ModelInvokerRef,
        max_tokens_before_summary: usize,
        messages_to_keep: usize,
    ) -> Self {
        Self {
            invoker,
            max_tokens_before_summary,
            messages_to_keep,
            trim_tokens_to_summarize: DEFAULT_TRIM_TOKENS_TO_SUMMARIZE,
            buffer_ratio: DEFAULT_BUFFER_RATIO,
            summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
        }
    }

    pub fn with_summary_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.summary_prompt = prompt.into();
        self
    }

    pub fn with_trim_tokens_to_summarize(mut self, tokens: usize) -> Self {
        self.trim_tokens_to_summarize = tokens;
        self
    }

    /// Share of the post-summary headroom held back for the conversation
    /// that follows. Clamped to `0.0..=1.0`.
    pub fn with_buffer_ratio(mut self, ratio: f64) -> Self {
        self.buffer_ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            DEFAULT_BUFFER_RATIO
        };
        self
    }

    /// Latest index at or before `len - messages_to_keep` that does not put an
    /// AI message and one of its Tool results on different sides.
    fn find_safe_cutoff(&self, messages: &[Message]) -> usize {
        if messages.len() <= self.messages_to_keep {
            return 0;
        }
        let target = messages.len() - self.messages_to_keep;
        (0..=target)
            .rev()
            .find(|&cutoff| is_safe_cutoff(messages, cutoff))
            .unwrap_or(0)
    }

    /// Newest messages that fit the trimming budget; never empty.
    fn trim_for_summary<'a>(&self, messages: &'a [Message]) -> &'a [Message] {
        let mut start = messages.len();
        let mut tokens = 0;
        while start > 0 {
            let cost = approximate_token_count(&messages[start - 1..start]);
            if tokens + cost > self.trim_tokens_to_summarize {
                break;
            }
            tokens += cost;
            start -= 1;
        }
        if start == messages.len() {
            start = messages.len().saturating_sub(1);
        }
        &messages[start..]
    }

    /// Longest suffix of `preserved` that fits next to a summary of
    /// `summary_tokens` while leaving headroom of at least
    /// `MIN_BUFFER_TOKENS`. The suffix never starts between an AI message and
    /// its Tool results.
    fn fit_preserved<'a>(&self, preserved: &'a [Message], summary_tokens: usize) -> &'a [Message] {
        let available = self.max_tokens_before_summary.saturating_sub(summary_tokens);
        let ratio_buffer = (available as f64 * self.buffer_ratio) as usize;
        let buffer = ratio_buffer
            .min(available.saturating_sub(MIN_BUFFER_TOKENS))
            .max(MIN_BUFFER_TOKENS);
        let budget = available.saturating_sub(buffer);
        let start = (0..preserved.len())
            .find(|&start| {
                is_safe_cutoff(preserved, start)
                    && approximate_token_count(&preserved[start..]) <= budget
            })
            .unwrap_or(preserved.len());
        &preserved[start..]
    }

    async fn summarize(&self, messages: &[Message]) -> Result<String, AgentError> {
        let formatted = self
            .trim_for_summary(messages)
            .iter()
            .map(|message| {
                let calls = message
                    .tool_calls()
                    .iter()
                    .map(|call| format!(" [tool call {}({})]", call.name, call.args))
                    .collect::<String>();
                format!("{}: {}{}", message.role(), message.content(), calls)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = self.summary_prompt.replace("{messages}", &formatted);
        let response = self
            .invoker
            .invoke(ModelRequest {
                messages: vec![Message::human(prompt)],
                ..ModelRequest::default()
            })
            .await
            .map_err(AgentError::Model)?;
        Ok(response.content.trim().to_string())
    }
}

fn is_safe_cutoff(messages: &[Message], cutoff: usize) -> bool {
    for (ai_index, message) in messages.iter().enumerate() {
        let ids = message
            .tool_calls()
            .iter()
            .map(|call| call.id.as_str())
            .collect::<HashSet<_>>();
        if ids.is_empty() {
            continue;
        }
        let ai_before = ai_index < cutoff;
        let split = messages
            .iter()
            .enumerate()
            .skip(ai_index + 1)
            .filter(|(_, other)| other.tool_call_id().is_some_and(|id| ids.contains(id)))
            .any(|(tool_index, _)| (tool_index < cutoff) != ai_before);
        if split {
            return false;
        }
    }
    true
}

#[async_trait]
impl Middleware for SummarizationMiddleware {
    fn name(&self) -> &str {
        "summarization"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_before_model: true,
            ..Capabilities::default()
        }
    }

    async fn before_model(
        &self,
        state: &State,
        runtime: &Runtime,
    ) -> Result<Option<StateUpdate>, AgentError> {
        let total_tokens = approximate_token_count(&state.messages);
        if total_tokens < self.max_tokens_before_summary {
            return Ok(None);
        }
        let cutoff = self.find_safe_cutoff(&state.messages);
        if cutoff == 0 {
            return Ok(None);
        }

        let (to_summarize, preserved) = state.messages.split_at(cutoff);
        let summary = match self.summarize(to_summarize).await {
            Ok(summary) => summary,
            Err(error) => {
                warn!(
                    thread_id = runtime.thread_id.as_str(),
                    error = %error,
                    "summary generation failed; keeping full history"
                );
                return Ok(None);
            }
        };

        let summary_message = Message::human(format!("{SUMMARY_PREFIX}\n\n{summary}"));
        let summary_tokens = approximate_token_count(std::slice::from_ref(&summary_message));
        let kept = self.fit_preserved(preserved, summary_tokens);
        info!(
            thread_id = runtime.thread_id.as_str(),
            total_tokens,
            summary_tokens,
            summarized = to_summarize.len(),
            kept = kept.len(),
            dropped = preserved.len() - kept.len(),
            "conversation summarized"
        );

        let mut update = StateUpdate::default().remove_all().append(summary_message);
        for message in kept {
            update = update.append(message.clone());
        }
        Ok(Some(update))
    }
}
