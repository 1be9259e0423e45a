use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};

use keel_ai::{Message, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AgentError;
use crate::interrupt::PendingInterrupt;
use crate::limits::LimitScope;

pub const STRUCTURED_RESPONSE_KEY: &str = "structured_response";
/// `custom_fields` entry mapping a tool call id to the arguments the model
/// proposed before a reviewer edited them.
pub const EDITED_TOOL_CALLS_KEY: &str = "edited_tool_calls";

/// Invocation counters. `thread` survives across calls on the same thread,
/// `run` is cleared at the start of every `run()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    #[serde(default)]
    pub thread: BTreeMap<String, u64>,
    #[serde(default)]
    pub run: BTreeMap<String, u64>,
}

impl Counters {
    pub fn get(&self, scope: LimitScope, key: &str) -> u64 {
        self.scope(scope).get(key).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, scope: LimitScope, key: &str) -> u64 {
        let map = match scope {
            LimitScope::Thread => &mut self.thread,
            LimitScope::Run => &mut self.run,
        };
        let counter = map.entry(key.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    pub fn reset_run(&mut self) {
        self.run.clear();
    }

    fn scope(&self, scope: LimitScope) -> &BTreeMap<String, u64> {
        match scope {
            LimitScope::Thread => &self.thread,
            LimitScope::Run => &self.run,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub messages: Vec<Message>,
    #[serde(rename = "customFields", default)]
    pub custom_fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingInterrupt>,
    #[serde(default)]
    pub counters: Counters,
}

impl State {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Merges a hook's partial update. Message removals must name an
    /// existing message; custom fields are replaced key by key.
    pub fn apply(&mut self, update: StateUpdate) -> Result<(), AgentError> {
        for op in update.messages {
            match op {
                MessageOp::Append(message) => self.messages.push(message),
                MessageOp::Remove(id) => {
                    let Some(index) = self.messages.iter().position(|message| message.id() == id)
                    else {
                        return Err(AgentError::Validation(format!(
                            "cannot remove unknown message id '{id}'"
                        )));
                    };
                    self.messages.remove(index);
                }
                MessageOp::RemoveAll => self.messages.clear(),
            }
        }
        for (key, value) in update.custom_fields {
            self.custom_fields.insert(key, value);
        }
        Ok(())
    }

    pub fn last_ai_index(&self) -> Option<usize> {
        self.messages.iter().rposition(Message::is_ai)
    }

    /// Tool calls of the latest AI message that have no Tool message yet.
    pub fn unanswered_tool_calls(&self) -> Vec<ToolCall> {
        let Some(index) = self.last_ai_index() else {
            return Vec::new();
        };
        let answered = self.messages[index + 1..]
            .iter()
            .filter_map(Message::tool_call_id)
            .collect::<HashSet<_>>();
        self.messages[index]
            .tool_calls()
            .iter()
            .filter(|call| !answered.contains(call.id.as_str()))
            .cloned()
            .collect()
    }

    /// Rewrites the arguments of a tool call in the latest AI message so the
    /// transcript matches what was actually executed. The first arguments seen
    /// for the call are kept under [`EDITED_TOOL_CALLS_KEY`].
    pub fn replace_tool_call_args(&mut self, call_id: &str, args: Value) {
        let Some(index) = self.last_ai_index() else {
            return;
        };
        let original = match &mut self.messages[index] {
            Message::Ai { tool_calls, .. } => tool_calls
                .iter_mut()
                .find(|call| call.id == call_id)
                .map(|call| std::mem::replace(&mut call.args, args)),
            _ => None,
        };
        let Some(original) = original else {
            return;
        };
        let edits = self
            .custom_fields
            .entry(EDITED_TOOL_CALLS_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(edits) = edits {
            edits.entry(call_id).or_insert(original);
        }
    }

    pub fn edited_tool_call_args(&self, call_id: &str) -> Option<&Value> {
        self.custom_fields
            .get(EDITED_TOOL_CALLS_KEY)
            .and_then(|edits| edits.get(call_id))
    }

    pub fn structured_response(&self) -> Option<&Value> {
        self.custom_fields.get(STRUCTURED_RESPONSE_KEY)
    }
}

/// Immutable snapshot written by a [`crate::StateStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "threadId")]
    pub thread_id: String,
    pub version: u64,
    pub state: State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JumpTo {
    End,
    Tools,
    Model,
}

impl Display for JumpTo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JumpTo::End => "end",
            JumpTo::Tools => "tools",
            JumpTo::Model => "model",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageOp {
    Append(Message),
    Remove(String),
    RemoveAll,
}

/// Partial state returned by a hook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub messages: Vec<MessageOp>,
    pub custom_fields: Map<String, Value>,
    pub jump_to: Option<JumpTo>,
}

impl StateUpdate {
    pub fn jump(target: JumpTo) -> Self {
        Self {
            jump_to: Some(target),
            ..Self::default()
        }
    }

    pub fn append(mut self, message: Message) -> Self {
        self.messages.push(MessageOp::Append(message));
        self
    }

    pub fn remove(mut self, id: impl Into<String>) -> Self {
        self.messages.push(MessageOp::Remove(id.into()));
        self
    }

    pub fn remove_all(mut self) -> Self {
        self.messages.push(MessageOp::RemoveAll);
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom_fields.insert(key.into(), value);
        self
    }

    pub fn with_jump(mut self, target: JumpTo) -> Self {
        self.jump_to = Some(target);
        self
    }
}
