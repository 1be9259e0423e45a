use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens")]
    pub output_tokens: u64,
    #[serde(rename = "totalTokens")]
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A conversation entry. Every message carries an `id` so that state updates
/// can remove it explicitly; history is otherwise append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system")]
    System { id: String, content: String },
    #[serde(rename = "human")]
    Human { id: String, content: String },
    #[serde(rename = "ai")]
    Ai {
        id: String,
        content: String,
        #[serde(rename = "toolCalls", default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured: Option<Value>,
    },
    #[serde(rename = "tool")]
    Tool {
        id: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        content: String,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            id: new_message_id(),
            content: content.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Message::Human {
            id: new_message_id(),
            content: content.into(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::ai_with_tool_calls(content, vec![])
    }

    pub fn ai_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Ai {
            id: new_message_id(),
            content: content.into(),
            tool_calls,
            usage: None,
            structured: None,
        }
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self::tool_message(call, content.into(), false)
    }

    pub fn tool_error(call: &ToolCall, content: impl Into<String>) -> Self {
        Self::tool_message(call, content.into(), true)
    }

    fn tool_message(call: &ToolCall, content: String, is_error: bool) -> Self {
        Message::Tool {
            id: new_message_id(),
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content,
            is_error,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Message::System { id, .. }
            | Message::Human { id, .. }
            | Message::Ai { id, .. }
            | Message::Tool { id, .. } => id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System { content, .. }
            | Message::Human { content, .. }
            | Message::Ai { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::Human { .. } => "human",
            Message::Ai { .. } => "ai",
            Message::Tool { .. } => "tool",
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Ai { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, Message::Ai { .. })
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Message::Tool { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    #[serde(rename = "systemPrompt", skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(rename = "responseFormat", skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    #[serde(rename = "toolCalls", default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
            ..Self::default()
        }
    }

    pub fn into_message(self) -> Message {
        Message::Ai {
            id: new_message_id(),
            content: self.content,
            tool_calls: self.tool_calls,
            usage: self.usage,
            structured: self.structured,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_serializes_with_role_tag_and_camel_case_fields() {
        let call = ToolCall::new("call-1", "add", json!({ "a": 3, "b": 5 }));
        let message = Message::tool_result(&call, "8");
        let value = serde_json::to_value(&message).expect("serialize tool message");

        assert_eq!(value["role"], json!("tool"));
        assert_eq!(value["toolCallId"], json!("call-1"));
        assert_eq!(value["toolName"], json!("add"));
        assert_eq!(value["isError"], json!(false));
    }

    #[test]
    fn ai_message_without_tool_calls_omits_the_field() {
        let value = serde_json::to_value(Message::ai("done")).expect("serialize ai message");
        assert!(value.get("toolCalls").is_none());
        let parsed: Message = serde_json::from_value(value).expect("parse ai message");
        assert!(parsed.tool_calls().is_empty());
    }

    #[test]
    fn constructors_assign_distinct_ids() {
        let first = Message::human("hi");
        let second = Message::human("hi");
        assert_ne!(first.id(), second.id());
        assert_eq!(first.content(), second.content());
    }
}
