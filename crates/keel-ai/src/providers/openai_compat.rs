use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::debug;

use super::common::{is_loopback_base_url, join_url, shared_http_client};
use crate::error::{KeelAiError, KeelAiErrorCode};
use crate::invoker::ModelInvoker;
use crate::types::{Message, ModelRequest, ModelResponse, ToolCall, Usage};

#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub headers: HashMap<String, String>,
}

impl OpenAiCompatConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            temperature: None,
            max_tokens: None,
            headers: HashMap::new(),
        }
    }
}

/// Non-streaming `chat/completions` client for OpenAI-compatible endpoints.
pub struct OpenAiCompatInvoker {
    config: OpenAiCompatConfig,
}

impl OpenAiCompatInvoker {
    pub fn new(config: OpenAiCompatConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OpenAiCompatConfig {
        &self.config
    }
}

#[async_trait]
impl ModelInvoker for OpenAiCompatInvoker {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, KeelAiError> {
        let api_key = resolve_api_key(&self.config)?;
        let payload = build_chat_payload(&self.config, &request);
        let endpoint = join_url(&self.config.base_url, "chat/completions");
        let client = shared_http_client(&self.config.base_url);

        debug!(
            endpoint = endpoint.as_str(),
            model = self.config.model.as_str(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            "sending chat completion request"
        );

        let mut http_request = client
            .post(endpoint.as_str())
            .header("Content-Type", "application/json");
        if let Some(api_key) = api_key {
            http_request = http_request.header("Authorization", format!("Bearer {api_key}"));
        }
        for (name, value) in &self.config.headers {
            http_request = http_request.header(name, value);
        }

        let response = http_request.json(&payload).send().await.map_err(|error| {
            KeelAiError::new(
                KeelAiErrorCode::ProviderTransport,
                format!("chat completion transport failed: {error}"),
            )
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|error| {
            KeelAiError::new(
                KeelAiErrorCode::ProviderTransport,
                format!("chat completion body read failed: {error}"),
            )
        })?;

        if !(200..300).contains(&status) {
            let code = if status == 429 {
                KeelAiErrorCode::ProviderRateLimited
            } else {
                KeelAiErrorCode::ProviderHttp
            };
            return Err(
                KeelAiError::new(code, format!("chat completion HTTP {status}: {body}"))
                    .with_details(json!({ "status": status })),
            );
        }

        let value: Value = serde_json::from_str(&body).map_err(|error| {
            KeelAiError::new(
                KeelAiErrorCode::ProviderProtocol,
                format!("invalid chat completion JSON: {error}"),
            )
        })?;
        parse_chat_response(&value, request.response_format.is_some())
    }
}

/// Bearer token for the request. Local endpoints and configs that carry their
/// own `Authorization` header may go without one.
fn resolve_api_key(config: &OpenAiCompatConfig) -> Result<Option<&str>, KeelAiError> {
    if let Some(api_key) = config
        .api_key
        .as_deref()
        .filter(|key| !key.trim().is_empty())
    {
        return Ok(Some(api_key));
    }
    let explicit_auth = config
        .headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case("authorization"));
    if explicit_auth || is_loopback_base_url(&config.base_url) {
        return Ok(None);
    }
    Err(KeelAiError::new(
        KeelAiErrorCode::ProviderAuthMissing,
        format!(
            "missing API key for '{}'; set model.api_key or OPENAI_API_KEY",
            config.base_url
        ),
    ))
}

pub fn build_chat_payload(config: &OpenAiCompatConfig, request: &ModelRequest) -> Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system_prompt) = request
        .system_prompt
        .as_deref()
        .filter(|prompt| !prompt.trim().is_empty())
    {
        messages.push(json!({ "role": "system", "content": system_prompt }));
    }
    messages.extend(request.messages.iter().map(to_wire_message));

    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(config.model));
    payload.insert("messages".to_string(), Value::Array(messages));
    payload.insert("stream".to_string(), json!(false));

    if !request.tools.is_empty() {
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect::<Vec<_>>();
        payload.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(format) = request.response_format.as_ref() {
        payload.insert("response_format".to_string(), to_wire_response_format(format));
    }
    if let Some(temperature) = config.temperature {
        payload.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = config.max_tokens {
        payload.insert("max_tokens".to_string(), json!(max_tokens));
    }

    Value::Object(payload)
}

fn to_wire_message(message: &Message) -> Value {
    match message {
        Message::System { content, .. } => json!({ "role": "system", "content": content }),
        Message::Human { content, .. } => json!({ "role": "user", "content": content }),
        Message::Ai {
            content,
            tool_calls,
            ..
        } => {
            if tool_calls.is_empty() {
                return json!({ "role": "assistant", "content": content });
            }
            let calls = tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.args.to_string(),
                        }
                    })
                })
                .collect::<Vec<_>>();
            let content = if content.is_empty() {
                Value::Null
            } else {
                json!(content)
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        Message::Tool {
            tool_call_id,
            content,
            ..
        } => json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content }),
    }
}

fn to_wire_response_format(format: &Value) -> Value {
    let declared = format.get("type").and_then(Value::as_str);
    if matches!(declared, Some("json_object" | "json_schema" | "text")) {
        return format.clone();
    }
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "response",
            "schema": format,
        }
    })
}

pub fn parse_chat_response(
    body: &Value,
    structured_requested: bool,
) -> Result<ModelResponse, KeelAiError> {
    let message = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| {
            KeelAiError::new(
                KeelAiErrorCode::ProviderProtocol,
                "chat completion missing choices[0].message",
            )
            .with_details(json!({ "body": body }))
        })?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (index, call) in calls.iter().enumerate() {
            tool_calls.push(parse_wire_tool_call(index, call)?);
        }
    }

    let usage = body.get("usage").map(|usage| {
        let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
        let input_tokens = field("prompt_tokens");
        let output_tokens = field("completion_tokens");
        let total_tokens = usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(input_tokens + output_tokens);
        Usage {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    });

    let structured = if structured_requested && tool_calls.is_empty() {
        serde_json::from_str::<Value>(&content).ok()
    } else {
        None
    };

    Ok(ModelResponse {
        content,
        tool_calls,
        usage,
        structured,
    })
}

fn parse_wire_tool_call(index: usize, call: &Value) -> Result<ToolCall, KeelAiError> {
    let function = call.get("function").ok_or_else(|| {
        KeelAiError::new(
            KeelAiErrorCode::ProviderProtocol,
            format!("tool_calls[{index}] missing function"),
        )
    })?;
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            KeelAiError::new(
                KeelAiErrorCode::ProviderProtocol,
                format!("tool_calls[{index}] missing function name"),
            )
        })?;
    let raw_args = function
        .get("arguments")
        .and_then(Value::as_str)
        .unwrap_or("");
    let args = if raw_args.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(raw_args).map_err(|error| {
            KeelAiError::new(
                KeelAiErrorCode::ProviderProtocol,
                format!("tool_calls[{index}] arguments are not valid JSON: {error}"),
            )
            .with_details(json!({ "arguments": raw_args }))
        })?
    };
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{index}"));

    Ok(ToolCall::new(id, name, args))
}
