use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeelAiErrorCode {
    ToolNotFound,
    ToolArgumentsInvalid,
    /// Permanent tool failure; surfaced to the model as tool content.
    ToolExecutionFailed,
    /// Tool failure that may succeed when attempted again.
    ToolTransient,
    SchemaInvalid,
    ProviderAuthMissing,
    ProviderHttp,
    ProviderRateLimited,
    ProviderTransport,
    ProviderProtocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeelAiError {
    pub code: KeelAiErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl KeelAiError {
    pub fn new(code: KeelAiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn transient_tool(message: impl Into<String>) -> Self {
        Self::new(KeelAiErrorCode::ToolTransient, message)
    }

    pub fn tool_failed(message: impl Into<String>) -> Self {
        Self::new(KeelAiErrorCode::ToolExecutionFailed, message)
    }

    /// HTTP status recorded by the provider adapter, if any.
    pub fn http_status(&self) -> Option<u16> {
        self.details
            .as_ref()
            .and_then(|details| details.get("status"))
            .and_then(Value::as_u64)
            .map(|status| status as u16)
    }

    pub fn is_transient(&self) -> bool {
        match self.code {
            KeelAiErrorCode::ToolTransient
            | KeelAiErrorCode::ProviderRateLimited
            | KeelAiErrorCode::ProviderTransport => true,
            KeelAiErrorCode::ProviderHttp => {
                self.http_status().map(|status| status >= 500).unwrap_or(false)
            }
            _ => false,
        }
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"provider_protocol\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl Display for KeelAiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for KeelAiError {}
