use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AgentError;
use crate::state::Counters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Thread,
    Run,
}

impl Display for LimitScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LimitScope::Thread => "thread",
            LimitScope::Run => "run",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitBehavior {
    /// Block only the offending tool calls.
    Continue,
    Error,
    /// Stop the loop with an explanatory AI message.
    End,
}

/// Countable resource. `Tool(None)` is any tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Model,
    Tool(Option<String>),
}

impl Resource {
    pub fn key(&self) -> String {
        match self {
            Resource::Model => "model".to_string(),
            Resource::Tool(None) => "tool".to_string(),
            Resource::Tool(Some(name)) => format!("tool:{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCallLimit {
    pub thread_limit: Option<u64>,
    pub run_limit: Option<u64>,
    pub exit_behavior: ExitBehavior,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallLimit {
    pub tool: Option<String>,
    pub thread_limit: Option<u64>,
    pub run_limit: Option<u64>,
    pub exit_behavior: ExitBehavior,
}

impl ToolCallLimit {
    fn applies_to(&self, tool_name: &str) -> bool {
        self.tool.as_deref().map(|tool| tool == tool_name).unwrap_or(true)
    }

    fn resource(&self) -> Resource {
        Resource::Tool(self.tool.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitViolation {
    pub resource: Resource,
    pub scope: LimitScope,
    pub limit: u64,
    pub exit_behavior: ExitBehavior,
}

impl LimitViolation {
    /// Text shown to the model (blocked tool call) or appended as the final
    /// AI message (`end`).
    pub fn message(&self) -> String {
        match &self.resource {
            Resource::Model => format!(
                "Model call limit reached ({} limit of {}). Stopping here.",
                self.scope, self.limit
            ),
            Resource::Tool(None) => format!(
                "Tool call limit reached ({} limit of {}). Do not call any more tools.",
                self.scope, self.limit
            ),
            Resource::Tool(Some(name)) => format!(
                "Tool call limit reached for '{name}' ({} limit of {}). Do not call '{name}' again.",
                self.scope, self.limit
            ),
        }
    }

    pub fn into_error(self) -> AgentError {
        AgentError::LimitExceeded {
            resource: self.resource.key(),
            scope: self.scope,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitCheck {
    Ok,
    Exceeded(LimitViolation),
}

/// Admission control for model and tool invocations. Counters live in the
/// thread's state; the enforcer itself only holds policy.
#[derive(Debug, Clone, Default)]
pub struct LimitEnforcer {
    model_limits: Vec<ModelCallLimit>,
    tool_limits: Vec<ToolCallLimit>,
}

impl LimitEnforcer {
    pub fn new(
        model_limits: Vec<ModelCallLimit>,
        tool_limits: Vec<ToolCallLimit>,
    ) -> Result<Self, AgentError> {
        for limit in &model_limits {
            if limit.thread_limit.is_none() && limit.run_limit.is_none() {
                return Err(AgentError::Validation(
                    "model call limit needs thread_limit or run_limit".to_string(),
                ));
            }
            if limit.exit_behavior == ExitBehavior::Continue {
                return Err(AgentError::Validation(
                    "exit_behavior 'continue' is only valid for tool call limits".to_string(),
                ));
            }
        }
        for limit in &tool_limits {
            if limit.thread_limit.is_none() && limit.run_limit.is_none() {
                return Err(AgentError::Validation(format!(
                    "tool call limit for {} needs thread_limit or run_limit",
                    limit.tool.as_deref().unwrap_or("all tools")
                )));
            }
            if limit.tool.as_deref().is_some_and(|tool| tool.trim().is_empty()) {
                return Err(AgentError::Validation(
                    "tool call limit names an empty tool".to_string(),
                ));
            }
        }
        Ok(Self {
            model_limits,
            tool_limits,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.model_limits.is_empty() && self.tool_limits.is_empty()
    }

    /// Admits one invocation of `resource` if every applicable limit allows
    /// it, then counts it in both scopes. Blocked calls are not counted.
    pub fn check_and_increment(
        &self,
        counters: &mut Counters,
        resource: &Resource,
        thread_id: &str,
    ) -> LimitCheck {
        if let Some(violation) = self.first_violation(counters, resource) {
            warn!(
                thread_id,
                resource = violation.resource.key().as_str(),
                scope = %violation.scope,
                limit = violation.limit,
                "call limit exceeded"
            );
            return LimitCheck::Exceeded(violation);
        }

        for scope in [LimitScope::Thread, LimitScope::Run] {
            match resource {
                Resource::Model => {
                    counters.increment(scope, "model");
                }
                Resource::Tool(name) => {
                    counters.increment(scope, "tool");
                    if let Some(name) = name {
                        counters.increment(scope, &Resource::Tool(Some(name.clone())).key());
                    }
                }
            }
        }
        LimitCheck::Ok
    }

    fn first_violation(&self, counters: &Counters, resource: &Resource) -> Option<LimitViolation> {
        let candidates: Vec<(Resource, Option<u64>, Option<u64>, ExitBehavior)> = match resource {
            Resource::Model => self
                .model_limits
                .iter()
                .map(|limit| {
                    (
                        Resource::Model,
                        limit.thread_limit,
                        limit.run_limit,
                        limit.exit_behavior,
                    )
                })
                .collect(),
            Resource::Tool(name) => self
                .tool_limits
                .iter()
                .filter(|limit| match name {
                    Some(name) => limit.applies_to(name),
                    None => limit.tool.is_none(),
                })
                .map(|limit| {
                    (
                        limit.resource(),
                        limit.thread_limit,
                        limit.run_limit,
                        limit.exit_behavior,
                    )
                })
                .collect(),
        };

        for (limited, thread_limit, run_limit, exit_behavior) in candidates {
            let key = limited.key();
            for (scope, limit) in [
                (LimitScope::Thread, thread_limit),
                (LimitScope::Run, run_limit),
            ] {
                let Some(limit) = limit else {
                    continue;
                };
                if counters.get(scope, &key) >= limit {
                    return Some(LimitViolation {
                        resource: limited,
                        scope,
                        limit,
                        exit_behavior,
                    });
                }
            }
        }
        None
    }
}
