use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use keel_ai::{Message, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Approve,
    Edit,
    Reject,
}

impl Display for DecisionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DecisionType::Approve => "approve",
            DecisionType::Edit => "edit",
            DecisionType::Reject => "reject",
        })
    }
}

/// A proposed tool call awaiting a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(rename = "toolName")]
    pub tool_name: String,
    pub args: Value,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(rename = "actionName")]
    pub action_name: String,
    #[serde(rename = "allowedDecisions")]
    pub allowed_decisions: BTreeSet<DecisionType>,
}

impl ReviewConfig {
    pub fn new(
        action_name: impl Into<String>,
        allowed_decisions: impl IntoIterator<Item = DecisionType>,
    ) -> Self {
        Self {
            action_name: action_name.into(),
            allowed_decisions: allowed_decisions.into_iter().collect(),
        }
    }

    pub fn all(action_name: impl Into<String>) -> Self {
        Self::new(
            action_name,
            [DecisionType::Approve, DecisionType::Edit, DecisionType::Reject],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(rename = "type")]
    pub kind: DecisionType,
    #[serde(rename = "editedArgs", default, skip_serializing_if = "Option::is_none")]
    pub edited_args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Decision {
    pub fn approve() -> Self {
        Self {
            kind: DecisionType::Approve,
            edited_args: None,
            reason: None,
        }
    }

    pub fn edit(args: Value) -> Self {
        Self {
            kind: DecisionType::Edit,
            edited_args: Some(args),
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            kind: DecisionType::Reject,
            edited_args: None,
            reason: Some(reason.into()),
        }
    }
}

/// What a tool or middleware hands back to suspend one call.
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptRequest {
    pub action_request: ActionRequest,
    pub review_config: ReviewConfig,
}

/// The tool dispatch that was in flight when the interrupt was raised.
/// `results` is index-aligned with `calls`; `awaiting` lists the indices
/// that need a decision, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolBatch {
    pub calls: Vec<ToolCall>,
    pub results: Vec<Option<Message>>,
    pub awaiting: Vec<usize>,
}

impl ToolBatch {
    pub fn new(calls: Vec<ToolCall>) -> Self {
        let results = vec![None; calls.len()];
        Self {
            calls,
            results,
            awaiting: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(Option::is_some)
    }

    /// Completed results in request order. `None` while any call is open.
    pub fn into_messages(self) -> Option<Vec<Message>> {
        self.results.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    #[serde(rename = "actionRequests")]
    pub action_requests: Vec<ActionRequest>,
    #[serde(rename = "reviewConfigs")]
    pub review_configs: Vec<ReviewConfig>,
    pub resume: ToolBatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Original or edited call; execution skips review.
    Execute(ToolCall),
    Rejected(Message),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBatch {
    pub batch: ToolBatch,
    pub dispositions: Vec<(usize, Disposition)>,
}

pub struct InterruptController;

impl InterruptController {
    /// Packs the suspended batch. `requests` pairs a batch index with the
    /// interrupt raised for that call.
    pub fn raise_interrupt(
        mut batch: ToolBatch,
        requests: Vec<(usize, InterruptRequest)>,
    ) -> PendingInterrupt {
        let mut action_requests = Vec::with_capacity(requests.len());
        let mut review_configs = Vec::with_capacity(requests.len());
        batch.awaiting.clear();
        for (index, request) in requests {
            batch.awaiting.push(index);
            action_requests.push(request.action_request);
            review_configs.push(request.review_config);
        }
        debug!(
            awaiting = batch.awaiting.len(),
            batch_size = batch.calls.len(),
            "interrupt raised"
        );
        PendingInterrupt {
            action_requests,
            review_configs,
            resume: batch,
        }
    }

    /// Checks the whole batch before anything is applied.
    pub fn validate(pending: &PendingInterrupt, decisions: &[Decision]) -> Result<(), AgentError> {
        if decisions.len() != pending.action_requests.len() {
            return Err(AgentError::InvalidDecision(format!(
                "expected {} decisions, got {}",
                pending.action_requests.len(),
                decisions.len()
            )));
        }
        for (index, (decision, config)) in decisions.iter().zip(&pending.review_configs).enumerate()
        {
            if !config.allowed_decisions.contains(&decision.kind) {
                return Err(AgentError::InvalidDecision(format!(
                    "decision {index} '{}' is not allowed for '{}'",
                    decision.kind, config.action_name
                )));
            }
            if decision.kind == DecisionType::Edit && decision.edited_args.is_none() {
                return Err(AgentError::InvalidDecision(format!(
                    "decision {index} is an edit without editedArgs"
                )));
            }
        }
        Ok(())
    }

    pub fn apply(
        pending: PendingInterrupt,
        decisions: Vec<Decision>,
    ) -> Result<ResolvedBatch, AgentError> {
        Self::validate(&pending, &decisions)?;

        let batch = pending.resume;
        let mut dispositions = Vec::with_capacity(decisions.len());
        for (index, decision) in batch.awaiting.iter().copied().zip(decisions) {
            let Some(original) = batch.calls.get(index) else {
                return Err(AgentError::InvalidDecision(format!(
                    "pending interrupt references missing tool call {index}"
                )));
            };
            let disposition = match decision.kind {
                DecisionType::Approve => Disposition::Execute(original.clone()),
                DecisionType::Edit => {
                    let mut edited = original.clone();
                    if let Some(args) = decision.edited_args {
                        edited.args = args;
                    }
                    Disposition::Execute(edited)
                }
                DecisionType::Reject => {
                    let content = decision.reason.unwrap_or_else(|| {
                        format!("User rejected the tool call for `{}`.", original.name)
                    });
                    Disposition::Rejected(Message::tool_error(original, content))
                }
            };
            dispositions.push((index, disposition));
        }

        Ok(ResolvedBatch {
            batch: ToolBatch {
                awaiting: Vec::new(),
                ..batch
            },
            dispositions,
        })
    }
}
