use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keel_agent_core::{
    AgentError, ContextEditingMiddleware, DecisionType, EventSink, ExecutionLoop, ExitBehavior,
    HumanInTheLoopMiddleware, JsonlStateStore, LimitEnforcer, MemoryStateStore, ModelCallLimit,
    OnFailure, RetryOn, RetryPolicy, ReviewConfig, StateStoreRef, SummarizationMiddleware,
    ToolCallLimit,
};
use keel_ai::{ModelInvokerRef, OpenAiCompatConfig};
use serde::Deserialize;

use crate::keel_home::expand_home_path;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_API_KEY: &str = "$OPENAI_API_KEY";
const DEFAULT_SUMMARY_TRIGGER_TOKENS: usize = 30_000;
const DEFAULT_MESSAGES_TO_KEEP: usize = 15;
const DEFAULT_CONTEXT_TRIGGER_TOKENS: usize = 30_000;
const DEFAULT_KEEP_TOOL_RESULTS: usize = 10;

#[derive(Debug, Clone)]
pub struct KeelConfig {
    pub log: LogConfig,
    pub agent: AgentSettings,
    pub model: OpenAiCompatConfig,
    pub store: StoreSettings,
    pub model_retry: RetryPolicy,
    pub tool_retry: RetryPolicy,
    pub model_limits: Vec<ModelCallLimit>,
    pub tool_limits: Vec<ToolCallLimit>,
    pub approval: Vec<ReviewConfig>,
    pub summarization: Option<SummarizationSettings>,
    pub context_editing: Option<ContextEditingSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub level: String,
    pub stdout: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub system_prompt: Option<String>,
    pub recursion_limit: u32,
    pub max_concurrent_tools: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSettings {
    Memory,
    Jsonl(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummarizationSettings {
    pub max_tokens_before_summary: usize,
    pub messages_to_keep: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEditingSettings {
    pub trigger_tokens: usize,
    pub keep_tool_results: usize,
    pub placeholder: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct KeelTomlFile {
    #[serde(default)]
    log: KeelTomlLog,
    #[serde(default)]
    agent: KeelTomlAgent,
    #[serde(default)]
    model: KeelTomlModel,
    #[serde(default)]
    store: KeelTomlStore,
    #[serde(default)]
    retry: KeelTomlRetrySection,
    #[serde(default)]
    limits: KeelTomlLimits,
    #[serde(default)]
    middleware: KeelTomlMiddleware,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlLog {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    stdout: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlAgent {
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    recursion_limit: Option<u32>,
    #[serde(default)]
    max_concurrent_tools: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlModel {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlStore {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlRetrySection {
    #[serde(default)]
    model: Option<KeelTomlRetry>,
    #[serde(default)]
    tool: Option<KeelTomlRetry>,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlRetry {
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    initial_delay_ms: Option<u64>,
    #[serde(default)]
    backoff_factor: Option<f64>,
    #[serde(default)]
    max_delay_ms: Option<u64>,
    #[serde(default)]
    on_failure: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlLimits {
    #[serde(default)]
    model: Vec<KeelTomlLimit>,
    #[serde(default)]
    tool: Vec<KeelTomlLimit>,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlLimit {
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    thread_limit: Option<u64>,
    #[serde(default)]
    run_limit: Option<u64>,
    #[serde(default)]
    exit_behavior: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlMiddleware {
    #[serde(default)]
    approval: KeelTomlApproval,
    #[serde(default)]
    summarization: KeelTomlSummarization,
    #[serde(default)]
    context_editing: KeelTomlContextEditing,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlApproval {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    allowed_decisions: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlSummarization {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    max_tokens_before_summary: Option<usize>,
    #[serde(default)]
    messages_to_keep: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct KeelTomlContextEditing {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    trigger_tokens: Option<usize>,
    #[serde(default)]
    keep_tool_results: Option<usize>,
    #[serde(default)]
    placeholder: Option<String>,
}

/// Reads `keel.toml`; a missing file yields the defaults.
pub fn load_keel_config(config_path: &Path, keel_home_dir: &Path) -> Result<KeelConfig, String> {
    let file = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .map_err(|error| format!("read {} failed: {error}", config_path.display()))?;
        toml::from_str::<KeelTomlFile>(&content)
            .map_err(|error| format!("parse {} failed: {error}", config_path.display()))?
    } else {
        KeelTomlFile::default()
    };
    resolve_keel_config(file, keel_home_dir)
        .map_err(|error| format!("invalid {}: {error}", config_path.display()))
}

pub(crate) fn resolve_keel_config(
    file: KeelTomlFile,
    keel_home_dir: &Path,
) -> Result<KeelConfig, AgentError> {
    let env_map = &file.env;

    let log = LogConfig {
        dir: file
            .log
            .path
            .as_deref()
            .and_then(|value| resolve_config_value(value, env_map))
            .map(|value| expand_home_path(&value))
            .unwrap_or_else(|| keel_home_dir.join("logs")),
        level: file
            .log
            .level
            .as_deref()
            .and_then(|value| resolve_config_value(value, env_map))
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        stdout: file.log.stdout.unwrap_or(false),
    };

    let agent = AgentSettings {
        system_prompt: file
            .agent
            .system_prompt
            .filter(|prompt| !prompt.trim().is_empty()),
        recursion_limit: file
            .agent
            .recursion_limit
            .unwrap_or(keel_agent_core::DEFAULT_RECURSION_LIMIT),
        max_concurrent_tools: file
            .agent
            .max_concurrent_tools
            .unwrap_or(keel_agent_core::DEFAULT_MAX_CONCURRENT_TOOLS),
    };

    let model = resolve_model(&file.model, env_map);

    let store = match file.store.kind.as_deref().map(str::trim) {
        None | Some("jsonl") => StoreSettings::Jsonl(
            file.store
                .dir
                .as_deref()
                .and_then(|value| resolve_config_value(value, env_map))
                .map(|value| expand_home_path(&value))
                .unwrap_or_else(|| keel_home_dir.join("threads")),
        ),
        Some("memory") => StoreSettings::Memory,
        Some(other) => {
            return Err(AgentError::Validation(format!(
                "unknown store kind '{other}', expected 'jsonl' or 'memory'"
            )));
        }
    };

    let model_retry = resolve_retry(file.retry.model.as_ref(), OnFailure::Raise)?;
    let tool_retry = resolve_retry(file.retry.tool.as_ref(), OnFailure::ReturnMessage)?;

    let model_limits = file
        .limits
        .model
        .iter()
        .map(|limit| {
            Ok(ModelCallLimit {
                thread_limit: limit.thread_limit,
                run_limit: limit.run_limit,
                exit_behavior: parse_exit_behavior(limit.exit_behavior.as_deref(), ExitBehavior::End)?,
            })
        })
        .collect::<Result<Vec<_>, AgentError>>()?;
    let tool_limits = file
        .limits
        .tool
        .iter()
        .map(|limit| {
            Ok(ToolCallLimit {
                tool: limit.tool.clone(),
                thread_limit: limit.thread_limit,
                run_limit: limit.run_limit,
                exit_behavior: parse_exit_behavior(
                    limit.exit_behavior.as_deref(),
                    ExitBehavior::Continue,
                )?,
            })
        })
        .collect::<Result<Vec<_>, AgentError>>()?;
    LimitEnforcer::new(model_limits.clone(), tool_limits.clone())?;

    let approval = resolve_approval(&file.middleware.approval)?;

    let summarization = file
        .middleware
        .summarization
        .enabled
        .unwrap_or(false)
        .then(|| SummarizationSettings {
            max_tokens_before_summary: file
                .middleware
                .summarization
                .max_tokens_before_summary
                .unwrap_or(DEFAULT_SUMMARY_TRIGGER_TOKENS),
            messages_to_keep: file
                .middleware
                .summarization
                .messages_to_keep
                .unwrap_or(DEFAULT_MESSAGES_TO_KEEP),
        });
    let context_editing = file
        .middleware
        .context_editing
        .enabled
        .unwrap_or(false)
        .then(|| ContextEditingSettings {
            trigger_tokens: file
                .middleware
                .context_editing
                .trigger_tokens
                .unwrap_or(DEFAULT_CONTEXT_TRIGGER_TOKENS),
            keep_tool_results: file
                .middleware
                .context_editing
                .keep_tool_results
                .unwrap_or(DEFAULT_KEEP_TOOL_RESULTS),
            placeholder: file.middleware.context_editing.placeholder.clone(),
        });

    Ok(KeelConfig {
        log,
        agent,
        model,
        store,
        model_retry,
        tool_retry,
        model_limits,
        tool_limits,
        approval,
        summarization,
        context_editing,
    })
}

/// Wires the resolved configuration into an [`ExecutionLoop`]. The CLI has no
/// built-in tools, so tool-facing settings only matter to embedders.
pub fn build_execution_loop(
    config: &KeelConfig,
    invoker: ModelInvokerRef,
    events: Option<EventSink>,
) -> Result<ExecutionLoop, AgentError> {
    let store: StateStoreRef = match &config.store {
        StoreSettings::Memory => Arc::new(MemoryStateStore::new()),
        StoreSettings::Jsonl(dir) => Arc::new(JsonlStateStore::new(dir.clone())),
    };

    let mut builder = ExecutionLoop::builder(invoker.clone())
        .store(store)
        .model_retry(config.model_retry.clone())
        .tool_retry(config.tool_retry.clone())
        .recursion_limit(config.agent.recursion_limit)
        .max_concurrent_tools(config.agent.max_concurrent_tools);
    if let Some(prompt) = &config.agent.system_prompt {
        builder = builder.system_prompt(prompt.clone());
    }
    if let Some(events) = events {
        builder = builder.event_sink(events);
    }
    for limit in &config.model_limits {
        builder = builder.model_limit(limit.clone());
    }
    for limit in &config.tool_limits {
        builder = builder.tool_limit(limit.clone());
    }
    if let Some(settings) = config.summarization {
        builder = builder.middleware(Arc::new(SummarizationMiddleware::new(
            invoker,
            settings.max_tokens_before_summary,
            settings.messages_to_keep,
        )));
    }
    if let Some(settings) = &config.context_editing {
        let mut middleware =
            ContextEditingMiddleware::new(settings.trigger_tokens, settings.keep_tool_results);
        if let Some(placeholder) = &settings.placeholder {
            middleware = middleware.with_placeholder(placeholder.clone());
        }
        builder = builder.middleware(Arc::new(middleware));
    }
    if !config.approval.is_empty() {
        builder = builder.middleware(Arc::new(HumanInTheLoopMiddleware::new(
            config.approval.clone(),
        )));
    }
    builder.build()
}

fn resolve_model(model: &KeelTomlModel, env_map: &HashMap<String, String>) -> OpenAiCompatConfig {
    let mut config = OpenAiCompatConfig::new(
        model
            .base_url
            .as_deref()
            .and_then(|value| resolve_config_value(value, env_map))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        model
            .model
            .as_deref()
            .and_then(|value| resolve_config_value(value, env_map))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
    );
    config.api_key = resolve_config_value(
        model.api_key.as_deref().unwrap_or(DEFAULT_API_KEY),
        env_map,
    );
    config.temperature = model.temperature;
    config.max_tokens = model.max_tokens;
    config.headers = model
        .headers
        .iter()
        .filter_map(|(name, value)| {
            resolve_config_value(value, env_map).map(|value| (name.clone(), value))
        })
        .collect();
    config
}

fn resolve_retry(
    retry: Option<&KeelTomlRetry>,
    default_on_failure: OnFailure,
) -> Result<RetryPolicy, AgentError> {
    let defaults = RetryPolicy {
        on_failure: default_on_failure,
        ..RetryPolicy::default()
    };
    let Some(retry) = retry else {
        return Ok(defaults);
    };
    let on_failure = match retry.on_failure.as_deref().map(str::trim) {
        None => default_on_failure,
        Some("return_message") => OnFailure::ReturnMessage,
        Some("raise") => OnFailure::Raise,
        Some(other) => {
            return Err(AgentError::Validation(format!(
                "unknown on_failure '{other}', expected 'return_message' or 'raise'"
            )));
        }
    };
    let policy = RetryPolicy {
        max_retries: retry.max_retries.unwrap_or(defaults.max_retries),
        retry_on: RetryOn::Transient,
        initial_delay: retry
            .initial_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_delay),
        backoff_factor: retry.backoff_factor.unwrap_or(defaults.backoff_factor),
        max_delay: retry
            .max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay),
        on_failure,
    };
    policy.validate()?;
    Ok(policy)
}

fn parse_exit_behavior(
    value: Option<&str>,
    default: ExitBehavior,
) -> Result<ExitBehavior, AgentError> {
    match value.map(str::trim) {
        None => Ok(default),
        Some("continue") => Ok(ExitBehavior::Continue),
        Some("error") => Ok(ExitBehavior::Error),
        Some("end") => Ok(ExitBehavior::End),
        Some(other) => Err(AgentError::Validation(format!(
            "unknown exit_behavior '{other}', expected 'continue', 'error' or 'end'"
        ))),
    }
}

fn resolve_approval(approval: &KeelTomlApproval) -> Result<Vec<ReviewConfig>, AgentError> {
    if !approval.enabled.unwrap_or(!approval.tools.is_empty()) {
        return Ok(Vec::new());
    }
    let allowed = if approval.allowed_decisions.is_empty() {
        vec![DecisionType::Approve, DecisionType::Edit, DecisionType::Reject]
    } else {
        approval
            .allowed_decisions
            .iter()
            .map(|value| match value.trim() {
                "approve" => Ok(DecisionType::Approve),
                "edit" => Ok(DecisionType::Edit),
                "reject" => Ok(DecisionType::Reject),
                other => Err(AgentError::Validation(format!(
                    "unknown decision type '{other}'"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?
    };
    approval
        .tools
        .iter()
        .map(|tool| {
            if tool.trim().is_empty() {
                return Err(AgentError::Validation(
                    "approval lists an empty tool name".to_string(),
                ));
            }
            Ok(ReviewConfig::new(tool.trim(), allowed.iter().copied()))
        })
        .collect()
}

/// `$NAME` reads from the `[env]` table first, then the process environment.
fn resolve_config_value(value: &str, env_map: &HashMap<String, String>) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(env_key) = trimmed.strip_prefix('$') {
        return env_map
            .get(env_key)
            .cloned()
            .or_else(|| std::env::var(env_key).ok())
            .filter(|resolved| !resolved.trim().is_empty());
    }
    Some(trimmed.to_string())
}
