//! Tool registry and dispatch.
//!
//! Tools give the language model hands: the model emits a call, the
//! dispatcher validates the arguments against the tool's schema, runs it
//! under a timeout, and hands the result back to generation. Tool failures
//! are isolated; the model is told what went wrong and talks its way out.

pub mod builtin;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{AgentError, AgentResult};

/// A tool call that could not produce a result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// The model asked for a tool nobody registered.
    #[error("no tool named '{0}' is registered")]
    NotFound(String),

    /// Arguments failed schema validation.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The tool did not finish within the dispatcher's deadline.
    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The tool ran and failed.
    #[error("{0}")]
    Execution(String),
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

/// Schema advertised to the language model for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: InputSchema,
}

/// JSON-Schema-shaped parameter description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub properties: HashMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: &str, schema: PropertySchema, required: bool) -> Self {
        self.properties.insert(name.to_string(), schema);
        if required {
            self.required.push(name.to_string());
        }
        self
    }
}

/// One parameter's type, doc string and optional default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub prop_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl PropertySchema {
    fn typed(prop_type: &str, description: impl Into<String>) -> Self {
        Self {
            prop_type: prop_type.to_string(),
            description: description.into(),
            default: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::typed("string", description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::typed("integer", description)
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::typed("number", description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::typed("boolean", description)
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Validates call arguments against a schema: required keys present,
/// declared types respected. Unknown keys pass through.
pub fn validate_arguments(schema: &InputSchema, arguments: &Value) -> Result<(), ToolError> {
    let object = match arguments {
        Value::Object(map) => map,
        Value::Null if schema.required.is_empty() => return Ok(()),
        _ => {
            return Err(ToolError::InvalidArguments(
                "arguments must be a JSON object".to_string(),
            ))
        }
    };

    for key in &schema.required {
        if !object.contains_key(key) {
            return Err(ToolError::InvalidArguments(format!(
                "missing required argument '{key}'"
            )));
        }
    }

    for (key, value) in object {
        let Some(property) = schema.properties.get(key) else {
            continue;
        };
        let matches = match property.prop_type.as_str() {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            _ => true,
        };
        if !matches {
            return Err(ToolError::InvalidArguments(format!(
                "argument '{key}' must be a {}",
                property.prop_type
            )));
        }
    }
    Ok(())
}

/// Side channel handed to a running tool.
///
/// `say` requests a proactive spoken update within the current turn, for
/// long-running tools that want to keep the user engaged ("let me look
/// that up for you"). The request is serialized by the reply generator;
/// it never overlaps the main reply.
#[derive(Clone)]
pub struct ToolContext {
    proactive_tx: mpsc::Sender<String>,
    token: CancellationToken,
    spoke: Arc<AtomicBool>,
}

impl ToolContext {
    pub fn new(proactive_tx: mpsc::Sender<String>, token: CancellationToken) -> Self {
        Self {
            proactive_tx,
            token,
            spoke: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Context for one invocation, sharing the turn's channel and token but
    /// tracking its own proactive-reply flag.
    fn per_call(&self) -> Self {
        Self {
            proactive_tx: self.proactive_tx.clone(),
            token: self.token.clone(),
            spoke: Arc::new(AtomicBool::new(false)),
        }
    }

    fn said_something(&self) -> bool {
        self.spoke.load(Ordering::Acquire)
    }

    /// Request a proactive utterance. Silently dropped once the turn is
    /// cancelled or closed.
    pub async fn say(&self, instruction: impl Into<String>) {
        let instruction = instruction.into();
        if self.proactive_tx.send(instruction).await.is_err() {
            debug!("proactive utterance dropped, turn no longer active");
            return;
        }
        self.spoke.store(true, Ordering::Release);
    }

    /// The turn's cancellation token, for tools that poll long operations.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }
}

/// An invocable capability.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    /// Deadline for one invocation. `None` uses the dispatcher's default;
    /// tools that are known to be slow (or must be fast) override it.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, arguments: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Record of one tool call, kept on the owning turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub arguments: Value,
    /// Result payload on success
    pub result: Option<Value>,
    /// Error text on failure
    pub error: Option<String>,
    pub latency_ms: u64,
    /// Whether the tool requested a proactive utterance while running
    #[serde(default)]
    pub proactive: bool,
}

impl ToolInvocation {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Text folded back into the language-model history.
    pub fn feedback(&self) -> String {
        match (&self.result, &self.error) {
            (Some(result), _) => result.to_string(),
            (None, Some(error)) => format!("tool call failed: {error}"),
            (None, None) => "tool call produced no result".to_string(),
        }
    }
}

/// Name-keyed tool collection. Registration is fixed before the session
/// starts; duplicate names are a configuration error.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> AgentResult<()> {
        let name = tool.schema().name;
        if self.tools.contains_key(&name) {
            return Err(AgentError::Configuration(format!(
                "tool '{name}' registered twice"
            )));
        }
        info!(tool = %name, "registered tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Schemas advertised to the language model.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Runs tool calls with validation, a deadline and cancellation.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.registry.schemas()
    }

    /// Dispatch one call. Always returns an invocation record; every
    /// failure mode lands in its `error` field so the caller can fold it
    /// back into generation instead of aborting the turn.
    ///
    /// Returns `None` only when the turn was cancelled mid-call; a result
    /// arriving after that is discarded.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Value,
        ctx: &ToolContext,
    ) -> Option<ToolInvocation> {
        let started = Instant::now();
        let mut record = ToolInvocation {
            tool: name.to_string(),
            arguments: arguments.clone(),
            result: None,
            error: None,
            latency_ms: 0,
            proactive: false,
        };

        let call_ctx = ctx.per_call();
        let outcome = self.run_checked(name, arguments, &call_ctx).await;
        record.latency_ms = started.elapsed().as_millis() as u64;
        record.proactive = call_ctx.said_something();

        match outcome {
            Ok(Some(result)) => record.result = Some(result),
            Ok(None) => {
                debug!(tool = name, "turn cancelled, discarding tool result");
                return None;
            }
            Err(error) => {
                warn!(tool = name, %error, "tool call failed");
                record.error = Some(error.to_string());
            }
        }
        Some(record)
    }

    async fn run_checked(
        &self,
        name: &str,
        arguments: Value,
        ctx: &ToolContext,
    ) -> Result<Option<Value>, ToolError> {
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        validate_arguments(&tool.schema().parameters, &arguments)?;

        let token = ctx.cancellation().clone();
        let limit = tool.timeout().unwrap_or(self.timeout);
        let deadline = tokio::time::timeout(limit, tool.run(arguments, ctx));

        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(None),
            result = deadline => match result {
                Ok(Ok(value)) => Ok(Some(value)),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(ToolError::Timeout {
                    tool: name.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
        }
    }
}
