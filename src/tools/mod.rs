//! Tool system for file agents.
//!
//! Tools are the agent's hands: each agent may only touch its own managed file
//! (and, when enabled, run commands in the workspace root). The model never
//! calls a tool directly; the parser hands us a [`ToolCallDescriptor`] and the
//! [`ToolRegistry`] validates it against the tool's [`ToolSchema`], runs the
//! handler under a time bound, and normalizes whatever happens into a
//! [`ToolResult`].

mod file_ops;
pub mod schema;
mod terminal;

pub use file_ops::{ReadFile, ReplaceInFile, WriteFile};
pub use schema::{ParamKind, ParamSpec, SchemaError, ToolSchema};
pub use terminal::RunCommand;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ErrorKind;
use crate::parser::ToolCallDescriptor;

// ============================================================================
// Context and arguments
// ============================================================================

/// What a tool handler is allowed to act on.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Workspace root; commands run here
    pub workspace: PathBuf,
    /// Managed file, workspace-relative (as shown to the model)
    pub managed_file: String,
}

impl ToolContext {
    pub fn new(workspace: impl Into<PathBuf>, managed_file: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            managed_file: managed_file.into(),
        }
    }

    /// Absolute path of the managed file.
    pub fn managed_path(&self) -> PathBuf {
        self.workspace.join(&self.managed_file)
    }
}

/// Arguments that already passed schema validation.
#[derive(Debug, Clone, Default)]
pub struct ToolArgs(Map<String, Value>);

impl ToolArgs {
    pub fn new(args: Map<String, Value>) -> Self {
        Self(args)
    }

    pub fn str(&self, name: &str) -> anyhow::Result<&str> {
        self.0
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Missing '{}' argument", name))
    }

    pub fn opt_u64(&self, name: &str) -> Option<u64> {
        self.0.get(name).and_then(Value::as_u64)
    }

    pub fn opt_bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }
}

// ============================================================================
// Results
// ============================================================================

/// What a handler returns on success.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub message: String,
    pub payload: Option<Value>,
    pub side_effects: Option<String>,
}

impl ToolOutput {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_side_effects(mut self, summary: impl Into<String>) -> Self {
        self.side_effects = Some(summary.into());
        self
    }
}

/// Normalized outcome of one dispatched call. Never an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ToolResult {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            payload: None,
            side_effects: None,
            error_kind: Some(kind),
        }
    }
}

impl From<ToolOutput> for ToolResult {
    fn from(output: ToolOutput) -> Self {
        Self {
            success: true,
            message: output.message,
            payload: output.payload,
            side_effects: output.side_effects,
            error_kind: None,
        }
    }
}

// ============================================================================
// Tool Trait and Registry
// ============================================================================

/// Entry for `tools/list` and the prompt's tool catalogue.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// Declared parameters.
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with validated arguments.
    async fn execute(&self, args: ToolArgs, ctx: &ToolContext) -> anyhow::Result<ToolOutput>;
}

/// Registry of available tools and the dispatcher over them.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolRegistry {
    /// Create an empty registry (no built-in tools).
    pub fn empty(timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            timeout,
        }
    }

    /// Registry with the file tools every agent gets, plus `run_command` if enabled.
    pub fn for_agents(enable_run_command: bool, timeout: Duration) -> Self {
        let mut registry = Self::empty(timeout);
        registry.register(Arc::new(ReadFile));
        registry.register(Arc::new(WriteFile));
        registry.register(Arc::new(ReplaceInFile));
        if enable_run_command {
            registry.register(Arc::new(RunCommand));
        }
        tracing::debug!(
            "Agent tool registry ready with {} tools (run_command: {})",
            registry.tools.len(),
            enable_run_command
        );
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Check if a tool exists by name.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool definitions sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.schema().to_json_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// One line per tool, `name(param: type, opt?: type): description`, sorted by name.
    pub fn prompt_catalogue(&self) -> String {
        let mut tools: Vec<&Arc<dyn Tool>> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
            .iter()
            .map(|t| {
                let params = t
                    .schema()
                    .params()
                    .iter()
                    .map(|p| {
                        format!(
                            "{}{}: {}",
                            p.name,
                            if p.required { "" } else { "?" },
                            p.kind.json_type()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("- {}({}): {}", t.name(), params, t.description())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Validate and run one call. Every failure becomes a failed [`ToolResult`].
    pub async fn dispatch(&self, call: &ToolCallDescriptor, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolResult::failure(
                ErrorKind::Validation,
                format!("Unknown tool: {}", call.name),
            );
        };

        let args = match tool.schema().validate(call.arguments.clone()) {
            Ok(args) => ToolArgs::new(args),
            Err(e) => {
                tracing::debug!("Rejected {} call: {}", call.name, e);
                return ToolResult::failure(
                    ErrorKind::Validation,
                    format!("Invalid arguments for {}: {}", call.name, e),
                );
            }
        };

        // A panicking handler surfaces as a JoinError
        let handler = {
            let tool = Arc::clone(tool);
            let ctx = ctx.clone();
            tokio::spawn(async move { tool.execute(args, &ctx).await })
        };
        let abort = handler.abort_handle();

        match tokio::time::timeout(self.timeout, handler).await {
            Ok(Ok(Ok(output))) => output.into(),
            Ok(Ok(Err(e))) => {
                tracing::debug!("Tool {} failed: {}", call.name, e);
                ToolResult::failure(ErrorKind::Handler, format!("{:#}", e))
            }
            Ok(Err(join_err)) => {
                tracing::error!("Tool {} panicked: {}", call.name, join_err);
                ToolResult::failure(
                    ErrorKind::Handler,
                    format!("Tool {} crashed: {}", call.name, join_err),
                )
            }
            Err(_) => {
                abort.abort();
                tracing::warn!(
                    "Tool {} timed out after {}s",
                    call.name,
                    self.timeout.as_secs()
                );
                ToolResult::failure(
                    ErrorKind::Timeout,
                    format!(
                        "Tool {} timed out after {} seconds",
                        call.name,
                        self.timeout.as_secs()
                    ),
                )
            }
        }
    }
}
