//! File agents: one agent, one managed file, one cycle per task.
//!
//! A cycle moves through [`AgentPhase`]s:
//!
//! ```text
//! Idle -> AwaitingModel -> Parsing -> Dispatching(0..n) -> Idle
//! ```
//!
//! Cycles for one agent never overlap; the task queue owns the only
//! [`FileAgent`] for each agent and drives it from a single worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, FleetResult};
use crate::llm::{GenerateOptions, InferenceEngine};
use crate::parser::{self, ParseDiagnostic, ToolCallDescriptor};
use crate::queue::TaskType;
use crate::registry::{AgentId, AgentRecord};
use crate::tools::{ToolContext, ToolRegistry, ToolResult};
use crate::util::{append_bounded_context, truncate_with_marker};

/// Bytes of the managed file shown to the model on every prompt.
const FILE_EXCERPT_BYTES: usize = 6_000;
/// Bytes of request and reply kept per context entry.
const CONTEXT_ENTRY_BYTES: usize = 400;

const DEFAULT_INSTRUCTIONS: &str =
    "You are a careful software engineer. Keep changes minimal and the file working.";

/// Where an agent is within its current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "call_index")]
pub enum AgentPhase {
    Idle,
    AwaitingModel,
    Parsing,
    /// Running the call at this index
    Dispatching(usize),
}

/// One tool call and what came of it.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchedCall {
    pub call: ToolCallDescriptor,
    pub result: ToolResult,
}

/// Result payload stored on a finished task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskOutcome {
    /// Prose the model wrote outside tool calls
    pub reply: String,
    /// Calls in the order they ran
    pub calls: Vec<DispatchedCall>,
    /// Segments that looked like tool calls but could not be parsed
    pub diagnostics: Vec<ParseDiagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_ms: Option<u64>,
}

impl TaskOutcome {
    pub fn failed_calls(&self) -> usize {
        self.calls.iter().filter(|c| !c.result.success).count()
    }

    pub fn all_calls_succeeded(&self) -> bool {
        self.failed_calls() == 0
    }

    /// Short `name ok; name failed` summary for context and logs.
    fn tool_summary(&self) -> String {
        if self.calls.is_empty() {
            return "none".to_string();
        }
        self.calls
            .iter()
            .map(|c| {
                format!(
                    "{} {}",
                    c.call.name,
                    if c.result.success { "ok" } else { "failed" }
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Collaborators shared by every agent.
pub struct AgentRuntime {
    pub engine: Arc<dyn InferenceEngine>,
    pub tools: Arc<ToolRegistry>,
    pub workspace: PathBuf,
    pub context_max_chars: usize,
    pub generate_options: GenerateOptions,
}

/// A live agent bound to its managed file.
pub struct FileAgent {
    record: AgentRecord,
    runtime: Arc<AgentRuntime>,
    phase: AgentPhase,
}

impl FileAgent {
    pub fn new(record: AgentRecord, runtime: Arc<AgentRuntime>) -> Self {
        Self {
            record,
            runtime,
            phase: AgentPhase::Idle,
        }
    }

    pub fn id(&self) -> AgentId {
        self.record.id
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    /// Accumulated context, including every finished cycle.
    pub fn context(&self) -> &str {
        &self.record.context
    }

    fn transition(&mut self, next: AgentPhase) {
        tracing::debug!(
            agent_id = %self.record.id,
            from = ?self.phase,
            to = ?next,
            "Agent phase transition"
        );
        self.phase = next;
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext::new(&self.runtime.workspace, &self.record.managed_file)
    }

    async fn file_excerpt(&self) -> String {
        let path = self.tool_context().managed_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) if text.is_empty() => "(empty file)".to_string(),
                Ok(text) => truncate_with_marker(&text, FILE_EXCERPT_BYTES),
                Err(_) => "(binary or non-UTF-8 content)".to_string(),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                "(file does not exist yet)".to_string()
            }
            Err(e) => format!("(could not read file: {})", e),
        }
    }

    /// Assemble the prompt for one task.
    pub async fn build_prompt(&self, task_type: TaskType, message: &str) -> String {
        let instructions = if self.record.instructions.trim().is_empty() {
            DEFAULT_INSTRUCTIONS
        } else {
            self.record.instructions.trim()
        };
        let context = if self.record.context.is_empty() {
            "(no previous tasks)"
        } else {
            self.record.context.as_str()
        };
        let guidance = match task_type {
            TaskType::CodeGeneration => {
                "Produce the requested code by calling write_file or replace_in_file. Do not paste the code as prose."
            }
            TaskType::Conversational => {
                "Answer in prose. Call tools only if the question requires reading or changing the file."
            }
            TaskType::FileOperation => "Carry out the requested file operation with the tools.",
        };
        let excerpt = self.file_excerpt().await;

        format!(
            r#"{instructions}

You are "{name}", the only agent allowed to change `{file}`. Every tool acts on that file.

## Tools
{catalogue}

To call a tool, emit a fenced block per call:
```json
{{"tool": "<name>", "arguments": {{...}}}}
```
You may write prose around the blocks. Calls run in the order you write them.

## Earlier tasks
{context}

## Current contents of `{file}`
```
{excerpt}
```

## Task ({task_type})
{guidance}

{message}"#,
            instructions = instructions,
            name = self.record.name,
            file = self.record.managed_file,
            catalogue = self.runtime.tools.prompt_catalogue(),
            context = context,
            excerpt = excerpt,
            task_type = task_type,
            guidance = guidance,
            message = message.trim(),
        )
    }

    /// Run one task end to end and fold a summary into the agent's context.
    ///
    /// Returns `Err` only when no outcome exists (inference failed, timed out,
    /// or the task was cancelled). Failed tool calls are part of the outcome.
    pub async fn run_cycle(
        &mut self,
        task_type: TaskType,
        message: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> FleetResult<TaskOutcome> {
        let result = self.cycle(task_type, message, timeout, cancel).await;
        self.transition(AgentPhase::Idle);

        let request = truncate_with_marker(message.trim(), CONTEXT_ENTRY_BYTES);
        let entry = match &result {
            Ok(outcome) => format!(
                "[{}] Request: {}\nReply: {}\nTools: {}",
                task_type,
                request,
                truncate_with_marker(&outcome.reply, CONTEXT_ENTRY_BYTES),
                outcome.tool_summary()
            ),
            Err(e) => format!(
                "[{}] Request: {}\nOutcome: failed ({})",
                task_type,
                request,
                e.kind()
            ),
        };
        self.record.context =
            append_bounded_context(&self.record.context, &entry, self.runtime.context_max_chars);

        result
    }

    async fn cycle(
        &mut self,
        task_type: TaskType,
        message: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> FleetResult<TaskOutcome> {
        self.transition(AgentPhase::AwaitingModel);
        let prompt = self.build_prompt(task_type, message).await;
        let started = Instant::now();

        let generation = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(FleetError::Cancelled("cancelled while waiting for the model".to_string()));
            }
            result = tokio::time::timeout(
                timeout,
                self.runtime.engine.generate(&prompt, &self.runtime.generate_options),
            ) => match result {
                Ok(Ok(generation)) => generation,
                Ok(Err(e)) => {
                    tracing::warn!(agent_id = %self.record.id, "Inference failed: {:#}", e);
                    return Err(FleetError::Handler(format!("Inference failed: {:#}", e)));
                }
                Err(_) => {
                    tracing::warn!(
                        agent_id = %self.record.id,
                        "Inference timed out after {}s",
                        timeout.as_secs()
                    );
                    return Err(FleetError::Timeout(timeout.as_secs()));
                }
            }
        };
        let inference_ms = generation
            .duration_ms
            .or_else(|| Some(started.elapsed().as_millis() as u64));

        self.transition(AgentPhase::Parsing);
        let parsed = parser::parse(&generation.text);
        tracing::debug!(
            agent_id = %self.record.id,
            calls = parsed.calls.len(),
            diagnostics = parsed.diagnostics.len(),
            "Parsed model output"
        );

        let ctx = self.tool_context();
        let total = parsed.calls.len();
        let mut calls = Vec::with_capacity(total);
        for (index, call) in parsed.calls.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(FleetError::Cancelled(format!(
                    "cancelled after {} of {} tool calls",
                    index, total
                )));
            }
            self.transition(AgentPhase::Dispatching(index));
            let result = self.runtime.tools.dispatch(&call, &ctx).await;
            tracing::debug!(
                agent_id = %self.record.id,
                tool = %call.name,
                success = result.success,
                "Dispatched tool call"
            );
            calls.push(DispatchedCall { call, result });
        }

        Ok(TaskOutcome {
            reply: parsed.text,
            calls,
            diagnostics: parsed.diagnostics,
            model: generation.model,
            inference_ms,
        })
    }
}
