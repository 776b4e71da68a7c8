//! The fleet's caller-facing tools and their argument schemas.

use crate::tools::{ParamKind, ParamSpec, ToolDefinition, ToolSchema};

/// One operation exposed through `tools/call`.
#[derive(Debug, Clone)]
pub struct SurfaceTool {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: ToolSchema,
}

impl SurfaceTool {
    fn new(name: &'static str, description: &'static str, params: Vec<ParamSpec>) -> Self {
        Self {
            name,
            description,
            schema: ToolSchema::new(params),
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.to_string(),
            description: self.description.to_string(),
            input_schema: self.schema.to_json_schema(),
        }
    }
}

fn agent_id() -> ParamSpec {
    ParamSpec::required("agent_id", ParamKind::String, "Agent id (UUID)")
}

fn task_id() -> ParamSpec {
    ParamSpec::required("task_id", ParamKind::String, "Task id (UUID)")
}

/// All surface tools, sorted by name.
pub fn surface_tools() -> Vec<SurfaceTool> {
    let mut tools = vec![
        SurfaceTool::new(
            "create_agent",
            "Create an agent that exclusively manages one workspace file. Fails if another agent already owns the file.",
            vec![
                ParamSpec::required("name", ParamKind::String, "Display name"),
                ParamSpec::optional("description", ParamKind::String, "What the agent is for"),
                ParamSpec::optional(
                    "instructions",
                    ParamKind::String,
                    "System instructions given to the agent on every task",
                ),
                ParamSpec::required(
                    "managed_file",
                    ParamKind::String,
                    "Workspace-relative path of the file the agent owns",
                ),
            ],
        ),
        SurfaceTool::new("list_agents", "List all agents, oldest first.", vec![]),
        SurfaceTool::new("get_agent", "Get one agent's record.", vec![agent_id()]),
        SurfaceTool::new(
            "delete_agent",
            "Delete an agent, releasing its file. Queued tasks are cancelled.",
            vec![agent_id()],
        ),
        SurfaceTool::new(
            "enqueue_task",
            "Queue a task for an agent and return its task id immediately. Poll task_status / task_result for progress.",
            vec![
                agent_id(),
                ParamSpec::required(
                    "task_type",
                    ParamKind::String,
                    "code_generation, conversational, or file_operation",
                ),
                ParamSpec::required("message", ParamKind::String, "What the agent should do"),
                ParamSpec::optional(
                    "timeout_secs",
                    ParamKind::Integer,
                    "Bound on the model call, 1 to 3600 seconds",
                ),
            ],
        ),
        SurfaceTool::new(
            "task_status",
            "Status, queue position and timestamps of a task.",
            vec![agent_id(), task_id()],
        ),
        SurfaceTool::new(
            "task_result",
            "Full result of a task, including the reply, tool calls and any error.",
            vec![agent_id(), task_id()],
        ),
        SurfaceTool::new(
            "cancel_task",
            "Cancel a task. Queued tasks are dropped, running tasks are stopped at the next safe point.",
            vec![agent_id(), task_id()],
        ),
        SurfaceTool::new(
            "list_tasks",
            "List an agent's retained tasks in enqueue order.",
            vec![agent_id()],
        ),
    ];
    tools.sort_by_key(|t| t.name);
    tools
}
