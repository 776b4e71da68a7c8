//! JSON-RPC request handling for the fleet surface.
//!
//! Transport-agnostic: the HTTP route and the stdio binary both hand raw
//! messages to [`FleetServer::handle_message`] together with the caller's
//! bearer token. `tools/call` validates the token before touching the
//! registry or a queue.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::surface::{surface_tools, SurfaceTool};
use super::types::*;
use crate::auth::SessionAuthenticator;
use crate::error::{FleetError, FleetResult};
use crate::queue::{TaskQueue, TaskType};
use crate::registry::{AgentRegistry, NewAgent};

/// Serves `initialize`, `ping`, `tools/list` and `tools/call`.
pub struct FleetServer {
    auth: Arc<SessionAuthenticator>,
    registry: AgentRegistry,
    queue: TaskQueue,
    tools: Vec<SurfaceTool>,
}

fn to_json<T: Serialize>(value: &T) -> FleetResult<Value> {
    serde_json::to_value(value).map_err(|e| FleetError::Internal(e.to_string()))
}

fn str_arg<'a>(args: &'a Map<String, Value>, name: &str) -> &'a str {
    args.get(name).and_then(Value::as_str).unwrap_or_default()
}

fn uuid_arg(args: &Map<String, Value>, name: &str) -> FleetResult<Uuid> {
    let raw = str_arg(args, name);
    Uuid::parse_str(raw.trim())
        .map_err(|_| FleetError::validation(name, format!("'{}' is not a valid id", raw)))
}

impl FleetServer {
    pub fn new(auth: Arc<SessionAuthenticator>, registry: AgentRegistry, queue: TaskQueue) -> Self {
        Self {
            auth,
            registry,
            queue,
            tools: surface_tools(),
        }
    }

    pub fn authenticator(&self) -> &SessionAuthenticator {
        &self.auth
    }

    /// Handle one raw JSON-RPC message. Returns `None` for notifications.
    pub async fn handle_message(&self, raw: &str, token: Option<&str>) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    Value::Null,
                    PARSE_ERROR,
                    format!("Parse error: {}", e),
                ))
            }
        };
        self.handle_value(value, token).await
    }

    /// Handle an already-decoded JSON-RPC message.
    pub async fn handle_value(&self, value: Value, token: Option<&str>) -> Option<JsonRpcResponse> {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    id,
                    INVALID_REQUEST,
                    format!("Invalid request: {}", e),
                ))
            }
        };
        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                id,
                INVALID_REQUEST,
                "Invalid request: jsonrpc must be \"2.0\"",
            ));
        }

        let response = self.handle_request(&request, token).await;
        if request.is_notification() {
            None
        } else {
            response
        }
    }

    pub async fn handle_request(
        &self,
        request: &JsonRpcRequest,
        token: Option<&str>,
    ) -> Option<JsonRpcResponse> {
        let id = request.id_or_null();
        match request.method.as_str() {
            "initialize" => Some(JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {
                        "name": "file-fleet",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {
                        "tools": {
                            "listChanged": false
                        }
                    }
                }),
            )),
            "notifications/initialized" | "initialized" => None,
            "ping" => Some(JsonRpcResponse::success(id, json!({}))),
            "tools/list" => {
                let defs: Vec<_> = self.tools.iter().map(SurfaceTool::definition).collect();
                Some(JsonRpcResponse::success(id, json!({ "tools": defs })))
            }
            "tools/call" => Some(self.call_tool(id, &request.params, token).await),
            other => Some(JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            )),
        }
    }

    async fn call_tool(&self, id: Value, params: &Value, token: Option<&str>) -> JsonRpcResponse {
        let session = match self.auth.validate(token.unwrap_or_default()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Rejected tools/call: {}", e);
                return JsonRpcResponse::error(id, AUTH_ERROR, format!("Authentication failed: {}", e));
            }
        };

        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing tool name");
        };
        let args = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, "arguments must be an object")
            }
        };
        let Some(tool) = self.tools.iter().find(|t| t.name == name) else {
            return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Unknown tool: {}", name));
        };

        let result = match tool.schema.validate(args) {
            Ok(args) => {
                tracing::info!(owner = %session.owner, "tools/call {}", name);
                match self.execute(name, &args).await {
                    Ok(payload) => CallToolResult::ok(payload),
                    Err(e) => {
                        tracing::debug!("tools/call {} failed: {}", name, e);
                        CallToolResult::from(e)
                    }
                }
            }
            Err(e) => CallToolResult::from(FleetError::from(e)),
        };

        match serde_json::to_value(&result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
        }
    }

    async fn execute(&self, name: &str, args: &Map<String, Value>) -> FleetResult<Value> {
        match name {
            "create_agent" => {
                let record = self
                    .registry
                    .create(NewAgent {
                        name: str_arg(args, "name").to_string(),
                        description: str_arg(args, "description").to_string(),
                        instructions: str_arg(args, "instructions").to_string(),
                        managed_file: str_arg(args, "managed_file").to_string(),
                    })
                    .await?;
                to_json(&record)
            }
            "list_agents" => {
                let agents = self.registry.list().await?;
                Ok(json!({ "count": agents.len(), "agents": agents }))
            }
            "get_agent" => {
                let record = self.registry.get(uuid_arg(args, "agent_id")?).await?;
                to_json(&record)
            }
            "delete_agent" => {
                let agent_id = uuid_arg(args, "agent_id")?;
                let record = self.registry.delete(agent_id).await?;
                self.queue.stop_agent(agent_id).await;
                Ok(json!({ "deleted": true, "agent": record }))
            }
            "enqueue_task" => {
                let agent_id = uuid_arg(args, "agent_id")?;
                let task_type = TaskType::parse(str_arg(args, "task_type"))?;
                let timeout = match args.get("timeout_secs") {
                    None => None,
                    Some(secs) => Some(secs.as_u64().map(Duration::from_secs).ok_or_else(|| {
                        FleetError::validation("timeout_secs", "must be between 1 and 3600")
                    })?),
                };
                let task_id = self
                    .queue
                    .enqueue(agent_id, task_type, str_arg(args, "message"), timeout)
                    .await?;
                Ok(json!({
                    "task_id": task_id,
                    "agent_id": agent_id,
                    "status": "queued",
                }))
            }
            "task_status" => {
                let view = self
                    .queue
                    .status(uuid_arg(args, "agent_id")?, uuid_arg(args, "task_id")?)
                    .await?;
                to_json(&view)
            }
            "task_result" => {
                let view = self
                    .queue
                    .result(uuid_arg(args, "agent_id")?, uuid_arg(args, "task_id")?)
                    .await?;
                to_json(&view)
            }
            "cancel_task" => {
                let report = self
                    .queue
                    .cancel(uuid_arg(args, "agent_id")?, uuid_arg(args, "task_id")?)
                    .await?;
                to_json(&report)
            }
            "list_tasks" => {
                let tasks = self.queue.list(uuid_arg(args, "agent_id")?).await?;
                Ok(json!({ "count": tasks.len(), "tasks": tasks }))
            }
            other => Err(FleetError::Internal(format!("no handler for tool {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRuntime;
    use crate::config::{AuthConfig, RetentionConfig};
    use crate::error::ErrorKind;
    use crate::llm::testing::ScriptedEngine;
    use crate::llm::GenerateOptions;
    use crate::tools::ToolRegistry;

    struct Fixture {
        server: Arc<FleetServer>,
        token: String,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(SessionAuthenticator::new(AuthConfig {
            password: Some("pw".to_string()),
            users: Vec::new(),
            jwt_secret: "secret".to_string(),
            session_ttl: Duration::from_secs(600),
        }));
        let runtime = Arc::new(AgentRuntime {
            engine: Arc::new(ScriptedEngine::replying("All done.")),
            tools: Arc::new(ToolRegistry::for_agents(false, Duration::from_secs(5))),
            workspace: dir.path().to_path_buf(),
            context_max_chars: 4000,
            generate_options: GenerateOptions::default(),
        });
        let registry = AgentRegistry::in_memory();
        let queue = TaskQueue::new(
            registry.clone(),
            runtime,
            RetentionConfig::default(),
            Duration::from_secs(5),
        );
        let token = auth.authenticate(None, "pw").unwrap().token;
        Fixture {
            server: Arc::new(FleetServer::new(auth, registry, queue)),
            token,
            _dir: dir,
        }
    }

    fn call_request(name: &str, arguments: Value) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": {"name": name, "arguments": arguments},
        })
        .to_string()
    }

    async fn call(f: &Fixture, name: &str, arguments: Value) -> CallToolResult {
        let response = f
            .server
            .handle_message(&call_request(name, arguments), Some(&f.token))
            .await
            .unwrap();
        assert!(response.error.is_none(), "unexpected error: {:?}", response.error);
        serde_json::from_value(response.result.unwrap()).unwrap()
    }

    fn error_kind(result: &CallToolResult) -> String {
        result.structured_content.as_ref().unwrap()["error_kind"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_initialize_and_ping() {
        let f = fixture();
        let response = f
            .server
            .handle_message(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#, None)
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "file-fleet");

        let pong = f
            .server
            .handle_message(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#, None)
            .await
            .unwrap();
        assert_eq!(pong.id, json!(2));
        assert!(pong.error.is_none());
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let f = fixture();
        let response = f
            .server
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#, None)
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let f = fixture();
        let parse = f.server.handle_message("{not json", None).await.unwrap();
        assert_eq!(parse.error_code(), Some(PARSE_ERROR));

        let invalid = f
            .server
            .handle_message(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#, None)
            .await
            .unwrap();
        assert_eq!(invalid.error_code(), Some(INVALID_REQUEST));

        let missing_method = f
            .server
            .handle_message(r#"{"jsonrpc":"2.0","id":1}"#, None)
            .await
            .unwrap();
        assert_eq!(missing_method.error_code(), Some(INVALID_REQUEST));

        let unknown = f
            .server
            .handle_message(r#"{"jsonrpc":"2.0","id":1,"method":"resources/list"}"#, None)
            .await
            .unwrap();
        assert_eq!(unknown.error_code(), Some(METHOD_NOT_FOUND));

        let unknown_tool = f
            .server
            .handle_message(&call_request("launch_rocket", json!({})), Some(&f.token))
            .await
            .unwrap();
        assert_eq!(unknown_tool.error_code(), Some(INVALID_PARAMS));
    }

    #[tokio::test]
    async fn test_tools_list() {
        let f = fixture();
        let response = f
            .server
            .handle_message(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#, None)
            .await
            .unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            vec![
                "cancel_task",
                "create_agent",
                "delete_agent",
                "enqueue_task",
                "get_agent",
                "list_agents",
                "list_tasks",
                "task_result",
                "task_status",
            ]
        );
        assert_eq!(tools[1]["inputSchema"]["additionalProperties"], json!(false));
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let f = fixture();
        let response = f
            .server
            .handle_message(&call_request("list_agents", json!({})), None)
            .await
            .unwrap();
        assert_eq!(response.error_code(), Some(AUTH_ERROR));
    }

    #[tokio::test]
    async fn test_expired_token_creates_no_task() {
        let f = fixture();
        let created = call(
            &f,
            "create_agent",
            json!({"name": "a", "managed_file": "a.py"}),
        )
        .await;
        let agent_id = created.structured_content.unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();

        // Zero TTL: the token is dead the moment it is issued
        let expired_auth = SessionAuthenticator::new(AuthConfig {
            password: Some("pw".to_string()),
            users: Vec::new(),
            jwt_secret: "secret".to_string(),
            session_ttl: Duration::ZERO,
        });
        let expired = expired_auth.authenticate(None, "pw").unwrap().token;

        let response = f
            .server
            .handle_message(
                &call_request(
                    "enqueue_task",
                    json!({"agent_id": agent_id, "task_type": "conversational", "message": "hi"}),
                ),
                Some(&expired),
            )
            .await
            .unwrap();
        assert_eq!(response.error_code(), Some(AUTH_ERROR));
        assert!(response.error.unwrap().message.contains("expired"));

        let tasks = call(&f, "list_tasks", json!({"agent_id": agent_id})).await;
        assert_eq!(tasks.structured_content.unwrap()["count"], json!(0));
    }

    #[tokio::test]
    async fn test_logged_out_token_rejected() {
        let f = fixture();
        f.server.authenticator().logout(&f.token).unwrap();
        let response = f
            .server
            .handle_message(&call_request("list_agents", json!({})), Some(&f.token))
            .await
            .unwrap();
        assert_eq!(response.error_code(), Some(AUTH_ERROR));
    }

    #[tokio::test]
    async fn test_concurrent_create_for_same_file() {
        let f = fixture();
        let (a, b) = tokio::join!(
            call(&f, "create_agent", json!({"name": "one", "managed_file": "a.py"})),
            call(&f, "create_agent", json!({"name": "two", "managed_file": "./a.py"})),
        );
        assert_eq!([a.is_error, b.is_error].iter().filter(|e| !**e).count(), 1);
        let loser = if a.is_error { &a } else { &b };
        assert_eq!(error_kind(loser), "conflict_error");

        let listed = call(&f, "list_agents", json!({})).await;
        assert_eq!(listed.structured_content.unwrap()["count"], json!(1));
    }

    #[tokio::test]
    async fn test_validation_failures_are_tool_errors() {
        let f = fixture();
        let unknown_field = call(
            &f,
            "create_agent",
            json!({"name": "a", "managed_file": "a.py", "colour": "blue"}),
        )
        .await;
        assert!(unknown_field.is_error);
        assert_eq!(error_kind(&unknown_field), "validation_error");
        assert!(unknown_field.text().contains("colour"));

        let bad_id = call(&f, "get_agent", json!({"agent_id": "nope"})).await;
        assert_eq!(error_kind(&bad_id), "validation_error");

        let missing = call(&f, "get_agent", json!({"agent_id": Uuid::new_v4().to_string()})).await;
        assert_eq!(error_kind(&missing), "not_found_error");

        let escaping = call(
            &f,
            "create_agent",
            json!({"name": "a", "managed_file": "../etc/passwd"}),
        )
        .await;
        assert_eq!(error_kind(&escaping), "validation_error");
    }

    #[tokio::test]
    async fn test_task_lifecycle_through_surface() {
        let f = fixture();
        let created = call(&f, "create_agent", json!({"name": "a", "managed_file": "a.py"})).await;
        let agent_id = created.structured_content.unwrap()["id"].clone();

        let bad_type = call(
            &f,
            "enqueue_task",
            json!({"agent_id": agent_id, "task_type": "poetry", "message": "hi"}),
        )
        .await;
        assert_eq!(error_kind(&bad_type), "validation_error");

        let enqueued = call(
            &f,
            "enqueue_task",
            json!({"agent_id": agent_id, "task_type": "conversational", "message": "hi", "timeout_secs": "30"}),
        )
        .await;
        assert!(!enqueued.is_error, "{}", enqueued.text());
        let task_id = enqueued.structured_content.unwrap()["task_id"].clone();

        let mut status = String::new();
        for _ in 0..200 {
            let view = call(&f, "task_status", json!({"agent_id": agent_id, "task_id": task_id})).await;
            status = view.structured_content.unwrap()["status"]
                .as_str()
                .unwrap()
                .to_string();
            if status == "succeeded" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, "succeeded");

        let result = call(&f, "task_result", json!({"agent_id": agent_id, "task_id": task_id})).await;
        let body = result.structured_content.unwrap();
        assert_eq!(body["outcome"]["reply"], json!("All done."));

        let cancel = call(&f, "cancel_task", json!({"agent_id": agent_id, "task_id": task_id})).await;
        assert_eq!(cancel.structured_content.unwrap()["effect"], json!("already_finished"));

        let deleted = call(&f, "delete_agent", json!({"agent_id": agent_id})).await;
        assert!(!deleted.is_error);
        let gone = call(&f, "get_agent", json!({"agent_id": agent_id})).await;
        assert_eq!(error_kind(&gone), "not_found_error");
        let recreated = call(&f, "create_agent", json!({"name": "b", "managed_file": "a.py"})).await;
        assert!(!recreated.is_error);
    }

    async fn wait_for_status(f: &Fixture, agent_id: &Value, task_id: &Value) -> Value {
        for _ in 0..200 {
            let view = call(f, "task_status", json!({"agent_id": agent_id, "task_id": task_id})).await;
            let body = view.structured_content.unwrap();
            if matches!(body["status"].as_str(), Some("succeeded" | "failed" | "cancelled")) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} did not finish", task_id);
    }

    #[tokio::test]
    async fn test_code_generation_without_calls_completes() {
        let f = fixture();
        let created = call(&f, "create_agent", json!({"name": "a", "managed_file": "a.py"})).await;
        let agent_id = created.structured_content.unwrap()["id"].clone();

        let enqueued = call(
            &f,
            "enqueue_task",
            json!({"agent_id": agent_id, "task_type": "code_generation", "message": "tidy up"}),
        )
        .await;
        assert!(!enqueued.is_error, "{}", enqueued.text());
        let task_id = enqueued.structured_content.unwrap()["task_id"].clone();

        let status = wait_for_status(&f, &agent_id, &task_id).await;
        assert_eq!(status["status"], json!("succeeded"));

        let result = call(&f, "task_result", json!({"agent_id": agent_id, "task_id": task_id})).await;
        assert!(!result.is_error);
        let body = result.structured_content.unwrap();
        assert_eq!(body["outcome"]["calls"], json!([]));
        assert_eq!(body["outcome"]["reply"], json!("All done."));
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_timeout_is_rejected() {
        let f = fixture();
        let created = call(&f, "create_agent", json!({"name": "a", "managed_file": "a.py"})).await;
        let agent_id = created.structured_content.unwrap()["id"].clone();

        for timeout in [json!(u64::MAX), json!(-5), json!(0), json!(3601)] {
            let enqueued = call(
                &f,
                "enqueue_task",
                json!({"agent_id": agent_id, "task_type": "conversational", "message": "hi", "timeout_secs": timeout}),
            )
            .await;
            assert!(enqueued.is_error, "timeout {} accepted", timeout);
            assert_eq!(error_kind(&enqueued), "validation_error");
        }

        let tasks = call(&f, "list_tasks", json!({"agent_id": agent_id})).await;
        assert_eq!(tasks.structured_content.unwrap()["count"], json!(0));
    }
}
