//! HTTP route handlers and server startup.

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agents::AgentRuntime;
use crate::auth::{Session, SessionAuthenticator};
use crate::config::{AgentStoreType, Config};
use crate::llm::{GenerateOptions, LocalEngineClient};
use crate::mcp::types::AUTH_ERROR;
use crate::mcp::FleetServer;
use crate::queue::TaskQueue;
use crate::registry::{create_agent_store, AgentRegistry};
use crate::tools::ToolRegistry;

use super::auth;
use super::types::*;

/// How often finished tasks are checked against the retention policy.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub auth: Arc<SessionAuthenticator>,
    pub registry: AgentRegistry,
    pub queue: TaskQueue,
    pub server: Arc<FleetServer>,
}

impl AppState {
    /// Open the agent store and wire up the fleet. Fails if persisted
    /// registry state cannot be read.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.workspace).await?;
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let store = create_agent_store(config.agent_store, config.data_dir.clone()).await?;
        let registry = AgentRegistry::new(store);
        registry.load().await?;

        let runtime = Arc::new(AgentRuntime {
            engine: Arc::new(LocalEngineClient::new(&config.inference)),
            tools: Arc::new(ToolRegistry::for_agents(
                config.enable_run_command,
                config.tool_timeout,
            )),
            workspace: config.workspace.clone(),
            context_max_chars: config.context_max_chars,
            generate_options: GenerateOptions::default(),
        });
        let queue = TaskQueue::new(
            registry.clone(),
            runtime,
            config.retention.clone(),
            config.inference.timeout,
        );
        let auth = Arc::new(SessionAuthenticator::new(config.auth.clone()));
        let server = Arc::new(FleetServer::new(
            Arc::clone(&auth),
            registry.clone(),
            queue.clone(),
        ));

        Ok(Self {
            config,
            auth,
            registry,
            queue,
            server,
        })
    }
}

/// Build the router over prepared state.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/api/auth/logout", post(auth::logout))
        .route("/mcp", post(mcp_endpoint))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::from_config(config).await?);
    let sweeper = state.queue.spawn_retention_sweeper(RETENTION_SWEEP_INTERVAL);

    let app = router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        "Server listening on {} (workspace: {})",
        addr,
        state.config.workspace.display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGTERM/SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let agents = match state.registry.list().await {
        Ok(agents) => agents.len(),
        Err(e) => {
            tracing::warn!("Health check could not list agents: {}", e);
            0
        }
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agent_store: match state.config.agent_store {
            AgentStoreType::Sqlite => "sqlite",
            AgentStoreType::Memory => "memory",
        }
        .to_string(),
        agents,
    })
}

/// One JSON-RPC message per request.
async fn mcp_endpoint(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    body: String,
) -> Response {
    match state.server.handle_message(&body, Some(&session.token)).await {
        Some(response) if response.error_code() == Some(AUTH_ERROR) => {
            (StatusCode::UNAUTHORIZED, Json(response)).into_response()
        }
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}
