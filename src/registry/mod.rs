//! Agent registry with pluggable storage backends.
//!
//! The registry is the only writer of agent existence. It owns the
//! one-file-one-agent invariant: a managed file is checked and reserved in the
//! same critical section that writes the agent record, so two concurrent
//! creates for one file produce exactly one agent and one `Conflict`.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database, `UNIQUE(managed_file)`

mod memory;
mod sqlite;

pub use memory::InMemoryAgentStore;
pub use sqlite::SqliteAgentStore;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AgentStoreType;
use crate::error::{FleetError, FleetResult};

pub type AgentId = Uuid;

const MAX_NAME_CHARS: usize = 128;

/// A persisted agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub description: String,
    /// System instructions prepended to every prompt
    pub instructions: String,
    /// Workspace-relative, normalized
    pub managed_file: String,
    /// Accumulated conversation summary, bounded by `CONTEXT_MAX_CHARS`
    #[serde(default)]
    pub context: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<String>,
    #[serde(default)]
    pub interactions: u64,
    #[serde(default)]
    pub successes: u64,
}

/// Input for [`AgentRegistry::create`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAgent {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: String,
    pub managed_file: String,
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Normalize a managed-file path into its workspace-relative key.
///
/// `./a.py`, `a.py`, and `x/../a.py` all become `a.py`. Absolute paths, empty
/// paths, and paths that climb out of the workspace are rejected.
pub fn normalize_managed_file(raw: &str) -> FleetResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FleetError::validation("managed_file", "must not be empty"));
    }
    let path = Path::new(trimmed);
    if path.is_absolute() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(FleetError::validation(
            "managed_file",
            "must be relative to the workspace",
        ));
    }

    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(FleetError::validation(
                        "managed_file",
                        "must not escape the workspace",
                    ));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(FleetError::validation(
                    "managed_file",
                    "must be relative to the workspace",
                ))
            }
        }
    }

    if parts.is_empty() {
        return Err(FleetError::validation("managed_file", "must name a file"));
    }
    Ok(parts.join("/"))
}

/// Agent store trait - implemented by all storage backends.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Insert a record, reserving its managed file.
    ///
    /// Must fail with `FleetError::Conflict` if another live agent owns the
    /// file; the check and the write are one atomic step.
    async fn insert(&self, record: &AgentRecord) -> FleetResult<()>;

    /// Remove a record and release its file. Returns the removed record.
    async fn remove(&self, id: AgentId) -> FleetResult<Option<AgentRecord>>;

    async fn get(&self, id: AgentId) -> FleetResult<Option<AgentRecord>>;

    /// All agents, oldest first.
    async fn list(&self) -> FleetResult<Vec<AgentRecord>>;

    async fn owner_of(&self, managed_file: &str) -> FleetResult<Option<AgentId>>;

    /// Replace context and bump counters after a finished task.
    async fn record_interaction(
        &self,
        id: AgentId,
        context: &str,
        success: bool,
    ) -> FleetResult<Option<AgentRecord>>;
}

/// Create an agent store based on type and configuration.
pub async fn create_agent_store(
    store_type: AgentStoreType,
    data_dir: PathBuf,
) -> FleetResult<Arc<dyn AgentStore>> {
    match store_type {
        AgentStoreType::Memory => Ok(Arc::new(InMemoryAgentStore::new())),
        AgentStoreType::Sqlite => {
            let store = SqliteAgentStore::new(data_dir).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Creates, deletes, and looks up agents.
#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<dyn AgentStore>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        Self { store }
    }

    /// Registry over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryAgentStore::new()))
    }

    /// Read every persisted agent once. Fails if any row is unreadable.
    pub async fn load(&self) -> FleetResult<usize> {
        let agents = self.store.list().await?;
        tracing::info!(
            "Agent registry loaded {} agents (persistent: {})",
            agents.len(),
            self.store.is_persistent()
        );
        Ok(agents.len())
    }

    pub async fn create(&self, input: NewAgent) -> FleetResult<AgentRecord> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(FleetError::validation("name", "must not be empty"));
        }
        if name.chars().count() > MAX_NAME_CHARS {
            return Err(FleetError::validation(
                "name",
                format!("must be at most {} characters", MAX_NAME_CHARS),
            ));
        }
        let managed_file = normalize_managed_file(&input.managed_file)?;

        let record = AgentRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: input.description,
            instructions: input.instructions,
            managed_file,
            context: String::new(),
            created_at: now_string(),
            last_active_at: None,
            interactions: 0,
            successes: 0,
        };

        match self.store.insert(&record).await {
            Ok(()) => {
                tracing::info!(
                    "Created agent {} ({}) for {}",
                    record.id,
                    record.name,
                    record.managed_file
                );
                Ok(record)
            }
            Err(e) => {
                tracing::debug!("Agent create for {} rejected: {}", record.managed_file, e);
                Err(e)
            }
        }
    }

    /// Delete an agent. The file reservation is released before this returns.
    pub async fn delete(&self, id: AgentId) -> FleetResult<AgentRecord> {
        let removed = self
            .store
            .remove(id)
            .await?
            .ok_or_else(|| FleetError::agent_not_found(id))?;
        tracing::info!("Deleted agent {} (released {})", id, removed.managed_file);
        Ok(removed)
    }

    pub async fn get(&self, id: AgentId) -> FleetResult<AgentRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| FleetError::agent_not_found(id))
    }

    pub async fn list(&self) -> FleetResult<Vec<AgentRecord>> {
        self.store.list().await
    }

    /// Agent that owns `managed_file`, if any. The path is normalized first.
    pub async fn owner_of(&self, managed_file: &str) -> FleetResult<Option<AgentId>> {
        let key = normalize_managed_file(managed_file)?;
        self.store.owner_of(&key).await
    }

    /// Persist the outcome of a finished task. Called only by the agent's queue worker.
    pub async fn record_interaction(
        &self,
        id: AgentId,
        context: &str,
        success: bool,
    ) -> FleetResult<AgentRecord> {
        self.store
            .record_interaction(id, context, success)
            .await?
            .ok_or_else(|| FleetError::agent_not_found(id))
    }
}
