//! In-memory agent store (non-persistent).

use super::{now_string, AgentId, AgentRecord, AgentStore};
use crate::error::{FleetError, FleetResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    agents: HashMap<AgentId, AgentRecord>,
    /// managed file -> owner; guarded by the same lock as `agents`
    by_file: HashMap<String, AgentId>,
}

#[derive(Clone, Default)]
pub struct InMemoryAgentStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn insert(&self, record: &AgentRecord) -> FleetResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(owner) = inner.by_file.get(&record.managed_file) {
            return Err(FleetError::Conflict {
                managed_file: record.managed_file.clone(),
                owner: owner.to_string(),
            });
        }
        inner
            .by_file
            .insert(record.managed_file.clone(), record.id);
        inner.agents.insert(record.id, record.clone());
        Ok(())
    }

    async fn remove(&self, id: AgentId) -> FleetResult<Option<AgentRecord>> {
        let mut inner = self.inner.write().await;
        let removed = inner.agents.remove(&id);
        if let Some(record) = &removed {
            inner.by_file.remove(&record.managed_file);
        }
        Ok(removed)
    }

    async fn get(&self, id: AgentId) -> FleetResult<Option<AgentRecord>> {
        Ok(self.inner.read().await.agents.get(&id).cloned())
    }

    async fn list(&self) -> FleetResult<Vec<AgentRecord>> {
        let mut agents: Vec<AgentRecord> =
            self.inner.read().await.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(agents)
    }

    async fn owner_of(&self, managed_file: &str) -> FleetResult<Option<AgentId>> {
        Ok(self.inner.read().await.by_file.get(managed_file).copied())
    }

    async fn record_interaction(
        &self,
        id: AgentId,
        context: &str,
        success: bool,
    ) -> FleetResult<Option<AgentRecord>> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.agents.get_mut(&id) else {
            return Ok(None);
        };
        record.context = context.to_string();
        record.interactions += 1;
        if success {
            record.successes += 1;
        }
        record.last_active_at = Some(now_string());
        Ok(Some(record.clone()))
    }
}
