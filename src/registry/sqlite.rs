//! SQLite-based agent store.
//!
//! The file reservation index is the `UNIQUE` constraint on
//! `agents.managed_file`: inserting a second agent for a file fails inside
//! SQLite, under the same connection lock as the write.

use super::{now_string, AgentId, AgentRecord, AgentStore};
use crate::error::{FleetError, FleetResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    instructions TEXT NOT NULL DEFAULT '',
    managed_file TEXT NOT NULL UNIQUE,
    context TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    last_active_at TEXT,
    interactions INTEGER NOT NULL DEFAULT 0,
    successes INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_agents_created_at ON agents(created_at);
"#;

const SELECT_COLUMNS: &str = "id, name, description, instructions, managed_file, context,
     created_at, last_active_at, interactions, successes";

pub struct SqliteAgentStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAgentStore {
    /// Open (or create) `{data_dir}/agents.db`.
    ///
    /// Every existing row is read back once; an unreadable database or an
    /// invalid row is a `Storage` error.
    pub async fn new(data_dir: PathBuf) -> FleetResult<Self> {
        tokio::fs::create_dir_all(&data_dir).await.map_err(|e| {
            FleetError::Storage(format!(
                "Failed to create data dir {}: {}",
                data_dir.display(),
                e
            ))
        })?;
        let db_path = data_dir.join("agents.db");

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).map_err(|e| {
                FleetError::Storage(format!(
                    "Failed to open SQLite database {}: {}",
                    db_path.display(),
                    e
                ))
            })?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| FleetError::Storage(format!("Failed to run schema: {}", e)))?;
            Self::run_migrations(&conn)?;
            Self::verify_rows(&conn)?;
            Ok::<_, FleetError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> FleetResult<()> {
        // Counters were added after the first schema
        for (column, ddl) in [
            (
                "interactions",
                "ALTER TABLE agents ADD COLUMN interactions INTEGER NOT NULL DEFAULT 0",
            ),
            (
                "successes",
                "ALTER TABLE agents ADD COLUMN successes INTEGER NOT NULL DEFAULT 0",
            ),
        ] {
            let exists: bool = conn
                .prepare("SELECT 1 FROM pragma_table_info('agents') WHERE name = ?1")?
                .exists([column])?;
            if !exists {
                tracing::info!("Running migration: adding '{}' column to agents table", column);
                conn.execute(ddl, [])?;
            }
        }
        Ok(())
    }

    fn verify_rows(conn: &Connection) -> FleetResult<()> {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM agents", SELECT_COLUMNS))?;
        let count = stmt
            .query_map([], row_to_record)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| FleetError::Storage(format!("Corrupted agent row: {}", e)))?
            .len();
        tracing::debug!("Verified {} persisted agent rows", count);
        Ok(())
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    let id_str: String = row.get(0)?;
    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(AgentRecord {
        id,
        name: row.get(1)?,
        description: row.get(2)?,
        instructions: row.get(3)?,
        managed_file: row.get(4)?,
        context: row.get(5)?,
        created_at: row.get(6)?,
        last_active_at: row.get(7)?,
        interactions: row.get::<_, i64>(8)?.max(0) as u64,
        successes: row.get::<_, i64>(9)?.max(0) as u64,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl AgentStore for SqliteAgentStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn insert(&self, record: &AgentRecord) -> FleetResult<()> {
        let conn = self.conn.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let result = conn.execute(
                "INSERT INTO agents (id, name, description, instructions, managed_file, context,
                                     created_at, last_active_at, interactions, successes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id.to_string(),
                    record.name,
                    record.description,
                    record.instructions,
                    record.managed_file,
                    record.context,
                    record.created_at,
                    record.last_active_at,
                    record.interactions as i64,
                    record.successes as i64,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => {
                    let owner: Option<String> = conn
                        .query_row(
                            "SELECT id FROM agents WHERE managed_file = ?1",
                            [&record.managed_file],
                            |row| row.get(0),
                        )
                        .optional()?;
                    Err(FleetError::Conflict {
                        managed_file: record.managed_file,
                        owner: owner.unwrap_or_else(|| "unknown".to_string()),
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    async fn remove(&self, id: AgentId) -> FleetResult<Option<AgentRecord>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let existing = conn
                .query_row(
                    &format!("SELECT {} FROM agents WHERE id = ?1", SELECT_COLUMNS),
                    [id.to_string()],
                    row_to_record,
                )
                .optional()?;
            if existing.is_some() {
                conn.execute("DELETE FROM agents WHERE id = ?1", [id.to_string()])?;
            }
            Ok(existing)
        })
        .await?
    }

    async fn get(&self, id: AgentId) -> FleetResult<Option<AgentRecord>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM agents WHERE id = ?1", SELECT_COLUMNS),
                    [id.to_string()],
                    row_to_record,
                )
                .optional()?)
        })
        .await?
    }

    async fn list(&self) -> FleetResult<Vec<AgentRecord>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM agents ORDER BY created_at ASC",
                SELECT_COLUMNS
            ))?;
            let agents = stmt
                .query_map([], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(agents)
        })
        .await?
    }

    async fn owner_of(&self, managed_file: &str) -> FleetResult<Option<AgentId>> {
        let conn = self.conn.clone();
        let managed_file = managed_file.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM agents WHERE managed_file = ?1",
                    [&managed_file],
                    |row| row.get(0),
                )
                .optional()?;
            id.map(|s| {
                Uuid::parse_str(&s)
                    .map_err(|e| FleetError::Storage(format!("Invalid agent id '{}': {}", s, e)))
            })
            .transpose()
        })
        .await?
    }

    async fn record_interaction(
        &self,
        id: AgentId,
        context: &str,
        success: bool,
    ) -> FleetResult<Option<AgentRecord>> {
        let conn = self.conn.clone();
        let context = context.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let updated = conn.execute(
                "UPDATE agents
                 SET context = ?1,
                     interactions = interactions + 1,
                     successes = successes + ?2,
                     last_active_at = ?3
                 WHERE id = ?4",
                params![context, success as i64, now_string(), id.to_string()],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM agents WHERE id = ?1", SELECT_COLUMNS),
                    [id.to_string()],
                    row_to_record,
                )
                .optional()?)
        })
        .await?
    }
}
