//! Configuration management for file_fleet.
//!
//! Configuration can be set via environment variables:
//! - `FLEET_HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `FLEET_PORT` - Optional. Server port. Defaults to `3100`.
//! - `FLEET_WORKSPACE` - Optional. Root directory managed files live under. Defaults to current directory.
//! - `FLEET_DATA_DIR` - Optional. Where the agent database lives. Defaults to `{workspace}/.file-fleet`.
//! - `AGENT_STORE` - Optional. `sqlite` (default) or `memory`.
//! - `INFERENCE_URL` - Optional. Base URL of the local engine. Defaults to `http://127.0.0.1:11434`.
//! - `INFERENCE_MODEL` - Optional. Model name passed to the engine. Defaults to `qwen2.5-coder:7b`.
//! - `INFERENCE_TIMEOUT_SECS` - Optional. Default bound on one inference call. Defaults to `120`.
//! - `INFERENCE_MAX_RETRIES` - Optional. Retries for transient engine errors. Defaults to `2`.
//! - `TOOL_TIMEOUT_SECS` - Optional. Bound on one tool handler call. Defaults to `60`.
//! - `FLEET_PASSWORD` - Password accepted by `/api/auth/login`.
//! - `FLEET_USERS` - Optional. Extra `user:password` pairs, comma separated.
//! - `JWT_SECRET` - Optional. HMAC secret for session tokens. Random per process if unset.
//! - `SESSION_TTL_MINUTES` - Optional. Session lifetime. Defaults to `720`.
//! - `TASK_RETENTION_SECS` - Optional. How long finished tasks are kept. Defaults to `3600`.
//! - `TASK_RETENTION_MAX` - Optional. Finished tasks kept per agent. Defaults to `100`.
//! - `TASK_FETCH_GRACE_SECS` - Optional. Minimum time a finished task stays fetchable. Defaults to `60`.
//! - `CONTEXT_MAX_CHARS` - Optional. Bound on an agent's accumulated context. Defaults to `8000`.
//! - `ENABLE_RUN_COMMAND` - Optional. Expose the `run_command` tool to agents. Defaults to `false`; when enabled, commands may only write to the managed file.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::env_var_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Which backend persists agent records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentStoreType {
    Memory,
    #[default]
    Sqlite,
}

impl AgentStoreType {
    /// Parse from environment variable value.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" | "db" => Ok(Self::Sqlite),
            other => Err(ConfigError::InvalidValue(
                "AGENT_STORE".to_string(),
                format!("unknown store '{}'", other),
            )),
        }
    }
}

/// Credentials and session settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Password for the default `operator` identity
    pub password: Option<String>,

    /// Additional named users (`username`, `password`)
    pub users: Vec<(String, String)>,

    /// HMAC secret used to sign session tokens
    pub jwt_secret: String,

    /// Session lifetime
    pub session_ttl: Duration,
}

impl AuthConfig {
    /// Whether any credential is configured at all.
    pub fn has_credentials(&self) -> bool {
        self.password.as_deref().map_or(false, |p| !p.is_empty()) || !self.users.is_empty()
    }
}

/// Inference engine connection settings.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Task retention policy.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Finished tasks older than this are evicted
    pub max_age: Duration,
    /// Finished tasks kept per agent before the oldest are evicted
    pub max_per_agent: usize,
    /// A finished task is never evicted sooner than this
    pub fetch_grace: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(3600),
            max_per_agent: 100,
            fetch_grace: Duration::from_secs(60),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Root directory that managed files are resolved against
    pub workspace: PathBuf,

    /// Directory for persisted registry state
    pub data_dir: PathBuf,

    pub agent_store: AgentStoreType,

    pub inference: InferenceConfig,

    /// Bound on one tool handler call
    pub tool_timeout: Duration,

    pub auth: AuthConfig,

    pub retention: RetentionConfig,

    /// Bound on an agent's accumulated context
    pub context_max_chars: usize,

    /// Whether agents may run shell commands in the workspace
    pub enable_run_command: bool,
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        _ => Ok(default),
    }
}

/// Parse `alice:pw1,bob:pw2` into pairs.
fn parse_users(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut users = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (user, pass) = entry.split_once(':').ok_or_else(|| {
            ConfigError::InvalidValue(
                "FLEET_USERS".to_string(),
                format!("entry '{}' is not user:password", entry),
            )
        })?;
        if user.trim().is_empty() || pass.is_empty() {
            return Err(ConfigError::InvalidValue(
                "FLEET_USERS".to_string(),
                format!("entry '{}' has an empty user or password", entry),
            ));
        }
        users.push((user.trim().to_string(), pass.to_string()));
    }
    Ok(users)
}

fn random_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if neither `FLEET_PASSWORD` nor
    /// `FLEET_USERS` is set, and `ConfigError::InvalidValue` for unparsable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("FLEET_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_env("FLEET_PORT", 3100u16)?;

        let workspace = std::env::var("FLEET_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let data_dir = std::env::var("FLEET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace.join(".file-fleet"));

        let agent_store = match std::env::var("AGENT_STORE") {
            Ok(v) => AgentStoreType::parse(&v)?,
            Err(_) => AgentStoreType::default(),
        };

        let inference = InferenceConfig {
            base_url: std::env::var("INFERENCE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            model: std::env::var("INFERENCE_MODEL")
                .unwrap_or_else(|_| "qwen2.5-coder:7b".to_string()),
            timeout: Duration::from_secs(parse_env("INFERENCE_TIMEOUT_SECS", 120u64)?),
            max_retries: parse_env("INFERENCE_MAX_RETRIES", 2u32)?,
        };

        let password = std::env::var("FLEET_PASSWORD").ok().filter(|p| !p.is_empty());
        let users = match std::env::var("FLEET_USERS") {
            Ok(raw) => parse_users(&raw)?,
            Err(_) => Vec::new(),
        };
        let jwt_secret = match std::env::var("JWT_SECRET") {
            Ok(s) if !s.trim().is_empty() => s,
            _ => {
                tracing::warn!(
                    "JWT_SECRET not set; generated a random secret. Sessions will not survive a restart."
                );
                random_secret()
            }
        };
        let auth = AuthConfig {
            password,
            users,
            jwt_secret,
            session_ttl: Duration::from_secs(parse_env("SESSION_TTL_MINUTES", 720u64)? * 60),
        };
        if !auth.has_credentials() {
            return Err(ConfigError::MissingEnvVar("FLEET_PASSWORD".to_string()));
        }

        let retention = RetentionConfig {
            max_age: Duration::from_secs(parse_env("TASK_RETENTION_SECS", 3600u64)?),
            max_per_agent: parse_env("TASK_RETENTION_MAX", 100usize)?,
            fetch_grace: Duration::from_secs(parse_env("TASK_FETCH_GRACE_SECS", 60u64)?),
        };
        if retention.max_age < retention.fetch_grace {
            return Err(ConfigError::InvalidValue(
                "TASK_RETENTION_SECS".to_string(),
                "must not be shorter than TASK_FETCH_GRACE_SECS".to_string(),
            ));
        }

        Ok(Self {
            host,
            port,
            workspace,
            data_dir,
            agent_store,
            inference,
            tool_timeout: Duration::from_secs(parse_env("TOOL_TIMEOUT_SECS", 60u64)?),
            auth,
            retention,
            context_max_chars: parse_env("CONTEXT_MAX_CHARS", 8000usize)?,
            enable_run_command: env_var_bool("ENABLE_RUN_COMMAND", false),
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(workspace: PathBuf, password: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3100,
            data_dir: workspace.join(".file-fleet"),
            workspace,
            agent_store: AgentStoreType::Memory,
            inference: InferenceConfig {
                base_url: "http://127.0.0.1:11434".to_string(),
                model: "test-model".to_string(),
                timeout: Duration::from_secs(30),
                max_retries: 0,
            },
            tool_timeout: Duration::from_secs(30),
            auth: AuthConfig {
                password: Some(password.into()),
                users: Vec::new(),
                jwt_secret: random_secret(),
                session_ttl: Duration::from_secs(3600),
            },
            retention: RetentionConfig::default(),
            context_max_chars: 8000,
            enable_run_command: false,
        }
    }
}
