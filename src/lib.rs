//! # file_fleet
//!
//! A fleet of file-bound agents behind an MCP tool surface.
//!
//! Every agent owns exactly one workspace file. Callers create agents, queue
//! tasks for them, and poll for results; each task runs one cycle of
//! prompt → local model → output parser → tool dispatcher against the
//! agent's file.
//!
//! ## Architecture
//!
//! ```text
//!   caller ──► auth ──► mcp::FleetServer ──► registry (create / delete / get)
//!                               │
//!                               ▼
//!                          queue (one FIFO worker per agent)
//!                               │
//!                               ▼
//!                     agents::FileAgent::run_cycle
//!                        │         │          │
//!                        ▼         ▼          ▼
//!                       llm     parser      tools
//! ```
//!
//! ## Modules
//! - `registry`: agent records and the one-file-one-agent reservation
//! - `queue`: per-agent task queues, cancellation and retention
//! - `agents`: the per-task cycle
//! - `parser`: tool-call extraction from model output
//! - `tools`: schema validation and dispatch of agent tools
//! - `auth`: password login and JWT sessions
//! - `mcp` / `api`: JSON-RPC surface over stdio and HTTP

pub mod agents;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod parser;
pub mod queue;
pub mod registry;
pub mod tools;
pub mod util;

pub use config::Config;
pub use error::{ErrorKind, FleetError, FleetResult};
