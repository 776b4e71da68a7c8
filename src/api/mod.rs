//! HTTP API for the fleet.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/auth/login` - Exchange a password for a session token
//! - `POST /api/auth/logout` - Revoke the bearer's session
//! - `POST /mcp` - One JSON-RPC message (bearer required)

mod auth;
mod routes;
pub mod types;

pub use auth::bearer_token;
pub use routes::{router, serve, AppState};
pub use types::*;
