//! MCP (Model Context Protocol) surface of the fleet.
//!
//! JSON-RPC 2.0 over HTTP (`POST /mcp`) or stdio (`fleet-mcp`).

mod server;
pub mod surface;
pub mod types;

pub use server::FleetServer;
pub use types::{CallToolResult, JsonRpcRequest, JsonRpcResponse};
