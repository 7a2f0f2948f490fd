//! HTTP surface of the server
//!
//! Routes the stateless `/mcp` endpoint, the SSE session endpoints and the
//! metadata endpoints onto the protocol transports.

pub mod handlers;
pub mod sessions;

pub const MCP_PATH: &str = "/mcp";
pub const SSE_PATH: &str = "/sse";
pub const SSE_MESSAGE_PATH: &str = "/message";
