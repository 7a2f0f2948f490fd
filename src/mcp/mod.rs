//! JSON-RPC engine and the Model Context Protocol server built on it
//!
//! `rpc` is the wire model, `protocol` correlates requests and replies over a
//! transport, and `server` exposes the catalog through that engine.

pub mod context;
pub mod pagination;
pub mod protocol;
pub mod rpc;
pub mod server;
