//! Downstream-facing surfaces: the MCP server handler and the
//! observability HTTP API, both backed by a shared [`crate::RelayRegistry`].

pub mod api;
pub mod server;
