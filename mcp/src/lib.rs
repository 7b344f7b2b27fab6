//! Reusable MCP (Model Context Protocol) client primitives.
//!
//! This crate is deliberately narrow: it owns the subprocess transport and
//! the JSON-RPC wire types for `tools/list` and `tools/call`. It has no
//! notion of a tool catalog, an event bus, or an LLM provider — those
//! policies live in the `hatchling` crate that consumes this one.

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::{McpClient, McpClientError};
pub use protocol::{ContentBlock, McpToolDescriptor, ToolsCallResult};
