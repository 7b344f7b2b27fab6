//! MCP lifecycle management built on top of the `hatchling_mcp` transport crate.

pub mod manager;

pub use manager::{McpManager, McpManagerError};
