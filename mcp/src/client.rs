//! One [`McpClient`] per MCP server: spawn, handshake, invoke, disconnect.
//!
//! ```rust,no_run
//! use std::path::Path;
//! use mcp::client::McpClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = McpClient::spawn(Path::new("python3"), Path::new("server.py")).await?;
//! let tools = client.initialize().await?;
//! println!("{} tools available", tools.len());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::protocol::{
    InitializeParams, McpToolDescriptor, RpcNotification, RpcRequest, ToolsCallParams,
    ToolsCallResult, ToolsListResult,
};
use crate::transport::{StdioTransport, TransportError};

const DISCONNECT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum McpClientError {
    Transport(TransportError),
    ResponseChannelClosed,
    Rpc(crate::protocol::RpcError),
    Decode(serde_json::Error),
}

impl std::fmt::Display for McpClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McpClientError::Transport(e) => write!(f, "{e}"),
            McpClientError::ResponseChannelClosed => {
                write!(f, "MCP server closed the connection before responding")
            }
            McpClientError::Rpc(e) => write!(f, "{e}"),
            McpClientError::Decode(e) => write!(f, "failed to decode MCP result: {e}"),
        }
    }
}

impl std::error::Error for McpClientError {}

impl From<TransportError> for McpClientError {
    fn from(e: TransportError) -> Self {
        McpClientError::Transport(e)
    }
}

/// A live connection to one MCP server.
///
/// Exactly one request may be in flight at a time: [`call`](McpClient::call)
/// takes an internal mutex across request and response, so concurrent
/// callers queue rather than interleave on the wire.
pub struct McpClient {
    transport: Arc<StdioTransport>,
    next_id: AtomicU64,
    request_guard: Mutex<()>,
    pub server_path: PathBuf,
}

impl McpClient {
    pub async fn spawn(
        python_executable: &Path,
        server_path: &Path,
    ) -> Result<Self, McpClientError> {
        let transport = StdioTransport::spawn(python_executable, server_path).await?;
        Ok(Self {
            transport: Arc::new(transport),
            next_id: AtomicU64::new(1),
            request_guard: Mutex::new(()),
            server_path: server_path.to_path_buf(),
        })
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpClientError> {
        let _permit = self.request_guard.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.transport.register(id).await;
        let request = RpcRequest::new(id, method, params);
        self.transport.write_line(&request).await?;
        let response = rx.await.map_err(|_| McpClientError::ResponseChannelClosed)?;
        if let Some(error) = response.error {
            return Err(McpClientError::Rpc(error));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Handshake then `tools/list`. Returns the server's advertised tools.
    pub async fn initialize(&self) -> Result<Vec<McpToolDescriptor>, McpClientError> {
        let init_params = serde_json::to_value(InitializeParams::default())
            .map_err(McpClientError::Decode)?;
        self.call("initialize", Some(init_params)).await?;
        self.transport
            .notify(&RpcNotification::new("notifications/initialized", None))
            .await?;
        let result = self.call("tools/list", None).await?;
        let parsed: ToolsListResult =
            serde_json::from_value(result).map_err(McpClientError::Decode)?;
        Ok(parsed.tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolsCallResult, McpClientError> {
        let params = ToolsCallParams { name, arguments };
        let value = serde_json::to_value(params).map_err(McpClientError::Decode)?;
        let result = self.call("tools/call", Some(value)).await?;
        serde_json::from_value(result).map_err(McpClientError::Decode)
    }

    /// Non-standard method some servers expose. Absence is not an error.
    pub async fn get_citations(&self) -> Option<std::collections::HashMap<String, String>> {
        match self.call("citations/get", None).await {
            Ok(value) => serde_json::from_value(value).ok(),
            Err(_) => None,
        }
    }

    pub async fn disconnect(&self) {
        self.transport
            .notify(&RpcNotification::new("notifications/shutdown", None))
            .await
            .ok();
        self.transport.shutdown(DISCONNECT_GRACE).await;
    }

    pub async fn has_exited(&self) -> bool {
        self.transport.has_exited().await
    }
}
