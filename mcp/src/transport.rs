//! Newline-delimited JSON-RPC transport over a child process's stdio.
//!
//! One [`StdioTransport`] owns exactly one subprocess. A background task
//! reads lines from the child's stdout, parses each as an [`RpcResponse`],
//! and routes it to whichever caller is waiting on that request id. Writes
//! go straight to stdin; MCP requires at most one in-flight request per
//! session, which [`crate::client::McpClient`] enforces with a mutex, not
//! this transport.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::protocol::{RpcNotification, RpcResponse};

#[derive(Debug)]
pub enum TransportError {
    Spawn(std::io::Error),
    Write(std::io::Error),
    Closed,
    Decode(serde_json::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Spawn(e) => write!(f, "failed to spawn MCP server: {e}"),
            TransportError::Write(e) => write!(f, "failed to write to MCP server stdin: {e}"),
            TransportError::Closed => write!(f, "MCP server process closed its stdout"),
            TransportError::Decode(e) => write!(f, "malformed MCP response: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

pub struct StdioTransport {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Spawn `python_executable script_path` with piped stdio and start the
    /// background response reader.
    pub async fn spawn(
        python_executable: &std::path::Path,
        script_path: &std::path::Path,
    ) -> Result<Self, TransportError> {
        let mut child = Command::new(python_executable)
            .arg(script_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(TransportError::Spawn)?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<RpcResponse>(&line) {
                            Ok(response) => {
                                let mut guard = reader_pending.lock().await;
                                if let Some(tx) = guard.remove(&response.id) {
                                    let _ = tx.send(response);
                                } else {
                                    log::warn!(
                                        "received MCP response for unknown request id {}",
                                        response.id
                                    );
                                }
                            }
                            Err(e) => {
                                log::warn!("discarding malformed MCP response line: {e}");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("MCP transport read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            reader_task,
        })
    }

    /// Register `id` as awaiting a response and return the receiver half.
    pub async fn register(&self, id: u64) -> oneshot::Receiver<RpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    pub async fn write_line<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(message).map_err(TransportError::Decode)?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await.map_err(TransportError::Write)?;
        stdin.flush().await.map_err(TransportError::Write)
    }

    pub async fn notify(&self, notification: &RpcNotification) -> Result<(), TransportError> {
        self.write_line(notification).await
    }

    /// Best-effort graceful shutdown: close stdin, wait up to `timeout`,
    /// then kill the process.
    pub async fn shutdown(&self, timeout: std::time::Duration) {
        self.reader_task.abort();
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        let mut child = self.child.lock().await;
        let waited = tokio::time::timeout(timeout, child.wait()).await;
        if waited.is_err() {
            log::warn!("MCP server did not exit within {:?}, killing", timeout);
            let _ = child.kill().await;
        }
    }

    /// `true` if the child process has already exited.
    pub async fn has_exited(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(Some(_)))
    }
}
