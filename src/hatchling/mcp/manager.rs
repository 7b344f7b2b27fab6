//! Lifecycle of every connected MCP client; routes `execute_tool`.
//!
//! Connection-map mutation is guarded by one mutex so that concurrent
//! `connect_to_servers`/`disconnect_all` calls cannot interleave catalog
//! updates — mirroring the chain scheduler's single continuation mutex
//! (see [`crate::hatchling::chain_scheduler`]).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use mcp::client::McpClient;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::hatchling::config::ToolCallingSettings;
use crate::hatchling::env_manager::EnvironmentManager;
use crate::hatchling::event_bus::{EventBus, EventKind};
use crate::hatchling::provider::ToolResult;
use crate::hatchling::tool_catalog::{CatalogError, ToolCatalog, ToolInfo, ToolStatusReason};

#[derive(Debug)]
pub enum McpManagerError {
    Environment(crate::hatchling::env_manager::EnvError),
    Catalog(CatalogError),
    UnknownTool(String),
    Timeout(String),
}

impl std::fmt::Display for McpManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McpManagerError::Environment(e) => write!(f, "{e}"),
            McpManagerError::Catalog(e) => write!(f, "{e}"),
            McpManagerError::UnknownTool(name) => write!(f, "unknown tool: {name}"),
            McpManagerError::Timeout(name) => write!(f, "tool '{name}' exceeded its working-time budget"),
        }
    }
}

impl std::error::Error for McpManagerError {}

struct ConnectedServer {
    client: Arc<McpClient>,
}

/// Owns every connected MCP client, the shared tool catalog, and the bus
/// those lifecycle/execution events are published on.
///
/// Conceptually a singleton in the original system; here ownership is
/// explicit — one instance per [`crate::hatchling::session::Session`],
/// constructed with its own catalog and bus so tests can create isolated
/// instances.
pub struct McpManager {
    servers: Mutex<HashMap<String, ConnectedServer>>,
    tool_to_server: Mutex<HashMap<String, String>>,
    catalog: Arc<ToolCatalog>,
    bus: Arc<EventBus>,
    env: Arc<dyn EnvironmentManager>,
    tool_calling: ToolCallingSettings,
}

impl McpManager {
    pub fn new(catalog: Arc<ToolCatalog>, bus: Arc<EventBus>, env: Arc<dyn EnvironmentManager>) -> Self {
        Self::with_tool_calling_settings(catalog, bus, env, ToolCallingSettings::default())
    }

    pub fn with_tool_calling_settings(
        catalog: Arc<ToolCatalog>,
        bus: Arc<EventBus>,
        env: Arc<dyn EnvironmentManager>,
        tool_calling: ToolCallingSettings,
    ) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            tool_to_server: Mutex::new(HashMap::new()),
            catalog,
            bus,
            env,
            tool_calling,
        }
    }

    /// Connect to `paths`, or, if `None`, whatever the environment manager
    /// reports. Already-connected paths are skipped. Each connection
    /// attempt independently emits `MCP_SERVER_UP`/`MCP_SERVER_UNREACHABLE`
    /// and, on success, `MCP_TOOL_ENABLED` per discovered tool.
    pub async fn connect_to_servers(
        &self,
        paths: Option<Vec<PathBuf>>,
    ) -> Result<(), McpManagerError> {
        let paths = match paths {
            Some(p) => p,
            None => self
                .env
                .list_server_entry_points()
                .await
                .map_err(McpManagerError::Environment)?,
        };
        let python = self
            .env
            .resolve_python_executable(None)
            .map_err(McpManagerError::Environment)?;

        for path in paths {
            let key = path.to_string_lossy().to_string();
            if self.servers.lock().await.contains_key(&key) {
                continue;
            }
            self.connect_one(&python, &path, &key).await?;
        }
        Ok(())
    }

    async fn connect_one(
        &self,
        python: &std::path::Path,
        path: &PathBuf,
        key: &str,
    ) -> Result<(), McpManagerError> {
        match McpClient::spawn(python, path).await {
            Ok(client) => match client.initialize().await {
                Ok(descriptors) => {
                    let client = Arc::new(client);
                    let mut tool_names = Vec::with_capacity(descriptors.len());
                    for descriptor in &descriptors {
                        let info = ToolInfo::new(
                            descriptor.name.clone(),
                            descriptor.description.clone(),
                            descriptor.input_schema.clone(),
                            key.to_string(),
                        );
                        self.catalog
                            .register_tool(info)
                            .await
                            .map_err(McpManagerError::Catalog)?;
                        self.tool_to_server
                            .lock()
                            .await
                            .insert(descriptor.name.clone(), key.to_string());
                        tool_names.push(descriptor.name.clone());
                    }
                    self.servers
                        .lock()
                        .await
                        .insert(key.to_string(), ConnectedServer { client });
                    self.bus
                        .publish(
                            EventKind::McpServerUp,
                            serde_json::json!({
                                "server_path": key,
                                "tool_count": tool_names.len(),
                            }),
                        )
                        .await;
                    for name in tool_names {
                        self.bus
                            .publish(
                                EventKind::McpToolEnabled,
                                serde_json::json!({"tool_name": name, "server_path": key}),
                            )
                            .await;
                    }
                    Ok(())
                }
                Err(e) => {
                    self.publish_unreachable(key, &e.to_string()).await;
                    Ok(())
                }
            },
            Err(e) => {
                self.publish_unreachable(key, &e.to_string()).await;
                Ok(())
            }
        }
    }

    async fn publish_unreachable(&self, key: &str, error: &str) {
        self.bus
            .publish(
                EventKind::McpServerUnreachable,
                serde_json::json!({"server_path": key, "error": error}),
            )
            .await;
    }

    /// Disable every tool of every connected server, attempt a graceful
    /// disconnect of each, then drop the connections. Disconnect failures
    /// surface as `MCP_SERVER_UNREACHABLE` rather than `MCP_SERVER_DOWN`.
    pub async fn disconnect_all(&self) {
        let servers: Vec<(String, Arc<McpClient>)> = {
            let guard = self.servers.lock().await;
            guard
                .iter()
                .map(|(k, v)| (k.clone(), v.client.clone()))
                .collect()
        };

        for (key, client) in &servers {
            let disabled = self
                .catalog
                .disable_server_tools(key, ToolStatusReason::FromServerDown)
                .await;
            for name in disabled {
                self.bus
                    .publish(
                        EventKind::McpToolDisabled,
                        serde_json::json!({"tool_name": name, "server_path": key}),
                    )
                    .await;
            }
            client.disconnect().await;
            if client.has_exited().await {
                self.bus
                    .publish(
                        EventKind::McpServerDown,
                        serde_json::json!({"server_path": key}),
                    )
                    .await;
            } else {
                self.publish_unreachable(key, "did not exit after disconnect").await;
            }
        }

        self.servers.lock().await.clear();
        self.tool_to_server.lock().await.clear();
    }

    /// Resolve `name`'s owning client and invoke it. On transport failure,
    /// marks that server unreachable and disables its tools before
    /// returning the error for the dispatcher to convert into an event.
    pub async fn execute_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolResult, McpManagerError> {
        let server_key = self
            .tool_to_server
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| McpManagerError::UnknownTool(name.to_string()))?;

        let client = {
            let guard = self.servers.lock().await;
            guard.get(&server_key).map(|s| s.client.clone())
        };
        let Some(client) = client else {
            return Err(McpManagerError::UnknownTool(name.to_string()));
        };

        let call = client.call_tool(name, arguments.clone());
        let outcome = match self.tool_calling.max_tool_working_time {
            Some(budget) => match tokio::time::timeout(std::time::Duration::from_secs_f64(budget), call).await {
                Ok(result) => result,
                Err(_) => {
                    log::warn!("tool '{name}' exceeded its {budget}s working-time budget");
                    return Ok(ToolResult {
                        tool_call_id: String::new(),
                        function_name: name.to_string(),
                        arguments,
                        content: vec![],
                        is_error: true,
                        error: Some(McpManagerError::Timeout(name.to_string()).to_string()),
                    });
                }
            },
            None => call.await,
        };

        match outcome {
            Ok(result) => {
                let content = result
                    .content
                    .into_iter()
                    .map(|c| (c.kind, c.text))
                    .collect();
                Ok(ToolResult {
                    tool_call_id: String::new(),
                    function_name: name.to_string(),
                    arguments,
                    content,
                    is_error: result.is_error,
                    error: None,
                })
            }
            Err(e) => {
                let disabled = self
                    .catalog
                    .disable_server_tools(&server_key, ToolStatusReason::FromServerUnreachable)
                    .await;
                for disabled_name in disabled {
                    self.bus
                        .publish(
                            EventKind::McpToolDisabled,
                            serde_json::json!({"tool_name": disabled_name, "server_path": server_key}),
                        )
                        .await;
                }
                self.publish_unreachable(&server_key, &e.to_string()).await;
                Ok(ToolResult {
                    tool_call_id: String::new(),
                    function_name: name.to_string(),
                    arguments,
                    content: vec![],
                    is_error: true,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// Called when a liveness probe finds a previously unreachable server
    /// responding again: emits `MCP_SERVER_REACHABLE` and re-enables only
    /// the tools the catalog disabled for `from_server_unreachable`, each
    /// with its own `MCP_TOOL_ENABLED`. A server that was never marked
    /// unreachable (or is unknown) has nothing to restore and this is a
    /// no-op beyond the lifecycle event.
    pub async fn mark_server_reachable(&self, server_path: &str) {
        self.bus
            .publish(
                EventKind::McpServerReachable,
                serde_json::json!({"server_path": server_path}),
            )
            .await;
        let restored = self.catalog.restore_unreachable_tools(server_path).await;
        for name in restored {
            self.bus
                .publish(
                    EventKind::McpToolEnabled,
                    serde_json::json!({"tool_name": name, "server_path": server_path}),
                )
                .await;
        }
    }

    pub async fn enable_tool(&self, name: &str) -> bool {
        let enabled = self.catalog.user_enable(name).await;
        if enabled {
            self.bus
                .publish(
                    EventKind::McpToolEnabled,
                    serde_json::json!({"tool_name": name}),
                )
                .await;
        }
        enabled
    }

    pub async fn disable_tool(&self, name: &str) -> bool {
        let disabled = self.catalog.user_disable(name).await;
        if disabled {
            self.bus
                .publish(
                    EventKind::McpToolDisabled,
                    serde_json::json!({"tool_name": name}),
                )
                .await;
        }
        disabled
    }

    pub async fn get_tool_status(
        &self,
        name: &str,
    ) -> Option<(crate::hatchling::tool_catalog::ToolStatus, ToolStatusReason)> {
        self.catalog.status_of(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hatchling::env_manager::StaticEnvironmentManager;
    use crate::hatchling::event_bus::{Event, EventSubscriber};
    use crate::hatchling::tool_catalog::{ToolInfo, ToolStatus};
    use std::collections::HashSet;
    use tokio::sync::Mutex as TokioMutex;

    struct Capture(TokioMutex<Vec<Event>>);
    #[async_trait::async_trait]
    impl EventSubscriber for Capture {
        fn subscribed_kinds(&self) -> HashSet<EventKind> {
            [EventKind::McpServerReachable, EventKind::McpToolEnabled]
                .into_iter()
                .collect()
        }
        async fn on_event(&self, event: &Event) {
            self.0.lock().await.push(event.clone());
        }
    }

    fn manager(bus: Arc<EventBus>) -> McpManager {
        let catalog = Arc::new(ToolCatalog::new());
        let env = Arc::new(StaticEnvironmentManager::new("/usr/bin/python3", vec![]));
        McpManager::new(catalog, bus, env)
    }

    #[tokio::test]
    async fn mark_server_reachable_restores_only_unreachable_tools() {
        let bus = Arc::new(EventBus::new());
        let capture = Arc::new(Capture(TokioMutex::new(Vec::new())));
        bus.subscribe(capture.clone());
        let manager = manager(bus);

        manager
            .catalog
            .register_tool(ToolInfo::new(
                "clock".to_string(),
                "tells time".to_string(),
                Value::Null,
                "a.py".to_string(),
            ))
            .await
            .unwrap();
        manager
            .catalog
            .register_tool(ToolInfo::new(
                "weather".to_string(),
                "reports weather".to_string(),
                Value::Null,
                "a.py".to_string(),
            ))
            .await
            .unwrap();

        // "weather" is disabled by the user first, so the later
        // server-wide unreachable sweep (which only touches currently
        // enabled tools) skips it and leaves its reason untouched.
        manager.catalog.user_disable("weather").await;
        manager
            .catalog
            .disable_server_tools("a.py", ToolStatusReason::FromServerUnreachable)
            .await;

        manager.mark_server_reachable("a.py").await;

        let (clock_status, clock_reason) = manager.catalog.status_of("clock").await.unwrap();
        assert_eq!(clock_status, ToolStatus::Enabled);
        assert_eq!(clock_reason, ToolStatusReason::FromServerReachable);

        let (weather_status, weather_reason) = manager.catalog.status_of("weather").await.unwrap();
        assert_eq!(weather_status, ToolStatus::Disabled);
        assert_eq!(weather_reason, ToolStatusReason::FromUserDisabled);

        let events = capture.0.lock().await;
        assert!(events.iter().any(|e| e.kind == EventKind::McpServerReachable));
        let enabled: Vec<&str> = events
            .iter()
            .filter(|e| e.kind == EventKind::McpToolEnabled)
            .filter_map(|e| e.data.get("tool_name").and_then(Value::as_str))
            .collect();
        assert_eq!(enabled, vec!["clock"]);
    }

    #[tokio::test]
    async fn execute_tool_on_unknown_name_is_rejected_before_touching_any_client() {
        let bus = Arc::new(EventBus::new());
        let manager = manager(bus);
        let result = manager.execute_tool("does-not-exist", Value::Null).await;
        assert!(matches!(result, Err(McpManagerError::UnknownTool(_))));
    }

    #[tokio::test]
    async fn enable_tool_on_server_down_tool_is_noop_and_emits_nothing() {
        let bus = Arc::new(EventBus::new());
        let capture = Arc::new(Capture(TokioMutex::new(Vec::new())));
        bus.subscribe(capture.clone());
        let manager = manager(bus);

        manager
            .catalog
            .register_tool(ToolInfo::new(
                "clock".to_string(),
                "tells time".to_string(),
                Value::Null,
                "a.py".to_string(),
            ))
            .await
            .unwrap();
        manager
            .catalog
            .disable_server_tools("a.py", ToolStatusReason::FromServerDown)
            .await;

        let enabled = manager.enable_tool("clock").await;
        assert!(!enabled);

        let (status, reason) = manager.catalog.status_of("clock").await.unwrap();
        assert_eq!(status, ToolStatus::Disabled);
        assert_eq!(reason, ToolStatusReason::FromServerDown);

        let events = capture.0.lock().await;
        assert!(!events.iter().any(|e| e.kind == EventKind::McpToolEnabled));
    }
}
