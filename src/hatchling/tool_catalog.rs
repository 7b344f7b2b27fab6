//! Per-tool state machine, provider-format cache, and server→tools index.
//!
//! ```text
//!     server_up                user_disable / server_down /
//!         │                    server_unreachable
//!         ▼                           │
//!     [ENABLED] ──────────────────────┘
//!         ▲                           │
//!         │         user_enable       ▼
//!         └──── (only if server_up) [DISABLED]
//!
//!   server_reachable restores only tools whose reason was
//!   from_server_unreachable.
//! ```

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::hatchling::provider::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatusReason {
    FromServerUp,
    FromUserEnabled,
    FromServerReachable,
    FromServerDown,
    FromServerUnreachable,
    FromUserDisabled,
    FromSystemError,
}

#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub server_path: String,
    pub status: ToolStatus,
    pub reason: ToolStatusReason,
    pub provider_format_cache: HashMap<ProviderId, Value>,
    pub last_updated: Instant,
}

impl ToolInfo {
    pub fn new(name: String, description: String, schema: Value, server_path: String) -> Self {
        Self {
            name,
            description,
            schema,
            server_path,
            status: ToolStatus::Enabled,
            reason: ToolStatusReason::FromServerUp,
            provider_format_cache: HashMap::new(),
            last_updated: Instant::now(),
        }
    }

    fn set(&mut self, status: ToolStatus, reason: ToolStatusReason) {
        self.status = status;
        self.reason = reason;
        self.last_updated = Instant::now();
    }
}

#[derive(Debug)]
pub enum CatalogError {
    DuplicateToolName(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::DuplicateToolName(name) => {
                write!(f, "tool name '{name}' is registered by more than one server")
            }
        }
    }
}

impl std::error::Error for CatalogError {}

/// Authoritative map of every known tool plus the server→tools index.
///
/// All mutation methods take `&self` and lock internally: the catalog is
/// meant to be shared behind an `Arc` across the MCP manager, the
/// dispatcher, and every provider.
pub struct ToolCatalog {
    tools: RwLock<HashMap<String, ToolInfo>>,
    server_to_tools: RwLock<HashMap<String, Vec<String>>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            server_to_tools: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a freshly discovered tool. Fails if `name` is already
    /// registered by a different server — tool names are unique across the
    /// whole catalog and a collision is a fatal configuration error.
    pub async fn register_tool(&self, info: ToolInfo) -> Result<(), CatalogError> {
        let mut tools = self.tools.write().await;
        if let Some(existing) = tools.get(&info.name) {
            if existing.server_path != info.server_path {
                return Err(CatalogError::DuplicateToolName(info.name));
            }
        }
        let server_path = info.server_path.clone();
        let name = info.name.clone();
        tools.insert(name.clone(), info);
        drop(tools);
        self.server_to_tools
            .write()
            .await
            .entry(server_path)
            .or_default()
            .push(name);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<ToolInfo> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<ToolInfo> {
        self.tools.read().await.values().cloned().collect()
    }

    pub async fn list_enabled(&self) -> Vec<ToolInfo> {
        self.tools
            .read()
            .await
            .values()
            .filter(|t| t.status == ToolStatus::Enabled)
            .cloned()
            .collect()
    }

    pub async fn server_of(&self, name: &str) -> Option<String> {
        self.tools.read().await.get(name).map(|t| t.server_path.clone())
    }

    /// Mark every tool owned by `server_path` disabled with `reason`.
    /// Returns the names actually transitioned (already-disabled tools are
    /// skipped).
    pub async fn disable_server_tools(
        &self,
        server_path: &str,
        reason: ToolStatusReason,
    ) -> Vec<String> {
        let names = self
            .server_to_tools
            .read()
            .await
            .get(server_path)
            .cloned()
            .unwrap_or_default();
        let mut tools = self.tools.write().await;
        let mut changed = Vec::new();
        for name in names {
            if let Some(tool) = tools.get_mut(&name) {
                if tool.status == ToolStatus::Enabled {
                    tool.set(ToolStatus::Disabled, reason);
                    changed.push(name);
                }
            }
        }
        changed
    }

    /// Restore every disabled tool of `server_path` whose reason is
    /// `from_server_unreachable`. Used by `server_reachable`.
    pub async fn restore_unreachable_tools(&self, server_path: &str) -> Vec<String> {
        let names = self
            .server_to_tools
            .read()
            .await
            .get(server_path)
            .cloned()
            .unwrap_or_default();
        let mut tools = self.tools.write().await;
        let mut changed = Vec::new();
        for name in names {
            if let Some(tool) = tools.get_mut(&name) {
                if tool.status == ToolStatus::Disabled
                    && tool.reason == ToolStatusReason::FromServerUnreachable
                {
                    tool.set(ToolStatus::Enabled, ToolStatusReason::FromServerReachable);
                    changed.push(name);
                }
            }
        }
        changed
    }

    /// User-initiated enable. Refused (no-op, no event) if the tool's
    /// server is currently down, i.e. the tool isn't present at all or was
    /// disabled for a reason other than the user disabling it.
    pub async fn user_enable(&self, name: &str) -> bool {
        let mut tools = self.tools.write().await;
        match tools.get_mut(name) {
            Some(tool)
                if tool.status == ToolStatus::Disabled
                    && tool.reason == ToolStatusReason::FromUserDisabled =>
            {
                tool.set(ToolStatus::Enabled, ToolStatusReason::FromUserEnabled);
                true
            }
            _ => false,
        }
    }

    pub async fn user_disable(&self, name: &str) -> bool {
        let mut tools = self.tools.write().await;
        match tools.get_mut(name) {
            Some(tool) if tool.status == ToolStatus::Enabled => {
                tool.set(ToolStatus::Disabled, ToolStatusReason::FromUserDisabled);
                true
            }
            _ => false,
        }
    }

    pub async fn status_of(&self, name: &str) -> Option<(ToolStatus, ToolStatusReason)> {
        self.tools
            .read()
            .await
            .get(name)
            .map(|t| (t.status, t.reason))
    }

    /// Returns the cached provider rendering for `name`, computing and
    /// storing it via `render` on first use.
    pub async fn provider_view(
        &self,
        name: &str,
        provider: ProviderId,
        render: impl FnOnce(&ToolInfo) -> Value,
    ) -> Option<Value> {
        {
            let tools = self.tools.read().await;
            if let Some(tool) = tools.get(name) {
                if let Some(cached) = tool.provider_format_cache.get(&provider) {
                    return Some(cached.clone());
                }
            } else {
                return None;
            }
        }
        let mut tools = self.tools.write().await;
        let tool = tools.get_mut(name)?;
        let rendered = render(tool);
        tool.provider_format_cache.insert(provider, rendered.clone());
        Some(rendered)
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, server: &str) -> ToolInfo {
        ToolInfo::new(name.to_string(), "desc".to_string(), Value::Null, server.to_string())
    }

    #[tokio::test]
    async fn duplicate_name_across_servers_is_rejected() {
        let catalog = ToolCatalog::new();
        catalog.register_tool(sample("clock", "a.py")).await.unwrap();
        let err = catalog.register_tool(sample("clock", "b.py")).await;
        assert!(matches!(err, Err(CatalogError::DuplicateToolName(_))));
    }

    #[tokio::test]
    async fn enable_on_down_server_tool_is_noop() {
        let catalog = ToolCatalog::new();
        // "down" means the tool was never registered at all.
        assert!(!catalog.user_enable("ghost").await);
    }

    #[tokio::test]
    async fn user_enable_on_server_down_tool_is_noop() {
        let catalog = ToolCatalog::new();
        catalog.register_tool(sample("clock", "a.py")).await.unwrap();
        catalog
            .disable_server_tools("a.py", ToolStatusReason::FromServerDown)
            .await;
        assert!(!catalog.user_enable("clock").await);
        let (status, reason) = catalog.status_of("clock").await.unwrap();
        assert_eq!(status, ToolStatus::Disabled);
        assert_eq!(reason, ToolStatusReason::FromServerDown);
    }

    #[tokio::test]
    async fn user_enable_on_unreachable_tool_is_noop() {
        let catalog = ToolCatalog::new();
        catalog.register_tool(sample("clock", "a.py")).await.unwrap();
        catalog
            .disable_server_tools("a.py", ToolStatusReason::FromServerUnreachable)
            .await;
        assert!(!catalog.user_enable("clock").await);
        let (status, reason) = catalog.status_of("clock").await.unwrap();
        assert_eq!(status, ToolStatus::Disabled);
        assert_eq!(reason, ToolStatusReason::FromServerUnreachable);
    }

    #[tokio::test]
    async fn server_reachable_only_restores_unreachable_tools() {
        let catalog = ToolCatalog::new();
        catalog.register_tool(sample("clock", "a.py")).await.unwrap();
        catalog.user_disable("clock").await;
        // disabled by the user, not by unreachability
        let restored = catalog.restore_unreachable_tools("a.py").await;
        assert!(restored.is_empty());
        let (status, reason) = catalog.status_of("clock").await.unwrap();
        assert_eq!(status, ToolStatus::Disabled);
        assert_eq!(reason, ToolStatusReason::FromUserDisabled);
    }

    #[tokio::test]
    async fn unreachable_then_reachable_round_trips() {
        let catalog = ToolCatalog::new();
        catalog.register_tool(sample("clock", "a.py")).await.unwrap();
        catalog
            .disable_server_tools("a.py", ToolStatusReason::FromServerUnreachable)
            .await;
        let restored = catalog.restore_unreachable_tools("a.py").await;
        assert_eq!(restored, vec!["clock".to_string()]);
        let (status, _) = catalog.status_of("clock").await.unwrap();
        assert_eq!(status, ToolStatus::Enabled);
    }

    #[tokio::test]
    async fn provider_view_is_cached() {
        let catalog = ToolCatalog::new();
        catalog.register_tool(sample("clock", "a.py")).await.unwrap();
        let calls = std::sync::atomic::AtomicUsize::new(0);
        for _ in 0..2 {
            catalog
                .provider_view("clock", ProviderId::Ollama, |_t| {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Value::String("rendered".to_string())
                })
                .await;
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
