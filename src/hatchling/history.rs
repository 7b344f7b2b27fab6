//! Dual-view message history: one canonical conversation record, one
//! provider-specific wire-format view derived from it on demand.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hatchling::hatchling::history::MessageHistory;
//! use hatchling::hatchling::provider::ProviderRegistry;
//!
//! let registry = Arc::new(ProviderRegistry::new());
//! let history = MessageHistory::new(registry);
//! history.add_user("hello".to_string());
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::hatchling::event_bus::{Event, EventKind, EventSubscriber};
use crate::hatchling::provider::{ProviderId, ProviderRegistry, ToolCall, ToolResult};

#[derive(Debug, Clone)]
pub enum HistoryEntry {
    User(String),
    Assistant(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

struct CachedView {
    provider: Option<ProviderId>,
    messages: Vec<Value>,
}

struct Inner {
    canonical: Vec<HistoryEntry>,
    cached: CachedView,
    assistant_buffer: String,
}

/// Accumulates canonical history and keeps a lazily-regenerated
/// provider-formatted view in sync with it.
pub struct MessageHistory {
    registry: Arc<ProviderRegistry>,
    inner: Mutex<Inner>,
}

impl MessageHistory {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            inner: Mutex::new(Inner {
                canonical: Vec::new(),
                cached: CachedView {
                    provider: None,
                    messages: Vec::new(),
                },
                assistant_buffer: String::new(),
            }),
        }
    }

    /// The only external mutator: appends directly to both canonical and
    /// cached views.
    pub async fn add_user(&self, text: String) {
        let mut inner = self.inner.lock().await;
        inner.canonical.push(HistoryEntry::User(text.clone()));
        inner
            .cached
            .messages
            .push(serde_json::json!({"role": "user", "content": text}));
    }

    /// Returns the cached view if it already belongs to `provider`,
    /// otherwise synthesizes a fresh view from canonical history without
    /// mutating the cache.
    pub async fn messages_for(&self, provider: ProviderId) -> Vec<Value> {
        let inner = self.inner.lock().await;
        if inner.cached.provider == Some(provider) {
            return inner.cached.messages.clone();
        }
        self.regenerate_from(&inner.canonical, provider)
    }

    fn regenerate_from(&self, canonical: &[HistoryEntry], provider: ProviderId) -> Vec<Value> {
        let Some(adapter) = self.registry.get(provider) else {
            return Vec::new();
        };
        canonical
            .iter()
            .filter_map(|entry| adapter.render_history_entry(entry))
            .collect()
    }

    async fn ensure_view_matches(&self, inner: &mut Inner, provider: ProviderId) {
        if inner.cached.provider != Some(provider) {
            inner.cached.messages = self.regenerate_from(&inner.canonical, provider);
            inner.cached.provider = Some(provider);
        }
    }

    fn data_str(data: &Value, key: &str) -> String {
        data.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn tool_call_from(data: &Value) -> ToolCall {
        ToolCall {
            id: Self::data_str(data, "tool_call_id"),
            function_name: Self::data_str(data, "function_name"),
            arguments: data.get("arguments").cloned().unwrap_or(Value::Null),
        }
    }

    fn tool_result_from(data: &Value) -> ToolResult {
        let content = data
            .get("content")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| {
                        (
                            item.get("type").and_then(Value::as_str).unwrap_or("text").to_string(),
                            item.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        ToolResult {
            tool_call_id: Self::data_str(data, "tool_call_id"),
            function_name: Self::data_str(data, "function_name"),
            arguments: data.get("arguments").cloned().unwrap_or(Value::Null),
            content,
            is_error: data.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            error: data.get("error").and_then(Value::as_str).map(String::from),
        }
    }
}

#[async_trait]
impl EventSubscriber for MessageHistory {
    fn subscribed_kinds(&self) -> HashSet<EventKind> {
        [
            EventKind::Content,
            EventKind::Finish,
            EventKind::McpToolCallDispatched,
            EventKind::McpToolCallResult,
            EventKind::McpToolCallError,
        ]
        .into_iter()
        .collect()
    }

    async fn on_event(&self, event: &Event) {
        let mut inner = self.inner.lock().await;

        match event.kind {
            EventKind::Content => {
                let delta = event
                    .data
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                inner.assistant_buffer.push_str(delta);
            }
            EventKind::Finish => {
                if !inner.assistant_buffer.is_empty() {
                    let text = std::mem::take(&mut inner.assistant_buffer);
                    inner.canonical.push(HistoryEntry::Assistant(text.clone()));
                    inner
                        .cached
                        .messages
                        .push(serde_json::json!({"role": "assistant", "content": text}));
                }
            }
            EventKind::McpToolCallDispatched => {
                if let Some(provider) = event.provider {
                    self.ensure_view_matches(&mut inner, provider).await;
                }
                let call = Self::tool_call_from(&event.data);
                let rendered = event
                    .provider
                    .and_then(|p| self.registry.get(p))
                    .map(|adapter| adapter.to_provider_tool_call(&call));
                inner.canonical.push(HistoryEntry::ToolCall(call));
                if let Some(rendered) = rendered {
                    inner.cached.messages.push(rendered);
                }
            }
            EventKind::McpToolCallResult | EventKind::McpToolCallError => {
                if let Some(provider) = event.provider {
                    self.ensure_view_matches(&mut inner, provider).await;
                }
                let result = Self::tool_result_from(&event.data);
                let rendered = event
                    .provider
                    .and_then(|p| self.registry.get(p))
                    .map(|adapter| adapter.to_provider_tool_result(&result));
                inner.canonical.push(HistoryEntry::ToolResult(result));
                if let Some(rendered) = rendered {
                    inner.cached.messages.push(rendered);
                }
            }
            _ => {}
        }
    }
}
