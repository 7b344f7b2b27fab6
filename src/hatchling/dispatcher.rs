//! Maps `LLM_TOOL_CALL_REQUEST` events onto MCP invocations and re-emits
//! their results.
//!
//! The dispatcher never blocks the provider's stream: `on_event` emits the
//! dispatch event synchronously (so ordering-sensitive subscribers, namely
//! the chain scheduler, observe it before any result can arrive) then hands
//! the actual MCP call off to a spawned task.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::hatchling::event_bus::{Event, EventBus, EventKind, EventSubscriber};
use crate::hatchling::mcp::McpManager;
use crate::hatchling::provider::ProviderRegistry;

pub struct ToolDispatcher {
    manager: Arc<McpManager>,
    bus: Arc<EventBus>,
    registry: Arc<ProviderRegistry>,
}

impl ToolDispatcher {
    pub fn new(manager: Arc<McpManager>, bus: Arc<EventBus>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            manager,
            bus,
            registry,
        }
    }
}

#[async_trait]
impl EventSubscriber for ToolDispatcher {
    fn subscribed_kinds(&self) -> HashSet<EventKind> {
        [EventKind::LlmToolCallRequest].into_iter().collect()
    }

    async fn on_event(&self, event: &Event) {
        let Some(provider_id) = event.provider else {
            log::warn!("tool-call request with no provider tag; ignoring");
            return;
        };
        let Some(provider) = self.registry.get(provider_id) else {
            log::warn!("tool-call request for unregistered provider {provider_id}");
            return;
        };
        let Some(call) = provider.parse_tool_call(event) else {
            return;
        };

        self.bus
            .publish_from(
                EventKind::McpToolCallDispatched,
                serde_json::json!({
                    "tool_call_id": call.id,
                    "function_name": call.function_name,
                    "arguments": call.arguments,
                }),
                Some(provider_id),
            )
            .await;

        let manager = self.manager.clone();
        let bus = self.bus.clone();
        let call_id = call.id.clone();
        let function_name = call.function_name.clone();
        let arguments = call.arguments.clone();

        tokio::spawn(async move {
            match manager.execute_tool(&function_name, arguments.clone()).await {
                Ok(mut result) => {
                    result.tool_call_id = call_id.clone();
                    let kind = if result.is_error {
                        EventKind::McpToolCallError
                    } else {
                        EventKind::McpToolCallResult
                    };
                    let content: Vec<Value> = result
                        .content
                        .iter()
                        .map(|(kind, text)| serde_json::json!({"type": kind, "text": text}))
                        .collect();
                    bus.publish_from(
                        kind,
                        serde_json::json!({
                            "tool_call_id": call_id,
                            "function_name": function_name,
                            "arguments": arguments,
                            "content": content,
                            "is_error": result.is_error,
                            "error": result.error,
                        }),
                        Some(provider_id),
                    )
                    .await;
                }
                Err(e) => {
                    bus.publish_from(
                        EventKind::McpToolCallError,
                        serde_json::json!({
                            "tool_call_id": call_id,
                            "function_name": function_name,
                            "arguments": arguments,
                            "content": Vec::<Value>::new(),
                            "is_error": true,
                            "error": e.to_string(),
                        }),
                        Some(provider_id),
                    )
                    .await;
                }
            }
        });
    }
}
