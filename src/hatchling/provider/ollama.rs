//! Ollama provider: NDJSON whole-message chunks over `/api/chat`.
//!
//! Unlike OpenAI, Ollama delivers each tool call whole in a single chunk —
//! there is no fragment accumulator here, only the per-chunk translation
//! rules for Ollama's `/api/chat` wire format.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hatchling::hatchling::event_bus::EventBus;
//! use hatchling::hatchling::tool_catalog::ToolCatalog;
//! use hatchling::hatchling::config::SamplingSettings;
//! use hatchling::hatchling::provider::ollama::OllamaProvider;
//!
//! let provider = OllamaProvider::new(
//!     "http://localhost:11434".to_string(),
//!     "llama3".to_string(),
//!     SamplingSettings::default(),
//!     Arc::new(EventBus::new()),
//!     Arc::new(ToolCatalog::new()),
//! );
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::hatchling::config::SamplingSettings;
use crate::hatchling::event_bus::{Event, EventBus, EventKind};
use crate::hatchling::history::HistoryEntry;
use crate::hatchling::provider::ndjson::NdjsonReader;
use crate::hatchling::provider::{ChatPayload, Provider, ProviderError, ProviderId, ToolCall, ToolResult};
use crate::hatchling::tool_catalog::ToolInfo;

pub struct OllamaProvider {
    http: reqwest::Client,
    base_url: String,
    model: String,
    sampling: SamplingSettings,
    bus: Arc<EventBus>,
    catalog: Arc<crate::hatchling::tool_catalog::ToolCatalog>,
}

impl OllamaProvider {
    pub fn new(
        base_url: String,
        model: String,
        sampling: SamplingSettings,
        bus: Arc<EventBus>,
        catalog: Arc<crate::hatchling::tool_catalog::ToolCatalog>,
    ) -> Self {
        Self {
            http: crate::hatchling::http::get_shared_http_client().clone(),
            base_url,
            model,
            sampling,
            bus,
            catalog,
        }
    }

    fn render_tool(tool: &ToolInfo) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.schema,
            }
        })
    }

    async fn publish_tool_call(&self, entry: &Value) {
        let id = entry
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let function = entry.get("function").cloned().unwrap_or(Value::Null);
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let arguments = match function.get("arguments") {
            Some(Value::String(s)) => {
                serde_json::from_str(s).unwrap_or_else(|_| serde_json::json!({"_raw": s}))
            }
            Some(other) => other.clone(),
            None => Value::Object(Default::default()),
        };
        self.bus
            .publish_from(
                EventKind::LlmToolCallRequest,
                serde_json::json!({
                    "tool_call_id": id,
                    "function_name": name,
                    "arguments": arguments,
                }),
                Some(ProviderId::Ollama),
            )
            .await;
    }

    async fn handle_chunk(&self, chunk: &Value) {
        if let Some(message) = chunk.get("message") {
            if let Some(role) = message.get("role").and_then(Value::as_str) {
                self.bus
                    .publish_from(
                        EventKind::Role,
                        serde_json::json!({"role": role}),
                        Some(ProviderId::Ollama),
                    )
                    .await;
            }
            if let Some(content) = message.get("content").and_then(Value::as_str) {
                if !content.is_empty() {
                    self.bus
                        .publish_from(
                            EventKind::Content,
                            serde_json::json!({"content": content}),
                            Some(ProviderId::Ollama),
                        )
                        .await;
                }
            }
            if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
                for entry in tool_calls {
                    self.publish_tool_call(entry).await;
                }
            }
        }

        if chunk.get("done").and_then(Value::as_bool).unwrap_or(false) {
            let reason = chunk
                .get("done_reason")
                .and_then(Value::as_str)
                .unwrap_or("stop")
                .to_string();
            self.bus
                .publish_from(
                    EventKind::Finish,
                    serde_json::json!({"finish_reason": reason}),
                    Some(ProviderId::Ollama),
                )
                .await;

            let prompt = chunk.get("prompt_eval_count").and_then(Value::as_u64);
            let completion = chunk.get("eval_count").and_then(Value::as_u64);
            if prompt.is_some() || completion.is_some() {
                let prompt = prompt.unwrap_or(0);
                let completion = completion.unwrap_or(0);
                self.bus
                    .publish_from(
                        EventKind::Usage,
                        serde_json::json!({
                            "prompt_tokens": prompt,
                            "completion_tokens": completion,
                            "total_tokens": prompt + completion,
                        }),
                        Some(ProviderId::Ollama),
                    )
                    .await;
            }
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Ollama
    }

    fn prepare_payload(&self, messages: Vec<Value>, model: &str) -> ChatPayload {
        ChatPayload {
            model: model.to_string(),
            messages,
            tools: Vec::new(),
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
        }
    }

    async fn add_tools_to_payload(
        &self,
        payload: &mut ChatPayload,
        names: Option<&[String]>,
    ) -> Result<(), ProviderError> {
        let mut tools = Vec::new();
        match names {
            None => {
                for tool in self.catalog.list_enabled().await {
                    if let Some(rendered) = self
                        .catalog
                        .provider_view(&tool.name, ProviderId::Ollama, Self::render_tool)
                        .await
                    {
                        tools.push(rendered);
                    }
                }
            }
            Some(names) => {
                for name in names {
                    let Some(tool) = self.catalog.get(name).await else {
                        return Err(ProviderError::UnknownTool(name.clone()));
                    };
                    if tool.status != crate::hatchling::tool_catalog::ToolStatus::Enabled {
                        log::warn!("skipping disabled tool '{name}' requested for payload");
                        continue;
                    }
                    if let Some(rendered) = self
                        .catalog
                        .provider_view(&tool.name, ProviderId::Ollama, Self::render_tool)
                        .await
                    {
                        tools.push(rendered);
                    }
                }
            }
        }
        payload.tools = tools;
        Ok(())
    }

    async fn stream(&self, payload: ChatPayload) -> Result<(), ProviderError> {
        let request_id = Uuid::new_v4().to_string();
        self.bus.set_request_id(Some(request_id)).await;

        let mut body = serde_json::json!({
            "model": payload.model,
            "messages": payload.messages,
            "stream": true,
            "options": {
                "temperature": payload.temperature,
                "top_p": payload.top_p,
            }
        });
        if !payload.tools.is_empty() {
            body["tools"] = Value::Array(payload.tools);
        }

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let response = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                self.bus
                    .publish_from(
                        EventKind::Error,
                        serde_json::json!({"error": e.to_string()}),
                        Some(ProviderId::Ollama),
                    )
                    .await;
                return Err(ProviderError::Transport(e));
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            self.bus
                .publish_from(
                    EventKind::Error,
                    serde_json::json!({"error": body.clone(), "status": status}),
                    Some(ProviderId::Ollama),
                )
                .await;
            return Err(ProviderError::Http { status, body });
        }

        let mut reader = NdjsonReader::new(response.bytes_stream());
        while let Some(line) = reader.next_line().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    self.bus
                        .publish_from(
                            EventKind::Error,
                            serde_json::json!({"error": e.to_string()}),
                            Some(ProviderId::Ollama),
                        )
                        .await;
                    return Err(e);
                }
            };
            match serde_json::from_str::<Value>(&line) {
                Ok(chunk) => self.handle_chunk(&chunk).await,
                Err(e) => {
                    log::warn!("discarding malformed Ollama chunk: {e}");
                }
            }
        }
        Ok(())
    }

    fn to_provider_tool(&self, tool: &ToolInfo) -> Value {
        Self::render_tool(tool)
    }

    fn to_provider_tool_call(&self, call: &ToolCall) -> Value {
        serde_json::json!({
            "role": "assistant",
            "content": "",
            "tool_calls": [{
                "id": call.id,
                "function": {
                    "name": call.function_name,
                    "arguments": call.arguments,
                }
            }]
        })
    }

    fn to_provider_tool_result(&self, result: &ToolResult) -> Value {
        let text = result
            .content
            .first()
            .map(|(_, text)| text.clone())
            .unwrap_or_else(|| "No result".to_string());
        serde_json::json!({
            "role": "tool",
            "tool_name": result.function_name,
            "content": text,
        })
    }

    fn render_history_entry(&self, entry: &HistoryEntry) -> Option<Value> {
        match entry {
            HistoryEntry::User(text) => Some(serde_json::json!({"role": "user", "content": text})),
            HistoryEntry::Assistant(text) => {
                Some(serde_json::json!({"role": "assistant", "content": text}))
            }
            HistoryEntry::ToolCall(call) => Some(self.to_provider_tool_call(call)),
            HistoryEntry::ToolResult(result) => Some(self.to_provider_tool_result(result)),
        }
    }

    fn parse_tool_call(&self, event: &Event) -> Option<ToolCall> {
        if event.kind != EventKind::LlmToolCallRequest {
            return None;
        }
        Some(ToolCall {
            id: event.data.get("tool_call_id")?.as_str()?.to_string(),
            function_name: event.data.get("function_name")?.as_str()?.to_string(),
            arguments: event.data.get("arguments").cloned().unwrap_or(Value::Null),
        })
    }
}
