//! OpenAI provider: SSE `ChatCompletionChunk` deltas with fragmented
//! tool-call arguments.
//!
//! The fragment accumulator lives entirely inside [`stream`](OpenAiProvider::stream)'s
//! stack frame — a state machine scoped to one call, never a struct field.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::hatchling::config::SamplingSettings;
use crate::hatchling::event_bus::{Event, EventBus, EventKind};
use crate::hatchling::history::HistoryEntry;
use crate::hatchling::provider::sse::{SseReader, DONE};
use crate::hatchling::provider::{ChatPayload, Provider, ProviderError, ProviderId, ToolCall, ToolResult};
use crate::hatchling::tool_catalog::ToolInfo;

struct ToolCallAccumulator {
    id: Option<String>,
    name: String,
    arguments_buffer: String,
}

impl ToolCallAccumulator {
    fn new() -> Self {
        Self {
            id: None,
            name: String::new(),
            arguments_buffer: String::new(),
        }
    }
}

pub struct OpenAiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    sampling: SamplingSettings,
    bus: Arc<EventBus>,
    catalog: Arc<crate::hatchling::tool_catalog::ToolCatalog>,
}

impl OpenAiProvider {
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        sampling: SamplingSettings,
        bus: Arc<EventBus>,
        catalog: Arc<crate::hatchling::tool_catalog::ToolCatalog>,
    ) -> Self {
        Self {
            http: crate::hatchling::http::get_shared_http_client().clone(),
            base_url,
            api_key,
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

    /// Applies one delta fragment to the accumulator entry at `index`,
    /// creating it on first sight.
    fn accumulate(acc: &mut HashMap<u64, ToolCallAccumulator>, index: u64, fragment: &Value) {
        let entry = acc.entry(index).or_insert_with(ToolCallAccumulator::new);
        if let Some(id) = fragment.get("id").and_then(Value::as_str) {
            entry.id = Some(id.to_string());
        }
        if let Some(function) = fragment.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                entry.name.push_str(name);
            }
            if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                entry.arguments_buffer.push_str(args);
            }
        }
    }

    async fn flush_accumulator(&self, acc: &mut HashMap<u64, ToolCallAccumulator>) {
        let mut indices: Vec<u64> = acc.keys().copied().collect();
        indices.sort_unstable();
        for index in indices {
            let Some(entry) = acc.remove(&index) else {
                continue;
            };
            let id = entry.id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let arguments = if entry.arguments_buffer.is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&entry.arguments_buffer)
                    .unwrap_or_else(|_| serde_json::json!({"_raw": entry.arguments_buffer}))
            };
            self.bus
                .publish_from(
                    EventKind::LlmToolCallRequest,
                    serde_json::json!({
                        "tool_call_id": id,
                        "function_name": entry.name,
                        "arguments": arguments,
                    }),
                    Some(ProviderId::OpenAi),
                )
                .await;
        }
    }

    async fn handle_chunk(&self, chunk: &Value, acc: &mut HashMap<u64, ToolCallAccumulator>) {
        let choices = chunk.get("choices").and_then(Value::as_array);

        if choices.map(|c| c.is_empty()).unwrap_or(true) {
            if let Some(usage) = chunk.get("usage") {
                let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
                let completion = usage
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let total = usage
                    .get("total_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(prompt + completion);
                self.bus
                    .publish_from(
                        EventKind::Usage,
                        serde_json::json!({
                            "prompt_tokens": prompt,
                            "completion_tokens": completion,
                            "total_tokens": total,
                        }),
                        Some(ProviderId::OpenAi),
                    )
                    .await;
            }
            return;
        }

        let Some(choice) = choices.and_then(|c| c.first()) else {
            return;
        };
        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

        if let Some(role) = delta.get("role").and_then(Value::as_str) {
            self.bus
                .publish_from(
                    EventKind::Role,
                    serde_json::json!({"role": role}),
                    Some(ProviderId::OpenAi),
                )
                .await;
        }

        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                self.bus
                    .publish_from(
                        EventKind::Content,
                        serde_json::json!({"content": content}),
                        Some(ProviderId::OpenAi),
                    )
                    .await;
            }
        }

        match delta.get("tool_calls").and_then(Value::as_array) {
            Some(fragments) if !fragments.is_empty() => {
                for fragment in fragments {
                    let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                    Self::accumulate(acc, index, fragment);
                }
            }
            _ => {
                if !acc.is_empty() {
                    self.flush_accumulator(acc).await;
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.bus
                .publish_from(
                    EventKind::Finish,
                    serde_json::json!({"finish_reason": reason}),
                    Some(ProviderId::OpenAi),
                )
                .await;
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
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
                        .provider_view(&tool.name, ProviderId::OpenAi, Self::render_tool)
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
                        .provider_view(&tool.name, ProviderId::OpenAi, Self::render_tool)
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
            "stream_options": {"include_usage": true},
            "temperature": payload.temperature,
            "top_p": payload.top_p,
        });
        if !payload.tools.is_empty() {
            body["tools"] = Value::Array(payload.tools);
            body["tool_choice"] = Value::String("auto".to_string());
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = match self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.bus
                    .publish_from(
                        EventKind::Error,
                        serde_json::json!({"error": e.to_string()}),
                        Some(ProviderId::OpenAi),
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
                    Some(ProviderId::OpenAi),
                )
                .await;
            return Err(ProviderError::Http { status, body });
        }

        let mut acc: HashMap<u64, ToolCallAccumulator> = HashMap::new();
        let mut reader = SseReader::new(response.bytes_stream());
        while let Some(data) = reader.next_data().await {
            let data = match data {
                Ok(data) => data,
                Err(e) => {
                    self.bus
                        .publish_from(
                            EventKind::Error,
                            serde_json::json!({"error": e.to_string()}),
                            Some(ProviderId::OpenAi),
                        )
                        .await;
                    return Err(e);
                }
            };
            if data == DONE {
                break;
            }
            match serde_json::from_str::<Value>(&data) {
                Ok(chunk) => self.handle_chunk(&chunk, &mut acc).await,
                Err(e) => {
                    log::warn!("discarding malformed OpenAI chunk: {e}");
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
            "content": Value::Null,
            "tool_calls": [{
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.function_name,
                    "arguments": serde_json::to_string(&call.arguments).unwrap_or_default(),
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
            "tool_call_id": result.tool_call_id,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hatchling::event_bus::EventSubscriber;
    use crate::hatchling::tool_catalog::ToolCatalog;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    fn provider(bus: Arc<EventBus>) -> OpenAiProvider {
        OpenAiProvider::new(
            "https://api.openai.com/v1".to_string(),
            "test-key".to_string(),
            "gpt-4.1-mini".to_string(),
            SamplingSettings::default(),
            bus,
            Arc::new(ToolCatalog::new()),
        )
    }

    struct Capture(Mutex<Vec<Event>>);
    #[async_trait::async_trait]
    impl EventSubscriber for Capture {
        fn subscribed_kinds(&self) -> HashSet<EventKind> {
            [
                EventKind::LlmToolCallRequest,
                EventKind::Content,
                EventKind::Finish,
            ]
            .into_iter()
            .collect()
        }
        async fn on_event(&self, event: &Event) {
            self.0.lock().await.push(event.clone());
        }
    }

    #[tokio::test]
    async fn fragmented_arguments_reassemble_on_boundary() {
        let bus = Arc::new(EventBus::new());
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        bus.subscribe(capture.clone());
        let provider = provider(bus);

        let mut acc = HashMap::new();
        let fragments = [
            serde_json::json!({"index": 0, "id": "call_1", "function": {"name": "add", "arguments": "{\"x\""}}),
            serde_json::json!({"index": 0, "function": {"arguments": ":1,\""}}),
            serde_json::json!({"index": 0, "function": {"arguments": "y\":2"}}),
            serde_json::json!({"index": 0, "function": {"arguments": "}"}}),
        ];
        for fragment in &fragments {
            provider
                .handle_chunk(
                    &serde_json::json!({"choices": [{"delta": {"tool_calls": [fragment]}}]}),
                    &mut acc,
                )
                .await;
        }
        assert!(!acc.is_empty());

        // boundary: a chunk with no tool_calls while the accumulator is non-empty
        provider
            .handle_chunk(&serde_json::json!({"choices": [{"delta": {}}]}), &mut acc)
            .await;
        assert!(acc.is_empty());

        let events = capture.0.lock().await;
        assert_eq!(events.len(), 1);
        let data = &events[0].data;
        assert_eq!(data["tool_call_id"], "call_1");
        assert_eq!(data["function_name"], "add");
        assert_eq!(data["arguments"], serde_json::json!({"x": 1, "y": 2}));
    }

    #[tokio::test]
    async fn usage_only_chunk_has_no_choices() {
        let bus = Arc::new(EventBus::new());
        let provider = provider(bus);
        let mut acc = HashMap::new();
        provider
            .handle_chunk(
                &serde_json::json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}}),
                &mut acc,
            )
            .await;
        assert!(acc.is_empty());
    }
}
