//! Decides, after each tool result, whether to re-invoke the provider and
//! how to compose its next payload, while preserving strict FIFO pairing
//! between dispatches and results.
//!
//! Grounded on `tool_chaining_subscriber.py`'s `_chain_lock` / FIFO-pair /
//! `reset()` shape: a single `Mutex<Inner>` owns the pairing structures and
//! chain-lifecycle fields (cheap, non-suspending mutations), while a
//! separate `continuation_lock` serializes the only suspending section —
//! composing a payload and calling `provider.stream()` — so at most one
//! continuation is in flight at a time (P2).
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hatchling::hatchling::event_bus::EventBus;
//! use hatchling::hatchling::history::MessageHistory;
//! use hatchling::hatchling::provider::ProviderRegistry;
//! use hatchling::hatchling::config::ToolCallingSettings;
//! use hatchling::hatchling::chain_scheduler::ChainScheduler;
//!
//! let bus = Arc::new(EventBus::new());
//! let registry = Arc::new(ProviderRegistry::new());
//! let history = Arc::new(MessageHistory::new(registry.clone()));
//! let scheduler = Arc::new(ChainScheduler::new(
//!     bus.clone(),
//!     history,
//!     registry,
//!     ToolCallingSettings::default(),
//! ));
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::hatchling::config::ToolCallingSettings;
use crate::hatchling::event_bus::{Event, EventBus, EventKind, EventSubscriber};
use crate::hatchling::history::MessageHistory;
use crate::hatchling::provider::{ProviderId, ProviderRegistry, ToolCall, ToolResult};

const LIMIT_REACHED_MESSAGE: &str = "We have reached the limit of tool calling and cannot continue with more tool calls.\n\
However, we have collected the tool results and should be able to provide a partial response.\n\
Write a response based on the collected tool results.\n\n\
Adapt the level of detail in your response based on the complexity of the tool calling chain.\n\
Prefer conciseness, clarity, and accuracy of the response.\n";

const CONTINUATION_MESSAGE: &str = "Given the tool results, do you have enough information \
to answer the original query of the user?\n\
- If yes, write a response based on the collected tool results. \
Adapt the level of detail in your response based on the complexity of the tool calling chain. \
Prefer conciseness, clarity, and accuracy of the response.\n\
- If not, continue using tools or, if no tools meet your needs, you can write a response.";

struct Inner {
    dispatch_queue: VecDeque<(String, Instant, ToolCall)>,
    result_buffer: std::collections::HashMap<String, ToolResult>,
    chain_id: Option<String>,
    root_query: String,
    provider: Option<ProviderId>,
    model: String,
    iteration: u32,
    started: bool,
    started_at: Option<Instant>,
    partial: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            dispatch_queue: VecDeque::new(),
            result_buffer: std::collections::HashMap::new(),
            chain_id: None,
            root_query: String::new(),
            provider: None,
            model: String::new(),
            iteration: 1,
            started: false,
            started_at: None,
            partial: false,
        }
    }

    fn reset_pairing(&mut self) {
        self.dispatch_queue.clear();
        self.result_buffer.clear();
        self.chain_id = None;
        self.iteration = 1;
        self.started = false;
        self.started_at = None;
        self.partial = false;
    }
}

/// Tool-chaining scheduler (C8).
pub struct ChainScheduler {
    state: Mutex<Inner>,
    continuation_lock: Mutex<()>,
    bus: Arc<EventBus>,
    history: Arc<MessageHistory>,
    registry: Arc<ProviderRegistry>,
    tool_calling: ToolCallingSettings,
}

impl ChainScheduler {
    pub fn new(
        bus: Arc<EventBus>,
        history: Arc<MessageHistory>,
        registry: Arc<ProviderRegistry>,
        tool_calling: ToolCallingSettings,
    ) -> Self {
        Self {
            state: Mutex::new(Inner::new()),
            continuation_lock: Mutex::new(()),
            bus,
            history,
            registry,
            tool_calling,
        }
    }

    /// Called by the session at the start of a new turn: records the root
    /// query and target provider/model, and clears any leftover pairing
    /// state from a prior turn.
    pub async fn begin_query(&self, root_query: String, provider: ProviderId, model: String) {
        let mut state = self.state.lock().await;
        state.reset_pairing();
        state.root_query = root_query;
        state.provider = Some(provider);
        state.model = model;
    }

    fn data_str(data: &Value, key: &str) -> String {
        data.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
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

    async fn handle_dispatched(&self, event: &Event) {
        let call = Self::tool_call_from(&event.data);
        let (is_first, chain_id, iteration) = {
            let mut state = self.state.lock().await;
            let is_first = !state.started;
            if is_first {
                state.started = true;
                state.started_at = Some(Instant::now());
                state.chain_id = Some(Uuid::new_v4().to_string());
            }
            state.dispatch_queue.push_back((call.id.clone(), Instant::now(), call.clone()));
            (is_first, state.chain_id.clone(), state.iteration)
        };

        if is_first {
            self.bus
                .publish_from(
                    EventKind::ToolChainStart,
                    serde_json::json!({
                        "tool_chain_id": chain_id,
                        "initial_query": self.state.lock().await.root_query.clone(),
                        "current_iteration": iteration,
                        "max_iterations": self.tool_calling.max_iterations,
                        "current_tool": {
                            "tool_call_id": call.id,
                            "function_name": call.function_name,
                            "arguments": call.arguments,
                        },
                    }),
                    event.provider,
                )
                .await;
        }
    }

    /// Inserts a result/error into the buffer then drains every
    /// consecutively-ready pair off the head of the dispatch queue,
    /// running a continuation for each in order. Draining (rather than
    /// checking only once) guarantees that a result which arrived early —
    /// before its pair became the queue head — is not stranded once its
    /// turn comes, without waiting on a future unrelated event.
    async fn handle_result(&self, event: &Event) {
        let result = Self::tool_result_from(&event.data);
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.result_buffer.contains_key(&result.tool_call_id) {
                log::warn!(
                    "tool result for '{}' already buffered; overwriting",
                    result.tool_call_id
                );
            }
            if !state.dispatch_queue.iter().any(|(id, _, _)| id == &result.tool_call_id) {
                log::warn!(
                    "tool result for '{}' has no matching dispatched call",
                    result.tool_call_id
                );
            }
            state.result_buffer.insert(result.tool_call_id.clone(), result);

            loop {
                let Some((head_id, _, _)) = state.dispatch_queue.front() else {
                    break;
                };
                if !state.result_buffer.contains_key(head_id) {
                    break;
                }
                let (id, _, call) = state.dispatch_queue.pop_front().unwrap();
                let result = state.result_buffer.remove(&id).unwrap();
                ready.push((call, result));
            }
        }

        for (call, result) in ready {
            self.run_continuation(call, result, event.provider).await;
        }
    }

    async fn run_continuation(&self, call: ToolCall, result: ToolResult, provider_hint: Option<ProviderId>) {
        let _guard = self.continuation_lock.lock().await;

        let (chain_id, iteration, started_at, provider_id, model, root_query) = {
            let state = self.state.lock().await;
            (
                state.chain_id.clone(),
                state.iteration,
                state.started_at,
                state.provider.or(provider_hint),
                state.model.clone(),
                state.root_query.clone(),
            )
        };
        let Some(provider_id) = provider_id else {
            log::warn!("chain continuation with no known provider; dropping pair for '{}'", call.id);
            return;
        };
        let Some(provider) = self.registry.get(provider_id) else {
            log::warn!("chain continuation for unregistered provider {provider_id}");
            return;
        };

        self.bus
            .publish_from(
                EventKind::ToolChainIterationStart,
                serde_json::json!({
                    "tool_chain_id": chain_id,
                    "iteration": iteration,
                    "max_iterations": self.tool_calling.max_iterations,
                    "tool_name": call.function_name,
                }),
                Some(provider_id),
            )
            .await;

        let elapsed = started_at.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0);
        let reached_max_iterations = iteration >= self.tool_calling.max_iterations;
        let reached_time_limit = self
            .tool_calling
            .max_working_time
            .map(|limit| elapsed >= limit)
            .unwrap_or(false);

        log::debug!(
            "chain {chain_id:?} iteration {iteration} continuing after tool '{}' (error={})",
            result.function_name,
            result.is_error
        );

        let mut messages = Vec::new();
        messages.push(serde_json::json!({"role": "user", "content": root_query}));
        messages.extend(self.history.messages_for(provider_id).await);

        let payload = if reached_max_iterations || reached_time_limit {
            {
                self.state.lock().await.partial = true;
            }
            let limit_type = if reached_max_iterations {
                "max_iterations"
            } else {
                "time_limit"
            };
            self.bus
                .publish_from(
                    EventKind::ToolChainLimitReached,
                    serde_json::json!({
                        "tool_chain_id": chain_id,
                        "limit_type": limit_type,
                        "iteration": iteration,
                        "elapsed_time": elapsed,
                    }),
                    Some(provider_id),
                )
                .await;

            messages.push(serde_json::json!({"role": "user", "content": LIMIT_REACHED_MESSAGE}));
            provider.prepare_payload(messages, &model)
        } else {
            messages.push(serde_json::json!({"role": "user", "content": CONTINUATION_MESSAGE}));
            let mut payload = provider.prepare_payload(messages, &model);
            if let Err(e) = provider.add_tools_to_payload(&mut payload, None).await {
                log::warn!("failed to attach tools to continuation payload: {e}");
            }
            self.state.lock().await.iteration += 1;
            payload
        };

        match provider.stream(payload).await {
            Ok(()) => {
                let iteration_after = self.state.lock().await.iteration;
                self.bus
                    .publish_from(
                        EventKind::ToolChainIterationEnd,
                        serde_json::json!({
                            "tool_chain_id": chain_id,
                            "iteration": iteration_after,
                            "max_iterations": self.tool_calling.max_iterations,
                            "tool_name": call.function_name,
                            "elapsed_time": elapsed,
                        }),
                        Some(provider_id),
                    )
                    .await;
            }
            Err(e) => {
                self.bus
                    .publish_from(
                        EventKind::ToolChainError,
                        serde_json::json!({
                            "tool_chain_id": chain_id,
                            "error": e.to_string(),
                            "iteration": iteration,
                        }),
                        Some(provider_id),
                    )
                    .await;

                let (root_query, elapsed) = {
                    let mut state = self.state.lock().await;
                    let root_query = state.root_query.clone();
                    let elapsed = state.started_at.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0);
                    state.reset_pairing();
                    (root_query, elapsed)
                };
                self.bus
                    .publish_from(
                        EventKind::ToolChainEnd,
                        serde_json::json!({
                            "tool_chain_id": chain_id,
                            "initial_query": root_query,
                            "success": false,
                            "iteration": iteration,
                            "elapsed_time": elapsed,
                        }),
                        Some(provider_id),
                    )
                    .await;
            }
        }
    }

    async fn handle_finish(&self, event: &Event) {
        let outcome = {
            let mut state = self.state.lock().await;
            if !state.started {
                return;
            }
            let normal_end = state.dispatch_queue.is_empty();
            if !(state.partial || normal_end) {
                return;
            }
            let chain_id = state.chain_id.clone();
            let root_query = state.root_query.clone();
            let iteration = state.iteration;
            let partial = state.partial;
            let elapsed = state.started_at.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0);
            state.reset_pairing();
            (chain_id, root_query, iteration, partial, elapsed)
        };
        let (chain_id, root_query, iteration, partial, elapsed) = outcome;

        self.bus
            .publish_from(
                EventKind::ToolChainEnd,
                serde_json::json!({
                    "tool_chain_id": chain_id,
                    "initial_query": root_query,
                    "success": true,
                    "partial": partial,
                    "iteration": iteration,
                    "elapsed_time": elapsed,
                }),
                event.provider,
            )
            .await;
    }
}

#[async_trait]
impl EventSubscriber for ChainScheduler {
    fn subscribed_kinds(&self) -> HashSet<EventKind> {
        [
            EventKind::LlmToolCallRequest,
            EventKind::McpToolCallDispatched,
            EventKind::McpToolCallResult,
            EventKind::McpToolCallError,
            EventKind::Finish,
        ]
        .into_iter()
        .collect()
    }

    async fn on_event(&self, event: &Event) {
        match event.kind {
            // Nothing to do here: the dispatcher sits ahead of us in
            // subscription order and publishes MCP_TOOL_CALL_DISPATCHED
            // synchronously and recursively before this handler ever runs,
            // so the request is already paired into dispatch_queue by the
            // time we'd see it.
            EventKind::LlmToolCallRequest => {}
            EventKind::McpToolCallDispatched => self.handle_dispatched(event).await,
            EventKind::McpToolCallResult | EventKind::McpToolCallError => {
                self.handle_result(event).await
            }
            EventKind::Finish => self.handle_finish(event).await,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hatchling::history::HistoryEntry;
    use crate::hatchling::provider::{ChatPayload, Provider, ProviderError};
    use crate::hatchling::tool_catalog::ToolInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        id: ProviderId,
        stream_calls: AtomicUsize,
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn id(&self) -> ProviderId {
            self.id
        }
        fn prepare_payload(&self, messages: Vec<Value>, model: &str) -> ChatPayload {
            ChatPayload {
                model: model.to_string(),
                messages,
                tools: Vec::new(),
                temperature: 0.7,
                top_p: 1.0,
            }
        }
        async fn add_tools_to_payload(
            &self,
            _payload: &mut ChatPayload,
            _names: Option<&[String]>,
        ) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn stream(&self, _payload: ChatPayload) -> Result<(), ProviderError> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn to_provider_tool(&self, _tool: &ToolInfo) -> Value {
            Value::Null
        }
        fn to_provider_tool_call(&self, call: &ToolCall) -> Value {
            serde_json::json!({"role": "assistant", "tool_call": call.id})
        }
        fn to_provider_tool_result(&self, result: &ToolResult) -> Value {
            serde_json::json!({"role": "tool", "tool_call_id": result.tool_call_id})
        }
        fn render_history_entry(&self, entry: &HistoryEntry) -> Option<Value> {
            match entry {
                HistoryEntry::User(t) => Some(serde_json::json!({"role": "user", "content": t})),
                HistoryEntry::Assistant(t) => Some(serde_json::json!({"role": "assistant", "content": t})),
                HistoryEntry::ToolCall(c) => Some(self.to_provider_tool_call(c)),
                HistoryEntry::ToolResult(r) => Some(self.to_provider_tool_result(r)),
            }
        }
        fn parse_tool_call(&self, _event: &Event) -> Option<ToolCall> {
            None
        }
    }

    fn dispatched(id: &str) -> Event {
        Event::new(
            EventKind::McpToolCallDispatched,
            serde_json::json!({"tool_call_id": id, "function_name": "f", "arguments": {}}),
            Some(ProviderId::Ollama),
            None,
        )
    }

    fn result(id: &str) -> Event {
        Event::new(
            EventKind::McpToolCallResult,
            serde_json::json!({"tool_call_id": id, "function_name": "f", "arguments": {}, "content": [], "is_error": false}),
            Some(ProviderId::Ollama),
            None,
        )
    }

    async fn make_scheduler() -> (Arc<ChainScheduler>, Arc<StubProvider>) {
        let bus = Arc::new(EventBus::new());
        let provider = Arc::new(StubProvider {
            id: ProviderId::Ollama,
            stream_calls: AtomicUsize::new(0),
        });
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderId::Ollama, provider.clone());
        let registry = Arc::new(registry);
        let history = Arc::new(MessageHistory::new(registry.clone()));
        let scheduler = Arc::new(ChainScheduler::new(
            bus,
            history,
            registry,
            ToolCallingSettings {
                max_iterations: 5,
                max_working_time: Some(60.0),
                max_tool_working_time: Some(12.0),
            },
        ));
        (scheduler, provider)
    }

    #[tokio::test]
    async fn out_of_order_results_continue_in_dispatch_order() {
        let (scheduler, provider) = make_scheduler().await;
        scheduler
            .begin_query("q".to_string(), ProviderId::Ollama, "llama3".to_string())
            .await;

        scheduler.on_event(&dispatched("a")).await;
        scheduler.on_event(&dispatched("b")).await;

        // result for "b" arrives first; its pair isn't the queue head yet.
        scheduler.on_event(&result("b")).await;
        assert_eq!(provider.stream_calls.load(Ordering::SeqCst), 0);

        // result for "a" arrives; both pairs drain in dispatch order.
        scheduler.on_event(&result("a")).await;
        assert_eq!(provider.stream_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn finish_without_pending_dispatches_ends_chain() {
        let (scheduler, _provider) = make_scheduler().await;
        scheduler
            .begin_query("q".to_string(), ProviderId::Ollama, "llama3".to_string())
            .await;
        scheduler.on_event(&dispatched("a")).await;
        scheduler.on_event(&result("a")).await;

        let finish = Event::new(EventKind::Finish, Value::Null, Some(ProviderId::Ollama), None);
        scheduler.on_event(&finish).await;

        let state = scheduler.state.lock().await;
        assert!(!state.started);
        assert!(state.dispatch_queue.is_empty());
    }
}
