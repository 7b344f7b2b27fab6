//! Provider abstraction: normalizes a streaming chat API into bus events.
//!
//! This is the one genuinely polymorphic seam in the crate. Rather than a
//! reflection-based registry, new providers are added by implementing
//! [`Provider`] and registering a constructor with [`ProviderRegistry::register`]
//! keyed on a [`ProviderId`] variant.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hatchling::hatchling::config::SamplingSettings;
//! use hatchling::hatchling::event_bus::EventBus;
//! use hatchling::hatchling::tool_catalog::ToolCatalog;
//! use hatchling::hatchling::provider::{ProviderId, ProviderRegistry};
//! use hatchling::hatchling::provider::ollama::OllamaProvider;
//!
//! let bus = Arc::new(EventBus::new());
//! let catalog = Arc::new(ToolCatalog::new());
//! let mut registry = ProviderRegistry::new();
//! registry.register(
//!     ProviderId::Ollama,
//!     Arc::new(OllamaProvider::new(
//!         "http://localhost:11434".to_string(),
//!         "llama3".to_string(),
//!         SamplingSettings::default(),
//!         bus.clone(),
//!         catalog,
//!     )),
//! );
//! ```

pub mod ndjson;
pub mod ollama;
pub mod openai;
pub mod sse;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::hatchling::event_bus::Event;
use crate::hatchling::history::HistoryEntry;
use crate::hatchling::tool_catalog::ToolInfo;

/// Closed set of supported LLM providers. New providers extend this set and
/// are wired in by calling [`ProviderRegistry::register`]; nothing here uses
/// runtime reflection to discover them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    OpenAi,
    Ollama,
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderId::OpenAi => write!(f, "openai"),
            ProviderId::Ollama => write!(f, "ollama"),
        }
    }
}

/// A reassembled tool call. `id` correlates with the eventual [`ToolResult`].
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    pub arguments: Value,
}

/// The outcome of invoking a tool, in MCP's `{content, is_error}` shape.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub function_name: String,
    pub arguments: Value,
    pub content: Vec<(String, String)>,
    pub is_error: bool,
    pub error: Option<String>,
}

/// Token accounting reported by a provider at the end of a stream.
#[derive(Debug, Clone, Copy)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug)]
pub enum ProviderError {
    Transport(reqwest::Error),
    UnknownTool(String),
    Http { status: u16, body: String },
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Transport(e) => write!(f, "provider transport error: {e}"),
            ProviderError::UnknownTool(name) => write!(f, "unknown tool requested: {name}"),
            ProviderError::Http { status, body } => {
                write!(f, "provider returned HTTP {status}: {body}")
            }
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e)
    }
}

/// A provider-agnostic chat request under construction. Providers mutate
/// their own representation internally; this struct only carries the
/// inputs common to every provider's `prepare_payload`.
#[derive(Debug, Clone)]
pub struct ChatPayload {
    pub model: String,
    pub messages: Vec<Value>,
    pub tools: Vec<Value>,
    pub temperature: f32,
    pub top_p: f32,
}

/// One normalized streaming chat API, implemented once per [`ProviderId`].
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Build the provider's chat request. Streaming is always enabled.
    fn prepare_payload(&self, messages: Vec<Value>, model: &str) -> ChatPayload;

    /// Attach tools to `payload`. `names = None` means "every enabled tool
    /// in the catalog"; `Some(names)` filters to exactly those, skipping
    /// disabled ones with a warning and failing on unknown ones.
    async fn add_tools_to_payload(
        &self,
        payload: &mut ChatPayload,
        names: Option<&[String]>,
    ) -> Result<(), ProviderError>;

    /// Open a streaming chat request and translate each chunk into bus
    /// events, per the provider's chunk translation rules. Generates a
    /// fresh request id for this call and attaches it to every event it
    /// emits.
    async fn stream(&self, payload: ChatPayload) -> Result<(), ProviderError>;

    /// Adapter used by the tool catalog to render a [`ToolInfo`] in this
    /// provider's wire format.
    fn to_provider_tool(&self, tool: &ToolInfo) -> Value;

    /// Adapter used when inserting a prior assistant tool-call record into
    /// the next payload.
    fn to_provider_tool_call(&self, call: &ToolCall) -> Value;

    /// Adapter used when inserting a tool's output into the next payload.
    fn to_provider_tool_result(&self, result: &ToolResult) -> Value;

    /// Render one canonical history entry in this provider's wire format.
    /// Used by [`crate::hatchling::history::MessageHistory`] to regenerate
    /// its cached view.
    fn render_history_entry(&self, entry: &HistoryEntry) -> Option<Value>;

    /// Reassemble a complete tool call from an `LLM_TOOL_CALL_REQUEST`
    /// event. Returns `None` if the event represents a still-partial call
    /// (callers ignore partials).
    fn parse_tool_call(&self, event: &Event) -> Option<ToolCall>;
}

/// Explicit registration table keyed on [`ProviderId`] — no reflection.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderId, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: ProviderId, provider: Arc<dyn Provider>) {
        self.providers.insert(id, provider);
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn Provider>> {
        self.providers.get(&id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ProviderId> {
        self.providers.keys()
    }
}
