//! Typed publish/subscribe event bus.
//!
//! Every subsystem in this crate communicates through the bus rather than
//! calling each other directly, with three exceptions that must return a
//! value synchronously: payload preparation, tool listing, and MCP
//! invocation (see the crate-level documentation).
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashSet;
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use hatchling::hatchling::event_bus::{Event, EventBus, EventKind, EventSubscriber};
//!
//! struct Logger;
//!
//! #[async_trait]
//! impl EventSubscriber for Logger {
//!     fn subscribed_kinds(&self) -> HashSet<EventKind> {
//!         [EventKind::Content].into_iter().collect()
//!     }
//!
//!     async fn on_event(&self, event: &Event) {
//!         println!("{:?}", event.kind);
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new();
//! bus.subscribe(Arc::new(Logger));
//! bus.publish(EventKind::Content, serde_json::json!({"text": "hi"})).await;
//! # }
//! ```

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::hatchling::provider::ProviderId;

/// The closed set of event kinds a subscriber may declare interest in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // Stream
    Content,
    Role,
    Finish,
    Usage,
    Error,
    // LLM tool-call
    LlmToolCallRequest,
    // MCP lifecycle
    McpServerUp,
    McpServerDown,
    McpServerUnreachable,
    McpServerReachable,
    McpToolEnabled,
    McpToolDisabled,
    // MCP execution
    McpToolCallDispatched,
    McpToolCallResult,
    McpToolCallError,
    // Chain
    ToolChainStart,
    ToolChainIterationStart,
    ToolChainIterationEnd,
    ToolChainEnd,
    ToolChainLimitReached,
    ToolChainError,
}

/// An immutable record published on the bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub data: Value,
    pub provider: Option<ProviderId>,
    pub request_id: Option<String>,
    pub timestamp: Instant,
}

impl Event {
    pub fn new(
        kind: EventKind,
        data: Value,
        provider: Option<ProviderId>,
        request_id: Option<String>,
    ) -> Self {
        Self {
            kind,
            data,
            provider,
            request_id,
            timestamp: Instant::now(),
        }
    }
}

/// Something that reacts to bus events.
///
/// Implementations must not panic inside [`on_event`](EventSubscriber::on_event);
/// a subscriber that fails should catch its own error, log it, and return —
/// an exception here must never prevent other subscribers from receiving
/// the same event, and the bus does not attempt to unwind across it.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// The kinds this subscriber wants delivered. Evaluated once per
    /// publish; implementations that need to change their interest set
    /// should recompute it cheaply (the bus does not cache it).
    fn subscribed_kinds(&self) -> HashSet<EventKind>;

    async fn on_event(&self, event: &Event);
}

/// Thread-safe publish/subscribe bus.
///
/// The subscriber list may be mutated concurrently with publication: a
/// snapshot (`Vec<Arc<dyn EventSubscriber>>`) is cloned out from under the
/// lock before any subscriber is invoked, so a `subscribe`/`unsubscribe`
/// racing a `publish` never observes a half-updated list and never holds
/// the lock across an `.await`.
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    active_request_id: Mutex<Option<String>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            active_request_id: Mutex::new(None),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .push(subscriber);
    }

    /// Removes a subscriber by pointer identity.
    pub fn unsubscribe(&self, subscriber: &Arc<dyn EventSubscriber>) {
        let target = Arc::as_ptr(subscriber);
        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .retain(|s| Arc::as_ptr(s) != target);
    }

    /// Sets the request id attached to every event published from now on,
    /// until changed again. A provider calls this once per `stream()`
    /// invocation with a fresh id.
    pub async fn set_request_id(&self, id: Option<String>) {
        *self.active_request_id.lock().await = id;
    }

    /// Publish `kind` with `data` (and no provider tag). Equivalent to
    /// [`publish_from`](EventBus::publish_from) with `provider = None`.
    pub async fn publish(&self, kind: EventKind, data: Value) {
        self.publish_from(kind, data, None).await;
    }

    /// Publish `kind` tagged with the given provider.
    pub async fn publish_from(&self, kind: EventKind, data: Value, provider: Option<ProviderId>) {
        let request_id = self.active_request_id.lock().await.clone();
        let event = Event::new(kind, data, provider, request_id);

        let snapshot: Vec<Arc<dyn EventSubscriber>> = self
            .subscribers
            .read()
            .expect("event bus lock poisoned")
            .clone();

        for subscriber in snapshot {
            if subscriber.subscribed_kinds().contains(&kind) {
                subscriber.on_event(&event).await;
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
