//! Owns one conversation: wires the event bus, history, MCP manager,
//! provider registry, dispatcher, and chain scheduler together behind a
//! single `send(text)` entry point.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hatchling::hatchling::config::HatchlingConfig;
//! use hatchling::hatchling::env_manager::StaticEnvironmentManager;
//! use hatchling::hatchling::session::Session;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let env = Arc::new(StaticEnvironmentManager::new("/usr/bin/python3", vec![]));
//! let session = Session::new(HatchlingConfig::default(), env).await?;
//! session.send("hello".to_string()).await?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use crate::hatchling::chain_scheduler::ChainScheduler;
use crate::hatchling::config::HatchlingConfig;
use crate::hatchling::dispatcher::ToolDispatcher;
use crate::hatchling::env_manager::EnvironmentManager;
use crate::hatchling::event_bus::{EventBus, EventSubscriber};
use crate::hatchling::history::MessageHistory;
use crate::hatchling::mcp::McpManager;
use crate::hatchling::provider::ollama::OllamaProvider;
use crate::hatchling::provider::openai::OpenAiProvider;
use crate::hatchling::provider::{ProviderId, ProviderRegistry};
use crate::hatchling::tool_catalog::ToolCatalog;

#[derive(Debug)]
pub enum SessionError {
    NoProviderConfigured,
    Environment(crate::hatchling::env_manager::EnvError),
    Manager(crate::hatchling::mcp::McpManagerError),
    Provider(crate::hatchling::provider::ProviderError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NoProviderConfigured => write!(f, "no provider configured for this session"),
            SessionError::Environment(e) => write!(f, "{e}"),
            SessionError::Manager(e) => write!(f, "{e}"),
            SessionError::Provider(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// One conversation: a bus, a catalog, an MCP manager, a dual-view history,
/// a registry of providers, a dispatcher, and a chain scheduler, all
/// subscribed to the same bus.
pub struct Session {
    bus: Arc<EventBus>,
    catalog: Arc<ToolCatalog>,
    manager: Arc<McpManager>,
    history: Arc<MessageHistory>,
    registry: Arc<ProviderRegistry>,
    scheduler: Arc<ChainScheduler>,
    config: HatchlingConfig,
    active_provider: ProviderId,
}

impl Session {
    /// Builds every component and wires their bus subscriptions. Does not
    /// connect to any MCP server — call [`Session::connect_tools`]
    /// afterwards if tool use is desired.
    pub async fn new(
        config: HatchlingConfig,
        env: Arc<dyn EnvironmentManager>,
    ) -> Result<Self, SessionError> {
        let bus = Arc::new(EventBus::new());
        let catalog = Arc::new(ToolCatalog::new());
        let manager = Arc::new(McpManager::with_tool_calling_settings(
            catalog.clone(),
            bus.clone(),
            env,
            config.tool_calling,
        ));

        let mut registry = ProviderRegistry::new();
        let mut active_provider = None;

        if let Some(openai) = &config.openai {
            let provider = Arc::new(OpenAiProvider::new(
                openai.base_url.clone(),
                openai.api_key.clone(),
                openai.model.clone(),
                config.sampling,
                bus.clone(),
                catalog.clone(),
            ));
            registry.register(ProviderId::OpenAi, provider);
            active_provider.get_or_insert(ProviderId::OpenAi);
        }
        if let Some(ollama) = &config.ollama {
            let provider = Arc::new(OllamaProvider::new(
                ollama.base_url.clone(),
                ollama.model.clone(),
                config.sampling,
                bus.clone(),
                catalog.clone(),
            ));
            registry.register(ProviderId::Ollama, provider);
            active_provider.get_or_insert(ProviderId::Ollama);
        }
        let Some(active_provider) = active_provider else {
            return Err(SessionError::NoProviderConfigured);
        };
        let registry = Arc::new(registry);

        let history = Arc::new(MessageHistory::new(registry.clone()));
        bus.subscribe(history.clone() as Arc<dyn EventSubscriber>);

        let dispatcher = Arc::new(ToolDispatcher::new(manager.clone(), bus.clone(), registry.clone()));
        bus.subscribe(dispatcher as Arc<dyn EventSubscriber>);

        let scheduler = Arc::new(ChainScheduler::new(
            bus.clone(),
            history.clone(),
            registry.clone(),
            config.tool_calling,
        ));
        bus.subscribe(scheduler.clone() as Arc<dyn EventSubscriber>);

        Ok(Self {
            bus,
            catalog,
            manager,
            history,
            registry,
            scheduler,
            config,
            active_provider,
        })
    }

    /// Attach an additional subscriber (a UI, a logger) to the session's bus.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.bus.subscribe(subscriber);
    }

    /// Connects to the given MCP server scripts, or, if `None`, whatever the
    /// environment manager reports.
    pub async fn connect_tools(&self, paths: Option<Vec<PathBuf>>) -> Result<(), SessionError> {
        self.manager
            .connect_to_servers(paths)
            .await
            .map_err(SessionError::Manager)
    }

    pub async fn disconnect_tools(&self) {
        self.manager.disconnect_all().await;
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    /// Switches which configured provider subsequent `send` calls target.
    pub fn set_active_provider(&mut self, provider: ProviderId) -> Result<(), SessionError> {
        if self.registry.get(provider).is_none() {
            return Err(SessionError::NoProviderConfigured);
        }
        self.active_provider = provider;
        Ok(())
    }

    /// Appends a user entry to history, resets the chain scheduler's
    /// per-turn state, and starts a fresh streaming request. Returns as
    /// soon as the stream completes; subscribers observe everything that
    /// happened via the bus.
    pub async fn send(&self, text: String) -> Result<(), SessionError> {
        let provider = self
            .registry
            .get(self.active_provider)
            .ok_or(SessionError::NoProviderConfigured)?;

        self.history.add_user(text.clone()).await;

        let model = match self.active_provider {
            ProviderId::OpenAi => self
                .config
                .openai
                .as_ref()
                .map(|c| c.model.clone())
                .unwrap_or_default(),
            ProviderId::Ollama => self
                .config
                .ollama
                .as_ref()
                .map(|c| c.model.clone())
                .unwrap_or_default(),
        };

        self.scheduler
            .begin_query(text, self.active_provider, model.clone())
            .await;

        let messages = self.history.messages_for(self.active_provider).await;
        let mut payload = provider.prepare_payload(messages, &model);
        provider
            .add_tools_to_payload(&mut payload, None)
            .await
            .map_err(SessionError::Provider)?;

        provider.stream(payload).await.map_err(SessionError::Provider)
    }
}
