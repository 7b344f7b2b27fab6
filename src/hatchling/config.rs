//! Configuration for the orchestration core.
//!
//! Mirrors the rest of the crate's stance on configuration: a plain struct
//! that callers construct however they like. No file-parsing dependency is
//! introduced here; reading TOML/YAML/env vars into a [`HatchlingConfig`]
//! is the caller's concern.
//!
//! # Example
//!
//! ```rust
//! use hatchling::hatchling::config::HatchlingConfig;
//!
//! let config = HatchlingConfig::default();
//! assert_eq!(config.tool_calling.max_iterations, 5);
//! ```

/// Per-chain iteration and wall-clock limits.
///
/// Defaults match the limits a freshly started session uses when nothing
/// overrides them: at most 5 tool-calling iterations, a 60 second overall
/// budget per chain, and a 12 second budget per individual tool call.
#[derive(Debug, Clone, Copy)]
pub struct ToolCallingSettings {
    /// Maximum number of continuation iterations per chain. Must be >= 1.
    pub max_iterations: u32,
    /// Overall wall-clock budget for a chain, in seconds. `None` disables
    /// the limit.
    pub max_working_time: Option<f64>,
    /// Wall-clock budget for a single tool invocation, in seconds. `None`
    /// disables the limit.
    pub max_tool_working_time: Option<f64>,
}

impl Default for ToolCallingSettings {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_working_time: Some(60.0),
            max_tool_working_time: Some(12.0),
        }
    }
}

/// Sampling parameters forwarded into `prepare_payload`. Per-call `opts`
/// passed to a provider override these.
#[derive(Debug, Clone, Copy)]
pub struct SamplingSettings {
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
        }
    }
}

/// Endpoint configuration for the OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Endpoint configuration for the Ollama provider.
#[derive(Debug, Clone)]
pub struct OllamaSettings {
    pub base_url: String,
    pub model: String,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
        }
    }
}

/// Top-level configuration for a [`crate::hatchling::session::Session`].
#[derive(Debug, Clone)]
pub struct HatchlingConfig {
    pub tool_calling: ToolCallingSettings,
    pub sampling: SamplingSettings,
    pub openai: Option<OpenAiSettings>,
    pub ollama: Option<OllamaSettings>,
}

impl Default for HatchlingConfig {
    fn default() -> Self {
        Self {
            tool_calling: ToolCallingSettings::default(),
            sampling: SamplingSettings::default(),
            openai: None,
            ollama: Some(OllamaSettings::default()),
        }
    }
}
