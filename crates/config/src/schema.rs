/// Config schema types (providers, agent loop defaults).
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Provider names the orchestration core knows how to talk to.
pub const KNOWN_PROVIDERS: &[&str] = &["anthropic", "openai", "gemini"];

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub providers: ProvidersConfig,
    pub agent: AgentConfig,
}

impl RelayConfig {
    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        for name in self.providers.providers.keys() {
            if !KNOWN_PROVIDERS.contains(&name.as_str()) {
                return Err(Error::Invalid(format!(
                    "unknown provider \"{name}\" (expected one of {})",
                    KNOWN_PROVIDERS.join(", ")
                )));
            }
        }
        if self.agent.max_iterations == 0 {
            return Err(Error::Invalid("agent.max_iterations must be at least 1".into()));
        }
        if self.agent.max_tokens == 0 {
            return Err(Error::Invalid("agent.max_tokens must be at least 1".into()));
        }
        Ok(())
    }
}

/// LLM provider configuration, keyed by provider name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Known keys: "anthropic", "openai", "gemini".
    #[serde(flatten)]
    pub providers: HashMap<String, ProviderEntry>,
}

impl ProvidersConfig {
    /// Check if a provider is enabled (defaults to true if not configured).
    pub fn is_enabled(&self, name: &str) -> bool {
        self.providers.get(name).is_none_or(|e| e.enabled)
    }

    /// Get the configured entry for a provider, if any.
    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.get(name)
    }
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEntry {
    /// Whether this provider is enabled. Defaults to true.
    pub enabled: bool,

    /// Override the vendor base URL (proxies, test servers).
    pub base_url: Option<String>,

    /// Default model ID for this provider.
    pub model: Option<String>,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            model: None,
        }
    }
}

/// Defaults for agent runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Upper bound on model calls per run. Default 10.
    pub max_iterations: usize,
    /// Visible-output token budget per request. Default 4096.
    pub max_tokens: u32,
    /// Reasoning budget in tokens (0 = thinking disabled).
    pub thinking_budget: u32,
    /// Wall-clock limit for one adapter call (0 = no timeout). Default 300.
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_tokens: 4096,
            thinking_budget: 0,
            request_timeout_secs: 300,
        }
    }
}
