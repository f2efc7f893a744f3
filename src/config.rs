//! Configuration for the gateway.
//!
//! Loaded once at startup from a TOML file (path from `GATEWAY_CONFIG`, default
//! `config.toml`), validated before any port opens, and hot-reloadable: a background
//! watcher polls the file's mtime and atomically swaps in a freshly parsed snapshot.
//! Handlers only ever see a `Config` snapshot that was valid at the time it was loaded —
//! there is no shared mutable configuration on the request path (spec §5).
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//! admin_port  = 8081
//!
//! [routing]
//! strategy = "smart"
//!
//! [providers.openai]
//! api_key_env = "OPENAI_API_KEY"
//! base_url    = "https://api.openai.com"
//! ```

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Shared, atomically-swappable config snapshot. The lock is held only for the duration of
/// an `Arc::clone`, so reading it never blocks the request path (spec §5).
pub type ConfigHandle = Arc<RwLock<Arc<Config>>>;

/// Snapshot the currently live config.
pub fn current(handle: &ConfigHandle) -> Arc<Config> {
    handle.read().expect("config lock poisoned").clone()
}

/// Atomically swap in a freshly loaded config (called by the hot-reload watcher).
pub fn replace(handle: &ConfigHandle, new: Config) {
    *handle.write().expect("config lock poisoned") = Arc::new(new);
}

/// The seven routing policies from spec §4.1.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    #[default]
    Smart,
    Cost,
    Latency,
    Quality,
    ContentBased,
    LoadBalanced,
    Experimental,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Smart => "smart",
            Self::Cost => "cost",
            Self::Latency => "latency",
            Self::Quality => "quality",
            Self::ContentBased => "content",
            Self::LoadBalanced => "load-balanced",
            Self::Experimental => "experimental",
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub strategy: RoutingStrategy,
    /// Weights for the `smart` composite score. Defaults per spec §9 Open Question 3.
    #[serde(default = "defaults::w_cost")]
    pub w_cost: f64,
    #[serde(default = "defaults::w_lat")]
    pub w_lat: f64,
    #[serde(default = "defaults::w_qual")]
    pub w_qual: f64,
    #[serde(default = "defaults::experimental_sample_rate")]
    pub experimental_sample_rate: f64,
    #[serde(default)]
    pub experimental_models: Vec<String>,
    /// Rolling-window size for the latency strategy (spec §4.1: W=64).
    #[serde(default = "defaults::latency_window")]
    pub latency_window: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::default(),
            w_cost: defaults::w_cost(),
            w_lat: defaults::w_lat(),
            w_qual: defaults::w_qual(),
            experimental_sample_rate: defaults::experimental_sample_rate(),
            experimental_models: Vec::new(),
            latency_window: defaults::latency_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResilienceConfig {
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    #[serde(default = "defaults::base_backoff_sec")]
    pub base_backoff_sec: u64,
    #[serde(default = "defaults::circuit_threshold")]
    pub circuit_threshold: u32,
    #[serde(default = "defaults::circuit_cooldown_sec")]
    pub circuit_cooldown_sec: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_backoff_sec: defaults::base_backoff_sec(),
            circuit_threshold: defaults::circuit_threshold(),
            circuit_cooldown_sec: defaults::circuit_cooldown_sec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "defaults::token_limit")]
    pub token_limit: u32,
    #[serde(default = "defaults::tokens_per_period")]
    pub tokens_per_period: u32,
    #[serde(default = "defaults::period_sec")]
    pub period_sec: u64,
    #[serde(default = "defaults::queue_limit")]
    pub queue_limit: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            token_limit: defaults::token_limit(),
            tokens_per_period: defaults::tokens_per_period(),
            period_sec: defaults::period_sec(),
            queue_limit: defaults::queue_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeadlinesConfig {
    #[serde(default = "defaults::non_stream_sec")]
    pub non_stream_sec: u64,
    #[serde(default = "defaults::stream_sec")]
    pub stream_sec: u64,
}

impl Default for DeadlinesConfig {
    fn default() -> Self {
        Self {
            non_stream_sec: defaults::non_stream_sec(),
            stream_sec: defaults::stream_sec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    #[serde(default = "defaults::bool_true")]
    pub enabled: bool,
    #[serde(default = "defaults::max_depth")]
    pub max_depth: u32,
    /// Fallback rules: requested canonical model id -> ordered candidate ids.
    #[serde(default)]
    pub rules: HashMap<String, Vec<String>>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: defaults::max_depth(),
            rules: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub enforce: bool,
    /// Per-user monthly budget in USD, consulted when `enforce` is true.
    #[serde(default)]
    pub monthly_limit_usd: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentFilterConfig {
    #[serde(default = "defaults::bool_true")]
    pub enabled: bool,
    #[serde(default = "defaults::filter_directions")]
    pub directions: Vec<FilterDirection>,
}

impl Default for ContentFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directions: defaults::filter_directions(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterDirection {
    Prompt,
    Completion,
}

/// Per-provider connection settings. `name` (the map key in `[providers.<name>]`) is the
/// canonical provider name used in model ids.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub base_url: String,
    #[serde(default = "defaults::provider_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default)]
    pub org_id: Option<String>,
    /// Known models for this provider, used to populate `/v1/models` and pricing lookups.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl ProviderConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_deref().and_then(|v| std::env::var(v).ok())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "defaults::context_window")]
    pub context_window: u32,
    #[serde(default)]
    pub price_per_1k_prompt: f64,
    #[serde(default)]
    pub price_per_1k_completion: f64,
    #[serde(default = "defaults::bool_true")]
    pub completions: bool,
    #[serde(default)]
    pub embeddings: bool,
    #[serde(default = "defaults::bool_true")]
    pub streaming: bool,
    #[serde(default)]
    pub tool_calling: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default = "defaults::quality_score")]
    pub quality_score: f64,
    #[serde(default = "defaults::bool_true")]
    pub active: bool,
}

/// A per-API-key binding: the key's environment variable, its owning user, and the
/// permissions it carries (spec §6 "Authorization claims gate operations").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub key_env: String,
    pub user_id: String,
    #[serde(default = "defaults::permissions")]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub admin_token_env: Option<String>,
    /// How often the fine-tuning background sync polls (spec §4.7, default 5 min).
    #[serde(default = "defaults::fine_tune_sync_sec")]
    pub fine_tune_sync_sec: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_port: defaults::client_port(),
            admin_port: defaults::admin_port(),
            traffic_log_capacity: defaults::traffic_log_capacity(),
            log_level: None,
            admin_token_env: None,
            fine_tune_sync_sec: defaults::fine_tune_sync_sec(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub deadlines: DeadlinesConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub content_filter: ContentFilterConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.routing.w_cost >= 0.0 && self.routing.w_lat >= 0.0 && self.routing.w_qual >= 0.0,
            "routing weights must be non-negative"
        );
        anyhow::ensure!(
            self.resilience.circuit_threshold > 0,
            "resilience.circuit.threshold must be > 0"
        );
        anyhow::ensure!(self.rate_limit.token_limit > 0, "rateLimit.tokenLimit must be > 0");

        let provider_names: std::collections::HashSet<&str> =
            self.providers.keys().map(|k| k.as_str()).collect();
        for (model_id, candidates) in &self.fallback.rules {
            anyhow::ensure!(
                model_id.contains('.'),
                "fallback rule key `{}` must be a canonical provider.model id",
                model_id
            );
            for c in candidates {
                anyhow::ensure!(
                    c.split_once('.').map(|(p, _)| provider_names.contains(p)).unwrap_or(false),
                    "fallback candidate `{}` references an unconfigured provider",
                    c
                );
            }
        }

        let profile_names_seen: std::collections::HashSet<&str> =
            self.clients.iter().map(|c| c.key_env.as_str()).collect();
        anyhow::ensure!(
            profile_names_seen.len() == self.clients.len(),
            "duplicate [[clients]] key_env entries"
        );

        Ok(())
    }

    /// Resolve either a canonical `provider.modelId` id or an alias into the model's
    /// `(provider, providerModelId)` pair plus its full descriptor.
    pub fn resolve_model(&self, model_id: &str) -> Option<(&str, &ModelConfig)> {
        let (provider, provider_model_id) = model_id.split_once('.')?;
        let provider_cfg = self.providers.get(provider)?;
        provider_cfg
            .models
            .iter()
            .find(|m| m.id == provider_model_id)
            .map(|m| (provider, m))
    }

    pub fn all_models(&self) -> Vec<crate::model::ModelDescriptor> {
        self.providers
            .iter()
            .flat_map(|(provider, cfg)| {
                cfg.models.iter().map(move |m| crate::model::ModelDescriptor {
                    id: crate::model::canonical_id(provider, &m.id),
                    display_name: m.display_name.clone().unwrap_or_else(|| m.id.clone()),
                    provider: provider.clone(),
                    provider_model_id: m.id.clone(),
                    context_window: m.context_window,
                    capabilities: crate::model::Capabilities {
                        completions: m.completions,
                        embeddings: m.embeddings,
                        streaming: m.streaming,
                        tool_calling: m.tool_calling,
                        vision: m.vision,
                    },
                    price_per_1k_prompt: m.price_per_1k_prompt,
                    price_per_1k_completion: m.price_per_1k_completion,
                    quality_score: m.quality_score,
                    active: m.active,
                })
            })
            .collect()
    }
}

mod defaults {
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn traffic_log_capacity() -> usize { 500 }
    pub fn fine_tune_sync_sec() -> u64 { 300 }
    pub fn w_cost() -> f64 { 0.4 }
    pub fn w_lat() -> f64 { 0.4 }
    pub fn w_qual() -> f64 { 0.2 }
    pub fn experimental_sample_rate() -> f64 { 0.1 }
    pub fn latency_window() -> usize { 64 }
    pub fn max_retries() -> u32 { 3 }
    pub fn base_backoff_sec() -> u64 { 1 }
    pub fn circuit_threshold() -> u32 { 5 }
    pub fn circuit_cooldown_sec() -> u64 { 30 }
    pub fn token_limit() -> u32 { 100 }
    pub fn tokens_per_period() -> u32 { 10 }
    pub fn period_sec() -> u64 { 1 }
    pub fn queue_limit() -> usize { 50 }
    pub fn non_stream_sec() -> u64 { 30 }
    pub fn stream_sec() -> u64 { 120 }
    pub fn max_depth() -> u32 { 3 }
    pub fn filter_directions() -> Vec<super::FilterDirection> {
        vec![super::FilterDirection::Prompt, super::FilterDirection::Completion]
    }
    pub fn provider_timeout_sec() -> u64 { 30 }
    pub fn context_window() -> u32 { 8192 }
    pub fn quality_score() -> f64 { 0.5 }
    pub fn bool_true() -> bool { true }
    pub fn permissions() -> Vec<String> { vec!["completion".into(), "embedding".into()] }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [providers.openai]
            base_url = "https://api.openai.com"
            [[providers.openai.models]]
            id = "gpt-3.5-turbo"
            price_per_1k_prompt = 0.001
            price_per_1k_completion = 0.002

            [providers.anthropic]
            base_url = "https://api.anthropic.com"
            [[providers.anthropic.models]]
            id = "claude-3-opus"
            price_per_1k_prompt = 0.015
            price_per_1k_completion = 0.075
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn parse_example_config() {
        let content = include_str!("../config.example.toml");
        let config: Config = toml::from_str(content).expect("example config should parse");
        config.validate().expect("example config should be valid");
    }

    #[test]
    fn defaults_applied_when_sections_absent() {
        let config = minimal_config();
        assert_eq!(config.gateway.client_port, 8080);
        assert_eq!(config.routing.strategy, RoutingStrategy::Smart);
        assert_eq!(config.routing.w_cost, 0.4);
        assert_eq!(config.resilience.max_retries, 3);
        assert_eq!(config.rate_limit.token_limit, 100);
        assert_eq!(config.deadlines.non_stream_sec, 30);
        assert_eq!(config.deadlines.stream_sec, 120);
    }

    #[test]
    fn resolve_model_by_canonical_id() {
        let config = minimal_config();
        let (provider, model) = config.resolve_model("openai.gpt-3.5-turbo").unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(model.id, "gpt-3.5-turbo");
    }

    #[test]
    fn resolve_model_returns_none_for_unknown() {
        let config = minimal_config();
        assert!(config.resolve_model("openai.no-such-model").is_none());
    }

    #[test]
    fn validation_rejects_fallback_rule_with_unconfigured_provider() {
        let mut config = minimal_config();
        config
            .fallback
            .rules
            .insert("openai.gpt-4".into(), vec!["cohere.command-r".into()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_accepts_fallback_rule_with_configured_provider() {
        let mut config = minimal_config();
        config
            .fallback
            .rules
            .insert("openai.gpt-4".into(), vec!["anthropic.claude-3-opus".into()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn all_models_produces_canonical_ids() {
        let config = minimal_config();
        let models = config.all_models();
        assert!(models.iter().any(|m| m.id == "openai.gpt-3.5-turbo"));
        assert!(models.iter().any(|m| m.id == "anthropic.claude-3-opus"));
    }
}
