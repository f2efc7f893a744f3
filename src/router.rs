//! Request routing — picks a candidate sequence of `(provider, providerModelId)` pairs for
//! a request, per the seven policies in `routing.strategy` (spec §4.1).
//!
//! Routing is pure decision-making: it never talks to a provider. The dispatcher
//! (`dispatcher.rs`) walks the returned candidate sequence and does the actual network work,
//! so a routing mistake never costs more than a wasted in-memory comparison.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    circuit::CircuitRegistry,
    config::{Config, ConfigHandle, RoutingStrategy},
    error::GatewayError,
    model::{Candidate, CompletionRequest, EmbeddingRequest, ModelDescriptor, RoutingDecision},
};

/// Rolling window of observed latencies for one canonical model id (spec §4.1: W=64).
pub struct LatencyStats {
    window: Mutex<VecDeque<f64>>,
    capacity: usize,
}

impl LatencyStats {
    pub fn new(capacity: usize) -> Self {
        Self { window: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    pub async fn record(&self, latency_ms: f64) {
        let mut w = self.window.lock().await;
        if w.len() == self.capacity {
            w.pop_front();
        }
        w.push_back(latency_ms);
    }

    pub async fn mean(&self) -> Option<f64> {
        let w = self.window.lock().await;
        if w.is_empty() {
            None
        } else {
            Some(w.iter().sum::<f64>() / w.len() as f64)
        }
    }
}

/// What a request needs a candidate model to support, derived from the request body.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityNeed {
    pub embeddings: bool,
    pub streaming: bool,
    pub tool_calling: bool,
    pub vision: bool,
    pub min_context_window: u32,
}

impl CapabilityNeed {
    pub fn for_completion(req: &CompletionRequest) -> Self {
        Self {
            embeddings: false,
            streaming: req.stream,
            tool_calling: req.tools.is_some() || req.tool_choice.is_some(),
            vision: false,
            min_context_window: estimate_tokens(&req.joined_text()),
        }
    }

    pub fn for_embedding(_req: &EmbeddingRequest) -> Self {
        Self { embeddings: true, ..Default::default() }
    }

    fn satisfied_by(&self, m: &ModelDescriptor) -> bool {
        if self.embeddings && !m.capabilities.embeddings {
            return false;
        }
        if !self.embeddings && !m.capabilities.completions {
            return false;
        }
        if self.streaming && !m.capabilities.streaming {
            return false;
        }
        if self.tool_calling && !m.capabilities.tool_calling {
            return false;
        }
        if self.vision && !m.capabilities.vision {
            return false;
        }
        if m.context_window < self.min_context_window {
            return false;
        }
        true
    }
}

/// Character-count/4 approximation, used only to decide whether a request is
/// "large" for content-based routing — the real token count comes from the tokenizer port
/// once a model is chosen.
fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

/// Routes requests to candidate models. Holds the per-model latency and round-robin state
/// that persists across requests; everything else comes from the current config snapshot.
pub struct Router {
    config: ConfigHandle,
    circuits: Arc<CircuitRegistry>,
    latency: DashMap<String, Arc<LatencyStats>>,
    round_robin: DashMap<String, AtomicUsize>,
}

impl Router {
    pub fn new(config: ConfigHandle, circuits: Arc<CircuitRegistry>) -> Self {
        Self { config, circuits, latency: DashMap::new(), round_robin: DashMap::new() }
    }

    /// Records an observed latency against a model's rolling window, for the `latency`
    /// and `smart` strategies. Called by the dispatcher after a successful attempt.
    pub async fn record_latency(&self, canonical_id: &str, latency_ms: f64) {
        let window = self.config.read().expect("config lock poisoned").routing.latency_window;
        let stats = self
            .latency
            .entry(canonical_id.to_string())
            .or_insert_with(|| Arc::new(LatencyStats::new(window)))
            .clone();
        stats.record(latency_ms).await;
    }

    /// Resolve a chat-completion request to an ordered candidate sequence.
    pub async fn route(
        &self,
        requested_model: &str,
        request: &CompletionRequest,
        preferred_model: Option<&str>,
    ) -> Result<(Vec<Candidate>, RoutingDecision), GatewayError> {
        let need = CapabilityNeed::for_completion(request);
        self.route_with_need(requested_model, need, preferred_model).await
    }

    /// Resolve an embedding request to an ordered candidate sequence.
    pub async fn route_embedding(
        &self,
        requested_model: &str,
        request: &EmbeddingRequest,
    ) -> Result<(Vec<Candidate>, RoutingDecision), GatewayError> {
        let need = CapabilityNeed::for_embedding(request);
        self.route_with_need(requested_model, need, None).await
    }

    async fn route_with_need(
        &self,
        requested_model: &str,
        need: CapabilityNeed,
        preferred_model: Option<&str>,
    ) -> Result<(Vec<Candidate>, RoutingDecision), GatewayError> {
        let config = self.config.read().expect("config lock poisoned").clone();
        let strategy = config.routing.strategy;

        // Step 1: a validated user preference is pinned ahead of everything else.
        if let Some(pref) = preferred_model {
            if let Some((provider, model)) = config.resolve_model(pref) {
                if need.satisfied_by(&descriptor(provider, model)) {
                    let candidate = Candidate { provider: provider.to_string(), provider_model_id: model.id.clone() };
                    let mut sequence = vec![candidate];
                    append_fallbacks(&config, requested_model, &mut sequence);
                    let sequence = self.drop_open_circuits(sequence);
                    if sequence.is_empty() {
                        return Err(GatewayError::AllProvidersOpen);
                    }
                    let decision = self.decision(requested_model, &sequence[0], "pinned-preference", strategy);
                    return Ok((sequence, decision));
                }
            }
        }

        // Step 2: resolve the requested logical/canonical id to its pool of viable candidates.
        let viable = self.viable_models(&config, requested_model, need);
        if viable.is_empty() {
            return Err(GatewayError::NoViableModel);
        }

        // Step 3: rank by policy.
        let ranked = match strategy {
            RoutingStrategy::Cost => self.rank_by_cost(&config, viable, &need),
            RoutingStrategy::Latency => self.rank_by_latency(viable).await,
            RoutingStrategy::ContentBased => self.rank_content_based(&config, viable, request_hint(requested_model), &need),
            RoutingStrategy::Quality => rank_by_quality(viable),
            RoutingStrategy::LoadBalanced => self.rank_load_balanced(requested_model, viable),
            RoutingStrategy::Smart => self.rank_smart(&config, viable).await,
            RoutingStrategy::Experimental => self.rank_experimental(&config, viable).await,
        };

        let mut sequence: Vec<Candidate> =
            ranked.iter().map(|m| Candidate { provider: m.provider.clone(), provider_model_id: m.provider_model_id.clone() }).collect();

        // Step 4: append configured fallback-rule candidates, deduplicated.
        append_fallbacks(&config, requested_model, &mut sequence);

        // Step 5: drop candidates whose provider circuit is open.
        let sequence = self.drop_open_circuits(sequence);
        if sequence.is_empty() {
            return Err(GatewayError::AllProvidersOpen);
        }

        let reason = match strategy {
            RoutingStrategy::Smart => "smart-composite-score",
            RoutingStrategy::Cost => "lowest-estimated-cost",
            RoutingStrategy::Latency => "lowest-rolling-latency",
            RoutingStrategy::Quality => "highest-quality-score",
            RoutingStrategy::ContentBased => "content-heuristic",
            RoutingStrategy::LoadBalanced => "round-robin",
            RoutingStrategy::Experimental => "experimental-sample",
        };
        let decision = self.decision(requested_model, &sequence[0], reason, strategy);
        Ok((sequence, decision))
    }

    fn decision(&self, requested: &str, winner: &Candidate, reason: &str, strategy: RoutingStrategy) -> RoutingDecision {
        RoutingDecision {
            request_id: Uuid::new_v4().to_string(),
            requested_model: requested.to_string(),
            selected_model: winner.canonical_id(),
            strategy: strategy.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
            fallback_depth: 0,
        }
    }

    /// Resolves the requested id (canonical or alias) to the pool of active, capability-matching
    /// models. A logical hint (non-dotted) is treated as "any active model satisfying `need`".
    fn viable_models(&self, config: &Config, requested: &str, need: CapabilityNeed) -> Vec<ModelDescriptor> {
        let all = config.all_models();
        if let Some((_, _)) = requested.split_once('.') {
            if let Some((provider, model)) = config.resolve_model(requested) {
                let d = descriptor(provider, model);
                if d.active && need.satisfied_by(&d) {
                    return vec![d];
                }
                return Vec::new();
            }
        }
        all.into_iter().filter(|m| m.active && need.satisfied_by(m)).collect()
    }

    fn rank_by_cost(&self, _config: &Config, mut models: Vec<ModelDescriptor>, need: &CapabilityNeed) -> Vec<ModelDescriptor> {
        models.sort_by(|a, b| {
            let cost_a = estimated_cost(a, need.min_context_window);
            let cost_b = estimated_cost(b, need.min_context_window);
            cost_a.partial_cmp(&cost_b).unwrap_or(std::cmp::Ordering::Equal)
        });
        models
    }

    async fn rank_by_latency(&self, mut models: Vec<ModelDescriptor>) -> Vec<ModelDescriptor> {
        let mut scored = Vec::with_capacity(models.len());
        for m in models.drain(..) {
            let mean = match self.latency.get(&m.id) {
                Some(s) => s.mean().await.unwrap_or(f64::MAX),
                None => f64::MAX,
            };
            scored.push((mean, m));
        }
        scored.sort_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, m)| m).collect()
    }

    fn rank_content_based(
        &self,
        config: &Config,
        mut models: Vec<ModelDescriptor>,
        hint: ContentHint,
        need: &CapabilityNeed,
    ) -> Vec<ModelDescriptor> {
        // Filter: the content signal narrows candidates when a matching one exists, but
        // never drops below one viable candidate.
        let filtered: Vec<ModelDescriptor> = models
            .iter()
            .filter(|m| match hint {
                ContentHint::Coding => m.capabilities.tool_calling || m.context_window >= 16_000,
                ContentHint::LongContext => m.context_window >= 32_000,
                ContentHint::Vision => m.capabilities.vision,
                ContentHint::None => true,
            })
            .cloned()
            .collect();
        if !filtered.is_empty() {
            models = filtered;
        }
        self.rank_by_cost(config, models, need)
    }

    fn rank_load_balanced(&self, requested: &str, models: Vec<ModelDescriptor>) -> Vec<ModelDescriptor> {
        if models.is_empty() {
            return models;
        }
        let counter = self.round_robin.entry(requested.to_string()).or_insert_with(|| AtomicUsize::new(0));
        let start = counter.fetch_add(1, Ordering::Relaxed) % models.len();
        let mut rotated = models;
        rotated.rotate_left(start);
        rotated
    }

    async fn rank_smart(&self, config: &Config, models: Vec<ModelDescriptor>) -> Vec<ModelDescriptor> {
        let w_cost = config.routing.w_cost;
        let w_lat = config.routing.w_lat;
        let w_qual = config.routing.w_qual;

        let mut scored = Vec::with_capacity(models.len());
        for m in &models {
            let cost = estimated_cost(m, 0);
            let latency = match self.latency.get(&m.id) {
                Some(s) => s.mean().await,
                None => None,
            };
            scored.push((cost, latency, m.quality_score));
        }

        let (min_cost, max_cost) = min_max(scored.iter().map(|(c, _, _)| *c));
        let known_latencies: Vec<f64> = scored.iter().filter_map(|(_, l, _)| *l).collect();
        let (min_lat, max_lat) = min_max(known_latencies.into_iter());
        let (min_qual, max_qual) = min_max(scored.iter().map(|(_, _, q)| *q));

        let mut ranked: Vec<(f64, ModelDescriptor)> = models
            .into_iter()
            .zip(scored)
            .map(|(m, (cost, latency, quality))| {
                let norm_cost = normalize(cost, min_cost, max_cost);
                // Unknown latency (no observations yet) is treated as average, not penalized.
                let norm_lat = latency.map(|l| normalize(l, min_lat, max_lat)).unwrap_or(0.5);
                let norm_qual = normalize(quality, min_qual, max_qual);
                let score = w_cost * norm_cost + w_lat * norm_lat + w_qual * (1.0 - norm_qual);
                (score, m)
            })
            .collect();
        ranked.sort_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        ranked.into_iter().map(|(_, m)| m).collect()
    }

    async fn rank_experimental(&self, config: &Config, models: Vec<ModelDescriptor>) -> Vec<ModelDescriptor> {
        let p = config.routing.experimental_sample_rate.clamp(0.0, 1.0);
        let roll: f64 = rand::thread_rng().gen_range(0.0..1.0);
        if roll < p && !config.routing.experimental_models.is_empty() {
            let experimental: HashSet<&str> = config.routing.experimental_models.iter().map(|s| s.as_str()).collect();
            let mut picked: Vec<ModelDescriptor> = models.iter().filter(|m| experimental.contains(m.id.as_str())).cloned().collect();
            if !picked.is_empty() {
                let rest: Vec<ModelDescriptor> = models.into_iter().filter(|m| !experimental.contains(m.id.as_str())).collect();
                picked.extend(self.rank_smart(config, rest).await);
                return picked;
            }
        }
        self.rank_smart(config, models).await
    }

    fn drop_open_circuits(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        candidates.into_iter().filter(|c| !self.circuits.is_open(&c.provider)).collect()
    }
}

fn rank_by_quality(mut models: Vec<ModelDescriptor>) -> Vec<ModelDescriptor> {
    models.sort_by(|a, b| b.quality_score.partial_cmp(&a.quality_score).unwrap_or(std::cmp::Ordering::Equal));
    models
}

fn estimated_cost(m: &ModelDescriptor, est_prompt_tokens: u32) -> f64 {
    // Completion tokens default to a flat 256 estimate when the caller hasn't supplied
    // maxTokens — matches spec §4.4 step 3's "or default" clause.
    let est_completion_tokens = 256.0;
    let prompt_tokens = if est_prompt_tokens > 0 { est_prompt_tokens as f64 } else { 256.0 };
    m.price_per_1k_prompt * prompt_tokens / 1000.0 + m.price_per_1k_completion * est_completion_tokens / 1000.0
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for v in values {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    if min > max {
        (0.0, 1.0)
    } else {
        (min, max)
    }
}

fn normalize(v: f64, min: f64, max: f64) -> f64 {
    if (max - min).abs() < f64::EPSILON {
        0.5
    } else {
        (v - min) / (max - min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentHint {
    Coding,
    LongContext,
    Vision,
    None,
}

/// Heuristic signal for the `content-based` strategy, derived from the requested model
/// hint string itself (e.g. `hint:coding`, `hint:vision`) since the canonical request body
/// carries no dedicated content-classification field.
fn request_hint(requested: &str) -> ContentHint {
    match requested {
        "hint:coding" => ContentHint::Coding,
        "hint:long-context" => ContentHint::LongContext,
        "hint:vision" => ContentHint::Vision,
        _ => ContentHint::None,
    }
}

fn descriptor(provider: &str, model: &crate::config::ModelConfig) -> ModelDescriptor {
    ModelDescriptor {
        id: crate::model::canonical_id(provider, &model.id),
        display_name: model.display_name.clone().unwrap_or_else(|| model.id.clone()),
        provider: provider.to_string(),
        provider_model_id: model.id.clone(),
        context_window: model.context_window,
        capabilities: crate::model::Capabilities {
            completions: model.completions,
            embeddings: model.embeddings,
            streaming: model.streaming,
            tool_calling: model.tool_calling,
            vision: model.vision,
        },
        price_per_1k_prompt: model.price_per_1k_prompt,
        price_per_1k_completion: model.price_per_1k_completion,
        quality_score: model.quality_score,
        active: model.active,
    }
}

fn append_fallbacks(config: &Config, requested: &str, sequence: &mut Vec<Candidate>) {
    let Some(rule) = config.fallback.rules.get(requested) else { return };
    if !config.fallback.enabled {
        return;
    }
    let mut seen: HashSet<String> = sequence.iter().map(|c| c.canonical_id()).collect();
    for candidate_id in rule {
        if seen.contains(candidate_id) {
            continue;
        }
        if let Some((provider, model)) = candidate_id.split_once('.') {
            sequence.push(Candidate { provider: provider.to_string(), provider_model_id: model.to_string() });
            seen.insert(candidate_id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FallbackConfig, ModelConfig, ProviderConfig, RoutingConfig};
    use std::collections::HashMap;
    use std::sync::RwLock;
    use std::time::Duration;

    fn model(id: &str, prompt_price: f64, completion_price: f64, ctx: u32) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            display_name: None,
            context_window: ctx,
            price_per_1k_prompt: prompt_price,
            price_per_1k_completion: completion_price,
            completions: true,
            embeddings: false,
            streaming: true,
            tool_calling: false,
            vision: false,
            quality_score: 0.5,
            active: true,
        }
    }

    fn test_config(strategy: RoutingStrategy) -> Config {
        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                api_key_env: None,
                base_url: "https://api.openai.test".into(),
                timeout_sec: 30,
                org_id: None,
                models: vec![model("gpt-cheap", 0.001, 0.002, 8_192), model("gpt-expensive", 0.03, 0.06, 128_000)],
            },
        );
        providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                api_key_env: None,
                base_url: "https://api.anthropic.test".into(),
                timeout_sec: 30,
                org_id: None,
                models: vec![model("claude-mid", 0.01, 0.02, 32_000)],
            },
        );
        Config {
            routing: RoutingConfig { strategy, ..Default::default() },
            providers,
            fallback: FallbackConfig::default(),
            ..Default::default()
        }
    }

    fn router_with(config: Config) -> Router {
        let handle: ConfigHandle = Arc::new(RwLock::new(Arc::new(config)));
        let circuits = Arc::new(CircuitRegistry::new(5, Duration::from_secs(30)));
        Router::new(handle, circuits)
    }

    fn completion_request() -> CompletionRequest {
        CompletionRequest {
            model_id: "hint:fast".into(),
            messages: vec![crate::model::Message {
                role: crate::model::Role::User,
                content: Some("hello".into()),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }],
            sampling: Default::default(),
            stream: false,
            tools: None,
            tool_choice: None,
            user_id: None,
            project_id: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn cost_strategy_prefers_cheapest_model() {
        let router = router_with(test_config(RoutingStrategy::Cost));
        let req = completion_request();
        let (candidates, decision) = router.route("hint:fast", &req, None).await.unwrap();
        assert_eq!(candidates[0].provider, "openai");
        assert_eq!(candidates[0].provider_model_id, "gpt-cheap");
        assert_eq!(decision.strategy, "cost");
    }

    #[tokio::test]
    async fn quality_strategy_returns_all_viable_candidates() {
        let router = router_with(test_config(RoutingStrategy::Quality));
        let req = completion_request();
        let (candidates, _) = router.route("hint:fast", &req, None).await.unwrap();
        assert_eq!(candidates.len(), 3);
    }

    #[tokio::test]
    async fn pinned_preference_is_honored_when_capability_satisfied() {
        let router = router_with(test_config(RoutingStrategy::Cost));
        let req = completion_request();
        let (candidates, decision) = router.route("hint:fast", &req, Some("anthropic.claude-mid")).await.unwrap();
        assert_eq!(candidates[0].provider, "anthropic");
        assert_eq!(decision.reason, "pinned-preference");
    }

    #[tokio::test]
    async fn canonical_id_resolves_to_single_candidate() {
        let router = router_with(test_config(RoutingStrategy::Cost));
        let req = completion_request();
        let (candidates, _) = router.route("openai.gpt-expensive", &req, None).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider_model_id, "gpt-expensive");
    }

    #[tokio::test]
    async fn unknown_canonical_id_is_not_viable() {
        let router = router_with(test_config(RoutingStrategy::Cost));
        let req = completion_request();
        let result = router.route("openai.no-such-model", &req, None).await;
        assert!(matches!(result, Err(GatewayError::NoViableModel)));
    }

    #[tokio::test]
    async fn open_circuit_removes_its_provider_from_candidates() {
        let config = test_config(RoutingStrategy::Cost);
        let handle: ConfigHandle = Arc::new(RwLock::new(Arc::new(config)));
        let circuits = Arc::new(CircuitRegistry::new(1, Duration::from_secs(30)));
        circuits.record_failure("openai");
        let router = Router::new(handle, circuits);
        let req = completion_request();
        let (candidates, _) = router.route("hint:fast", &req, None).await.unwrap();
        assert!(candidates.iter().all(|c| c.provider != "openai"));
    }

    #[tokio::test]
    async fn all_providers_open_yields_error() {
        let config = test_config(RoutingStrategy::Cost);
        let handle: ConfigHandle = Arc::new(RwLock::new(Arc::new(config)));
        let circuits = Arc::new(CircuitRegistry::new(1, Duration::from_secs(30)));
        circuits.record_failure("openai");
        circuits.record_failure("anthropic");
        let router = Router::new(handle, circuits);
        let req = completion_request();
        let result = router.route("hint:fast", &req, None).await;
        assert!(matches!(result, Err(GatewayError::AllProvidersOpen)));
    }

    #[tokio::test]
    async fn load_balanced_rotates_across_calls() {
        let router = router_with(test_config(RoutingStrategy::LoadBalanced));
        let req = completion_request();
        let (first, _) = router.route("hint:fast", &req, None).await.unwrap();
        let (second, _) = router.route("hint:fast", &req, None).await.unwrap();
        assert_ne!(first[0].provider_model_id, second[0].provider_model_id);
    }

    #[tokio::test]
    async fn fallback_rule_candidates_are_appended_and_deduplicated() {
        let mut config = test_config(RoutingStrategy::Cost);
        config.fallback.rules.insert("hint:fast".into(), vec!["openai.gpt-cheap".into(), "anthropic.claude-mid".into()]);
        let router = router_with(config);
        let req = completion_request();
        let (candidates, _) = router.route("hint:fast", &req, None).await.unwrap();
        let canonical: Vec<String> = candidates.iter().map(|c| c.canonical_id()).collect();
        let unique: HashSet<&String> = canonical.iter().collect();
        assert_eq!(canonical.len(), unique.len(), "fallback candidates must be deduplicated");
    }

    #[tokio::test]
    async fn latency_strategy_prefers_model_with_lower_recorded_latency() {
        let router = router_with(test_config(RoutingStrategy::Latency));
        router.record_latency("openai.gpt-expensive", 50.0).await;
        router.record_latency("openai.gpt-cheap", 500.0).await;
        let req = completion_request();
        let (candidates, _) = router.route("hint:fast", &req, None).await.unwrap();
        assert_eq!(candidates[0].provider_model_id, "gpt-expensive");
    }

    #[tokio::test]
    async fn content_based_prefers_long_context_model_for_large_prompt() {
        let router = router_with(test_config(RoutingStrategy::ContentBased));
        let mut req = completion_request();
        req.messages[0].content = Some("x".repeat(200_000));
        let (candidates, _) = router.route("hint:long-context", &req, None).await.unwrap();
        assert_eq!(candidates[0].provider_model_id, "gpt-expensive");
    }

    #[tokio::test]
    async fn smart_strategy_returns_ranked_non_empty_sequence() {
        let router = router_with(test_config(RoutingStrategy::Smart));
        let req = completion_request();
        let (candidates, decision) = router.route("hint:fast", &req, None).await.unwrap();
        assert!(!candidates.is_empty());
        assert_eq!(decision.strategy, "smart");
    }

    #[test]
    fn embedding_need_requires_embeddings_capability() {
        let mut m = descriptor(
            "openai",
            &ModelConfig { embeddings: false, ..model("gpt-cheap", 0.001, 0.002, 8_192) },
        );
        let need = CapabilityNeed { embeddings: true, ..Default::default() };
        assert!(!need.satisfied_by(&m));
        m.capabilities.embeddings = true;
        assert!(need.satisfied_by(&m));
    }
}
