//! Dispatcher (spec §4.2): walks a router-produced candidate sequence, does admission and
//! circuit checks, retries transient failures, and falls back to the next candidate on
//! fallback-eligible errors. Streaming bypasses fallback once the first chunk has been
//! observed by the caller — a partially-delivered response can never be retried invisibly.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::{
    backends::{BackendClient, ChunkStream},
    circuit::CircuitRegistry,
    config::{current, ConfigHandle, FilterDirection as ConfigFilterDirection},
    content_filter::{ContentFilter, FilterDirection},
    cost::CostPipeline,
    error::GatewayError,
    model::{Candidate, CompletionChunk, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, RequestType},
    rate_limit::{Admission, RateLimiter},
    router::Router,
    tokenizer::TokenizerPort,
};

pub struct Dispatcher {
    config: ConfigHandle,
    circuits: Arc<CircuitRegistry>,
    rate_limiter: Arc<RateLimiter>,
    router: Arc<Router>,
    cost: Arc<CostPipeline>,
    tokenizer: Arc<dyn TokenizerPort>,
    content_filter: Arc<dyn ContentFilter>,
}

impl Dispatcher {
    pub fn new(
        config: ConfigHandle,
        circuits: Arc<CircuitRegistry>,
        rate_limiter: Arc<RateLimiter>,
        router: Arc<Router>,
        cost: Arc<CostPipeline>,
        tokenizer: Arc<dyn TokenizerPort>,
        content_filter: Arc<dyn ContentFilter>,
    ) -> Self {
        Self { config, circuits, rate_limiter, router, cost, tokenizer, content_filter }
    }

    /// `Dispatch(request, candidateSequence) -> response` for non-streaming completions.
    pub async fn dispatch(
        &self,
        api_key: &str,
        user_id: Option<&str>,
        request_id: &str,
        request: &CompletionRequest,
        candidates: &[Candidate],
    ) -> Result<CompletionResponse, GatewayError> {
        let config = current(&self.config);
        let deadline = Instant::now() + Duration::from_secs(config.deadlines.non_stream_sec);
        let max_depth = config.fallback.max_depth;

        let mut last_err = GatewayError::NoViableModel;
        for (depth, candidate) in candidates.iter().enumerate() {
            if depth as u32 > max_depth {
                break;
            }

            match self.rate_limiter.try_acquire(api_key).await {
                Admission::Allowed => {}
                Admission::Denied { retry_after_secs } => {
                    return Err(GatewayError::RateLimitExceeded { retry_after_secs })
                }
                Admission::QueueFull => return Err(GatewayError::RateLimitExceeded { retry_after_secs: 1 }),
            }

            if self.circuits.is_open(&candidate.provider) {
                last_err = GatewayError::Transient(format!("{}: circuit open", candidate.provider));
                continue;
            }

            let Some(provider_cfg) = config.providers.get(&candidate.provider) else {
                last_err = GatewayError::NoSuchModel(candidate.canonical_id());
                continue;
            };
            let client = match BackendClient::new(&candidate.provider, provider_cfg) {
                Ok(c) => c,
                Err(e) => {
                    last_err = GatewayError::Internal(e.to_string());
                    continue;
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::Transient("request deadline exceeded".into()));
            }

            match self.attempt_completion_with_retry(&client, request, candidate, remaining, &config).await {
                Ok((response, latency_ms)) => {
                    self.circuits.record_success(&candidate.provider);
                    self.router.record_latency(&candidate.canonical_id(), latency_ms as f64).await;
                    self.record_completion_usage(request_id, user_id, api_key, candidate, request, &response);
                    return Ok(response);
                }
                Err(e) => {
                    self.circuits.record_failure(&candidate.provider);
                    let can_fall_back = e.fallback_eligible() && (depth as u32) < max_depth;
                    last_err = e;
                    if !can_fall_back {
                        return Err(last_err);
                    }
                    warn!(provider = %candidate.provider, error = %last_err, "falling back to next candidate");
                }
            }
        }
        Err(GatewayError::AllCandidatesExhausted(last_err.to_string()))
    }

    /// `Dispatch` for embeddings — same admission/circuit/retry/fallback shape, no streaming.
    pub async fn dispatch_embedding(
        &self,
        api_key: &str,
        user_id: Option<&str>,
        request_id: &str,
        request: &EmbeddingRequest,
        candidates: &[Candidate],
    ) -> Result<EmbeddingResponse, GatewayError> {
        let config = current(&self.config);
        let deadline = Instant::now() + Duration::from_secs(config.deadlines.non_stream_sec);
        let max_depth = config.fallback.max_depth;

        let mut last_err = GatewayError::NoViableModel;
        for (depth, candidate) in candidates.iter().enumerate() {
            if depth as u32 > max_depth {
                break;
            }
            match self.rate_limiter.try_acquire(api_key).await {
                Admission::Allowed => {}
                Admission::Denied { retry_after_secs } => {
                    return Err(GatewayError::RateLimitExceeded { retry_after_secs })
                }
                Admission::QueueFull => return Err(GatewayError::RateLimitExceeded { retry_after_secs: 1 }),
            }
            if self.circuits.is_open(&candidate.provider) {
                last_err = GatewayError::Transient(format!("{}: circuit open", candidate.provider));
                continue;
            }
            let Some(provider_cfg) = config.providers.get(&candidate.provider) else {
                last_err = GatewayError::NoSuchModel(candidate.canonical_id());
                continue;
            };
            let client = match BackendClient::new(&candidate.provider, provider_cfg) {
                Ok(c) => c,
                Err(e) => {
                    last_err = GatewayError::Internal(e.to_string());
                    continue;
                }
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::Transient("request deadline exceeded".into()));
            }

            let attempt_deadline = Instant::now() + remaining;
            let mut attempt = 0u32;
            let outcome = loop {
                let left = attempt_deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break Err(GatewayError::Transient(format!("{}: deadline exceeded", candidate.provider)));
                }
                let t0 = Instant::now();
                match tokio::time::timeout(left, client.create_embedding(request, &candidate.provider_model_id)).await {
                    Ok(Ok(resp)) => break Ok((resp, t0.elapsed().as_millis() as u64)),
                    Ok(Err(e)) if e.retryable() && attempt < config.resilience.max_retries => {
                        attempt += 1;
                        let backoff = Duration::from_secs(config.resilience.base_backoff_sec) * 2u32.pow(attempt);
                        tokio::time::sleep(backoff.min(attempt_deadline.saturating_duration_since(Instant::now()))).await;
                    }
                    Ok(Err(e)) => break Err(e),
                    Err(_) => break Err(GatewayError::Transient(format!("{}: attempt timed out", candidate.provider))),
                }
            };

            match outcome {
                Ok((response, latency_ms)) => {
                    self.circuits.record_success(&candidate.provider);
                    self.router.record_latency(&candidate.canonical_id(), latency_ms as f64).await;
                    let prompt_text = request.input.join("\n");
                    let (prompt_tokens, estimated) = if response.prompt_tokens > 0 {
                        (response.prompt_tokens, false)
                    } else {
                        let count = self.tokenizer.count_tokens(&candidate.provider, &candidate.provider_model_id, &prompt_text);
                        (count.tokens, count.estimated)
                    };
                    self.cost.record(
                        request_id,
                        user_id,
                        Some(api_key),
                        &candidate.canonical_id(),
                        &candidate.provider,
                        RequestType::Embedding,
                        prompt_tokens,
                        0,
                        estimated,
                    );
                    return Ok(response);
                }
                Err(e) => {
                    self.circuits.record_failure(&candidate.provider);
                    let can_fall_back = e.fallback_eligible() && (depth as u32) < max_depth;
                    last_err = e;
                    if !can_fall_back {
                        return Err(last_err);
                    }
                    warn!(provider = %candidate.provider, error = %last_err, "falling back to next candidate");
                }
            }
        }
        Err(GatewayError::AllCandidatesExhausted(last_err.to_string()))
    }

    /// `DispatchStream(request, candidateSequence) -> chunk sequence`. Runs on a background
    /// task so the returned stream can forward chunks the moment they arrive, without the
    /// caller driving candidate selection. Once a candidate's stream has yielded at least one
    /// chunk, a mid-stream failure is surfaced as-is — no further candidates are tried.
    pub fn dispatch_stream(
        self: Arc<Self>,
        api_key: String,
        user_id: Option<String>,
        request_id: String,
        request: CompletionRequest,
        candidates: Vec<Candidate>,
    ) -> ChunkStream {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<CompletionChunk, GatewayError>>(8);
        tokio::spawn(async move {
            self.drive_stream(api_key, user_id, request_id, request, candidates, tx).await;
        });
        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }))
    }

    async fn drive_stream(
        &self,
        api_key: String,
        user_id: Option<String>,
        request_id: String,
        request: CompletionRequest,
        candidates: Vec<Candidate>,
        tx: tokio::sync::mpsc::Sender<Result<CompletionChunk, GatewayError>>,
    ) {
        use futures_util::StreamExt as _;

        let config = current(&self.config);
        let deadline = Instant::now() + Duration::from_secs(config.deadlines.stream_sec);
        let max_depth = config.fallback.max_depth;

        let mut last_err = GatewayError::NoViableModel;
        for (depth, candidate) in candidates.iter().enumerate() {
            if depth as u32 > max_depth {
                break;
            }
            match self.rate_limiter.try_acquire(&api_key).await {
                Admission::Allowed => {}
                Admission::Denied { retry_after_secs } => {
                    let _ = tx.send(Err(GatewayError::RateLimitExceeded { retry_after_secs })).await;
                    return;
                }
                Admission::QueueFull => {
                    let _ = tx.send(Err(GatewayError::RateLimitExceeded { retry_after_secs: 1 })).await;
                    return;
                }
            }
            if self.circuits.is_open(&candidate.provider) {
                last_err = GatewayError::Transient(format!("{}: circuit open", candidate.provider));
                continue;
            }
            let Some(provider_cfg) = config.providers.get(&candidate.provider) else {
                last_err = GatewayError::NoSuchModel(candidate.canonical_id());
                continue;
            };
            let client = match BackendClient::new(&candidate.provider, provider_cfg) {
                Ok(c) => c,
                Err(e) => {
                    last_err = GatewayError::Internal(e.to_string());
                    continue;
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = tx.send(Err(GatewayError::Transient("request deadline exceeded".into()))).await;
                return;
            }

            let connect = tokio::time::timeout(remaining, client.create_completion_stream(&request, &candidate.provider_model_id)).await;
            let mut stream = match connect {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    self.circuits.record_failure(&candidate.provider);
                    last_err = e;
                    if last_err.fallback_eligible() && (depth as u32) < max_depth {
                        warn!(provider = %candidate.provider, error = %last_err, "stream connect failed, falling back");
                        continue;
                    }
                    let _ = tx.send(Err(last_err)).await;
                    return;
                }
                Err(_) => {
                    self.circuits.record_failure(&candidate.provider);
                    last_err = GatewayError::Transient(format!("{}: stream connect timed out", candidate.provider));
                    if (depth as u32) < max_depth {
                        continue;
                    }
                    let _ = tx.send(Err(last_err)).await;
                    return;
                }
            };

            // The stream handshake succeeded — this candidate is committed. No fallback past
            // this point (spec §4.2: partial output already observed).
            self.circuits.record_success(&candidate.provider);

            let mut completion_text = String::new();
            let mut observed_any = false;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        observed_any = true;
                        for choice in &chunk.choices {
                            if let Some(content) = &choice.delta.content {
                                completion_text.push_str(content);
                            }
                        }
                        if tx.send(Ok(chunk)).await.is_err() {
                            return; // caller dropped the stream
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }

            if observed_any {
                if config.content_filter.enabled
                    && config.content_filter.directions.contains(&ConfigFilterDirection::Completion)
                {
                    let result = self.content_filter.check(&completion_text, FilterDirection::Completion).await;
                    if !result.allowed {
                        let _ = tx
                            .send(Err(GatewayError::ContentBlocked(
                                result.reason.unwrap_or_else(|| "completion blocked".into()),
                            )))
                            .await;
                        return;
                    }
                }

                let prompt_text = request.joined_text();
                let prompt_count = self.tokenizer.count_tokens(&candidate.provider, &candidate.provider_model_id, &prompt_text);
                let completion_count = self.tokenizer.count_tokens(&candidate.provider, &candidate.provider_model_id, &completion_text);
                self.cost.record(
                    &request_id,
                    user_id.as_deref(),
                    Some(&api_key),
                    &candidate.canonical_id(),
                    &candidate.provider,
                    RequestType::Stream,
                    prompt_count.tokens,
                    completion_count.tokens,
                    true,
                );
            }
            return;
        }
        let _ = tx.send(Err(GatewayError::AllCandidatesExhausted(last_err.to_string()))).await;
    }

    async fn attempt_completion_with_retry(
        &self,
        client: &BackendClient,
        request: &CompletionRequest,
        candidate: &Candidate,
        remaining_deadline: Duration,
        config: &crate::config::Config,
    ) -> Result<(CompletionResponse, u64), GatewayError> {
        let deadline = Instant::now() + remaining_deadline;
        let mut attempt = 0u32;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(GatewayError::Transient(format!("{}: deadline exceeded", candidate.provider)));
            }
            let t0 = Instant::now();
            match tokio::time::timeout(left, client.create_completion(request, &candidate.provider_model_id)).await {
                Ok(Ok(response)) => return Ok((response, t0.elapsed().as_millis() as u64)),
                Ok(Err(e)) if e.retryable() && attempt < config.resilience.max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_secs(config.resilience.base_backoff_sec) * 2u32.pow(attempt);
                    tokio::time::sleep(backoff.min(deadline.saturating_duration_since(Instant::now()))).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(GatewayError::Transient(format!("{}: attempt timed out", candidate.provider))),
            }
        }
    }

    fn record_completion_usage(
        &self,
        request_id: &str,
        user_id: Option<&str>,
        api_key: &str,
        candidate: &Candidate,
        request: &CompletionRequest,
        response: &CompletionResponse,
    ) {
        let (prompt_tokens, prompt_estimated) = if response.usage.prompt_tokens > 0 {
            (response.usage.prompt_tokens, false)
        } else {
            let count = self.tokenizer.count_tokens(&candidate.provider, &candidate.provider_model_id, &request.joined_text());
            (count.tokens, count.estimated)
        };
        let (completion_tokens, completion_estimated) = if response.usage.completion_tokens > 0 {
            (response.usage.completion_tokens, false)
        } else {
            let text: String =
                response.choices.iter().filter_map(|c| c.message.content.as_deref()).collect::<Vec<_>>().join("\n");
            let count = self.tokenizer.count_tokens(&candidate.provider, &candidate.provider_model_id, &text);
            (count.tokens, count.estimated)
        };
        self.cost.record(
            request_id,
            user_id,
            Some(api_key),
            &candidate.canonical_id(),
            &candidate.provider,
            RequestType::Completion,
            prompt_tokens,
            completion_tokens,
            prompt_estimated || completion_estimated,
        );
    }
}
