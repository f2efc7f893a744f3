//! Backend client factory and unified dispatch interface.
//!
//! [`BackendClient`] is an enum that wraps a concrete provider adapter chosen
//! at construction time from the provider name under `[providers.<name>]`. All
//! routing/dispatch code interacts with the same capability surface (spec §4.3:
//! `ListModels`, `GetModel`, `CreateCompletion`, `CreateCompletionStream`,
//! `CreateEmbedding`, `IsAvailable`); adapter-specific protocol differences —
//! schema translation, auth headers, endpoint paths — are fully encapsulated in
//! the adapter modules. `ListModels`/`GetModel` are served from the operator's
//! static config (`Config::all_models`/`resolve_model`) rather than a live vendor
//! call — this gateway's catalog is configured, not discovered.

mod anthropic;
mod azure_openai;
mod cohere;
mod huggingface;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use azure_openai::AzureOpenAiAdapter;
pub use cohere::CohereAdapter;
pub use huggingface::HuggingFaceAdapter;
pub use openai::OpenAIAdapter;

use std::pin::Pin;

use futures_util::Stream;

use crate::config::ProviderConfig;
use crate::error::GatewayError;
use crate::model::{CompletionChunk, CompletionRequest, EmbeddingRequest, EmbeddingResponse};

/// A `Send`-able, heap-allocated stream of canonical completion chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk, GatewayError>> + Send>>;

/// Unified backend client — enum dispatch over concrete provider adapters.
pub enum BackendClient {
    OpenAI(OpenAIAdapter),
    Anthropic(AnthropicAdapter),
    Cohere(CohereAdapter),
    HuggingFace(HuggingFaceAdapter),
    AzureOpenAi(AzureOpenAiAdapter),
}

impl BackendClient {
    /// Build a backend client for `provider_name` (the `[providers.<name>]` key) from its
    /// config. The provider name selects the wire dialect; unrecognized names fall back to
    /// the OpenAI-compatible adapter (many self-hosted/gateway backends speak it).
    pub fn new(provider_name: &str, cfg: &ProviderConfig) -> anyhow::Result<Self> {
        let base_url = cfg.base_url.trim_end_matches('/').to_string();
        let api_key = cfg.api_key();

        Ok(match provider_name {
            "anthropic" => {
                let key = api_key.ok_or_else(|| {
                    anyhow::anyhow!(
                        "anthropic backend requires an API key; set `{}`",
                        cfg.api_key_env.as_deref().unwrap_or("<unset>")
                    )
                })?;
                Self::Anthropic(AnthropicAdapter::new(base_url, cfg.timeout_sec, key))
            }
            "cohere" => {
                let key = api_key.ok_or_else(|| {
                    anyhow::anyhow!(
                        "cohere backend requires an API key; set `{}`",
                        cfg.api_key_env.as_deref().unwrap_or("<unset>")
                    )
                })?;
                Self::Cohere(CohereAdapter::new(base_url, cfg.timeout_sec, key))
            }
            "huggingface" => {
                let key = api_key.ok_or_else(|| {
                    anyhow::anyhow!(
                        "huggingface backend requires an API key; set `{}`",
                        cfg.api_key_env.as_deref().unwrap_or("<unset>")
                    )
                })?;
                Self::HuggingFace(HuggingFaceAdapter::new(base_url, cfg.timeout_sec, key))
            }
            "azure-openai" | "azure_openai" => {
                let key = api_key.ok_or_else(|| {
                    anyhow::anyhow!(
                        "azure-openai backend requires an API key; set `{}`",
                        cfg.api_key_env.as_deref().unwrap_or("<unset>")
                    )
                })?;
                Self::AzureOpenAi(AzureOpenAiAdapter::new(base_url, cfg.timeout_sec, key))
            }
            _ => Self::OpenAI(OpenAIAdapter::with_provider_name(provider_name, base_url, cfg.timeout_sec, api_key)),
        })
    }

    pub async fn create_completion(
        &self,
        request: &CompletionRequest,
        provider_model_id: &str,
    ) -> Result<crate::model::CompletionResponse, GatewayError> {
        match self {
            Self::OpenAI(a) => a.create_completion(request, provider_model_id).await,
            Self::Anthropic(a) => a.create_completion(request, provider_model_id).await,
            Self::Cohere(a) => a.create_completion(request, provider_model_id).await,
            Self::HuggingFace(a) => a.create_completion(request, provider_model_id).await,
            Self::AzureOpenAi(a) => a.create_completion(request, provider_model_id).await,
        }
    }

    pub async fn create_completion_stream(
        &self,
        request: &CompletionRequest,
        provider_model_id: &str,
    ) -> Result<ChunkStream, GatewayError> {
        match self {
            Self::OpenAI(a) => a.create_completion_stream(request, provider_model_id).await,
            Self::Anthropic(a) => a.create_completion_stream(request, provider_model_id).await,
            Self::Cohere(a) => a.create_completion_stream(request, provider_model_id).await,
            Self::HuggingFace(a) => a.create_completion_stream(request, provider_model_id).await,
            Self::AzureOpenAi(a) => a.create_completion_stream(request, provider_model_id).await,
        }
    }

    pub async fn create_embedding(
        &self,
        request: &EmbeddingRequest,
        provider_model_id: &str,
    ) -> Result<EmbeddingResponse, GatewayError> {
        match self {
            Self::OpenAI(a) => a.create_embedding(request, provider_model_id).await,
            Self::Anthropic(_) => Err(GatewayError::ProviderBadRequest(
                "anthropic does not support embeddings".into(),
            )),
            Self::Cohere(a) => a.create_embedding(request, provider_model_id).await,
            Self::HuggingFace(a) => a.create_embedding(request, provider_model_id).await,
            Self::AzureOpenAi(a) => a.create_embedding(request, provider_model_id).await,
        }
    }

    pub async fn is_available(&self) -> bool {
        let result = match self {
            Self::OpenAI(a) => a.health_check().await,
            Self::Anthropic(a) => a.health_check().await,
            Self::Cohere(a) => a.health_check().await,
            Self::HuggingFace(a) => a.health_check().await,
            Self::AzureOpenAi(a) => a.health_check().await,
        };
        result.is_ok()
    }
}

/// Classify an HTTP response status into a [`GatewayError`] (spec §4.3: "On HTTP error,
/// read body (truncated) and raise `ProviderError{status, vendor, message}`" — here refined
/// into the dispatcher's retry/fallback classes from spec §7).
pub(crate) fn classify_status(vendor: &str, status: reqwest::StatusCode, body: &str) -> GatewayError {
    let truncated: String = body.chars().take(500).collect();
    match status.as_u16() {
        401 | 403 => GatewayError::ProviderAuth(format!("{vendor}: HTTP {status}: {truncated}")),
        404 => GatewayError::NoSuchModel(format!("{vendor}: HTTP {status}: {truncated}")),
        408 | 429 => GatewayError::Transient(format!("{vendor}: HTTP {status}: {truncated}")),
        501 => GatewayError::ProviderBadRequest(format!("{vendor}: HTTP {status}: {truncated}")),
        s if (500..600).contains(&s) => {
            GatewayError::Transient(format!("{vendor}: HTTP {status}: {truncated}"))
        }
        _ => GatewayError::ProviderBadRequest(format!("{vendor}: HTTP {status}: {truncated}")),
    }
}

/// Classify a transport-level (connect/timeout/body-read) reqwest error — always transient
/// (spec §4.2 step 3: "network I/O ... are transient classes").
pub(crate) fn classify_transport_error(vendor: &str, err: &reqwest::Error) -> GatewayError {
    GatewayError::Transient(format!("{vendor}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_maps_auth_errors() {
        let e = classify_status("openai", reqwest::StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(e, GatewayError::ProviderAuth(_)));
        assert!(!e.fallback_eligible());
    }

    #[test]
    fn classify_status_maps_429_to_transient() {
        let e = classify_status("openai", reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(e, GatewayError::Transient(_)));
        assert!(e.retryable());
    }

    #[test]
    fn classify_status_maps_501_to_bad_request_not_transient() {
        let e = classify_status("openai", reqwest::StatusCode::NOT_IMPLEMENTED, "nope");
        assert!(matches!(e, GatewayError::ProviderBadRequest(_)));
        assert!(!e.retryable());
    }

    #[test]
    fn classify_status_maps_404_to_no_such_model() {
        let e = classify_status("openai", reqwest::StatusCode::NOT_FOUND, "missing");
        assert!(matches!(e, GatewayError::NoSuchModel(_)));
        assert!(e.fallback_eligible());
    }

    #[test]
    fn classify_status_truncates_long_bodies() {
        let long_body = "x".repeat(10_000);
        let e = classify_status("openai", reqwest::StatusCode::BAD_REQUEST, &long_body);
        assert!(e.to_string().len() < 1000);
    }

    #[test]
    fn new_falls_back_to_openai_adapter_for_unknown_provider_name() {
        let cfg = ProviderConfig {
            api_key_env: None,
            base_url: "http://localhost:11434".into(),
            timeout_sec: 5,
            org_id: None,
            models: Vec::new(),
        };
        assert!(BackendClient::new("local-vllm", &cfg).is_ok());
    }

    #[test]
    fn new_requires_api_key_for_anthropic() {
        let cfg = ProviderConfig {
            api_key_env: None,
            base_url: "https://api.anthropic.com".into(),
            timeout_sec: 5,
            org_id: None,
            models: Vec::new(),
        };
        assert!(BackendClient::new("anthropic", &cfg).is_err());
    }
}
