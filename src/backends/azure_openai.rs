//! Azure OpenAI adapter.
//!
//! Same request/response JSON shapes as `openai.rs` (reused directly), but routed through
//! Azure's deployment-scoped URL layout and `api-key` header instead of
//! `Authorization: Bearer`.

use std::time::Duration;

use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::openai::{from_openai_response, openai_chunk_to_canonical, to_openai_request};
use super::{classify_status, classify_transport_error, ChunkStream};
use crate::error::GatewayError;
use crate::model::{CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse};
use crate::streaming::{sse_lines, SseLine};

const API_VERSION: &str = "2024-06-01";

pub struct AzureOpenAiAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl AzureOpenAiAdapter {
    pub fn new(base_url: String, timeout_sec: u64, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "api-key",
            header::HeaderValue::from_str(&api_key).expect("Azure OpenAI API key contains invalid header characters"),
        );

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_secs(timeout_sec))
            .build()
            .expect("failed to build reqwest client");
        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build streaming reqwest client");

        Self { client, stream_client, base_url }
    }

    /// Azure addresses a model by its deployment name, not a catalog id; `provider_model_id`
    /// is treated as the deployment name.
    fn completions_url(&self, deployment: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.base_url, deployment, API_VERSION
        )
    }

    fn embeddings_url(&self, deployment: &str) -> String {
        format!("{}/openai/deployments/{}/embeddings?api-version={}", self.base_url, deployment, API_VERSION)
    }

    pub async fn create_completion(
        &self,
        request: &CompletionRequest,
        provider_model_id: &str,
    ) -> Result<CompletionResponse, GatewayError> {
        let body = to_openai_request(request, provider_model_id);
        let url = self.completions_url(provider_model_id);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("azure-openai", &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("azure-openai: reading body: {e}")))?;
        if !status.is_success() {
            return Err(classify_status("azure-openai", status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::ProviderBadRequest(format!("azure-openai: invalid JSON response: {e}")))?;
        from_openai_response(value, "azure-openai")
    }

    pub async fn create_completion_stream(
        &self,
        request: &CompletionRequest,
        provider_model_id: &str,
    ) -> Result<ChunkStream, GatewayError> {
        let mut body = to_openai_request(request, provider_model_id);
        body["stream"] = json!(true);
        let url = self.completions_url(provider_model_id);
        let response = self
            .stream_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("azure-openai", &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("azure-openai", status, &text));
        }

        let stream = sse_lines(response.bytes_stream()).filter_map(move |line| async move {
            match line {
                Ok(SseLine::Data(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(v) => openai_chunk_to_canonical(v, "azure-openai").map(Ok),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed Azure OpenAI SSE chunk");
                        None
                    }
                },
                Ok(SseLine::Done) => None,
                Err(e) => Some(Err(GatewayError::Transient(e.to_string()))),
            }
        });
        Ok(Box::pin(stream))
    }

    pub async fn create_embedding(
        &self,
        request: &EmbeddingRequest,
        provider_model_id: &str,
    ) -> Result<EmbeddingResponse, GatewayError> {
        let url = self.embeddings_url(provider_model_id);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "input": request.input }))
            .send()
            .await
            .map_err(|e| classify_transport_error("azure-openai", &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("azure-openai: reading body: {e}")))?;
        if !status.is_success() {
            return Err(classify_status("azure-openai", status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::ProviderBadRequest(format!("azure-openai: invalid JSON response: {e}")))?;

        let vectors: Vec<Vec<f32>> = value["data"]
            .as_array()
            .ok_or_else(|| GatewayError::ProviderBadRequest("azure-openai: response missing `data`".into()))?
            .iter()
            .map(|d| d["embedding"].as_array().map(|a| a.iter().filter_map(|n| n.as_f64()).map(|f| f as f32).collect()).unwrap_or_default())
            .collect();

        Ok(EmbeddingResponse {
            model: provider_model_id.to_string(),
            provider: "azure-openai".to_string(),
            vectors,
            prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/openai/models?api-version={}", self.base_url, API_VERSION);
        let response = self.client.get(&url).send().await?;
        anyhow::ensure!(response.status().is_success(), "Azure OpenAI health check returned HTTP {}", response.status());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_url_includes_deployment_and_api_version() {
        let adapter = AzureOpenAiAdapter::new("https://my-resource.openai.azure.com".into(), 5, "key".into());
        let url = adapter.completions_url("gpt-4-deployment");
        assert!(url.contains("/openai/deployments/gpt-4-deployment/chat/completions"));
        assert!(url.contains(API_VERSION));
    }
}
