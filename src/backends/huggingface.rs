//! HuggingFace Inference adapter.
//!
//! Chat completions go through HuggingFace's OpenAI-compatible router
//! (`/v1/chat/completions`), so this adapter reuses `openai`'s translation functions
//! directly. Embeddings use the classic feature-extraction pipeline endpoint
//! (`/models/{id}`), which returns nested float arrays with no wrapping envelope.

use std::time::Duration;

use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::openai::{from_openai_response, openai_chunk_to_canonical, to_openai_request};
use super::{classify_status, classify_transport_error, ChunkStream};
use crate::error::GatewayError;
use crate::model::{CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse};
use crate::streaming::{sse_lines, SseLine};

pub struct HuggingFaceAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl HuggingFaceAdapter {
    pub fn new(base_url: String, timeout_sec: u64, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();
        let value = format!("Bearer {api_key}");
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&value).expect("HuggingFace API key contains invalid header characters"),
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

    pub async fn create_completion(
        &self,
        request: &CompletionRequest,
        provider_model_id: &str,
    ) -> Result<CompletionResponse, GatewayError> {
        let body = to_openai_request(request, provider_model_id);
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("huggingface", &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("huggingface: reading body: {e}")))?;
        if !status.is_success() {
            return Err(classify_status("huggingface", status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::ProviderBadRequest(format!("huggingface: invalid JSON response: {e}")))?;
        from_openai_response(value, "huggingface")
    }

    pub async fn create_completion_stream(
        &self,
        request: &CompletionRequest,
        provider_model_id: &str,
    ) -> Result<ChunkStream, GatewayError> {
        let mut body = to_openai_request(request, provider_model_id);
        body["stream"] = json!(true);
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("huggingface", &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("huggingface", status, &text));
        }

        let stream = sse_lines(response.bytes_stream()).filter_map(move |line| async move {
            match line {
                Ok(SseLine::Data(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(v) => openai_chunk_to_canonical(v, "huggingface").map(Ok),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed HuggingFace SSE chunk");
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
        let url = format!("{}/models/{}", self.base_url, provider_model_id);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "inputs": request.input }))
            .send()
            .await
            .map_err(|e| classify_transport_error("huggingface", &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("huggingface: reading body: {e}")))?;
        if !status.is_success() {
            return Err(classify_status("huggingface", status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::ProviderBadRequest(format!("huggingface: invalid JSON response: {e}")))?;

        let vectors: Vec<Vec<f32>> = value
            .as_array()
            .ok_or_else(|| GatewayError::ProviderBadRequest("huggingface: expected a JSON array response".into()))?
            .iter()
            .map(|row| row.as_array().map(|a| a.iter().filter_map(|n| n.as_f64()).map(|f| f as f32).collect()).unwrap_or_default())
            .collect();

        Ok(EmbeddingResponse {
            model: provider_model_id.to_string(),
            provider: "huggingface".to_string(),
            vectors,
            // The feature-extraction pipeline reports no usage numbers; the cost pipeline's
            // tokenizer fallback fills this in and marks the record estimated.
            prompt_tokens: 0,
        })
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.client.get(&url).send().await?;
        anyhow::ensure!(response.status().is_success(), "HuggingFace health check returned HTTP {}", response.status());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn create_embedding_parses_nested_float_arrays() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/sentence-transformers/all-MiniLM-L6-v2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([[0.1, 0.2], [0.3, 0.4]])))
            .mount(&server)
            .await;

        let adapter = HuggingFaceAdapter::new(server.uri(), 5, "hf_test".into());
        let req = EmbeddingRequest {
            model_id: "huggingface.sentence-transformers/all-MiniLM-L6-v2".into(),
            input: vec!["a".into(), "b".into()],
            user_id: None,
        };
        let resp = adapter.create_embedding(&req, "sentence-transformers/all-MiniLM-L6-v2").await.unwrap();
        assert_eq!(resp.vectors.len(), 2);
        assert_eq!(resp.vectors[0], vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn create_embedding_errors_on_non_array_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/bad-model"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "error": "model loading" })))
            .mount(&server)
            .await;

        let adapter = HuggingFaceAdapter::new(server.uri(), 5, "hf_test".into());
        let req = EmbeddingRequest { model_id: "huggingface.bad-model".into(), input: vec!["a".into()], user_id: None };
        assert!(adapter.create_embedding(&req, "bad-model").await.is_err());
    }
}
