//! Cohere Chat + Embed API adapter.
//!
//! Cohere's chat wire shape differs from the OpenAI family: the latest turn is a bare
//! `message` string, prior turns are `chat_history` with `USER`/`CHATBOT`/`SYSTEM` roles,
//! and streaming responses are newline-delimited JSON objects (no `data:` SSE framing), so
//! this adapter parses its own line stream rather than reusing `streaming::sse_lines`.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt as _};
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{classify_status, classify_transport_error, ChunkStream};
use crate::error::GatewayError;
use crate::model::{
    Choice, ChunkChoice, CompletionChunk, CompletionRequest, CompletionResponse, Delta,
    EmbeddingRequest, EmbeddingResponse, FinishReason, Message, Role, TokenUsage,
};

pub struct CohereAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl CohereAdapter {
    pub fn new(base_url: String, timeout_sec: u64, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();
        let value = format!("Bearer {api_key}");
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&value).expect("Cohere API key contains invalid header characters"),
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
        let body = to_cohere_request(request, provider_model_id, false);
        let url = format!("{}/v1/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("cohere", &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("cohere: reading body: {e}")))?;
        if !status.is_success() {
            return Err(classify_status("cohere", status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::ProviderBadRequest(format!("cohere: invalid JSON response: {e}")))?;
        from_cohere_response(value, provider_model_id)
    }

    pub async fn create_completion_stream(
        &self,
        request: &CompletionRequest,
        provider_model_id: &str,
    ) -> Result<ChunkStream, GatewayError> {
        let body = to_cohere_request(request, provider_model_id, true);
        let url = format!("{}/v1/chat", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("cohere", &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("cohere", status, &text));
        }

        let model_id = provider_model_id.to_string();
        let stream = ndjson_lines(response.bytes_stream()).filter_map(move |line| {
            let model_id = model_id.clone();
            async move {
                match line {
                    Ok(text) => match serde_json::from_str::<Value>(&text) {
                        Ok(v) => cohere_event_to_chunk(v, &model_id).map(Ok),
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed Cohere stream line");
                            None
                        }
                    },
                    Err(e) => Some(Err(GatewayError::Transient(e.to_string()))),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    pub async fn create_embedding(
        &self,
        request: &EmbeddingRequest,
        provider_model_id: &str,
    ) -> Result<EmbeddingResponse, GatewayError> {
        let body = json!({
            "model": provider_model_id,
            "texts": request.input,
            "input_type": "search_document",
        });
        let url = format!("{}/v1/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("cohere", &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("cohere: reading body: {e}")))?;
        if !status.is_success() {
            return Err(classify_status("cohere", status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::ProviderBadRequest(format!("cohere: invalid JSON response: {e}")))?;

        let vectors: Vec<Vec<f32>> = value["embeddings"]
            .as_array()
            .ok_or_else(|| GatewayError::ProviderBadRequest("cohere: response missing `embeddings`".into()))?
            .iter()
            .map(|row| row.as_array().map(|a| a.iter().filter_map(|n| n.as_f64()).map(|f| f as f32).collect()).unwrap_or_default())
            .collect();

        Ok(EmbeddingResponse {
            model: provider_model_id.to_string(),
            provider: "cohere".to_string(),
            vectors,
            prompt_tokens: value["meta"]["billed_units"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.client.get(&url).send().await?;
        anyhow::ensure!(response.status().is_success(), "Cohere health check returned HTTP {}", response.status());
        Ok(())
    }
}

/// Split a raw byte stream into newline-delimited JSON text lines (Cohere's streaming wire
/// format has no `data:` framing, unlike the SSE vendors in `streaming.rs`).
fn ndjson_lines(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = anyhow::Result<String>> + Send {
    let mut buffer = String::new();
    byte_stream
        .map(move |chunk| match chunk {
            Ok(bytes) => match std::str::from_utf8(&bytes) {
                Ok(s) => {
                    buffer.push_str(s);
                    let mut lines = Vec::new();
                    while let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim().to_string();
                        buffer.drain(..=pos);
                        if !line.is_empty() {
                            lines.push(line);
                        }
                    }
                    Ok(lines)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping non-UTF8 Cohere stream chunk");
                    Ok(Vec::new())
                }
            },
            Err(e) => Err(anyhow::anyhow!(e)),
        })
        .flat_map(|result| {
            futures_util::stream::iter(match result {
                Ok(lines) => lines.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            })
        })
}

// ──────────────────────────────────────────────────────────────────────────────
// Schema translation
// ──────────────────────────────────────────────────────────────────────────────

pub(crate) fn to_cohere_request(request: &CompletionRequest, provider_model_id: &str, stream: bool) -> Value {
    let (history, last) = request.messages.split_at(request.messages.len().saturating_sub(1));
    let chat_history: Vec<Value> = history
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "SYSTEM",
                Role::Assistant => "CHATBOT",
                Role::User | Role::Tool => "USER",
            };
            json!({ "role": role, "message": m.content.clone().unwrap_or_default() })
        })
        .collect();

    let mut body = json!({
        "model": provider_model_id,
        "message": last.first().and_then(|m| m.content.clone()).unwrap_or_default(),
        "chat_history": chat_history,
        "stream": stream,
    });

    if let Some(max_tokens) = request.sampling.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temp) = request.sampling.temperature {
        body["temperature"] = json!(temp);
    }
    if let Some(p) = request.sampling.top_p {
        body["p"] = json!(p);
    }

    body
}

pub(crate) fn from_cohere_response(resp: Value, model_id: &str) -> Result<CompletionResponse, GatewayError> {
    let text = resp["text"]
        .as_str()
        .ok_or_else(|| GatewayError::ProviderBadRequest("cohere: response missing `text`".into()))?
        .to_string();

    let finish_reason = match resp["finish_reason"].as_str().unwrap_or("COMPLETE") {
        "MAX_TOKENS" => FinishReason::Length,
        _ => FinishReason::Stop,
    };

    let prompt_tokens = resp["meta"]["tokens"]["input_tokens"].as_u64().unwrap_or(0) as u32;
    let completion_tokens = resp["meta"]["tokens"]["output_tokens"].as_u64().unwrap_or(0) as u32;

    Ok(CompletionResponse {
        id: resp["generation_id"].as_str().unwrap_or_default().to_string(),
        created: Utc::now(),
        model: model_id.to_string(),
        provider: "cohere".to_string(),
        choices: vec![Choice {
            index: 0,
            message: Message { role: Role::Assistant, content: Some(text), name: None, tool_calls: None, tool_call_id: None },
            finish_reason: Some(finish_reason),
        }],
        usage: TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
        system_fingerprint: None,
    })
}

pub(crate) fn cohere_event_to_chunk(value: Value, model_id: &str) -> Option<CompletionChunk> {
    let event_type = value["event_type"].as_str()?;
    let (content, finish_reason) = match event_type {
        "text-generation" => (value["text"].as_str().map(|s| s.to_string()), None),
        "stream-end" => {
            let reason = value["finish_reason"].as_str().map(|r| match r {
                "MAX_TOKENS" => FinishReason::Length,
                _ => FinishReason::Stop,
            });
            (None, reason)
        }
        _ => return None,
    };

    Some(CompletionChunk {
        id: String::new(),
        model: model_id.to_string(),
        provider: "cohere".to_string(),
        choices: vec![ChunkChoice { index: 0, delta: Delta { role: None, content, tool_call: None }, finish_reason }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SamplingParams;

    fn sample_request() -> CompletionRequest {
        CompletionRequest {
            model_id: "cohere.command-r-plus".into(),
            messages: vec![
                Message { role: Role::System, content: Some("Be terse.".into()), name: None, tool_calls: None, tool_call_id: None },
                Message { role: Role::User, content: Some("Hi".into()), name: None, tool_calls: None, tool_call_id: None },
            ],
            sampling: SamplingParams::default(),
            stream: false,
            tools: None,
            tool_choice: None,
            user_id: None,
            project_id: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn to_cohere_request_puts_last_message_as_message_field() {
        let body = to_cohere_request(&sample_request(), "command-r-plus", false);
        assert_eq!(body["message"], "Hi");
        assert_eq!(body["chat_history"].as_array().unwrap().len(), 1);
        assert_eq!(body["chat_history"][0]["role"], "SYSTEM");
    }

    #[test]
    fn from_cohere_response_maps_text_and_usage() {
        let resp = json!({
            "generation_id": "gen-1",
            "text": "hello",
            "finish_reason": "COMPLETE",
            "meta": { "tokens": { "input_tokens": 4, "output_tokens": 2 } },
        });
        let out = from_cohere_response(resp, "command-r-plus").unwrap();
        assert_eq!(out.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(out.usage.total_tokens, 6);
    }

    #[test]
    fn cohere_event_to_chunk_extracts_text_generation() {
        let event = json!({ "event_type": "text-generation", "text": "Hi" });
        let chunk = cohere_event_to_chunk(event, "command-r-plus").unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
    }

    #[test]
    fn cohere_event_to_chunk_ignores_unknown_event_types() {
        let event = json!({ "event_type": "search-results" });
        assert!(cohere_event_to_chunk(event, "command-r-plus").is_none());
    }
}
