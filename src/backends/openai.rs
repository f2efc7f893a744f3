//! OpenAI-compatible chat completions + embeddings adapter.
//!
//! Handles any backend that speaks the OpenAI wire protocol — OpenAI itself, and any
//! self-hosted/gateway backend that mirrors it (vLLM, LocalAI, OpenRouter, ...). The
//! translation functions here are reused by [`super::azure_openai`], since Azure's OpenAI
//! deployments speak the same JSON shapes under a different URL/auth scheme.

use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{classify_status, classify_transport_error, ChunkStream};
use crate::error::GatewayError;
use crate::model::{
    Choice, ChunkChoice, CompletionChunk, CompletionRequest, CompletionResponse, Delta,
    EmbeddingRequest, EmbeddingResponse, FinishReason, Message, Role, ToolCall, TokenUsage,
};
use crate::streaming::{sse_lines, SseLine};

pub struct OpenAIAdapter {
    provider_name: String,
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl OpenAIAdapter {
    pub fn new(base_url: String, timeout_sec: u64, api_key: Option<String>) -> Self {
        Self::with_provider_name("openai", base_url, timeout_sec, api_key)
    }

    pub(crate) fn with_provider_name(
        provider_name: &str,
        base_url: String,
        timeout_sec: u64,
        api_key: Option<String>,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = &api_key {
            let value = format!("Bearer {key}");
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&value)
                    .expect("API key contains invalid Authorization header characters"),
            );
        }

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_secs(timeout_sec))
            .build()
            .expect("failed to build reqwest client");

        // No request-level timeout for streaming — the response body arrives incrementally.
        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build streaming reqwest client");

        Self { provider_name: provider_name.to_string(), client, stream_client, base_url }
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
            .map_err(|e| classify_transport_error(&self.provider_name, &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("{}: reading body: {e}", self.provider_name)))?;

        if !status.is_success() {
            return Err(classify_status(&self.provider_name, status, &text));
        }

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            GatewayError::ProviderBadRequest(format!("{}: invalid JSON response: {e}", self.provider_name))
        })?;
        from_openai_response(value, &self.provider_name)
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
            .map_err(|e| classify_transport_error(&self.provider_name, &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.provider_name, status, &text));
        }

        let provider_name = self.provider_name.clone();
        let stream = sse_lines(response.bytes_stream()).filter_map(move |line| {
            let provider_name = provider_name.clone();
            async move {
                match line {
                    Ok(SseLine::Data(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(v) => openai_chunk_to_canonical(v, &provider_name).map(Ok),
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed OpenAI SSE chunk");
                            None
                        }
                    },
                    Ok(SseLine::Done) => None,
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
            "input": request.input,
        });
        let url = format!("{}/v1/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&self.provider_name, &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("{}: reading body: {e}", self.provider_name)))?;
        if !status.is_success() {
            return Err(classify_status(&self.provider_name, status, &text));
        }

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            GatewayError::ProviderBadRequest(format!("{}: invalid JSON response: {e}", self.provider_name))
        })?;

        let vectors: Vec<Vec<f32>> = value["data"]
            .as_array()
            .ok_or_else(|| GatewayError::ProviderBadRequest(format!("{}: response missing `data`", self.provider_name)))?
            .iter()
            .map(|d| {
                d["embedding"]
                    .as_array()
                    .map(|arr| arr.iter().filter_map(|n| n.as_f64()).map(|f| f as f32).collect())
                    .unwrap_or_default()
            })
            .collect();

        Ok(EmbeddingResponse {
            model: provider_model_id.to_string(),
            provider: self.provider_name.clone(),
            vectors,
            prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.client.get(&url).send().await?;
        anyhow::ensure!(response.status().is_success(), "health check returned HTTP {}", response.status());
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Schema translation — pub(crate) so azure_openai.rs and tests can reuse it.
// ──────────────────────────────────────────────────────────────────────────────

pub(crate) fn to_openai_request(req: &CompletionRequest, provider_model_id: &str) -> Value {
    let messages: Vec<Value> = req.messages.iter().map(message_to_openai).collect();
    let mut body = json!({
        "model": provider_model_id,
        "messages": messages,
        "stream": req.stream,
    });

    if let Some(v) = req.sampling.max_tokens {
        body["max_tokens"] = json!(v);
    }
    if let Some(v) = req.sampling.temperature {
        body["temperature"] = json!(v);
    }
    if let Some(v) = req.sampling.top_p {
        body["top_p"] = json!(v);
    }
    if let Some(v) = req.sampling.n {
        body["n"] = json!(v);
    }
    if let Some(v) = req.sampling.presence_penalty {
        body["presence_penalty"] = json!(v);
    }
    if let Some(v) = req.sampling.frequency_penalty {
        body["frequency_penalty"] = json!(v);
    }
    if let Some(v) = &req.sampling.logit_bias {
        body["logit_bias"] = json!(v);
    }
    if let Some(v) = &req.sampling.stop {
        body["stop"] = json!(v);
    }
    if let Some(tools) = &req.tools {
        body["tools"] = json!(tools
            .iter()
            .map(|t| json!({
                "type": "function",
                "function": { "name": t.name, "description": t.description, "parameters": t.parameters },
            }))
            .collect::<Vec<_>>());
    }
    if let Some(choice) = &req.tool_choice {
        body["tool_choice"] = match choice {
            crate::model::ToolChoice::Auto(s) => json!(s),
            crate::model::ToolChoice::Named { name } => {
                json!({ "type": "function", "function": { "name": name } })
            }
        };
    }
    if let Some(user) = &req.user_id {
        body["user"] = json!(user);
    }

    body
}

fn message_to_openai(m: &Message) -> Value {
    let mut v = json!({ "role": serde_json::to_value(m.role).expect("Role always serializes") });
    v["content"] = m.content.clone().map(Value::String).unwrap_or(Value::Null);
    if let Some(n) = &m.name {
        v["name"] = json!(n);
    }
    if let Some(tool_calls) = &m.tool_calls {
        v["tool_calls"] = json!(tool_calls
            .iter()
            .map(|t| json!({
                "id": t.id,
                "type": "function",
                "function": { "name": t.name, "arguments": t.arguments },
            }))
            .collect::<Vec<_>>());
    }
    if let Some(id) = &m.tool_call_id {
        v["tool_call_id"] = json!(id);
    }
    v
}

fn role_from_str(s: &str) -> Role {
    match s {
        "system" => Role::System,
        "user" => Role::User,
        "tool" => Role::Tool,
        _ => Role::Assistant,
    }
}

fn finish_reason_from_str(s: &str) -> FinishReason {
    match s {
        "length" => FinishReason::Length,
        "tool_calls" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

pub(crate) fn from_openai_response(body: Value, provider: &str) -> Result<CompletionResponse, GatewayError> {
    let id = body["id"].as_str().unwrap_or_default().to_string();
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let raw_choices = body["choices"]
        .as_array()
        .ok_or_else(|| GatewayError::ProviderBadRequest(format!("{provider}: response missing `choices`")))?;

    let choices = raw_choices
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let msg = &c["message"];
            let role = role_from_str(msg["role"].as_str().unwrap_or("assistant"));
            let content = msg["content"].as_str().map(|s| s.to_string());
            let tool_calls = msg["tool_calls"].as_array().map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        Some(ToolCall {
                            id: tc["id"].as_str()?.to_string(),
                            name: tc["function"]["name"].as_str()?.to_string(),
                            arguments: tc["function"]["arguments"].as_str().unwrap_or("{}").to_string(),
                        })
                    })
                    .collect::<Vec<_>>()
            });
            Choice {
                index: i as u32,
                message: Message { role, content, name: None, tool_calls, tool_call_id: None },
                finish_reason: c["finish_reason"].as_str().map(finish_reason_from_str),
            }
        })
        .collect();

    let usage = TokenUsage {
        prompt_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: body["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
    };

    Ok(CompletionResponse {
        id,
        created: Utc::now(),
        model,
        provider: provider.to_string(),
        choices,
        usage,
        system_fingerprint: body["system_fingerprint"].as_str().map(|s| s.to_string()),
    })
}

pub(crate) fn openai_chunk_to_canonical(value: Value, provider: &str) -> Option<CompletionChunk> {
    let id = value["id"].as_str().unwrap_or_default().to_string();
    let model = value["model"].as_str().unwrap_or_default().to_string();
    let choices = value["choices"]
        .as_array()?
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let delta = &c["delta"];
            ChunkChoice {
                index: i as u32,
                delta: Delta {
                    role: delta["role"].as_str().map(role_from_str),
                    content: delta["content"].as_str().map(|s| s.to_string()),
                    tool_call: None,
                },
                finish_reason: c["finish_reason"].as_str().map(finish_reason_from_str),
            }
        })
        .collect();
    Some(CompletionChunk { id, model, provider: provider.to_string(), choices })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role as R, SamplingParams};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> CompletionRequest {
        CompletionRequest {
            model_id: "openai.gpt-4".into(),
            messages: vec![Message {
                role: R::User,
                content: Some("hi".into()),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }],
            sampling: SamplingParams { max_tokens: Some(100), ..Default::default() },
            stream: false,
            tools: None,
            tool_choice: None,
            user_id: None,
            project_id: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn to_openai_request_carries_model_and_messages() {
        let body = to_openai_request(&sample_request(), "gpt-4");
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["max_tokens"], 100);
    }

    #[test]
    fn from_openai_response_maps_choices_and_usage() {
        let resp = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "hello" },
                "finish_reason": "stop",
            }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5 },
        });
        let out = from_openai_response(resp, "openai").unwrap();
        assert_eq!(out.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(out.usage.total_tokens, 5);
        assert_eq!(out.choices[0].finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn from_openai_response_errors_without_choices() {
        let resp = json!({ "id": "x", "model": "gpt-4" });
        assert!(from_openai_response(resp, "openai").is_err());
    }

    #[test]
    fn chunk_translation_maps_delta_content() {
        let chunk = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4",
            "choices": [{ "index": 0, "delta": { "content": "Hi" }, "finish_reason": null }],
        });
        let out = openai_chunk_to_canonical(chunk, "openai").unwrap();
        assert_eq!(out.choices[0].delta.content.as_deref(), Some("Hi"));
    }

    #[tokio::test]
    async fn create_completion_returns_parsed_response_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "model": "gpt-4",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "hello there" },
                    "finish_reason": "stop",
                }],
                "usage": { "prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3 },
            })))
            .mount(&server)
            .await;

        let adapter = OpenAIAdapter::new(server.uri(), 5, None);
        let resp = adapter.create_completion(&sample_request(), "gpt-4").await.unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hello there"));
    }

    #[tokio::test]
    async fn create_completion_classifies_429_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let adapter = OpenAIAdapter::new(server.uri(), 5, None);
        let err = adapter.create_completion(&sample_request(), "gpt-4").await.unwrap_err();
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn create_embedding_returns_vectors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "embedding": [0.1, 0.2, 0.3] }],
                "usage": { "prompt_tokens": 4 },
            })))
            .mount(&server)
            .await;

        let adapter = OpenAIAdapter::new(server.uri(), 5, None);
        let req = EmbeddingRequest { model_id: "openai.text-embedding-3-small".into(), input: vec!["hi".into()], user_id: None };
        let resp = adapter.create_embedding(&req, "text-embedding-3-small").await.unwrap();
        assert_eq!(resp.vectors[0].len(), 3);
        assert_eq!(resp.prompt_tokens, 4);
    }

    #[tokio::test]
    async fn health_check_errors_on_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/v1/models")).respond_with(ResponseTemplate::new(503)).mount(&server).await;
        let adapter = OpenAIAdapter::new(server.uri(), 5, None);
        assert!(adapter.health_check().await.is_err());
    }
}
