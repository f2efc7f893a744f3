//! Anthropic Messages API adapter.
//!
//! Translates the canonical [`CompletionRequest`]/[`CompletionResponse`] types to and from
//! Anthropic's [`/v1/messages`](https://docs.anthropic.com/en/api/messages) API.
//!
//! | Concern | Canonical | Anthropic |
//! |---|---|---|
//! | System prompt | `Role::System` message | top-level `system` field |
//! | Max tokens | optional | **required** (`max_tokens`) |
//! | Finish reasons | `stop`/`length`/... | `end_turn`/`max_tokens`/... |
//! | Response shape | `choices[].message.content` | `content[].text` |
//! | Auth header | — | `x-api-key` |
//!
//! Anthropic has no embeddings endpoint; `create_embedding` is not exposed here (see
//! [`super::BackendClient::create_embedding`]'s `Anthropic` arm).

use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{classify_status, classify_transport_error, ChunkStream};
use crate::error::GatewayError;
use crate::model::{
    Choice, ChunkChoice, CompletionChunk, CompletionRequest, CompletionResponse, Delta,
    FinishReason, Message, Role, TokenUsage,
};
use crate::streaming::{sse_lines, SseLine};

const DEFAULT_MAX_TOKENS: u64 = 8_192;
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(base_url: String, timeout_sec: u64, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            header::HeaderValue::from_str(&api_key).expect("Anthropic API key contains invalid header characters"),
        );
        headers.insert("anthropic-version", header::HeaderValue::from_static(ANTHROPIC_VERSION));

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
        let body = to_anthropic(request, provider_model_id, false);
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("anthropic", &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("anthropic: reading body: {e}")))?;
        if !status.is_success() {
            return Err(classify_status("anthropic", status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::ProviderBadRequest(format!("anthropic: invalid JSON response: {e}")))?;
        from_anthropic(value)
    }

    pub async fn create_completion_stream(
        &self,
        request: &CompletionRequest,
        provider_model_id: &str,
    ) -> Result<ChunkStream, GatewayError> {
        let body = to_anthropic(request, provider_model_id, true);
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("anthropic", &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("anthropic", status, &text));
        }

        let model_id = provider_model_id.to_string();
        let stream = sse_lines(response.bytes_stream()).filter_map(move |line| {
            let model_id = model_id.clone();
            async move {
                match line {
                    Ok(SseLine::Data(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(v) => anthropic_event_to_chunk(v, &model_id).map(Ok),
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed Anthropic SSE event");
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

    /// Anthropic has no `/v1/models` endpoint; a cheap 1-token completion is the only
    /// reliable way to verify auth + connectivity.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        let probe = json!({
            "model": "claude-haiku-4-5-20251001",
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        });
        let url = format!("{}/v1/messages", self.base_url);
        let response = self.client.post(&url).json(&probe).send().await?;
        anyhow::ensure!(response.status().is_success(), "Anthropic health check returned HTTP {}", response.status());
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Schema translation — pub(crate) for unit testing
// ──────────────────────────────────────────────────────────────────────────────

/// Convert a canonical completion request to Anthropic's Messages format. Anthropic has no
/// `tool` role; tool-result messages are forwarded as user turns labelled with their
/// originating `tool_call_id` (reasonable approximation — Anthropic's typed `tool_result`
/// content blocks are a superset this adapter does not need for text completions).
pub(crate) fn to_anthropic(request: &CompletionRequest, provider_model_id: &str, stream: bool) -> Value {
    let max_tokens = request.sampling.max_tokens.map(|v| v as u64).unwrap_or(DEFAULT_MAX_TOKENS);

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len());

    for msg in &request.messages {
        match msg.role {
            Role::System => {
                if let Some(content) = &msg.content {
                    system_parts.push(content.clone());
                }
            }
            Role::Tool => {
                let label = msg.tool_call_id.as_deref().unwrap_or("tool");
                let content = msg.content.clone().unwrap_or_default();
                messages.push(json!({ "role": "user", "content": format!("[tool result {label}] {content}") }));
            }
            Role::User => messages.push(json!({ "role": "user", "content": msg.content.clone().unwrap_or_default() })),
            Role::Assistant => {
                messages.push(json!({ "role": "assistant", "content": msg.content.clone().unwrap_or_default() }))
            }
        }
    }

    let mut req = json!({
        "model": provider_model_id,
        "max_tokens": max_tokens,
        "messages": messages,
        "stream": stream,
    });

    if !system_parts.is_empty() {
        req["system"] = json!(system_parts.join("\n\n"));
    }
    if let Some(temp) = request.sampling.temperature {
        req["temperature"] = json!(temp);
    }
    if let Some(top_p) = request.sampling.top_p {
        req["top_p"] = json!(top_p);
    }
    if let Some(stop) = &request.sampling.stop {
        req["stop_sequences"] = json!(stop);
    }

    req
}

/// Convert an Anthropic Messages API response to a canonical [`CompletionResponse`].
pub(crate) fn from_anthropic(resp: Value) -> Result<CompletionResponse, GatewayError> {
    let text = resp["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
        .and_then(|b| b["text"].as_str())
        .ok_or_else(|| GatewayError::ProviderBadRequest("anthropic: no text block in response `content`".into()))?
        .to_string();

    let model = resp["model"].as_str().unwrap_or("unknown").to_string();
    let finish_reason = match resp["stop_reason"].as_str().unwrap_or("end_turn") {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    };

    let input_tokens = resp["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
    let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;

    Ok(CompletionResponse {
        id: resp["id"].as_str().unwrap_or_default().to_string(),
        created: Utc::now(),
        model,
        provider: "anthropic".to_string(),
        choices: vec![Choice {
            index: 0,
            message: Message {
                role: Role::Assistant,
                content: Some(text),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            },
            finish_reason: Some(finish_reason),
        }],
        usage: TokenUsage {
            prompt_tokens: input_tokens,
            completion_tokens: output_tokens,
            total_tokens: input_tokens + output_tokens,
        },
        system_fingerprint: None,
    })
}

/// Translate one Anthropic SSE event into a canonical chunk. Several event types
/// (`ping`, `content_block_start`/`stop`, `message_stop`) carry no text and are filtered
/// out upstream by returning `None`.
pub(crate) fn anthropic_event_to_chunk(value: Value, model_id: &str) -> Option<CompletionChunk> {
    let event_type = value["type"].as_str()?;
    let id = value["message"]["id"].as_str().unwrap_or_default().to_string();

    let (content, finish_reason) = match event_type {
        "content_block_delta" if value["delta"]["type"] == "text_delta" => {
            (value["delta"]["text"].as_str().map(|s| s.to_string()), None)
        }
        "message_delta" => {
            let reason = value["delta"]["stop_reason"].as_str().map(|r| match r {
                "max_tokens" => FinishReason::Length,
                "tool_use" => FinishReason::ToolCalls,
                _ => FinishReason::Stop,
            });
            (None, reason)
        }
        _ => return None,
    };

    Some(CompletionChunk {
        id,
        model: model_id.to_string(),
        provider: "anthropic".to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: Delta { role: None, content, tool_call: None },
            finish_reason,
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SamplingParams;

    fn req_with_messages(messages: Vec<Message>) -> CompletionRequest {
        CompletionRequest {
            model_id: "anthropic.claude-3-opus".into(),
            messages,
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
    fn to_anthropic_extracts_system_message_to_top_level() {
        let req = req_with_messages(vec![
            Message { role: Role::System, content: Some("Be helpful.".into()), name: None, tool_calls: None, tool_call_id: None },
            Message { role: Role::User, content: Some("Hello".into()), name: None, tool_calls: None, tool_call_id: None },
        ]);
        let out = to_anthropic(&req, "claude-3-opus", false);
        assert_eq!(out["system"], "Be helpful.");
        assert_eq!(out["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn to_anthropic_defaults_max_tokens_when_absent() {
        let req = req_with_messages(vec![Message {
            role: Role::User,
            content: Some("hi".into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }]);
        let out = to_anthropic(&req, "claude-3-opus", false);
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn from_anthropic_maps_end_turn_to_stop() {
        let resp = json!({
            "id": "msg_123",
            "model": "claude-3-opus",
            "content": [{ "type": "text", "text": "Hello!" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        let out = from_anthropic(resp).unwrap();
        assert_eq!(out.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(out.choices[0].message.content.as_deref(), Some("Hello!"));
        assert_eq!(out.usage.total_tokens, 15);
    }

    #[test]
    fn from_anthropic_maps_max_tokens_stop_reason_to_length() {
        let resp = json!({
            "id": "msg_456",
            "model": "claude-3-opus",
            "content": [{ "type": "text", "text": "…" }],
            "stop_reason": "max_tokens",
            "usage": { "input_tokens": 100, "output_tokens": 1024 },
        });
        let out = from_anthropic(resp).unwrap();
        assert_eq!(out.choices[0].finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn from_anthropic_errors_when_no_text_block_present() {
        let resp = json!({
            "id": "msg_789",
            "model": "claude-3-opus",
            "content": [{ "type": "tool_use", "id": "toolu_1", "name": "calculator", "input": {} }],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        assert!(from_anthropic(resp).is_err());
    }

    #[test]
    fn anthropic_event_to_chunk_extracts_text_delta() {
        let event = json!({
            "type": "content_block_delta",
            "delta": { "type": "text_delta", "text": "Hi" },
        });
        let chunk = anthropic_event_to_chunk(event, "claude-3-opus").unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
    }

    #[test]
    fn anthropic_event_to_chunk_ignores_ping_events() {
        let event = json!({ "type": "ping" });
        assert!(anthropic_event_to_chunk(event, "claude-3-opus").is_none());
    }

    #[test]
    fn anthropic_event_to_chunk_maps_message_delta_stop_reason() {
        let event = json!({ "type": "message_delta", "delta": { "stop_reason": "max_tokens" } });
        let chunk = anthropic_event_to_chunk(event, "claude-3-opus").unwrap();
        assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::Length));
    }
}
