//! Canonical wire types shared by every provider adapter, the router, and the dispatcher.
//!
//! Vendor-specific shapes live in `backends::*`; everything in this module is
//! provider-agnostic and is what the HTTP surface in `api` actually speaks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A canonical model id is always `providerName.providerModelId` (lower-case provider).
pub fn canonical_id(provider: &str, provider_model_id: &str) -> String {
    format!("{}.{}", provider.to_ascii_lowercase(), provider_model_id)
}

/// Split a canonical id into `(provider, providerModelId)`. Returns `None` if there is no dot.
pub fn split_canonical_id(id: &str) -> Option<(&str, &str)> {
    id.split_once('.')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub completions: bool,
    pub embeddings: bool,
    pub streaming: bool,
    pub tool_calling: bool,
    pub vision: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            completions: true,
            embeddings: false,
            streaming: true,
            tool_calling: false,
            vision: false,
        }
    }
}

/// Immutable per-reload snapshot describing one model behind one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// `provider.providerModelId`
    pub id: String,
    pub display_name: String,
    pub provider: String,
    pub provider_model_id: String,
    pub context_window: u32,
    pub capabilities: Capabilities,
    pub price_per_1k_prompt: f64,
    pub price_per_1k_completion: f64,
    pub quality_score: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Auto(String),
    Named { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Exactly one of `content` / `tool_calls` is populated (spec invariant).
    pub content: Option<String>,
    pub name: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn validate(&self) -> Result<(), &'static str> {
        match (&self.content, &self.tool_calls) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err("message must carry content or tool_calls, not both"),
            (None, None) => Err("message must carry content or tool_calls"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub n: Option<u32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub logit_bias: Option<HashMap<String, f32>>,
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model_id: String,
    pub messages: Vec<Message>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub stream: bool,
    pub tools: Option<Vec<Tool>>,
    pub tool_choice: Option<ToolChoice>,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CompletionRequest {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.messages.is_empty() {
            return Err("messages must be non-empty");
        }
        for m in &self.messages {
            m.validate()?;
        }
        Ok(())
    }

    /// Concatenation of all message text content, used for content-filtering and as a
    /// fallback token-counting input.
    pub fn joined_text(&self) -> String {
        self.messages
            .iter()
            .filter_map(|m| m.content.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub created: DateTime<Utc>,
    pub model: String,
    pub provider: String,
    pub choices: Vec<Choice>,
    pub usage: TokenUsage,
    pub system_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub tool_call: Option<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<FinishReason>,
}

/// One SSE event's worth of a streaming completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub id: String,
    pub model: String,
    pub provider: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model_id: String,
    pub input: Vec<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub model: String,
    pub provider: String,
    pub vectors: Vec<Vec<f32>>,
    pub prompt_tokens: u32,
}

/// Append-only observation of token/cost numbers for one completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub api_key_id: Option<String>,
    pub request_id: String,
    pub model_id: String,
    pub provider: String,
    pub request_type: RequestType,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub estimated_cost_usd: f64,
    pub estimated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Completion,
    Embedding,
    Stream,
}

/// Observational record of one routing decision — never consulted on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: String,
    pub requested_model: String,
    pub selected_model: String,
    pub strategy: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub fallback_depth: u32,
}

/// A `(provider, providerModelId)` pair considered for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub provider: String,
    pub provider_model_id: String,
}

impl Candidate {
    pub fn canonical_id(&self) -> String {
        canonical_id(&self.provider, &self.provider_model_id)
    }
}
