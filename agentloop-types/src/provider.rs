//! The inbound LLM client contract (spec §6).
//!
//! Deliberately narrow: the core only ever needs `infer`. Vendor wire
//! formats, retries below the loop-level network retry, and authentication
//! are all the provider implementation's business, not this crate's.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::message::TokenUsage;

/// Role on the wire, as the provider API sees it. Collapsed from the
/// internal four-variant `Role`: tool messages are reshaped into a user
/// message before this boundary (see `agentloop-context`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    System,
    User,
    Assistant,
}

/// A single message as sent to the provider: role plus either plain text or
/// a list of multi-modal parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: WireRole,
    pub content: ProviderContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderContent {
    Text(String),
    Parts(Vec<crate::message::ContentPart>),
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Per-inference model configuration (model id, sampling, output budget).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub system: Option<String>,
}

/// One chunk delivered via `on_chunk` during a streaming inference call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamChunk {
    Text { content: String },
    Reasoning { content: String },
    ToolCallStart { index: usize, id: String, name: String },
    ToolCallDelta { index: usize, name: String, arguments_delta: String },
}

/// Why the model stopped generating, surfaced on [`ModelResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    ContentFilter,
}

/// A resolved tool call as parsed out of a [`ModelResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawToolCall {
    pub id: String,
    pub name: String,
    pub arguments_json: String,
}

/// The result of one `infer` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: Option<String>,
    pub thinking: Option<String>,
    pub tool_calls: Option<Vec<RawToolCall>>,
    pub truncated: bool,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
}

impl ModelResponse {
    pub fn is_tool_use(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

/// Errors raised by the provider boundary.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("context length exceeded: requested {requested_tokens} tokens, max {max_tokens} for {provider}")]
    ContextLengthExceeded {
        requested_tokens: u64,
        max_tokens: u64,
        provider: String,
    },
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("provider request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Network-transient errors get exactly one additional loop-level retry
    /// after provider-level retries exhaust (spec §5).
    pub fn is_network_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport(message)
                if message.contains("connection reset")
                    || message.contains("TLS")
                    || message.contains("ETIMEDOUT")
                    || message.contains("timed out")
        )
    }
}

/// The inbound LLM client contract.
///
/// Implemented with return-position `impl Trait in traits` rather than
/// `#[async_trait]`: the loop controller always calls it through a concrete
/// generic parameter (`AgentLoop<P: Provider, ...>`), never through a
/// `dyn Provider`, so there is no need to pay for a boxed future here.
pub trait Provider: Send + Sync {
    /// Runs one inference call, delivering stream chunks to `on_chunk` as
    /// they arrive. `cancel` is honored by returning
    /// `Err(ProviderError::Cancelled)` as soon as practical after
    /// cancellation is requested.
    fn infer(
        &self,
        messages: Vec<ProviderMessage>,
        tools: Vec<ToolDefinition>,
        model_config: ModelConfig,
        on_chunk: Box<dyn FnMut(StreamChunk) + Send>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<ModelResponse, ProviderError>> + Send;
}

/// Object-safe wrapper around [`Provider`], for call sites that need a
/// `dyn`-compatible handle (e.g. the fallback router swapping between two
/// configured providers at runtime).
pub trait ErasedProvider: Send + Sync {
    fn infer_erased(
        &self,
        messages: Vec<ProviderMessage>,
        tools: Vec<ToolDefinition>,
        model_config: ModelConfig,
        on_chunk: Box<dyn FnMut(StreamChunk) + Send>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ModelResponse, ProviderError>> + Send + '_>>;
}

impl<P: Provider> ErasedProvider for P {
    fn infer_erased(
        &self,
        messages: Vec<ProviderMessage>,
        tools: Vec<ToolDefinition>,
        model_config: ModelConfig,
        on_chunk: Box<dyn FnMut(StreamChunk) + Send>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ModelResponse, ProviderError>> + Send + '_>> {
        Box::pin(self.infer(messages, tools, model_config, on_chunk, cancel))
    }
}

/// Boxed, type-erased provider handle.
pub type BoxedProvider = std::sync::Arc<dyn ErasedProvider>;

/// Stream of chunks as an alternative to the callback form, for providers
/// that naturally produce a `Stream` (kept for parity with
/// `agent-types::stream::StreamHandle`; the loop controller uses the
/// callback form above).
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;
