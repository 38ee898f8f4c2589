//! Conversation history types (spec §3: Message, Content Part, ToolCall,
//! ToolResult, ExecutionTrace).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{MessageId, ToolCallId, TurnId};

/// Role of a message's author within the run's internal history.
///
/// Four variants, not the three a wire-level provider message carries:
/// `Tool` is collapsed into a user-role message only at the provider
/// boundary (see `agentloop-context`'s model-message synthesis), so the
/// history invariant below can be checked before that reshaping happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A single part of a multi-modal message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { media_type: String, base64: String },
}

/// The parsed or unparsed arguments of a tool call.
///
/// Parse failures are a sentinel variant, not an error return: the
/// controller feeds them back to the model as an observation rather than
/// raising (spec §7, `TOOL_ARGUMENTS_PARSE_ERROR`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArguments {
    Parsed(serde_json::Map<String, serde_json::Value>),
    ParseError { raw: String, message: String },
}

impl ToolArguments {
    /// Parses a raw JSON argument string, producing the sentinel variant on
    /// failure instead of an `Err`.
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(serde_json::Value::Object(map)) => ToolArguments::Parsed(map),
            Ok(other) => ToolArguments::ParseError {
                raw,
                message: format!("expected a JSON object, got {other}"),
            },
            Err(err) => ToolArguments::ParseError {
                raw,
                message: err.to_string(),
            },
        }
    }

    pub fn is_parse_error(&self) -> bool {
        matches!(self, ToolArguments::ParseError { .. })
    }

    pub fn as_parsed(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            ToolArguments::Parsed(map) => Some(map),
            ToolArguments::ParseError { .. } => None,
        }
    }
}

/// A structured action requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: ToolArguments,
}

impl ToolCall {
    pub fn new(id: impl Into<ToolCallId>, name: impl Into<String>, raw_arguments: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: ToolArguments::parse(raw_arguments),
        }
    }
}

/// The observation produced by running a [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: ToolCallId,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub metadata: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(tool_call_id: ToolCallId, output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            tool_call_id,
            success: true,
            output: Some(output),
            error: None,
            duration_ms,
            metadata: None,
        }
    }

    pub fn failed(tool_call_id: ToolCallId, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            tool_call_id,
            success: false,
            output: None,
            error: Some(error.into()),
            duration_ms,
            metadata: None,
        }
    }

    /// Whether `metadata.requires_user_confirmation` is set (§6: the only
    /// metadata field the core contract inspects besides skill-activation).
    pub fn requires_user_confirmation(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("requires_user_confirmation"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_skill_activation(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("is_skill_activation"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    pub fn skill_result(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref().and_then(|m| m.get("skill_result"))
    }
}

/// Marks a summary message produced by history compression or proactive
/// compaction, preserving auditability of what was removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionBlock {
    pub messages_compacted: usize,
    pub tokens_saved: u64,
    pub summary: String,
}

/// The body of a [`Message`]: either plain text or a multi-modal sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageBody {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(text) => Some(text),
            MessageBody::Parts(_) => None,
        }
    }
}

/// An attachment on a user message, not yet converted to content parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub data: AttachmentData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum AttachmentData {
    Text { content: String },
    Base64 { content: String },
}

/// An ordered entry in conversation history.
///
/// **Invariant**: any assistant message carrying `tool_calls` must be
/// followed in history by exactly one tool message whose `tool_results`
/// cover the same tool-call ids as a set (order within the set is
/// irrelevant). Compressed segments may summarize the pair but must
/// preserve the pairing as a single summary entry — see
/// `agentloop_context::compression`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: MessageBody,
    pub timestamp: DateTime<Utc>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_results: Option<Vec<ToolResult>>,
    pub attachments: Option<Vec<Attachment>>,
    pub thinking: Option<String>,
    pub compaction: Option<CompactionBlock>,
    pub is_meta: bool,
}

impl Message {
    pub fn user(id: impl Into<MessageId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            content: MessageBody::Text(text.into()),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_results: None,
            attachments: None,
            thinking: None,
            compaction: None,
            is_meta: false,
        }
    }

    pub fn system(id: impl Into<MessageId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::System,
            content: MessageBody::Text(text.into()),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_results: None,
            attachments: None,
            thinking: None,
            compaction: None,
            is_meta: false,
        }
    }

    /// A system message that does not surface in any end-user transcript.
    pub fn meta_system(id: impl Into<MessageId>, text: impl Into<String>) -> Self {
        let mut message = Self::system(id, text);
        message.is_meta = true;
        message
    }

    pub fn assistant_text(id: impl Into<MessageId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: MessageBody::Text(text.into()),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_results: None,
            attachments: None,
            thinking: None,
            compaction: None,
            is_meta: false,
        }
    }

    pub fn assistant_tool_calls(id: impl Into<MessageId>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: MessageBody::Text(String::new()),
            timestamp: Utc::now(),
            tool_calls: Some(tool_calls),
            tool_results: None,
            attachments: None,
            thinking: None,
            compaction: None,
            is_meta: false,
        }
    }

    pub fn tool_results(id: impl Into<MessageId>, results: Vec<ToolResult>) -> Self {
        Self {
            id: id.into(),
            role: Role::Tool,
            content: MessageBody::Text(String::new()),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_results: Some(results),
            attachments: None,
            thinking: None,
            compaction: None,
            is_meta: false,
        }
    }

    /// The set of tool-call ids this message's `tool_results` cover, for
    /// checking the pairing invariant.
    pub fn tool_result_ids(&self) -> Option<std::collections::HashSet<&ToolCallId>> {
        self.tool_results
            .as_ref()
            .map(|results| results.iter().map(|r| &r.tool_call_id).collect())
    }

    pub fn tool_call_ids(&self) -> Option<std::collections::HashSet<&ToolCallId>> {
        self.tool_calls
            .as_ref()
            .map(|calls| calls.iter().map(|c| &c.id).collect())
    }
}

/// Token usage reported by a single model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: Option<u64>,
    pub cache_creation_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens = match (self.cache_read_tokens, other.cache_read_tokens) {
            (Some(a), Some(b)) => Some(a + b),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        self.cache_creation_tokens =
            match (self.cache_creation_tokens, other.cache_creation_tokens) {
                (Some(a), Some(b)) => Some(a + b),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };
    }
}

/// A single call made to the LLM client during a run, for the execution
/// trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCallRecord {
    pub turn_id: TurnId,
    pub model: String,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
}

/// Observational record of one run, handed to post-run learning
/// collaborators. Never read back by the core itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub turn_id: Option<TurnId>,
    pub iteration: usize,
    pub tool_calls_with_results: Vec<(ToolCall, ToolResult)>,
    pub token_usage: TokenUsage,
    pub model_calls: Vec<ModelCallRecord>,
}

impl ExecutionTrace {
    pub fn record_tool(&mut self, call: ToolCall, result: ToolResult) {
        self.tool_calls_with_results.push((call, result));
    }

    pub fn record_model_call(&mut self, record: ModelCallRecord) {
        self.token_usage.accumulate(&record.usage);
        self.model_calls.push(record);
    }
}
