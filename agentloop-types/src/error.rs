//! Error taxonomy (spec §7).
//!
//! All *expected* failure modes stay inside `ToolResult` so the model can
//! see and react to them (spec §7's propagation policy). These enums cover
//! only what the loop itself may raise when it gives up.

use crate::provider::ProviderError;

/// A tool-level failure. Never surfaced to the model directly — always
/// folded into a failed [`crate::message::ToolResult`] by the scheduler or
/// the loop controller.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ToolError {
    #[error("tool {0:?} is not registered")]
    NotFound(String),
    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),
    #[error("tool call blocked by hook: {reason}")]
    BlockedByHook { reason: String },
    #[error("tool arguments could not be parsed: {message}")]
    ArgumentsParseError { raw: String, message: String },
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors from the context/message manager.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ContextError {
    #[error("context length exceeded even after compaction: {0}")]
    Uncompactable(String),
    #[error("history is missing the tool-result pair for turn {0}")]
    UnpairedToolCall(String),
}

/// Errors from hook dispatch. Per spec §7, hook failures are logged but
/// never propagate — this type exists for the dispatcher's own
/// `tracing::warn!` call sites, not for the loop to match on.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum HookError {
    #[error("hook {hook_name:?} failed: {message}")]
    HandlerFailed { hook_name: String, message: String },
}

/// The top-level error the Loop Controller may raise. Every variant
/// corresponds to one of the codes named in spec §7's taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum LoopError {
    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),
    #[error("token budget exhausted")]
    BudgetExceeded,
    #[error("circuit breaker tripped after {consecutive_failures} consecutive tool failures")]
    CircuitBreakerTripped { consecutive_failures: u32 },
    #[error("iteration cap ({cap}) reached")]
    MaxIterations { cap: usize },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl LoopError {
    /// The short machine-readable code surfaced on the `error` event (spec
    /// §6/§7).
    pub fn code(&self) -> &'static str {
        match self {
            LoopError::ContextLengthExceeded(_) => "CONTEXT_LENGTH_EXCEEDED",
            LoopError::BudgetExceeded => "BUDGET_EXCEEDED",
            LoopError::CircuitBreakerTripped { .. } => "CIRCUIT_BREAKER_TRIPPED",
            LoopError::MaxIterations { .. } => "MAX_ITERATIONS",
            LoopError::Provider(_) => "PROVIDER_ERROR",
            LoopError::Tool(_) => "TOOL_ERROR",
            LoopError::Context(_) => "CONTEXT_ERROR",
        }
    }
}
