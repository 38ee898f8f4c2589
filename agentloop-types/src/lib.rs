//! Data model, event taxonomy, and provider/error contracts shared by every
//! `agentloop-*` crate.
//!
//! This is the protocol-boundary crate: it has no opinion on *how* a loop
//! runs, only on the shapes that cross the seams between the loop
//! controller, the tool scheduler, the context manager, and the outer
//! shell. Every other crate in the workspace depends on this one; this one
//! depends on nothing in the workspace.

pub mod error;
pub mod event;
pub mod id;
pub mod message;
pub mod provider;

pub use error::{ContextError, HookError, LoopError, ToolError};
pub use event::{AgentEvent, ChannelEventEmitter, EventEmitter, NullEventEmitter, TaskProgressPhase};
pub use id::{MessageId, RunId, ToolCallId, TurnId};
pub use message::{
    Attachment, AttachmentData, CompactionBlock, ContentPart, ExecutionTrace, Message, MessageBody,
    ModelCallRecord, Role, TokenUsage, ToolArguments, ToolCall, ToolResult,
};
pub use provider::{
    BoxedProvider, ChunkStream, ErasedProvider, FinishReason, ModelConfig, ModelResponse,
    Provider, ProviderContent, ProviderError, ProviderMessage, RawToolCall, StreamChunk,
    ToolDefinition, WireRole,
};
