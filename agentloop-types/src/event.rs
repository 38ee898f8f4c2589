//! The outbound agent event stream (spec §6) and its channel-backed emitter.

use serde::{Deserialize, Serialize};

use crate::id::{ToolCallId, TurnId};
use crate::message::Message;

/// `task_progress`'s `phase` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskProgressPhase {
    Thinking,
    Generating,
    ToolPending,
    ToolRunning,
    Completed,
    Failed,
}

/// One event on the outbound agent event stream.
///
/// Every variant here corresponds one-to-one to a tag in spec §6's event
/// list; the shell consuming this stream matches on the tag the way it
/// would match a `{type: "..."}` JSON envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStart {
        turn_id: TurnId,
    },
    TurnEnd {
        turn_id: TurnId,
    },
    Message {
        message: Box<Message>,
    },
    StreamChunk {
        content: String,
    },
    StreamReasoning {
        content: String,
    },
    StreamToolCallStart {
        index: usize,
        id: ToolCallId,
        name: String,
    },
    StreamToolCallDelta {
        index: usize,
        name: String,
        arguments_delta: String,
    },
    ToolCallStart {
        tool_call_id: ToolCallId,
        name: String,
    },
    ToolCallEnd {
        tool_call_id: ToolCallId,
        success: bool,
    },
    TaskProgress {
        phase: TaskProgressPhase,
    },
    TaskComplete,
    Notification {
        message: String,
    },
    ModelFallback {
        reason: String,
        from: String,
        to: String,
    },
    ApiKeyRequired {
        capability: String,
    },
    BudgetWarning,
    BudgetExceeded,
    ContextCompressed {
        saved_tokens: u64,
    },
    MemoryLearned,
    DiffComputed {
        path: String,
    },
    CitationsUpdated,
    InterruptAcknowledged,
    Error {
        code: String,
        message: String,
    },
    AgentComplete,
}

impl AgentEvent {
    /// Shorthand for the common `message` event.
    pub fn message(message: Message) -> Self {
        AgentEvent::Message {
            message: Box::new(message),
        }
    }
}

/// A sink for [`AgentEvent`]s. Implementations must not block the caller for
/// long — the loop controller emits synchronously on its own task.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: AgentEvent);
}

/// An [`EventEmitter`] that forwards every event onto an unbounded
/// `tokio::sync::mpsc` channel, matching the "single emitter channel"
/// description in spec §6. The receiving half is handed to whatever shell
/// (CLI, GUI, IPC transport) consumes the stream; this crate does not
/// prescribe one.
#[derive(Clone)]
pub struct ChannelEventEmitter {
    sender: tokio::sync::mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelEventEmitter {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<AgentEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventEmitter for ChannelEventEmitter {
    fn emit(&self, event: AgentEvent) {
        // The receiver may have been dropped if the shell disconnected
        // mid-run; the loop keeps running and simply stops being observed.
        let _ = self.sender.send(event);
    }
}

/// An [`EventEmitter`] that discards every event. Useful for tests and for
/// embedders that don't need the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventEmitter;

impl EventEmitter for NullEventEmitter {
    fn emit(&self, _event: AgentEvent) {}
}
