//! ID generation for turns, synthesized messages, and tool calls the
//! loop controller synthesizes itself (textual tool-call recovery).

use agentloop_types::{MessageId, ToolCallId, TurnId};
use uuid::Uuid;

pub fn new_turn_id() -> TurnId {
    TurnId::new(Uuid::new_v4().to_string())
}

pub fn new_message_id() -> MessageId {
    MessageId::new(Uuid::new_v4().to_string())
}

pub fn new_tool_call_id() -> ToolCallId {
    ToolCallId::new(Uuid::new_v4().to_string())
}
