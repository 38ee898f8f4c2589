//! Truncation policy (spec §4.7): what to do when the model signals
//! `truncated` on a response.

use agentloop_types::{ToolArguments, ToolCall, ToolResult};

use crate::id_gen::new_message_id;

/// The tool name convention used to recognise a write-to-file call. Tool
/// implementations are free to register under other names; this is a
/// best-effort heuristic over the common convention, same as the scheduler's
/// `mcp_`-prefix classification in `agentloop-tool`.
const WRITE_FILE_TOOL: &str = "write_file";
const BASH_TOOL: &str = "bash";

/// What the loop controller should do in response to a truncated
/// [`agentloop_types::ModelResponse`].
#[derive(Debug, Clone, PartialEq)]
pub enum TruncationAction {
    /// Not truncated, or a text-response retry already happened this run.
    None,
    /// A write-file call was cut off mid-batch: tell the model to split
    /// the change into a skeleton plus incremental edits, and raise the
    /// token ceiling.
    SplitIntoSkeleton { boosted_max_tokens: u32 },
    /// A bash heredoc was cut off: don't execute any call in the batch —
    /// synthesize failures for all of them instead and ask the model to
    /// regenerate.
    RefuseHeredocBatch {
        synthetic_results: Vec<ToolResult>,
        directive: String,
    },
    /// Some other tool-call batch was cut off: ask the model to continue
    /// the previous action, and raise the token ceiling.
    ContinuePreviousAction { boosted_max_tokens: u32 },
    /// A plain text response was cut off: retry once with a doubled
    /// ceiling.
    RetryTextResponse { boosted_max_tokens: u32 },
}

/// Doubles `current`, capped at `model_max`.
fn boosted(current: u32, model_max: u32) -> u32 {
    current.saturating_mul(2).min(model_max)
}

fn call_is_heredoc_bash(call: &ToolCall) -> bool {
    if call.name != BASH_TOOL {
        return false;
    }
    let Some(map) = call.arguments.as_parsed() else {
        return false;
    };
    map.get("command")
        .and_then(|value| value.as_str())
        .is_some_and(|command| command.trim_start().starts_with("<<") || command.contains("<<"))
}

/// Tracks the per-run state the policy needs across truncation events: the
/// text-response retry is a one-shot (spec §4.7, "once per run").
#[derive(Debug, Clone, Default)]
pub struct TruncationState {
    text_retry_used: bool,
}

impl TruncationState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Decides the truncation response for one model turn.
pub struct TruncationPolicy<'a> {
    state: &'a mut TruncationState,
}

impl<'a> TruncationPolicy<'a> {
    pub fn new(state: &'a mut TruncationState) -> Self {
        Self { state }
    }

    /// For a truncated response that carried tool calls.
    pub fn on_tool_call_truncation(
        &mut self,
        tool_calls: &[ToolCall],
        current_max_tokens: u32,
        model_max_tokens: u32,
    ) -> TruncationAction {
        if tool_calls.iter().any(|call| call.name == WRITE_FILE_TOOL) {
            return TruncationAction::SplitIntoSkeleton {
                boosted_max_tokens: boosted(current_max_tokens, model_max_tokens),
            };
        }

        if tool_calls.iter().any(call_is_heredoc_bash) {
            let synthetic_results = tool_calls
                .iter()
                .map(|call| {
                    ToolResult::failed(
                        call.id.clone(),
                        "truncated mid-heredoc: the call was not executed",
                        0,
                    )
                })
                .collect();
            return TruncationAction::RefuseHeredocBatch {
                synthetic_results,
                directive: "Your last response was truncated inside a shell heredoc, so none \
                            of the pending tool calls were executed. Regenerate the command \
                            without relying on a heredoc — write the content to a temporary \
                            file with a separate call first, or keep the command short enough \
                            to fit in one response."
                    .to_string(),
            };
        }

        TruncationAction::ContinuePreviousAction {
            boosted_max_tokens: boosted(current_max_tokens, model_max_tokens),
        }
    }

    /// For a truncated response with no tool calls (a plain text response
    /// cut off mid-stream). Returns `TruncationAction::None` if the
    /// one-shot retry has already been used this run.
    pub fn on_text_truncation(
        &mut self,
        current_max_tokens: u32,
        model_max_tokens: u32,
    ) -> TruncationAction {
        if self.state.text_retry_used {
            return TruncationAction::None;
        }
        self.state.text_retry_used = true;
        TruncationAction::RetryTextResponse {
            boosted_max_tokens: boosted(current_max_tokens, model_max_tokens),
        }
    }
}

/// Allocates a fresh message id for a directive injected by this policy.
/// Thin wrapper kept here so callers don't need to import `id_gen`
/// directly just to build the directive message.
pub fn directive_message_id() -> agentloop_types::MessageId {
    new_message_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_types::ToolCallId;

    fn call(name: &str, command: Option<&str>) -> ToolCall {
        let raw = match command {
            Some(command) => format!(r#"{{"command": {:?}}}"#, command),
            None => "{}".to_string(),
        };
        ToolCall::new(ToolCallId::from("c1"), name, &raw)
    }

    #[test]
    fn write_file_truncation_splits_into_skeleton() {
        let mut state = TruncationState::new();
        let mut policy = TruncationPolicy::new(&mut state);
        let action = policy.on_tool_call_truncation(&[call("write_file", None)], 1000, 4000);
        assert_eq!(action, TruncationAction::SplitIntoSkeleton { boosted_max_tokens: 2000 });
    }

    #[test]
    fn write_file_truncation_caps_boost_at_model_max() {
        let mut state = TruncationState::new();
        let mut policy = TruncationPolicy::new(&mut state);
        let action = policy.on_tool_call_truncation(&[call("write_file", None)], 3000, 4000);
        assert_eq!(action, TruncationAction::SplitIntoSkeleton { boosted_max_tokens: 4000 });
    }

    #[test]
    fn heredoc_bash_truncation_refuses_whole_batch() {
        let mut state = TruncationState::new();
        let mut policy = TruncationPolicy::new(&mut state);
        let calls = vec![call("bash", Some("cat <<EOF\nhello\nEOF")), call("read_file", None)];
        let action = policy.on_tool_call_truncation(&calls, 1000, 4000);
        match action {
            TruncationAction::RefuseHeredocBatch { synthetic_results, .. } => {
                assert_eq!(synthetic_results.len(), 2);
                assert!(synthetic_results.iter().all(|r| !r.success));
            }
            other => panic!("expected RefuseHeredocBatch, got {other:?}"),
        }
    }

    #[test]
    fn other_tool_truncation_continues_previous_action() {
        let mut state = TruncationState::new();
        let mut policy = TruncationPolicy::new(&mut state);
        let action = policy.on_tool_call_truncation(&[call("read_file", None)], 1000, 4000);
        assert_eq!(action, TruncationAction::ContinuePreviousAction { boosted_max_tokens: 2000 });
    }

    #[test]
    fn text_truncation_retries_once_then_gives_up() {
        let mut state = TruncationState::new();
        let mut policy = TruncationPolicy::new(&mut state);
        let first = policy.on_text_truncation(1000, 4000);
        assert_eq!(first, TruncationAction::RetryTextResponse { boosted_max_tokens: 2000 });
        let second = policy.on_text_truncation(2000, 4000);
        assert_eq!(second, TruncationAction::None);
    }
}
