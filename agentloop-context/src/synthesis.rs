//! Model-message synthesis (spec §4.5): reshapes internal four-role
//! history into the three-role wire format the provider boundary expects.
//!
//! Grounded on the teacher's provider-message construction in
//! `neuron-loop/src/step.rs`, generalized to cover tool-result collapsing
//! and tool-call summarization, which the teacher does inline in the step
//! loop rather than as a standalone pass.

use agentloop_types::{
    ContentPart, Message, MessageBody, ProviderContent, ProviderMessage, Role, ToolArguments,
    WireRole,
};

use crate::attachments::attachment_to_parts;
use crate::config::ContextConfig;

const ELLIPSIS_MARKER: &str = "...";

/// Synthesizes the full provider-facing message list from internal
/// history, applying the per-role transforms spec §4.5 describes.
pub fn synthesize_messages(history: &[Message], config: &ContextConfig) -> Vec<ProviderMessage> {
    history
        .iter()
        .map(|message| synthesize_one(message, config))
        .collect()
}

fn synthesize_one(message: &Message, config: &ContextConfig) -> ProviderMessage {
    match message.role {
        Role::Tool => ProviderMessage {
            role: WireRole::User,
            content: ProviderContent::Text(format!("Tool results:\n{}", tool_results_text(message))),
        },
        Role::Assistant if message.tool_calls.is_some() => ProviderMessage {
            role: WireRole::Assistant,
            content: ProviderContent::Text(summarize_tool_calls(message)),
        },
        Role::User if message.attachments.is_some() => ProviderMessage {
            role: WireRole::User,
            content: ProviderContent::Parts(attachments_to_content(message, config)),
        },
        Role::User => ProviderMessage {
            role: WireRole::User,
            content: text_or_parts(message),
        },
        Role::Assistant => ProviderMessage {
            role: WireRole::Assistant,
            content: text_or_parts(message),
        },
        Role::System => ProviderMessage {
            role: WireRole::System,
            content: text_or_parts(message),
        },
    }
}

fn text_or_parts(message: &Message) -> ProviderContent {
    match &message.content {
        MessageBody::Text(text) => ProviderContent::Text(text.clone()),
        MessageBody::Parts(parts) => ProviderContent::Parts(parts.clone()),
    }
}

fn tool_results_text(message: &Message) -> String {
    let Some(results) = &message.tool_results else {
        return String::new();
    };
    results
        .iter()
        .map(|result| {
            if result.success {
                result
                    .output
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            } else {
                format!("error: {}", result.error.clone().unwrap_or_default())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compacts each tool call on an assistant message into a one-line summary
/// (`"Ran: cmd"`, `"Edited path"`, ...), ellipsising long arguments while
/// preserving the original character count in the ellipsis marker.
fn summarize_tool_calls(message: &Message) -> String {
    let Some(calls) = &message.tool_calls else {
        return String::new();
    };
    calls
        .iter()
        .map(|call| {
            let summary = match call.name.as_str() {
                "bash" => call
                    .arguments
                    .as_parsed()
                    .and_then(|args| args.get("command"))
                    .and_then(|v| v.as_str())
                    .map(|cmd| format!("Ran: {}", ellipsise(cmd, 200)))
                    .unwrap_or_else(|| "Ran: (unknown command)".to_string()),
                "write_file" | "edit_file" => call
                    .arguments
                    .as_parsed()
                    .and_then(|args| args.get("path"))
                    .and_then(|v| v.as_str())
                    .map(|path| format!("Edited {path}"))
                    .unwrap_or_else(|| "Edited (unknown path)".to_string()),
                "read_file" => call
                    .arguments
                    .as_parsed()
                    .and_then(|args| args.get("path"))
                    .and_then(|v| v.as_str())
                    .map(|path| format!("Read {path}"))
                    .unwrap_or_else(|| "Read (unknown path)".to_string()),
                other => match &call.arguments {
                    ToolArguments::Parsed(map) => {
                        format!("Called {other}({})", ellipsise(&serde_json::Value::Object(map.clone()).to_string(), 120))
                    }
                    ToolArguments::ParseError { raw, .. } => {
                        format!("Called {other}({})", ellipsise(raw, 120))
                    }
                },
            };
            summary
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Head-and-tail ellipsises `text` to `max_len` characters, preserving the
/// original character count inside the marker (e.g. `"...{n} chars...`).
fn ellipsise(text: &str, max_len: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_len {
        return text.to_string();
    }
    let original_len = chars.len();
    let marker = format!("{ELLIPSIS_MARKER}[{original_len} chars]{ELLIPSIS_MARKER}");
    let remaining = max_len.saturating_sub(marker.len());
    let head_len = remaining / 2;
    let tail_len = remaining - head_len;
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[chars.len() - tail_len..].iter().collect();
    format!("{head}{marker}{tail}")
}

fn attachments_to_content(message: &Message, config: &ContextConfig) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    if let Some(text) = message.content.as_text() {
        if !text.is_empty() {
            parts.push(ContentPart::Text { text: text.to_string() });
        }
    }
    let Some(attachments) = &message.attachments else {
        return parts;
    };
    let mut char_budget = config.attachment_char_cap;
    for attachment in attachments {
        if char_budget == 0 {
            parts.push(ContentPart::Text {
                text: format!(
                    "[ATTACHMENT_ELIDED: {} omitted, attachment character cap reached]",
                    attachment.name
                ),
            });
            continue;
        }
        let converted = attachment_to_parts(attachment, config, char_budget);
        for part in converted {
            if let ContentPart::Text { text } = &part {
                char_budget = char_budget.saturating_sub(text.len());
            }
            parts.push(part);
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_types::{MessageId, ToolCall, ToolCallId, ToolResult};

    #[test]
    fn tool_message_becomes_user_role_with_prefix() {
        let result = ToolResult::ok(ToolCallId::from("t1"), serde_json::json!("done"), 5);
        let message = Message::tool_results(MessageId::from("m1"), vec![result]);
        let synthesized = synthesize_one(&message, &ContextConfig::default());
        assert_eq!(synthesized.role, WireRole::User);
        match synthesized.content {
            ProviderContent::Text(text) => assert!(text.starts_with("Tool results:\n")),
            _ => panic!("expected text content"),
        }
    }

    #[test]
    fn assistant_tool_calls_summarized_compactly() {
        let call = ToolCall::new(ToolCallId::from("t1"), "bash", r#"{"command": "ls -la"}"#);
        let message = Message::assistant_tool_calls(MessageId::from("m1"), vec![call]);
        let synthesized = synthesize_one(&message, &ContextConfig::default());
        match synthesized.content {
            ProviderContent::Text(text) => assert!(text.contains("Ran: ls -la")),
            _ => panic!("expected text content"),
        }
    }

    #[test]
    fn write_file_call_summarized_as_edited() {
        let call = ToolCall::new(ToolCallId::from("t1"), "write_file", r#"{"path": "src/lib.rs"}"#);
        let message = Message::assistant_tool_calls(MessageId::from("m1"), vec![call]);
        let synthesized = synthesize_one(&message, &ContextConfig::default());
        match synthesized.content {
            ProviderContent::Text(text) => assert_eq!(text, "Edited src/lib.rs"),
            _ => panic!("expected text content"),
        }
    }

    #[test]
    fn ellipsise_preserves_char_count_in_marker() {
        let long = "x".repeat(500);
        let result = ellipsise(&long, 100);
        assert!(result.contains("[500 chars]"));
        assert!(result.len() < long.len());
    }

    #[test]
    fn ellipsise_is_noop_under_limit() {
        let short = "short text";
        assert_eq!(ellipsise(short, 100), short);
    }

    #[test]
    fn other_roles_pass_through() {
        let message = Message::user(MessageId::from("m1"), "hello");
        let synthesized = synthesize_one(&message, &ContextConfig::default());
        assert_eq!(synthesized.role, WireRole::User);
        match synthesized.content {
            ProviderContent::Text(text) => assert_eq!(text, "hello"),
            _ => panic!("expected text content"),
        }
    }
}
