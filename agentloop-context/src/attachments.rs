//! Large-file and attachment handling (spec §4.5).
//!
//! Files above the configured threshold are sent as a preview plus an
//! instruction to call `read_file`; images become base64 content parts
//! directly. Grounded on the teacher's attachment handling pattern in
//! `neuron-context`'s tool-result clearing strategy, generalized from
//! tool-result truncation to user-attachment previewing.

use agentloop_types::{Attachment, AttachmentData, ContentPart};

use crate::config::ContextConfig;

/// Converts one [`Attachment`] into the content parts it contributes to a
/// synthesized user message, honoring the remaining character budget.
pub fn attachment_to_parts(
    attachment: &Attachment,
    config: &ContextConfig,
    remaining_char_budget: usize,
) -> Vec<ContentPart> {
    match &attachment.data {
        AttachmentData::Base64 { content } => vec![ContentPart::Image {
            media_type: attachment.media_type.clone(),
            base64: content.clone(),
        }],
        AttachmentData::Text { content } => {
            let text = if content.len() as u64 > config.large_file_threshold_bytes {
                preview_with_instruction(&attachment.name, content, config.preview_line_count)
            } else {
                content.clone()
            };
            let text = if text.len() > remaining_char_budget {
                elide_for_budget(&attachment.name, &text, remaining_char_budget)
            } else {
                text
            };
            vec![ContentPart::Text { text }]
        }
    }
}

fn preview_with_instruction(name: &str, content: &str, preview_lines: usize) -> String {
    let preview: String = content
        .lines()
        .take(preview_lines)
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "[{name}: showing first {preview_lines} lines of a larger file]\n{preview}\n\
         [call read_file on \"{name}\" for the full content]"
    )
}

fn elide_for_budget(name: &str, text: &str, budget: usize) -> String {
    if budget == 0 {
        return format!("[ATTACHMENT_ELIDED: {name} omitted, attachment character cap reached]");
    }
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}\n[ATTACHMENT_TRUNCATED: {name} exceeded the attachment character cap]")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(name: &str, content: &str) -> Attachment {
        Attachment {
            name: name.to_string(),
            media_type: "text/plain".to_string(),
            data: AttachmentData::Text {
                content: content.to_string(),
            },
        }
    }

    #[test]
    fn small_file_passed_through_in_full() {
        let config = ContextConfig::default();
        let file = attachment("small.txt", "hello world");
        let parts = attachment_to_parts(&file, &config, config.attachment_char_cap);
        match &parts[0] {
            ContentPart::Text { text } => assert_eq!(text, "hello world"),
            _ => panic!("expected text part"),
        }
    }

    #[test]
    fn large_file_previewed_with_read_instruction() {
        let config = ContextConfig::default();
        let big_content = (0..500)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let file = attachment("big.txt", &big_content);
        let parts = attachment_to_parts(&file, &config, config.attachment_char_cap);
        match &parts[0] {
            ContentPart::Text { text } => {
                assert!(text.contains("read_file"));
                assert!(text.contains("line 0"));
                assert!(!text.contains("line 400"));
            }
            _ => panic!("expected text part"),
        }
    }

    #[test]
    fn base64_attachment_becomes_image_part() {
        let config = ContextConfig::default();
        let file = Attachment {
            name: "photo.png".to_string(),
            media_type: "image/png".to_string(),
            data: AttachmentData::Base64 {
                content: "aGVsbG8=".to_string(),
            },
        };
        let parts = attachment_to_parts(&file, &config, config.attachment_char_cap);
        match &parts[0] {
            ContentPart::Image { media_type, base64 } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(base64, "aGVsbG8=");
            }
            _ => panic!("expected image part"),
        }
    }

    #[test]
    fn attachment_over_remaining_budget_is_elided() {
        let config = ContextConfig::default();
        let file = attachment("small.txt", "hello world");
        let parts = attachment_to_parts(&file, &config, 0);
        match &parts[0] {
            ContentPart::Text { text } => assert!(text.contains("ATTACHMENT_ELIDED")),
            _ => panic!("expected text part"),
        }
    }
}
