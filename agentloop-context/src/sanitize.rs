//! Tool-result sanitization before history storage (spec §4.5).
//!
//! Walks a result's `metadata`/`output` JSON, redacting large
//! base64-looking strings and always-stripped known fields. Grounded on
//! the teacher's `ToolResultClearingStrategy` (walks and replaces content
//! in place while preserving message shape) generalized from whole-result
//! clearing to field-level redaction.

use agentloop_types::ToolResult;
use serde_json::Value;

use crate::config::ContextConfig;

/// Fields that are always stripped regardless of size, per spec §4.5.
const ALWAYS_STRIPPED_FIELDS: &[&str] = &["images", "screenshots", "pdfImages", "audio", "video"];

/// Sanitizes one [`ToolResult`] in place, redacting large base64-looking
/// strings from `output`/`metadata` and always stripping known binary
/// fields. Idempotent: sanitizing an already-sanitized result is a no-op.
pub fn sanitize_tool_result(result: &mut ToolResult, config: &ContextConfig) {
    if let Some(output) = result.output.take() {
        result.output = Some(sanitize_value(output, config));
    }
    if let Some(metadata) = result.metadata.take() {
        result.metadata = Some(sanitize_value(metadata, config));
    }
}

fn sanitize_value(value: Value, config: &ContextConfig) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, val)| {
                    if ALWAYS_STRIPPED_FIELDS.contains(&key.as_str()) {
                        (key, redacted_placeholder(val.to_string().len() as u64))
                    } else {
                        (key, sanitize_value(val, config))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|item| sanitize_value(item, config)).collect())
        }
        Value::String(text) => {
            if is_large_binary_looking(&text, config) {
                redacted_placeholder(text.len() as u64)
            } else {
                Value::String(text)
            }
        }
        other => other,
    }
}

fn redacted_placeholder(byte_len: u64) -> Value {
    let kb = byte_len / 1024;
    Value::String(format!("[BINARY_DATA_FILTERED: {kb}KB]"))
}

fn is_large_binary_looking(text: &str, config: &ContextConfig) -> bool {
    if (text.len() as u64) <= config.sanitize_threshold_bytes {
        return false;
    }
    text.starts_with("data:") || looks_like_base64(text)
}

fn looks_like_base64(text: &str) -> bool {
    // Sample by chars, not bytes: byte 256 of a >10KB string can land inside
    // a multibyte UTF-8 character, and slicing there would panic.
    let sample: Vec<char> = text.chars().take(256).collect();
    let base64_chars = sample
        .iter()
        .filter(|c| c.is_ascii_alphanumeric() || **c == '+' || **c == '/' || **c == '=')
        .count();
    base64_chars == sample.len()
}
