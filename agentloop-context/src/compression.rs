//! History compression and proactive compaction (spec §4.5).
//!
//! Grounded on the teacher's `SlidingWindowStrategy` (keep-the-tail,
//! compact-the-rest shape) and `SummarizationStrategy` (summary message
//! replacing a compacted span), combined into the single threshold/target
//! compressor plus a separate proactive-compaction path the spec
//! describes as two distinct mechanisms.

use agentloop_types::{CompactionBlock, Message, MessageId, Role};

use crate::config::ContextConfig;
use crate::tokens::TokenCounter;

/// Outcome of a compression pass: the (possibly unchanged) message list
/// plus how many tokens were saved, for the `context_compressed` event.
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub messages: Vec<Message>,
    pub tokens_saved: u64,
    pub compressed: bool,
}

/// Compresses `history` when its estimated token count exceeds
/// `compression_threshold_tokens`. Preserves the most recent
/// `recent_message_floor` messages and all user messages; everything else
/// may be folded into summary messages that keep their original `id`.
pub fn compress_history(
    history: Vec<Message>,
    config: &ContextConfig,
    counter: &TokenCounter,
) -> CompressionOutcome {
    let before_tokens = counter.estimate_messages(&history) as u64;
    if before_tokens <= config.compression_threshold_tokens {
        return CompressionOutcome {
            messages: history,
            tokens_saved: 0,
            compressed: false,
        };
    }

    let floor = config.recent_message_floor.min(history.len());
    let split_at = history.len() - floor;
    let (candidates, preserved_tail) = history.split_at(split_at);

    let mut kept = Vec::new();
    let mut compactable = Vec::new();
    for message in candidates {
        if message.role == Role::User {
            kept.push(message.clone());
        } else {
            compactable.push(message.clone());
        }
    }

    if compactable.is_empty() {
        return CompressionOutcome {
            messages: history,
            tokens_saved: 0,
            compressed: false,
        };
    }

    let compactable_tokens = counter.estimate_messages(&compactable) as u64;
    let summary = summarize_span(&compactable);
    let summary_message = Message {
        id: first_id(&compactable),
        role: Role::Assistant,
        content: agentloop_types::MessageBody::Text(summary.clone()),
        timestamp: compactable
            .first()
            .map(|m| m.timestamp)
            .unwrap_or_else(chrono::Utc::now),
        tool_calls: None,
        tool_results: None,
        attachments: None,
        thinking: None,
        compaction: Some(CompactionBlock {
            messages_compacted: compactable.len(),
            tokens_saved: 0,
            summary,
        }),
        is_meta: false,
    };

    let mut result = Vec::with_capacity(kept.len() + 1 + preserved_tail.len());
    result.extend(kept);
    result.push(summary_message);
    result.extend(preserved_tail.iter().cloned());

    let after_tokens = counter.estimate_messages(&result) as u64;
    let tokens_saved = before_tokens.saturating_sub(after_tokens);

    if let Some(last) = result.iter_mut().rev().find(|m| m.compaction.is_some()) {
        if let Some(block) = &mut last.compaction {
            block.tokens_saved = tokens_saved;
        }
    }

    let _ = compactable_tokens;
    CompressionOutcome {
        messages: result,
        tokens_saved,
        compressed: true,
    }
}

fn first_id(messages: &[Message]) -> MessageId {
    messages
        .first()
        .map(|m| m.id.clone())
        .unwrap_or_else(|| MessageId::from("compacted"))
}

fn summarize_span(messages: &[Message]) -> String {
    format!(
        "[Compacted {} earlier message(s) to stay within the history budget]",
        messages.len()
    )
}

/// Outcome of a proactive compaction check.
#[derive(Debug, Clone)]
pub enum ProactiveOutcome {
    NotNeeded,
    Compacted(CompressionOutcome),
}

/// Fires proactive compaction when `input_tokens` exceeds the configured
/// fraction of the assumed context window (spec §4.5).
pub fn maybe_proactively_compact(
    history: Vec<Message>,
    input_tokens: u64,
    config: &ContextConfig,
    counter: &TokenCounter,
) -> ProactiveOutcome {
    if input_tokens < config.proactive_compaction_threshold() {
        return ProactiveOutcome::NotNeeded;
    }
    let forced_threshold = ContextConfig {
        compression_threshold_tokens: 0,
        ..config.clone()
    };
    ProactiveOutcome::Compacted(compress_history(history, &forced_threshold, counter))
}

/// Whether a context-length-exceeded retry should reduce the output-token
/// budget and try once more, per spec §4.5's hard-limit-overrun path.
pub fn overrun_retry_max_tokens(original_max_tokens: u32, config: &ContextConfig) -> u32 {
    ((original_max_tokens as f64) * config.overrun_retry_output_fraction) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_types::MessageBody;

    fn filler_message(id: &str, role: Role, size: usize) -> Message {
        Message {
            id: MessageId::from(id),
            role,
            content: MessageBody::Text("x".repeat(size)),
            timestamp: chrono::Utc::now(),
            tool_calls: None,
            tool_results: None,
            attachments: None,
            thinking: None,
            compaction: None,
            is_meta: false,
        }
    }

    #[test]
    fn below_threshold_is_untouched() {
        let config = ContextConfig::default();
        let counter = TokenCounter::new();
        let history = vec![filler_message("m1", Role::User, 100)];
        let outcome = compress_history(history.clone(), &config, &counter);
        assert!(!outcome.compressed);
        assert_eq!(outcome.messages.len(), history.len());
    }

    #[test]
    fn above_threshold_compacts_and_preserves_tail_and_user_messages() {
        let config = ContextConfig::default();
        let counter = TokenCounter::new();
        let mut history = Vec::new();
        for i in 0..40 {
            let role = if i % 5 == 0 { Role::User } else { Role::Assistant };
            history.push(filler_message(&format!("m{i}"), role, 1000));
        }
        let outcome = compress_history(history.clone(), &config, &counter);
        assert!(outcome.compressed);
        assert!(outcome.tokens_saved > 0);
        let tail_ids: Vec<&str> = history[history.len() - config.recent_message_floor..]
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        for id in tail_ids {
            assert!(outcome.messages.iter().any(|m| m.id.as_str() == id));
        }
        let user_count_before = history.iter().filter(|m| m.role == Role::User).count();
        let user_count_after = outcome.messages.iter().filter(|m| m.role == Role::User).count();
        assert_eq!(user_count_before, user_count_after);
    }

    #[test]
    fn proactive_compaction_fires_above_threshold() {
        let config = ContextConfig::default();
        let counter = TokenCounter::new();
        let history = vec![filler_message("m1", Role::Assistant, 10)];
        let threshold = config.proactive_compaction_threshold();
        let outcome = maybe_proactively_compact(history, threshold + 1, &config, &counter);
        assert!(matches!(outcome, ProactiveOutcome::Compacted(_)));
    }

    #[test]
    fn proactive_compaction_skips_below_threshold() {
        let config = ContextConfig::default();
        let counter = TokenCounter::new();
        let history = vec![filler_message("m1", Role::Assistant, 10)];
        let outcome = maybe_proactively_compact(history, 1, &config, &counter);
        assert!(matches!(outcome, ProactiveOutcome::NotNeeded));
    }

    #[test]
    fn overrun_retry_reduces_max_tokens() {
        let config = ContextConfig::default();
        assert_eq!(overrun_retry_max_tokens(1000, &config), 700);
    }
}
