//! Token estimation and the budget collaborator (spec §4.5's "Token
//! accounting" and §4.1 step 2's "budget collaborator").
//!
//! Grounded on the teacher's `agent-context::TokenCounter`: a heuristic
//! chars-per-token estimator, used only as a fallback when the provider
//! doesn't report real usage.

use agentloop_types::{ContentPart, Message, MessageBody, TokenUsage};

/// Estimates token counts from text using a configurable chars-per-token
/// ratio. Real tokenization varies per model; 4.0 chars/token approximates
/// the Claude/GPT family.
#[derive(Debug, Clone)]
pub struct TokenCounter {
    chars_per_token: f32,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self { chars_per_token: 4.0 }
    }

    pub fn with_ratio(chars_per_token: f32) -> Self {
        Self { chars_per_token }
    }

    pub fn estimate_text(&self, text: &str) -> usize {
        (text.len() as f32 / self.chars_per_token).ceil() as usize
    }

    /// Estimates tokens over the full message slice.
    pub fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }

    /// Estimates tokens over only the last `n` messages, per spec §4.5's
    /// fallback estimator ("over the last 10 messages").
    pub fn estimate_recent(&self, messages: &[Message], n: usize) -> usize {
        let start = messages.len().saturating_sub(n);
        self.estimate_messages(&messages[start..])
    }

    fn estimate_message(&self, message: &Message) -> usize {
        let role_overhead = 4;
        let content_tokens = match &message.content {
            MessageBody::Text(text) => self.estimate_text(text),
            MessageBody::Parts(parts) => parts.iter().map(|p| self.estimate_part(p)).sum(),
        };
        let thinking_tokens = message
            .thinking
            .as_deref()
            .map(|t| self.estimate_text(t))
            .unwrap_or(0);
        let tool_call_tokens: usize = message
            .tool_calls
            .as_ref()
            .map(|calls| {
                calls
                    .iter()
                    .map(|c| self.estimate_text(&c.name) + 8)
                    .sum()
            })
            .unwrap_or(0);
        let tool_result_tokens: usize = message
            .tool_results
            .as_ref()
            .map(|results| {
                results
                    .iter()
                    .map(|r| {
                        r.output
                            .as_ref()
                            .map(|v| self.estimate_text(&v.to_string()))
                            .unwrap_or(0)
                    })
                    .sum()
            })
            .unwrap_or(0);
        role_overhead + content_tokens + thinking_tokens + tool_call_tokens + tool_result_tokens
    }

    fn estimate_part(&self, part: &ContentPart) -> usize {
        match part {
            ContentPart::Text { text } => self.estimate_text(text),
            ContentPart::Image { .. } => 300,
        }
    }
}

/// The "budget collaborator" the Loop Controller consults before each
/// iteration (spec §4.1 step 2) and the context manager feeds token usage
/// to after each inference (spec §4.5).
pub trait Budget: Send + Sync {
    /// Whether further inference should be blocked.
    fn is_blocked(&self) -> bool;

    /// Records newly-spent tokens.
    fn record(&self, usage: &TokenUsage);

    /// Fraction of the budget consumed so far, in `[0.0, 1.0+]`.
    fn fraction_used(&self) -> f64;
}

/// A simple in-memory token-ceiling [`Budget`]. The spec treats budget as
/// an external collaborator, but a usable crate needs at least one
/// concrete implementation to be testable (DESIGN.md).
pub struct TokenCeilingBudget {
    ceiling: u64,
    spent: std::sync::atomic::AtomicU64,
}

impl TokenCeilingBudget {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            spent: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn spent(&self) -> u64 {
        self.spent.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Budget for TokenCeilingBudget {
    fn is_blocked(&self) -> bool {
        self.spent() >= self.ceiling
    }

    fn record(&self, usage: &TokenUsage) {
        self.spent
            .fetch_add(usage.total(), std::sync::atomic::Ordering::SeqCst);
    }

    fn fraction_used(&self) -> f64 {
        if self.ceiling == 0 {
            return 1.0;
        }
        self.spent() as f64 / self.ceiling as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_types::Role;

    fn text_message(role: Role, text: &str) -> Message {
        Message {
            id: "m1".into(),
            role,
            content: MessageBody::Text(text.to_string()),
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
    fn estimates_text_with_default_ratio() {
        let counter = TokenCounter::new();
        assert_eq!(counter.estimate_text(&"a".repeat(400)), 100);
    }

    #[test]
    fn estimates_messages_with_role_overhead() {
        let counter = TokenCounter::new();
        let messages = vec![text_message(Role::User, &"a".repeat(400))];
        assert_eq!(counter.estimate_messages(&messages), 104);
    }

    #[test]
    fn estimate_recent_only_considers_tail() {
        let counter = TokenCounter::new();
        let messages: Vec<Message> = (0..20)
            .map(|_| text_message(Role::User, &"a".repeat(40)))
            .collect();
        let all = counter.estimate_messages(&messages);
        let recent = counter.estimate_recent(&messages, 10);
        assert!(recent < all);
        assert_eq!(recent, counter.estimate_messages(&messages[10..]));
    }

    #[test]
    fn token_ceiling_budget_blocks_once_spent_reaches_ceiling() {
        let budget = TokenCeilingBudget::new(1000);
        assert!(!budget.is_blocked());
        budget.record(&TokenUsage {
            input_tokens: 600,
            output_tokens: 500,
            ..Default::default()
        });
        assert!(budget.is_blocked());
        assert!(budget.fraction_used() >= 1.0);
    }

    #[test]
    fn token_ceiling_budget_fraction_used_tracks_spend() {
        let budget = TokenCeilingBudget::new(1000);
        budget.record(&TokenUsage {
            input_tokens: 400,
            output_tokens: 0,
            ..Default::default()
        });
        assert!((budget.fraction_used() - 0.4).abs() < f64::EPSILON);
    }
}
