//! Policy numbers for the context manager (spec §4.5, §9's "implementers
//! should parameterise" instruction for the two open questions).

/// All tunable thresholds the context manager consults. Every field has a
/// default matching the number the source hard-codes, per spec §9.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Token count above which history compression triggers (default
    /// 8000).
    pub compression_threshold_tokens: u64,
    /// Target token count after compression (default 4000).
    pub compression_target_tokens: u64,
    /// Minimum number of most-recent messages preserved uncompressed
    /// (default 6).
    pub recent_message_floor: usize,
    /// Fraction of the assumed context window that triggers proactive
    /// compaction (default 0.75 of `assumed_context_window_tokens`). Open
    /// question in spec §9 — the real window size varies per model and is
    /// not consulted here; callers should pass the right window size for
    /// the active model.
    pub proactive_compaction_fraction: f64,
    /// The assumed context window size proactive compaction fractions are
    /// computed against when the caller doesn't know the model's real
    /// window (default 64_000, per spec §9).
    pub assumed_context_window_tokens: u64,
    /// Files above this size are sent as a preview, not in full (default
    /// 8 KB).
    pub large_file_threshold_bytes: u64,
    /// Number of lines shown in a large-file preview (default 30).
    pub preview_line_count: usize,
    /// Total attachment character cap per inference (default 50 000).
    pub attachment_char_cap: usize,
    /// Strings in tool result metadata/output above this size that look
    /// like base64 are redacted (default 10 KB).
    pub sanitize_threshold_bytes: u64,
    /// Fraction of `max_tokens` at which a `budget_warning` fires once
    /// (default 0.8).
    pub budget_warning_fraction: f64,
    /// Output-token budget fraction used on the context-length-exceeded
    /// retry (default 0.7).
    pub overrun_retry_output_fraction: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            compression_threshold_tokens: 8_000,
            compression_target_tokens: 4_000,
            recent_message_floor: 6,
            proactive_compaction_fraction: 0.75,
            assumed_context_window_tokens: 64_000,
            large_file_threshold_bytes: 8 * 1024,
            preview_line_count: 30,
            attachment_char_cap: 50_000,
            sanitize_threshold_bytes: 10 * 1024,
            budget_warning_fraction: 0.8,
            overrun_retry_output_fraction: 0.7,
        }
    }
}

impl ContextConfig {
    /// The token count at which proactive compaction should fire, derived
    /// from `assumed_context_window_tokens` and `proactive_compaction_fraction`.
    pub fn proactive_compaction_threshold(&self) -> u64 {
        (self.assumed_context_window_tokens as f64 * self.proactive_compaction_fraction) as u64
    }
}
