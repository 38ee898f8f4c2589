//! The context / message manager for the agentloop control loop.
//!
//! Owns system-prompt assembly, model-message synthesis, large-file and
//! attachment previewing, history compression and proactive compaction,
//! tool-result sanitization, and token accounting. The loop controller
//! (`agentloop-core`) drives this crate once per iteration; nothing here
//! knows about tool dispatch or anti-pattern detection.

pub mod attachments;
pub mod compression;
pub mod config;
pub mod prompt;
pub mod sanitize;
pub mod synthesis;
pub mod tokens;

pub use attachments::attachment_to_parts;
pub use compression::{
    compress_history, maybe_proactively_compact, overrun_retry_max_tokens, CompressionOutcome,
    ProactiveOutcome,
};
pub use config::ContextConfig;
pub use prompt::{
    assemble_system_prompt, vision_only_prompt, AssembledPrompt, GenerationTier, PromptRequest,
    PromptSources, TaskComplexity, WorkingDirectoryKind,
};
pub use sanitize::sanitize_tool_result;
pub use synthesis::synthesize_messages;
pub use tokens::{Budget, TokenCeilingBudget, TokenCounter};

use agentloop_types::{AgentEvent, EventEmitter, Message, ToolResult};

/// Coordinates the context-manager passes the loop controller needs each
/// turn: sanitize fresh tool results, append them to history, compress if
/// over threshold, and report token accounting against the budget.
pub struct ContextManager {
    config: ContextConfig,
    counter: TokenCounter,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            counter: TokenCounter::new(),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    /// Sanitizes a freshly-produced batch of tool results before they are
    /// folded into a `tool` history message.
    pub fn sanitize_results(&self, results: &mut [ToolResult]) {
        for result in results {
            sanitize_tool_result(result, &self.config);
        }
    }

    /// Runs the threshold-triggered compressor over `history`, emitting
    /// `context_compressed` on the given emitter when it fires.
    pub fn compress_if_needed(
        &self,
        history: Vec<Message>,
        emitter: &dyn EventEmitter,
    ) -> Vec<Message> {
        let outcome = compress_history(history, &self.config, &self.counter);
        if outcome.compressed {
            emitter.emit(AgentEvent::ContextCompressed {
                saved_tokens: outcome.tokens_saved,
            });
        }
        outcome.messages
    }

    /// Runs the proactive compaction check against the latest input token
    /// count, emitting `context_compressed` when it fires.
    pub fn proactively_compact_if_needed(
        &self,
        history: Vec<Message>,
        input_tokens: u64,
        emitter: &dyn EventEmitter,
    ) -> Vec<Message> {
        match maybe_proactively_compact(history.clone(), input_tokens, &self.config, &self.counter)
        {
            ProactiveOutcome::NotNeeded => history,
            ProactiveOutcome::Compacted(outcome) => {
                emitter.emit(AgentEvent::ContextCompressed {
                    saved_tokens: outcome.tokens_saved,
                });
                outcome.messages
            }
        }
    }

    /// Checks the budget fraction and emits `budget_warning` once the
    /// configured fraction is crossed. Callers are responsible for only
    /// calling this once per inference so the event fires at most once.
    pub fn check_budget_warning(&self, budget: &dyn Budget, emitter: &dyn EventEmitter) {
        if budget.fraction_used() >= self.config.budget_warning_fraction {
            emitter.emit(AgentEvent::BudgetWarning);
        }
    }
}
