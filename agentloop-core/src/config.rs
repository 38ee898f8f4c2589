//! Policy numbers for the loop controller and its sub-components (spec
//! §9: "policy numbers... the source hard-codes them").

/// Every tunable threshold the loop controller and its collaborators
/// consult, gathered into one struct so an embedder can override any of
/// them without reaching into individual sub-components.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Hard cap on iterations per run. `None` means unbounded.
    pub max_iterations: Option<usize>,
    /// Inject a goal-reminder system message every N iterations (spec
    /// §4.1 step 4).
    pub goal_checkpoint_interval: usize,
    /// Bound on retries when the format-correction message is injected
    /// for a malformed or textual tool call (spec §4.1 step 7).
    pub max_text_tool_call_retries: usize,
    /// Bound on stop-hook-requested continuations before the loop gives
    /// up honoring them (spec §4.1 step 8).
    pub max_stop_hook_retries: usize,
    /// Consecutive tool failures before the circuit breaker trips
    /// (default 5, spec §4.4).
    pub max_consecutive_failures: u32,
    /// Optional cooldown after which the breaker auto-resets on read.
    pub circuit_breaker_cooldown: Option<std::time::Duration>,
    /// Read-only stall thresholds: warning before first write, warning
    /// after first write, hard limit (spec §4.3).
    pub read_only_warn_before_write: u32,
    pub read_only_warn_after_write: u32,
    pub read_only_hard_limit: u32,
    /// Repeated-failure escalation strike count before `ESCALATE_TO_USER`
    /// (spec §4.3, "4 strikes").
    pub repeated_failure_strikes: u32,
    /// Exact-arguments-and-same-error repetition cap (default 3).
    pub exact_args_repeat_cap: u32,
    /// Duplicate-call count that triggers the "you're looping" warning
    /// (default 3; the 2nd identical read-only call gets a softer hint).
    pub duplicate_call_warning_count: u32,
    /// Consecutive `exploring` iterations before the write-demanding
    /// nudge fires (spec §4.3, "reaches 3").
    pub exploring_streak_limit: u32,
    /// Upper bound on concurrently in-flight tool calls within one
    /// dependency layer (spec §4.2). Mirrors
    /// `agentloop_tool::scheduler::MAX_PARALLEL_TOOLS`; exposed here so an
    /// embedder can tune it alongside the rest of the loop's policy
    /// numbers without reaching into the scheduler directly.
    pub max_parallel_tools: usize,
    /// How many times each of the stop-time nudges (read-only, todo,
    /// file-completion, goal-verification) may fire per run before the
    /// loop stops holding the model back from ending the turn (spec §4.1
    /// step 8: "each bounded").
    pub max_stop_nudges_per_kind: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: Some(50),
            goal_checkpoint_interval: 10,
            max_text_tool_call_retries: 2,
            max_stop_hook_retries: 2,
            max_consecutive_failures: 5,
            circuit_breaker_cooldown: None,
            read_only_warn_before_write: 5,
            read_only_warn_after_write: 10,
            read_only_hard_limit: 15,
            repeated_failure_strikes: 4,
            exact_args_repeat_cap: 3,
            duplicate_call_warning_count: 3,
            exploring_streak_limit: 3,
            max_parallel_tools: 4,
            max_stop_nudges_per_kind: 1,
        }
    }
}
