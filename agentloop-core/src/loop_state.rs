//! Per-run loop state (spec §3) and the external control surface used to
//! cancel, interrupt, or steer a running loop from another task.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use agentloop_types::TurnId;

use crate::anti_pattern::AntiPatternState;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::LoopConfig;
use crate::truncation::TruncationState;

/// The external control surface for one in-flight run. Cloneable and
/// `Send + Sync`: an embedder holds one half while the loop controller
/// owns the other, checking it between iterations and at tool-dispatch
/// suspension points (spec §5's cancellation/interrupt/steer semantics).
#[derive(Clone)]
pub struct LoopHandle {
    cancelled: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
    needs_reinference: Arc<AtomicBool>,
    steer_message: Arc<Mutex<Option<String>>>,
    cancellation: CancellationToken,
}

impl LoopHandle {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            interrupted: Arc::new(AtomicBool::new(false)),
            needs_reinference: Arc::new(AtomicBool::new(false)),
            steer_message: Arc::new(Mutex::new(None)),
            cancellation: CancellationToken::new(),
        }
    }

    /// Requests the run stop entirely at its next suspension point.
    /// Cancellation takes effect even mid-tool-dispatch (spec §5): the
    /// token is also handed to the tool scheduler so in-flight calls can
    /// observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Requests the current turn's tool batch be abandoned once it
    /// finishes, without ending the run (spec §4.1's distinction between
    /// cancellation and interruption).
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Consumes the interrupt flag, returning whether it was set.
    pub fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Injects a user message to be woven into history before the next
    /// inference, and marks the loop as needing a fresh model turn rather
    /// than continuing whatever it was doing (spec §4.1 "steer check").
    pub fn steer(&self, message: impl Into<String>) {
        *self.steer_message.lock().unwrap_or_else(|poison| poison.into_inner()) =
            Some(message.into());
        self.needs_reinference.store(true, Ordering::SeqCst);
    }

    /// Consumes and returns the pending steer message, if any, and clears
    /// the re-inference flag.
    pub fn take_steer_message(&self) -> Option<String> {
        self.needs_reinference.store(false, Ordering::SeqCst);
        self.steer_message.lock().unwrap_or_else(|poison| poison.into_inner()).take()
    }

    pub fn needs_reinference(&self) -> bool {
        self.needs_reinference.load(Ordering::SeqCst)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

impl Default for LoopHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-turn nudge guards that must reset every turn rather than persist
/// across the run (spec §3: "nudge counters... structured-output retry
/// count, network-retry guard, context-overflow-retried guard,
/// truncation-retried guard").
#[derive(Debug, Clone, Default)]
pub struct PerTurnGuards {
    pub text_tool_call_retries: usize,
    pub stop_hook_retries: usize,
    pub network_retry_used: bool,
    pub context_overflow_retried: bool,
}

impl PerTurnGuards {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// All mutable state the loop controller carries across one run (spec
/// §3's "Loop State"). Owned exclusively by the controller's `run`
/// method; never shared or cloned.
pub struct LoopState {
    pub iteration: usize,
    pub current_turn_id: TurnId,
    pub per_turn_tool_names: Vec<String>,
    pub modified_files: HashSet<String>,
    last_modified_file: Option<String>,
    pub anti_pattern: AntiPatternState,
    pub circuit_breaker: CircuitBreaker,
    pub truncation: TruncationState,
    pub per_turn_guards: PerTurnGuards,
    pub todo_nudges_issued: usize,
    pub file_completion_nudges_issued: usize,
    pub goal_verification_nudges_issued: usize,
    pub read_only_stop_nudges_issued: usize,
}

impl LoopState {
    pub fn new(config: &LoopConfig, first_turn_id: TurnId) -> Self {
        Self {
            iteration: 0,
            current_turn_id: first_turn_id,
            per_turn_tool_names: Vec::new(),
            modified_files: HashSet::new(),
            last_modified_file: None,
            anti_pattern: AntiPatternState::new(),
            circuit_breaker: CircuitBreaker::new(
                config.max_consecutive_failures,
                config.circuit_breaker_cooldown,
            ),
            truncation: TruncationState::new(),
            per_turn_guards: PerTurnGuards::default(),
            todo_nudges_issued: 0,
            file_completion_nudges_issued: 0,
            goal_verification_nudges_issued: 0,
            read_only_stop_nudges_issued: 0,
        }
    }

    /// Starts a fresh turn: bumps the iteration counter, assigns a new
    /// turn id, and clears per-turn (not per-run) guards.
    pub fn begin_turn(&mut self, turn_id: TurnId) {
        self.iteration += 1;
        self.current_turn_id = turn_id;
        self.per_turn_tool_names.clear();
        self.per_turn_guards.reset();
    }

    /// Records a file touched by a write-classified tool this run. The
    /// anti-pattern read-only-streak reset happens separately, via
    /// `AntiPatternDetector::record_write` — this just tracks the set of
    /// paths for the exit summary and duplicate-write checks.
    pub fn record_modified_file(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.last_modified_file = Some(path.clone());
        self.modified_files.insert(path);
    }

    /// The most recently written path this run, if any, consulted by the
    /// stop-time file-completion nudge (spec §4.1 step 8).
    pub fn last_modified_file(&self) -> Option<&str> {
        self.last_modified_file.as_deref()
    }

    pub fn at_goal_checkpoint(&self, interval: usize) -> bool {
        interval > 0 && self.iteration > 0 && self.iteration % interval == 0
    }

    pub fn exceeded_max_iterations(&self, max: Option<usize>) -> bool {
        max.is_some_and(|max| self.iteration >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_sets_flag_and_tokens() {
        let handle = LoopHandle::new();
        assert!(!handle.is_cancelled());
        let token = handle.cancellation_token();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[test]
    fn interrupt_is_take_once() {
        let handle = LoopHandle::new();
        handle.interrupt();
        assert!(handle.is_interrupted());
        assert!(handle.take_interrupted());
        assert!(!handle.take_interrupted());
    }

    #[test]
    fn steer_sets_message_and_reinference_flag() {
        let handle = LoopHandle::new();
        assert!(!handle.needs_reinference());
        handle.steer("focus on the other file instead");
        assert!(handle.needs_reinference());
        let message = handle.take_steer_message();
        assert_eq!(message.as_deref(), Some("focus on the other file instead"));
        assert!(!handle.needs_reinference());
        assert!(handle.take_steer_message().is_none());
    }

    #[test]
    fn begin_turn_advances_iteration_and_clears_per_turn_state() {
        let config = LoopConfig::default();
        let mut state = LoopState::new(&config, TurnId::from("t0"));
        state.per_turn_tool_names.push("read_file".to_string());
        state.per_turn_guards.text_tool_call_retries = 1;
        state.begin_turn(TurnId::from("t1"));
        assert_eq!(state.iteration, 1);
        assert_eq!(state.current_turn_id.as_str(), "t1");
        assert!(state.per_turn_tool_names.is_empty());
        assert_eq!(state.per_turn_guards.text_tool_call_retries, 0);
    }

    #[test]
    fn goal_checkpoint_fires_on_interval() {
        let mut state = LoopState::new(&LoopConfig::default(), TurnId::from("t0"));
        for i in 1..=10 {
            state.begin_turn(TurnId::from(format!("t{i}")));
        }
        assert!(state.at_goal_checkpoint(10));
    }

    #[test]
    fn exceeded_max_iterations_respects_unbounded() {
        let state = LoopState::new(&LoopConfig::default(), TurnId::from("t0"));
        assert!(!state.exceeded_max_iterations(None));
    }
}
