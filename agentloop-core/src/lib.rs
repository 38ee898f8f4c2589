//! The agentloop control loop: per-turn lifecycle, anti-pattern detection,
//! circuit breaker, fallback routing, and truncation policy.
//!
//! This crate provides [`AgentLoop`], a ReAct loop controller: call the
//! model, dispatch tool calls through `agentloop-tool`'s scheduler, fold
//! results back into history through `agentloop-context`, repeat until the
//! model produces a plain-text reply or one of the suspension points (max
//! iterations, cancellation, a tripped circuit breaker) ends the run.
//!
//! Key types defined here:
//! - [`AgentLoop`] / [`AgentLoopBuilder`] — the controller and its builder
//! - [`LoopHandle`] — the external cancel/interrupt/steer control surface
//! - [`LoopConfig`] — every tunable policy number gathered into one struct

pub mod anti_pattern;
pub mod circuit_breaker;
pub mod config;
pub mod controller;
pub mod fallback_router;
pub mod id_gen;
pub mod loop_state;
pub mod progress;
pub mod truncation;

pub use anti_pattern::{
    AntiPatternDetector, AntiPatternState, DetectedToolCall, DetectorSignal, IterationClass,
};
pub use circuit_breaker::CircuitBreaker;
pub use config::LoopConfig;
pub use controller::{
    AgentLoop, AgentLoopBuilder, AgentOutcome, NoPromptSources, PromptSourceProvider,
    PromptTemplate,
};
pub use fallback_router::{
    Capability, Credential, CredentialChain, CredentialError, CredentialSource, FallbackConfig,
    FallbackEvent, FallbackModel, FallbackRouter, RoutingOutcome,
};
pub use id_gen::{new_message_id, new_tool_call_id, new_turn_id};
pub use loop_state::{LoopHandle, LoopState, PerTurnGuards};
pub use progress::{NoProgressChecks, ProgressChecks, ProgressNudge};
pub use truncation::{TruncationAction, TruncationPolicy, TruncationState};
