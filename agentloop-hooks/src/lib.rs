//! Hook chains: ordered handler lists fired at fixed points in the loop,
//! each returning `{should_proceed, message?}` (spec §9). The dispatcher
//! short-circuits on the first handler that says "do not proceed."
//!
//! The loop controller owns two independent dispatchers of this type — one
//! for user-registered hooks, one for the planning subsystem's own hooks
//! (spec §4.1 step 8, §4.2's pre-/post-tool behaviour) — rather than this
//! crate baking in the distinction.

use std::sync::Arc;

use agentloop_types::{HookError, ToolCall, ToolResult};
use async_trait::async_trait;

/// A fixed point in the loop where hooks may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    Stop,
    SessionEnd,
}

/// The point-specific payload a hook inspects. Only the fields relevant to
/// `point` are populated; the rest are `None`.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub point: Option<HookPoint>,
    pub session_id: Option<String>,
    pub user_message: Option<String>,
    pub tool_call: Option<ToolCall>,
    pub tool_result: Option<ToolResult>,
    /// Whether the candidate tool call is parallel-safe (only non-parallel-
    /// safe calls fire the user pre-tool hook per spec §4.2).
    pub tool_is_parallel_safe: bool,
    pub extra: serde_json::Value,
}

impl HookContext {
    pub fn for_point(point: HookPoint) -> Self {
        Self {
            point: Some(point),
            extra: serde_json::Value::Null,
            ..Default::default()
        }
    }
}

/// The outcome of one hook invocation.
#[derive(Debug, Clone)]
pub struct HookDecision {
    pub should_proceed: bool,
    pub message: Option<String>,
}

impl HookDecision {
    pub fn proceed() -> Self {
        Self {
            should_proceed: true,
            message: None,
        }
    }

    pub fn halt(message: impl Into<String>) -> Self {
        Self {
            should_proceed: false,
            message: Some(message.into()),
        }
    }

    pub fn proceed_with_note(message: impl Into<String>) -> Self {
        Self {
            should_proceed: true,
            message: Some(message.into()),
        }
    }
}

/// A single hook handler.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Human-readable name, used only in log lines when the hook errors.
    fn name(&self) -> &str;

    /// The points this hook wants to run at. A hook registered at a point
    /// the dispatcher isn't dispatching for is simply skipped.
    fn points(&self) -> &[HookPoint];

    async fn on_event(&self, ctx: &HookContext) -> Result<HookDecision, HookError>;
}

/// An ordered pipeline of [`Hook`]s, dispatched at a given [`HookPoint`].
#[derive(Default)]
pub struct HookDispatcher {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    /// Runs every hook registered for `ctx.point`, in registration order,
    /// stopping at the first `should_proceed: false`. A hook that errors is
    /// logged and treated as if it had returned `proceed()` — hook failures
    /// are never allowed to halt the loop (spec §7).
    pub async fn dispatch(&self, ctx: &HookContext) -> HookDecision {
        let point = ctx.point;
        for hook in &self.hooks {
            if !point.is_none_or(|p| hook.points().contains(&p)) {
                continue;
            }
            match hook.on_event(ctx).await {
                Ok(decision) => {
                    if !decision.should_proceed {
                        return decision;
                    }
                }
                Err(err) => {
                    tracing::warn!(hook = hook.name(), error = %err, "hook failed, continuing");
                }
            }
        }
        HookDecision::proceed()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}
