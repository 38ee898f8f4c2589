//! The Tool Scheduler (spec §4.2): classifies tool calls, builds a
//! dependency DAG, and executes in layered parallel batches bounded by
//! `MAX_PARALLEL_TOOLS`.

use std::sync::Arc;

use agentloop_hooks::{HookContext, HookDecision, HookDispatcher, HookPoint};
use agentloop_types::{AgentEvent, EventEmitter, ToolCall, ToolError, ToolResult};
use tokio::sync::Semaphore;

use crate::dag::build_plan;
use crate::sanitize::{BashSanitizeOutcome, sanitize_bash_command, strip_leaked_tags};
use crate::{ToolContext, ToolKind, ToolRegistry, resolve_arguments};

/// Default bound on concurrent tool execution within one batch (spec
/// §4.2, §5).
pub const MAX_PARALLEL_TOOLS: usize = 4;

/// Observes each resolved result as it is produced, in execution order
/// (not necessarily original index order). The Loop Controller wires this
/// to the anti-pattern detector, circuit breaker, and other per-call
/// trackers that this crate does not itself depend on.
pub trait PostCallObserver: Send + Sync {
    fn on_result(&self, call: &ToolCall, result: &ToolResult);
}

/// A no-op observer for call sites that don't need per-call tracking.
pub struct NullObserver;
impl PostCallObserver for NullObserver {
    fn on_result(&self, _call: &ToolCall, _result: &ToolResult) {}
}

/// The Tool Scheduler.
pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    user_hooks: Arc<HookDispatcher>,
    planning_hooks: Arc<HookDispatcher>,
    max_parallel: usize,
}

impl ToolScheduler {
    pub fn new(
        registry: Arc<ToolRegistry>,
        user_hooks: Arc<HookDispatcher>,
        planning_hooks: Arc<HookDispatcher>,
    ) -> Self {
        Self {
            registry,
            user_hooks,
            planning_hooks,
            max_parallel: MAX_PARALLEL_TOOLS,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Executes a batch of tool calls and returns same-length, same-order
    /// results.
    ///
    /// `context_for` builds the per-call [`ToolContext`] (generation id,
    /// working directory, etc.) fresh for each call. `emitter` receives
    /// `tool_call_start`/`tool_call_end` events. `observer` is notified of
    /// each result for state the scheduler doesn't own.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        context_for: impl Fn(&ToolCall) -> ToolContext + Send + Sync,
        emitter: &dyn EventEmitter,
        observer: &dyn PostCallObserver,
    ) -> Vec<ToolResult> {
        let plan = build_plan(&self.registry, calls);
        let mut results: Vec<Option<ToolResult>> = (0..calls.len()).map(|_| None).collect();

        if plan.has_dependencies {
            for layer in &plan.layers {
                self.run_layer(layer, calls, &context_for, emitter, observer, &mut results)
                    .await;
            }
        } else {
            // Fast path: split by classification. Parallel-safe calls run
            // in a bounded-fan-out batch; mutating calls run strictly
            // sequentially in original order (spec §4.2).
            let (parallel_safe, mutating): (Vec<usize>, Vec<usize>) = (0..calls.len())
                .partition(|&i| self.registry.kind_of(&calls[i].name) == ToolKind::ParallelSafe);

            self.run_layer(&parallel_safe, calls, &context_for, emitter, observer, &mut results)
                .await;
            for &i in &mutating {
                self.run_layer(&[i], calls, &context_for, emitter, observer, &mut results)
                    .await;
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.unwrap_or_else(|| {
                    ToolResult::failed(calls[i].id.clone(), "tool call was never scheduled", 0)
                })
            })
            .collect()
    }

    /// Runs one layer (a set of indices with no edges between them) as a
    /// bounded-parallel batch. `tool_call_start` is emitted for the whole
    /// layer before any `tool_call_end`, per spec §5's ordering guarantee.
    async fn run_layer(
        &self,
        indices: &[usize],
        calls: &[ToolCall],
        context_for: &(impl Fn(&ToolCall) -> ToolContext + Send + Sync),
        emitter: &dyn EventEmitter,
        observer: &dyn PostCallObserver,
        results: &mut [Option<ToolResult>],
    ) {
        if indices.is_empty() {
            return;
        }

        for &i in indices {
            emitter.emit(AgentEvent::ToolCallStart {
                tool_call_id: calls[i].id.clone(),
                name: calls[i].name.clone(),
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallel.min(indices.len()).max(1)));
        let mut futures = Vec::with_capacity(indices.len());
        for &i in indices {
            let call = calls[i].clone();
            let context = context_for(&call);
            let semaphore = semaphore.clone();
            let fut = async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                let result = self.execute_one(&call, &context).await;
                (i, call, result)
            };
            futures.push(fut);
        }

        let outcomes = futures::future::join_all(futures).await;
        for (i, call, result) in outcomes {
            emitter.emit(AgentEvent::ToolCallEnd {
                tool_call_id: call.id.clone(),
                success: result.success,
            });
            observer.on_result(&call, &result);
            results[i] = Some(result);
        }
    }

    /// Runs the pre-/post-tool pipeline for a single call (spec §4.2).
    async fn execute_one(&self, call: &ToolCall, context: &ToolContext) -> ToolResult {
        let start = std::time::Instant::now();
        let is_parallel_safe = self.registry.kind_of(&call.name) == ToolKind::ParallelSafe;

        // User pre-tool hook fires only for non-parallel-safe tools.
        if !is_parallel_safe {
            let mut ctx = HookContext::for_point(HookPoint::PreToolUse);
            ctx.tool_call = Some(call.clone());
            ctx.tool_is_parallel_safe = is_parallel_safe;
            let decision = self.user_hooks.dispatch(&ctx).await;
            if let Some(blocked) = self.blocked_result(call, &decision, start) {
                return blocked;
            }
        }

        // Planning pre-tool hook always fires.
        let mut ctx = HookContext::for_point(HookPoint::PreToolUse);
        ctx.tool_call = Some(call.clone());
        ctx.tool_is_parallel_safe = is_parallel_safe;
        let decision = self.planning_hooks.dispatch(&ctx).await;
        if let Some(blocked) = self.blocked_result(call, &decision, start) {
            return blocked;
        }

        let result = self.invoke(call, context).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        let mut result = match result {
            Ok(output) => ToolResult::ok(call.id.clone(), output, duration_ms),
            Err(err) => ToolResult::failed(call.id.clone(), err.to_string(), duration_ms),
        };

        // User + planning post-tool hooks. Per spec §9, a hook failure is
        // logged but never propagates — `HookDispatcher::dispatch` already
        // absorbs that; here we only look at an explicit halt, which the
        // spec treats as advisory (message is appended, not a hard stop)
        // for the post-tool point.
        let mut ctx = HookContext::for_point(HookPoint::PostToolUse);
        ctx.tool_call = Some(call.clone());
        ctx.tool_result = Some(result.clone());
        let post_decision = self.user_hooks.dispatch(&ctx).await;
        if let Some(note) = post_decision.message {
            result.metadata = Some(merge_note(result.metadata.take(), "post_tool_hook_note", &note));
        }
        let _ = self.planning_hooks.dispatch(&ctx).await;

        result
    }

    fn blocked_result(
        &self,
        call: &ToolCall,
        decision: &HookDecision,
        start: std::time::Instant,
    ) -> Option<ToolResult> {
        if decision.should_proceed {
            return None;
        }
        let reason = decision
            .message
            .clone()
            .unwrap_or_else(|| "blocked by hook".to_string());
        let mut result = ToolResult::failed(
            call.id.clone(),
            ToolError::BlockedByHook {
                reason: reason.clone(),
            }
            .to_string(),
            start.elapsed().as_millis() as u64,
        );
        result.metadata = Some(serde_json::json!({"blocked_by_hook": true, "reason": reason}));
        Some(result)
    }

    async fn invoke(
        &self,
        call: &ToolCall,
        context: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let arguments = resolve_arguments(call)?.clone();
        let sanitized = match strip_leaked_tags(serde_json::Value::Object(arguments)) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("strip_leaked_tags preserves the Object shape"),
        };

        let sanitized = if call.name == "bash" {
            sanitize_bash_arguments(sanitized)?
        } else {
            sanitized
        };

        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        tool.call(sanitized, context).await
    }
}

fn sanitize_bash_arguments(
    mut arguments: serde_json::Map<String, serde_json::Value>,
) -> Result<serde_json::Map<String, serde_json::Value>, ToolError> {
    let Some(command) = arguments.get("command").and_then(|v| v.as_str()) else {
        return Ok(arguments);
    };
    match sanitize_bash_command(command) {
        BashSanitizeOutcome::Ok(sanitized) => {
            arguments.insert("command".into(), serde_json::Value::String(sanitized));
            Ok(arguments)
        }
        BashSanitizeOutcome::Refused { reason } => Err(ToolError::ExecutionFailed(format!(
            "refused to execute: {reason}"
        ))),
    }
}

fn merge_note(
    existing: Option<serde_json::Value>,
    key: &str,
    note: &str,
) -> serde_json::Value {
    let mut map = match existing {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    map.insert(key.to_string(), serde_json::Value::String(note.to_string()));
    serde_json::Value::Object(map)
}
