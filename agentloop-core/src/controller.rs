//! The Loop Controller (spec §4.1): drives iterations, owns turn
//! lifecycle, cancellation, steering, and interruption, and wires the Tool
//! Scheduler, Anti-Pattern Detector, Circuit Breaker, Context Manager,
//! Fallback Router, and Hook Dispatcher together.
//!
//! Grounded on the teacher's `AgentLoop`/`StepIterator` split in
//! `neuron-loop/src/loop_impl.rs` and `neuron-loop/src/step.rs`: this
//! module plays the role of both, but as a single `run` method rather than
//! a struct-plus-iterator, since the spec's per-iteration algorithm (§4.1
//! steps 1-10) is linear enough not to need the teacher's step-by-step
//! cursor API.

use std::collections::HashSet;
use std::sync::Arc;

use agentloop_context::{
    assemble_system_prompt, vision_only_prompt, synthesize_messages, AssembledPrompt,
    Budget, ContextManager, GenerationTier, PromptRequest, PromptSources, TaskComplexity,
    WorkingDirectoryKind,
};
use agentloop_hooks::{HookContext, HookDispatcher, HookPoint};
use agentloop_tool::scheduler::{NullObserver, ToolScheduler};
use agentloop_tool::{ToolContext, ToolKind, ToolRegistry};
use agentloop_types::{
    AgentEvent, Attachment, EventEmitter, LoopError, Message, ModelConfig, Provider,
    ProviderError, Role, StreamChunk, TaskProgressPhase, ToolArguments, ToolCall, ToolCallId,
};

use crate::anti_pattern::{
    classify_iteration, detect_textual_tool_call, AntiPatternDetector, DetectorSignal,
};
use crate::config::LoopConfig;
use crate::fallback_router::{requires_image_tool_operation, strip_images, FallbackRouter};
use crate::id_gen::{new_message_id, new_tool_call_id, new_turn_id};
use crate::loop_state::{LoopHandle, LoopState};
use crate::progress::{NoProgressChecks, ProgressChecks, ProgressNudge};
use crate::truncation::{TruncationAction, TruncationPolicy};

/// A system-prompt-shaping template held fixed for the lifetime of an
/// [`AgentLoop`] (spec §4.5's per-generation/per-complexity base prompt
/// selection and working-directory block).
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    /// Which generation tier's prompt variant to assemble (gates RAG and
    /// proactive/cloud context sources).
    pub tier: GenerationTier,
    /// Task complexity, selecting between the simple and full base prompts.
    pub complexity: TaskComplexity,
    /// Absolute path of the working directory to describe in the prompt.
    pub working_directory: String,
    /// How the working directory should be framed (fresh checkout, existing
    /// project, scratch space).
    pub working_directory_kind: WorkingDirectoryKind,
    /// Base prompt text used for [`TaskComplexity::Simple`] requests.
    pub base_prompt_simple: String,
    /// Base prompt text used for full-complexity requests.
    pub base_prompt_full: String,
}

/// The embedder-provided seam onto RAG/proactive/cloud context sources
/// consulted during system-prompt assembly (spec §4.5). Default returns no
/// sources, matching [`NoProgressChecks`]'s role for the progress seam.
pub trait PromptSourceProvider: Send + Sync {
    /// Returns the RAG/proactive/cloud sources available for this request.
    fn sources(&self) -> PromptSources {
        PromptSources::default()
    }
}

/// A [`PromptSourceProvider`] for embedders with no external sources to
/// offer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPromptSources;
impl PromptSourceProvider for NoPromptSources {}

/// Goal-reminder text injected at the checkpoint interval (spec §4.1 step
/// 4). Kept as a single constant rather than a template: the embedder's
/// task-store wiring belongs behind [`ProgressChecks`], not here.
const GOAL_CHECKPOINT_TEXT: &str =
    "Checkpoint: restate the original goal to yourself and confirm what has been \
     completed so far before continuing.";

/// How a `run` call ended (spec §4.1's four exit conditions plus the error
/// taxonomy of §7).
#[derive(Debug)]
pub enum AgentOutcome {
    /// A text-only response survived all stop hooks and nudges.
    Completed {
        /// The model's final text reply.
        final_text: String,
    },
    /// The run was cancelled via [`LoopHandle::cancel`] before it could
    /// produce a final reply.
    Cancelled,
    /// The current turn's tool batch was abandoned via
    /// [`LoopHandle::interrupt`].
    Interrupted,
    /// The configured `max_iterations` ceiling was reached.
    MaxIterations,
    /// The circuit breaker tripped after too many consecutive tool
    /// failures.
    CircuitBreakerTripped,
    /// An unrecoverable error ended the run.
    Error(LoopError),
}

/// Whether a helper that may end the run should keep looping or return.
enum Flow {
    Continue,
    Return(AgentOutcome),
}

/// The Loop Controller.
///
/// Generic over `P: Provider` rather than holding a `dyn Provider`: the
/// controller calls `infer` on the hot path of every iteration, and the
/// concrete-type call avoids paying for a boxed future there (spec §9's
/// "dynamic content is naturally expressed as tagged variants" note is
/// about the *data*, not the provider seam).
pub struct AgentLoop<P: Provider> {
    provider: P,
    tools: Arc<ToolRegistry>,
    scheduler: ToolScheduler,
    context: ContextManager,
    user_hooks: Arc<HookDispatcher>,
    planning_hooks: Arc<HookDispatcher>,
    progress: Arc<dyn ProgressChecks>,
    prompt_sources: Arc<dyn PromptSourceProvider>,
    fallback: Option<FallbackRouter>,
    config: LoopConfig,
    model_config: ModelConfig,
    prompt: PromptTemplate,
    model_has_vision: bool,
    privileged: bool,
    session_id: Option<String>,
    pre_approved_tools: Arc<HashSet<String>>,
}

/// Builds an [`AgentLoop`], matching the teacher's `AgentLoopBuilder`
/// pattern (`neuron-loop::config::LoopConfig` assembled via a builder
/// rather than a bare struct literal).
pub struct AgentLoopBuilder<P: Provider> {
    provider: P,
    tools: Arc<ToolRegistry>,
    scheduler_max_parallel: Option<usize>,
    user_hooks: Arc<HookDispatcher>,
    planning_hooks: Arc<HookDispatcher>,
    progress: Arc<dyn ProgressChecks>,
    prompt_sources: Arc<dyn PromptSourceProvider>,
    fallback: Option<FallbackRouter>,
    config: LoopConfig,
    model_config: ModelConfig,
    prompt: PromptTemplate,
    model_has_vision: bool,
    privileged: bool,
    session_id: Option<String>,
    pre_approved_tools: Arc<HashSet<String>>,
}

impl<P: Provider> AgentLoopBuilder<P> {
    pub fn new(provider: P, model_config: ModelConfig, prompt: PromptTemplate) -> Self {
        Self {
            provider,
            tools: Arc::new(ToolRegistry::new()),
            scheduler_max_parallel: None,
            user_hooks: Arc::new(HookDispatcher::new()),
            planning_hooks: Arc::new(HookDispatcher::new()),
            progress: Arc::new(NoProgressChecks),
            prompt_sources: Arc::new(NoPromptSources),
            fallback: None,
            config: LoopConfig::default(),
            model_config,
            prompt,
            model_has_vision: false,
            privileged: false,
            session_id: None,
            pre_approved_tools: Arc::new(HashSet::new()),
        }
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_parallel_tools(mut self, max_parallel: usize) -> Self {
        self.scheduler_max_parallel = Some(max_parallel);
        self
    }

    pub fn with_user_hooks(mut self, hooks: Arc<HookDispatcher>) -> Self {
        self.user_hooks = hooks;
        self
    }

    pub fn with_planning_hooks(mut self, hooks: Arc<HookDispatcher>) -> Self {
        self.planning_hooks = hooks;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressChecks>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_prompt_sources(mut self, sources: Arc<dyn PromptSourceProvider>) -> Self {
        self.prompt_sources = sources;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackRouter) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_model_has_vision(mut self, has_vision: bool) -> Self {
        self.model_has_vision = has_vision;
        self
    }

    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_pre_approved_tools(mut self, tools: HashSet<String>) -> Self {
        self.pre_approved_tools = Arc::new(tools);
        self
    }

    pub fn build(self) -> AgentLoop<P> {
        let mut scheduler = ToolScheduler::new(
            self.tools.clone(),
            self.user_hooks.clone(),
            self.planning_hooks.clone(),
        );
        if let Some(max_parallel) = self.scheduler_max_parallel {
            scheduler = scheduler.with_max_parallel(max_parallel);
        } else {
            scheduler = scheduler.with_max_parallel(self.config.max_parallel_tools);
        }
        AgentLoop {
            provider: self.provider,
            tools: self.tools,
            scheduler,
            context: ContextManager::new(Default::default()),
            user_hooks: self.user_hooks,
            planning_hooks: self.planning_hooks,
            progress: self.progress,
            prompt_sources: self.prompt_sources,
            fallback: self.fallback,
            config: self.config,
            model_config: self.model_config,
            prompt: self.prompt,
            model_has_vision: self.model_has_vision,
            privileged: self.privileged,
            session_id: self.session_id,
            pre_approved_tools: self.pre_approved_tools,
        }
    }
}

impl<P: Provider> AgentLoop<P> {
    /// Drives iterations for one user request until one of spec §4.1's
    /// four exit conditions. `history` is shared by reference with the
    /// outer orchestrator (spec §3's "Lifecycle") so steering is visible
    /// immediately; this call owns it exclusively for its own duration.
    pub async fn run(
        &self,
        user_message: impl Into<String>,
        history: &mut Vec<Message>,
        handle: &LoopHandle,
        emitter: &dyn EventEmitter,
        budget: &dyn Budget,
    ) -> AgentOutcome {
        history.push(Message::user(new_message_id(), user_message.into()));

        let mut state = LoopState::new(&self.config, new_turn_id());
        let mut current_max_tokens = self.model_config.max_tokens;

        loop {
            if let Some(outcome) = self.check_suspension(handle, budget, &state, emitter) {
                return outcome;
            }

            let turn_id = new_turn_id();
            state.begin_turn(turn_id.clone());
            emitter.emit(AgentEvent::TurnStart { turn_id: turn_id.clone() });
            emitter.emit(AgentEvent::TaskProgress { phase: TaskProgressPhase::Thinking });

            if state.at_goal_checkpoint(self.config.goal_checkpoint_interval) {
                history.push(Message::meta_system(new_message_id(), GOAL_CHECKPOINT_TEXT));
            }

            *history = self.context.compress_if_needed(std::mem::take(history), emitter);

            let response = match self.infer_once(history, handle, emitter, &mut current_max_tokens, &mut state.per_turn_guards).await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    // Steered mid-inference: response discarded, new user
                    // message already woven in by `infer_once`.
                    emitter.emit(AgentEvent::InterruptAcknowledged);
                    continue;
                }
                Err(outcome) => return outcome,
            };

            if let Some(usage) = response.usage {
                budget.record(&usage);
                self.context.check_budget_warning(budget, emitter);
            }

            if response.is_tool_use() {
                let calls: Vec<ToolCall> = response
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .map(|raw| ToolCall::new(ToolCallId::from(raw.id), raw.name, &raw.arguments_json))
                    .collect();

                match self
                    .handle_tool_call_response(
                        calls,
                        response.truncated,
                        history,
                        &mut state,
                        turn_id,
                        emitter,
                        handle,
                        &mut current_max_tokens,
                    )
                    .await
                {
                    Flow::Continue => continue,
                    Flow::Return(outcome) => return outcome,
                }
            }

            let text = response.content.unwrap_or_default();

            if let Some(detected) = detect_textual_tool_call(&text) {
                if state.per_turn_guards.text_tool_call_retries < self.config.max_text_tool_call_retries {
                    if let Some(arguments) = detected.arguments {
                        let synthetic = ToolCall {
                            id: new_tool_call_id(),
                            name: detected.name,
                            arguments: ToolArguments::Parsed(
                                arguments.as_object().cloned().unwrap_or_default(),
                            ),
                        };
                        match self
                            .handle_tool_call_response(
                                vec![synthetic],
                                false,
                                history,
                                &mut state,
                                turn_id,
                                emitter,
                                handle,
                                &mut current_max_tokens,
                            )
                            .await
                        {
                            Flow::Continue => continue,
                            Flow::Return(outcome) => return outcome,
                        }
                    } else {
                        state.per_turn_guards.text_tool_call_retries += 1;
                        history.push(Message::meta_system(
                            new_message_id(),
                            format!(
                                "Your last response described calling `{}` in prose instead of \
                                 issuing an actual tool call. Issue the tool call directly.",
                                detected.name
                            ),
                        ));
                        continue;
                    }
                }
            }

            match self.run_stop_hooks(&text, &mut state, history).await {
                Flow::Continue => continue,
                Flow::Return(_) => {}
            }

            if let Some(nudge) = self.run_stop_nudges(&mut state, history).await {
                history.push(Message::meta_system(new_message_id(), nudge));
                continue;
            }

            if response.truncated {
                let action = TruncationPolicy::new(&mut state.truncation)
                    .on_text_truncation(current_max_tokens, self.model_config.max_tokens);
                if let TruncationAction::RetryTextResponse { boosted_max_tokens } = action {
                    current_max_tokens = boosted_max_tokens;
                    continue;
                }
            }

            let assistant_message = Message::assistant_text(new_message_id(), text.clone());
            emitter.emit(AgentEvent::message(assistant_message.clone()));
            history.push(assistant_message);
            emitter.emit(AgentEvent::TaskComplete);
            emitter.emit(AgentEvent::TurnEnd { turn_id });
            emitter.emit(AgentEvent::AgentComplete);
            return AgentOutcome::Completed { final_text: text };
        }
    }

    /// Step 1-2: interruption/cancellation/budget/iteration-cap checks
    /// (spec §4.1). Returns `Some(outcome)` when the run must end.
    fn check_suspension(
        &self,
        handle: &LoopHandle,
        budget: &dyn Budget,
        state: &LoopState,
        emitter: &dyn EventEmitter,
    ) -> Option<AgentOutcome> {
        if handle.is_cancelled() {
            emitter.emit(AgentEvent::AgentComplete);
            return Some(AgentOutcome::Cancelled);
        }
        if handle.take_interrupted() {
            emitter.emit(AgentEvent::AgentComplete);
            return Some(AgentOutcome::Interrupted);
        }
        if budget.is_blocked() {
            emitter.emit(AgentEvent::BudgetExceeded);
            emitter.emit(AgentEvent::AgentComplete);
            return Some(AgentOutcome::Error(LoopError::BudgetExceeded));
        }
        if state.exceeded_max_iterations(self.config.max_iterations) {
            emitter.emit(AgentEvent::Error {
                code: "MAX_ITERATIONS".to_string(),
                message: format!(
                    "iteration cap ({:?}) reached",
                    self.config.max_iterations
                ),
            });
            emitter.emit(AgentEvent::AgentComplete);
            return Some(AgentOutcome::MaxIterations);
        }
        None
    }

    /// Step 5-6: builds model input (fallback routing, prompt assembly,
    /// message synthesis), calls the provider, and applies the steer
    /// check. Returns `Ok(None)` when the response was discarded because
    /// `steer()` fired mid-inference (spec §4.1 step 6).
    async fn infer_once(
        &self,
        history: &mut Vec<Message>,
        handle: &LoopHandle,
        emitter: &dyn EventEmitter,
        current_max_tokens: &mut u32,
        guards: &mut crate::loop_state::PerTurnGuards,
    ) -> Result<Option<agentloop_types::ModelResponse>, AgentOutcome> {
        loop {
            let last_user_text = history
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .and_then(|m| m.content.as_text())
                .unwrap_or_default();

            let routing = match &self.fallback {
                Some(router) => {
                    router
                        .route(
                            &self.model_config.model,
                            self.model_has_vision,
                            history,
                            self.privileged,
                            requires_image_tool_operation(last_user_text),
                        )
                        .await
                }
                None => Default::default(),
            };

            for event in &routing.fallback_events {
                emitter.emit(AgentEvent::ModelFallback {
                    reason: format!("{:?}", event.reason).to_lowercase(),
                    from: event.from.clone(),
                    to: event.to.clone(),
                });
            }
            for capability in &routing.api_key_required {
                emitter.emit(AgentEvent::ApiKeyRequired {
                    capability: format!("{capability:?}").to_lowercase(),
                });
            }

            let mut messages_for_model = history.clone();
            if routing.strip_images {
                strip_images(&mut messages_for_model);
            }

            let provider_messages = synthesize_messages(&messages_for_model, self.context.config());
            let tools_for_model = if routing.disable_tools {
                Vec::new()
            } else {
                self.tools.definitions()
            };

            let system_text = if routing.disable_tools {
                vision_only_prompt()
            } else {
                self.assemble_prompt().text
            };

            let model_config = ModelConfig {
                model: routing.model_override.clone().unwrap_or_else(|| self.model_config.model.clone()),
                max_tokens: *current_max_tokens,
                temperature: self.model_config.temperature,
                system: Some(system_text),
            };

            // `on_chunk` must be `'static` (it is boxed as `Box<dyn FnMut + Send>`
            // with no borrow), so it cannot hold `emitter` directly; instead it
            // fills a shared buffer the controller drains into `emitter` the
            // moment `infer` returns, re-emitting each chunk as the matching
            // `stream_*` event (spec §4.1 step 5, §6).
            let stream_chunks: Arc<std::sync::Mutex<Vec<AgentEvent>>> =
                Arc::new(std::sync::Mutex::new(Vec::new()));
            let stream_chunks_for_closure = stream_chunks.clone();
            let on_chunk: Box<dyn FnMut(StreamChunk) + Send> = Box::new(move |chunk| {
                let event = match chunk {
                    StreamChunk::Text { content } => AgentEvent::StreamChunk { content },
                    StreamChunk::Reasoning { content } => AgentEvent::StreamReasoning { content },
                    StreamChunk::ToolCallStart { index, id, name } => {
                        AgentEvent::StreamToolCallStart { index, id: ToolCallId::from(id), name }
                    }
                    StreamChunk::ToolCallDelta { index, name, arguments_delta } => {
                        AgentEvent::StreamToolCallDelta { index, name, arguments_delta }
                    }
                };
                stream_chunks_for_closure.lock().unwrap().push(event);
            });

            let result = self
                .provider
                .infer(
                    provider_messages,
                    tools_for_model,
                    model_config,
                    on_chunk,
                    handle.cancellation_token(),
                )
                .await;

            for event in stream_chunks.lock().unwrap().drain(..) {
                emitter.emit(event);
            }

            if handle.needs_reinference() {
                if let Some(message) = handle.take_steer_message() {
                    history.push(Message::user(new_message_id(), message));
                }
                return Ok(None);
            }

            match result {
                Ok(response) => return Ok(Some(response)),
                Err(ProviderError::Cancelled) => {
                    emitter.emit(AgentEvent::AgentComplete);
                    return Err(AgentOutcome::Cancelled);
                }
                Err(ProviderError::ContextLengthExceeded { .. }) => {
                    let input_tokens = self
                        .context
                        .counter()
                        .estimate_messages(history)
                        .try_into()
                        .unwrap_or(u64::MAX);
                    *history = self.context.proactively_compact_if_needed(
                        std::mem::take(history),
                        input_tokens,
                        emitter,
                    );
                    *current_max_tokens = (*current_max_tokens as f64
                        * self.context.config().overrun_retry_output_fraction)
                        as u32;
                    // One retry only: fall through to the loop's top once
                    // more, then surface the error if it recurs by having
                    // already reduced the budget (spec §4.5's single retry).
                    let input_tokens_after = self
                        .context
                        .counter()
                        .estimate_messages(history)
                        .try_into()
                        .unwrap_or(u64::MAX);
                    if input_tokens_after >= input_tokens {
                        emitter.emit(AgentEvent::Error {
                            code: "CONTEXT_LENGTH_EXCEEDED".to_string(),
                            message: "context length exceeded even after compaction".to_string(),
                        });
                        emitter.emit(AgentEvent::AgentComplete);
                        return Err(AgentOutcome::Error(LoopError::ContextLengthExceeded(
                            "compaction did not reduce input tokens".to_string(),
                        )));
                    }
                    continue;
                }
                Err(err) if err.is_network_transient() && !guards.network_retry_used => {
                    guards.network_retry_used = true;
                    continue;
                }
                Err(err) => {
                    emitter.emit(AgentEvent::Error {
                        code: "PROVIDER_ERROR".to_string(),
                        message: err.to_string(),
                    });
                    emitter.emit(AgentEvent::AgentComplete);
                    return Err(AgentOutcome::Error(LoopError::Provider(err)));
                }
            }
        }
    }

    fn assemble_prompt(&self) -> AssembledPrompt {
        assemble_system_prompt(&PromptRequest {
            tier: self.prompt.tier,
            complexity: self.prompt.complexity,
            working_directory: &self.prompt.working_directory,
            working_directory_kind: self.prompt.working_directory_kind,
            base_prompt_simple: &self.prompt.base_prompt_simple,
            base_prompt_full: &self.prompt.base_prompt_full,
            sources: self.prompt_sources.sources(),
        })
    }

    /// Step 8's hook half: fires the user then planning stop hooks,
    /// honoring `maxStopHookRetries`.
    async fn run_stop_hooks(
        &self,
        text: &str,
        state: &mut LoopState,
        history: &mut Vec<Message>,
    ) -> Flow {
        let mut ctx = HookContext::for_point(HookPoint::Stop);
        ctx.user_message = Some(text.to_string());

        let user_decision = self.user_hooks.dispatch(&ctx).await;
        if !user_decision.should_proceed
            && state.per_turn_guards.stop_hook_retries < self.config.max_stop_hook_retries
        {
            state.per_turn_guards.stop_hook_retries += 1;
            if let Some(message) = user_decision.message {
                history.push(Message::meta_system(new_message_id(), message));
            }
            return Flow::Continue;
        }

        let planning_decision = self.planning_hooks.dispatch(&ctx).await;
        if !planning_decision.should_proceed
            && state.per_turn_guards.stop_hook_retries < self.config.max_stop_hook_retries
        {
            state.per_turn_guards.stop_hook_retries += 1;
            if let Some(message) = planning_decision.message {
                history.push(Message::meta_system(new_message_id(), message));
            }
            return Flow::Continue;
        }

        Flow::Continue
    }

    /// Step 8's progress-nudge half: read-only/todo/file-completion/
    /// goal-verification, in that order, each bounded (spec §4.1 step 8).
    async fn run_stop_nudges(&self, state: &mut LoopState, _history: &[Message]) -> Option<String> {
        let max = self.config.max_stop_nudges_per_kind;

        if state.modified_files.is_empty()
            && state.anti_pattern.consecutive_read_ops() > 0
            && state.read_only_stop_nudges_issued < max
        {
            state.read_only_stop_nudges_issued += 1;
            return Some(
                "You're about to stop without having made any change to the project. If the \
                 task required one, make it now; otherwise state explicitly why no change was \
                 needed."
                    .to_string(),
            );
        }

        let modified: Vec<String> = state.modified_files.iter().cloned().collect();
        if state.todo_nudges_issued < max {
            if let ProgressNudge::IncompleteTodos(message) =
                self.progress.check_incomplete_todos(&modified).await
            {
                state.todo_nudges_issued += 1;
                return Some(message);
            }
        }

        if state.file_completion_nudges_issued < max {
            if let Some(path) = state.last_modified_file() {
                if let ProgressNudge::IncompleteFileEdit(message) =
                    self.progress.check_file_completion(path).await
                {
                    state.file_completion_nudges_issued += 1;
                    return Some(message);
                }
            }
        }

        if state.at_goal_checkpoint(self.config.goal_checkpoint_interval.max(1))
            && state.goal_verification_nudges_issued < max
        {
            if let ProgressNudge::UnverifiedGoal(message) =
                self.progress.check_goal_verification(state.iteration).await
            {
                state.goal_verification_nudges_issued += 1;
                return Some(message);
            }
        }
        None
    }

    /// Step 9: appends the assistant tool-call message, dispatches the
    /// batch, sanitizes and appends the tool-result message, and runs the
    /// per-call anti-pattern/circuit-breaker bookkeeping (spec §4.1 step
    /// 9, §4.2, §4.3).
    async fn handle_tool_call_response(
        &self,
        calls: Vec<ToolCall>,
        truncated: bool,
        history: &mut Vec<Message>,
        state: &mut LoopState,
        turn_id: agentloop_types::TurnId,
        emitter: &dyn EventEmitter,
        handle: &LoopHandle,
        current_max_tokens: &mut u32,
    ) -> Flow {
        if truncated {
            let action = TruncationPolicy::new(&mut state.truncation).on_tool_call_truncation(
                &calls,
                *current_max_tokens,
                self.model_config.max_tokens,
            );
            match action {
                TruncationAction::SplitIntoSkeleton { boosted_max_tokens } => {
                    *current_max_tokens = boosted_max_tokens;
                    history.push(Message::meta_system(
                        new_message_id(),
                        "Your last write was truncated mid-file. Split the change into a \
                         skeleton first, then apply the rest as incremental edits.",
                    ));
                    return Flow::Continue;
                }
                TruncationAction::RefuseHeredocBatch { synthetic_results, directive } => {
                    let assistant_message =
                        Message::assistant_tool_calls(new_message_id(), calls.clone());
                    emitter.emit(AgentEvent::message(assistant_message.clone()));
                    history.push(assistant_message);
                    let tool_message =
                        Message::tool_results(new_message_id(), synthetic_results);
                    emitter.emit(AgentEvent::message(tool_message.clone()));
                    history.push(tool_message);
                    history.push(Message::meta_system(new_message_id(), directive));
                    emitter.emit(AgentEvent::TurnEnd { turn_id });
                    return Flow::Continue;
                }
                TruncationAction::ContinuePreviousAction { boosted_max_tokens } => {
                    *current_max_tokens = boosted_max_tokens;
                    history.push(Message::meta_system(
                        new_message_id(),
                        "Your last response was truncated mid-action. Continue the previous \
                         action from where it left off.",
                    ));
                    return Flow::Continue;
                }
                TruncationAction::RetryTextResponse { .. } | TruncationAction::None => {}
            }
        }

        let assistant_message = Message::assistant_tool_calls(new_message_id(), calls.clone());
        emitter.emit(AgentEvent::message(assistant_message.clone()));
        history.push(assistant_message);

        state.per_turn_tool_names = calls.iter().map(|call| call.name.clone()).collect();

        let attachments: Vec<Attachment> = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.attachments.clone())
            .unwrap_or_default();

        let session_id = self.session_id.clone();
        let pre_approved = self.pre_approved_tools.clone();
        let cancellation = handle.cancellation_token();
        let context_for = |call: &ToolCall| ToolContext {
            generation_id: turn_id.to_string(),
            working_directory: self.prompt.working_directory.clone(),
            session_id: session_id.clone(),
            model_config_name: self.model_config.model.clone(),
            pre_approved_tools: pre_approved.clone(),
            attachments: attachments.clone(),
            tool_call_id: call.id.clone(),
            cancellation: cancellation.clone(),
        };

        let mut results = self
            .scheduler
            .execute_batch(&calls, context_for, emitter, &NullObserver)
            .await;
        self.context.sanitize_results(&mut results);

        let mut kinds = Vec::with_capacity(calls.len());
        let mut any_write = false;
        let mut nudges: Vec<String> = Vec::new();
        let mut hard_limit = false;
        let mut detector = AntiPatternDetector::new(&mut state.anti_pattern, &self.config);

        for (call, result) in calls.iter().zip(results.iter()) {
            let kind = self.tools.kind_of(&call.name);
            kinds.push(kind);

            if let Some(tool) = self.tools.get(&call.name) {
                if let Some(arguments) = call.arguments.as_parsed() {
                    let writes = tool.writes(arguments);
                    if !writes.is_empty() && result.success {
                        any_write = true;
                        for path in writes {
                            state.record_modified_file(path.clone());
                            emitter.emit(AgentEvent::DiffComputed { path });
                        }
                    }
                }
            }

            match detector.record_tool_kind(kind) {
                DetectorSignal::Nudge(message) => nudges.push(message),
                DetectorSignal::HardLimit => hard_limit = true,
                DetectorSignal::EscalateToUser(message) => nudges.push(message),
                DetectorSignal::None => {}
            }
            if any_write {
                detector.record_write();
            }

            let signature = format!(
                "{}:{}",
                call.name,
                call.arguments
                    .as_parsed()
                    .map(|m| serde_json::Value::Object(m.clone()).to_string())
                    .unwrap_or_default()
            );

            match detector.record_failure(&call.name, result.success) {
                DetectorSignal::Nudge(message) => nudges.push(message),
                DetectorSignal::EscalateToUser(message) => nudges.push(message),
                _ => {}
            }
            if let DetectorSignal::Nudge(message) = detector.record_exact_repeat(
                &call.name,
                &signature,
                result.success,
                result.error.as_deref(),
            ) {
                nudges.push(message);
            }
            if result.success {
                if let DetectorSignal::Nudge(message) = detector.record_duplicate(&signature, kind) {
                    nudges.push(message);
                }
            }

            state.circuit_breaker.record(result.success, result.error.as_deref());
        }

        let tool_message = Message::tool_results(new_message_id(), results);
        emitter.emit(AgentEvent::message(tool_message.clone()));
        history.push(tool_message);

        for nudge in nudges {
            history.push(Message::meta_system(new_message_id(), nudge));
        }
        if hard_limit {
            history.push(Message::meta_system(
                new_message_id(),
                "You have made too many consecutive read-only calls without writing anything. \
                 Stop exploring and make the necessary change now, or explain why none is \
                 possible.",
            ));
        }

        emitter.emit(AgentEvent::TurnEnd { turn_id });

        *history = self.context.compress_if_needed(std::mem::take(history), emitter);

        if state.circuit_breaker.is_tripped() {
            history.push(Message::assistant_text(
                new_message_id(),
                state.circuit_breaker.user_facing_message(),
            ));
            state.circuit_breaker.reset();
            emitter.emit(AgentEvent::Error {
                code: "CIRCUIT_BREAKER_TRIPPED".to_string(),
                message: "consecutive tool failures tripped the circuit breaker".to_string(),
            });
            emitter.emit(AgentEvent::AgentComplete);
            return Flow::Return(AgentOutcome::CircuitBreakerTripped);
        }

        let class = classify_iteration(&kinds, any_write);
        if let DetectorSignal::Nudge(message) = detector.record_iteration(class) {
            history.push(Message::meta_system(new_message_id(), message));
        }

        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_types::{
        ChannelEventEmitter, FinishReason, ModelResponse, NullEventEmitter, ProviderMessage,
        RawToolCall, ToolDefinition,
    };
    use agentloop_context::TokenCeilingBudget;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    fn template() -> PromptTemplate {
        PromptTemplate {
            tier: GenerationTier(1),
            complexity: TaskComplexity::Full,
            working_directory: "/tmp/project".to_string(),
            working_directory_kind: WorkingDirectoryKind::UserProject,
            base_prompt_simple: "simple".to_string(),
            base_prompt_full: "full".to_string(),
        }
    }

    fn model_config() -> ModelConfig {
        ModelConfig { model: "test-model".to_string(), max_tokens: 1000, temperature: None, system: None }
    }

    /// A provider returning a scripted sequence of responses, one per call.
    struct ScriptedProvider {
        responses: Mutex<Vec<ModelResponse>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<ModelResponse>) -> Self {
            Self { responses: Mutex::new(responses), calls: AtomicUsize::new(0) }
        }
    }

    impl Provider for ScriptedProvider {
        async fn infer(
            &self,
            _messages: Vec<ProviderMessage>,
            _tools: Vec<ToolDefinition>,
            _model_config: ModelConfig,
            mut on_chunk: Box<dyn FnMut(StreamChunk) + Send>,
            _cancel: CancellationToken,
        ) -> Result<ModelResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            on_chunk(StreamChunk::Text { content: "chunk".to_string() });
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(ModelResponse {
                    content: Some("done".to_string()),
                    thinking: None,
                    tool_calls: None,
                    truncated: false,
                    finish_reason: Some(FinishReason::EndTurn),
                    usage: None,
                });
            }
            Ok(responses.remove(0))
        }
    }

    fn text_response(text: &str) -> ModelResponse {
        ModelResponse {
            content: Some(text.to_string()),
            thinking: None,
            tool_calls: None,
            truncated: false,
            finish_reason: Some(FinishReason::EndTurn),
            usage: None,
        }
    }

    fn tool_call_response(id: &str, name: &str, args: &str) -> ModelResponse {
        ModelResponse {
            content: None,
            thinking: None,
            tool_calls: Some(vec![RawToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments_json: args.to_string(),
            }]),
            truncated: false,
            finish_reason: Some(FinishReason::ToolUse),
            usage: None,
        }
    }

    #[tokio::test]
    async fn plain_text_turn_completes_without_tools() {
        let provider = ScriptedProvider::new(vec![text_response("hi")]);
        let agent = AgentLoopBuilder::new(provider, model_config(), template()).build();
        let mut history = Vec::new();
        let handle = LoopHandle::new();
        let (emitter, mut receiver) = ChannelEventEmitter::new();
        let budget = TokenCeilingBudget::new(1_000_000);
        let outcome = agent.run("Say hi", &mut history, &handle, &emitter, &budget).await;
        drop(emitter);
        match outcome {
            AgentOutcome::Completed { final_text } => assert_eq!(final_text, "hi"),
            other => panic!("expected Completed, got {other:?}"),
        }
        assert!(history.iter().any(|m| m.role == Role::Assistant));

        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::StreamChunk { content } if content == "chunk")));
    }

    #[tokio::test]
    async fn one_write_then_text_response() {
        let provider = ScriptedProvider::new(vec![
            tool_call_response("c1", "write_file", r#"{"path":"a.txt","content":"HELLO"}"#),
            text_response("done"),
        ]);
        struct WriteTool;
        #[async_trait::async_trait]
        impl agentloop_tool::ToolDyn for WriteTool {
            fn name(&self) -> &str {
                "write_file"
            }
            fn description(&self) -> &str {
                "writes a file"
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({})
            }
            fn writes(&self, arguments: &serde_json::Map<String, serde_json::Value>) -> Vec<String> {
                arguments.get("path").and_then(|v| v.as_str()).map(|s| vec![s.to_string()]).unwrap_or_default()
            }
            async fn call(
                &self,
                _arguments: serde_json::Map<String, serde_json::Value>,
                _context: &ToolContext,
            ) -> Result<serde_json::Value, agentloop_types::ToolError> {
                Ok(serde_json::json!({"written": true}))
            }
        }
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WriteTool));

        let agent = AgentLoopBuilder::new(provider, model_config(), template())
            .with_tools(Arc::new(registry))
            .build();
        let mut history = Vec::new();
        let handle = LoopHandle::new();
        let (emitter, mut receiver) = ChannelEventEmitter::new();
        let budget = TokenCeilingBudget::new(1_000_000);
        let outcome = agent
            .run("create file a.txt with body HELLO", &mut history, &handle, &emitter, &budget)
            .await;
        drop(emitter);
        assert!(matches!(outcome, AgentOutcome::Completed { .. }));

        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }
        assert!(events.iter().any(|e| matches!(e, AgentEvent::DiffComputed { path } if path == "a.txt")));
    }

    #[tokio::test]
    async fn circuit_breaker_trips_after_consecutive_failures() {
        let mut responses: Vec<ModelResponse> = (0..6)
            .map(|i| tool_call_response(&format!("c{i}"), "bad_tool", "{}"))
            .collect();
        responses.push(text_response("unreachable"));
        let provider = ScriptedProvider::new(responses);

        struct FailingTool;
        #[async_trait::async_trait]
        impl agentloop_tool::ToolDyn for FailingTool {
            fn name(&self) -> &str {
                "bad_tool"
            }
            fn description(&self) -> &str {
                "always fails"
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({})
            }
            async fn call(
                &self,
                _arguments: serde_json::Map<String, serde_json::Value>,
                _context: &ToolContext,
            ) -> Result<serde_json::Value, agentloop_types::ToolError> {
                Err(agentloop_types::ToolError::ExecutionFailed("boom".to_string()))
            }
        }
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool));

        let mut config = LoopConfig::default();
        config.max_consecutive_failures = 5;
        let agent = AgentLoopBuilder::new(provider, model_config(), template())
            .with_tools(Arc::new(registry))
            .with_config(config)
            .build();
        let mut history = Vec::new();
        let handle = LoopHandle::new();
        let budget = TokenCeilingBudget::new(1_000_000);
        let outcome = agent.run("do it", &mut history, &handle, &NullEventEmitter, &budget).await;
        assert!(matches!(outcome, AgentOutcome::CircuitBreakerTripped));
    }

    #[tokio::test]
    async fn cancel_before_run_exits_immediately() {
        let provider = ScriptedProvider::new(vec![text_response("should not run")]);
        let agent = AgentLoopBuilder::new(provider, model_config(), template()).build();
        let mut history = Vec::new();
        let handle = LoopHandle::new();
        handle.cancel();
        let budget = TokenCeilingBudget::new(1_000_000);
        let outcome = agent.run("hi", &mut history, &handle, &NullEventEmitter, &budget).await;
        assert!(matches!(outcome, AgentOutcome::Cancelled));
    }

    #[tokio::test]
    async fn max_iterations_is_respected() {
        let responses: Vec<ModelResponse> = (0..10)
            .map(|i| tool_call_response(&format!("c{i}"), "noop", "{}"))
            .collect();
        let provider = ScriptedProvider::new(responses);

        struct NoopTool;
        #[async_trait::async_trait]
        impl agentloop_tool::ToolDyn for NoopTool {
            fn name(&self) -> &str {
                "noop"
            }
            fn description(&self) -> &str {
                "does nothing"
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({})
            }
            fn kind(&self) -> ToolKind {
                ToolKind::ParallelSafe
            }
            async fn call(
                &self,
                _arguments: serde_json::Map<String, serde_json::Value>,
                _context: &ToolContext,
            ) -> Result<serde_json::Value, agentloop_types::ToolError> {
                Ok(serde_json::json!("ok"))
            }
        }
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(NoopTool));

        let mut config = LoopConfig::default();
        config.max_iterations = Some(3);
        let agent = AgentLoopBuilder::new(provider, model_config(), template())
            .with_tools(Arc::new(registry))
            .with_config(config)
            .build();
        let mut history = Vec::new();
        let handle = LoopHandle::new();
        let budget = TokenCeilingBudget::new(1_000_000);
        let outcome = agent.run("loop", &mut history, &handle, &NullEventEmitter, &budget).await;
        assert!(matches!(outcome, AgentOutcome::MaxIterations));
    }

    /// A provider that always fails with a network-transient transport
    /// error, so the loop-level retry bound (spec §5, §7: "exactly one
    /// additional retry") can be observed directly.
    struct AlwaysTransientProvider {
        calls: AtomicUsize,
    }

    impl Provider for AlwaysTransientProvider {
        async fn infer(
            &self,
            _messages: Vec<ProviderMessage>,
            _tools: Vec<ToolDefinition>,
            _model_config: ModelConfig,
            _on_chunk: Box<dyn FnMut(StreamChunk) + Send>,
            _cancel: CancellationToken,
        ) -> Result<ModelResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Transport("connection reset by peer".to_string()))
        }
    }

    #[tokio::test]
    async fn network_transient_error_retries_exactly_once_then_surfaces() {
        let provider = AlwaysTransientProvider { calls: AtomicUsize::new(0) };
        let agent = AgentLoopBuilder::new(provider, model_config(), template()).build();
        let mut history = Vec::new();
        let handle = LoopHandle::new();
        let budget = TokenCeilingBudget::new(1_000_000);
        let outcome = agent.run("hi", &mut history, &handle, &NullEventEmitter, &budget).await;
        assert!(matches!(outcome, AgentOutcome::Error(LoopError::Provider(_))));
        assert_eq!(agent.provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_only_stop_nudge_fires_once_then_allows_completion() {
        let provider = ScriptedProvider::new(vec![
            tool_call_response("c1", "read_file", r#"{"path":"a.txt"}"#),
            text_response("looks fine, nothing to change"),
            text_response("done"),
        ]);

        struct ReadTool;
        #[async_trait::async_trait]
        impl agentloop_tool::ToolDyn for ReadTool {
            fn name(&self) -> &str {
                "read_file"
            }
            fn description(&self) -> &str {
                "reads a file"
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({})
            }
            fn kind(&self) -> ToolKind {
                ToolKind::ParallelSafe
            }
            async fn call(
                &self,
                _arguments: serde_json::Map<String, serde_json::Value>,
                _context: &ToolContext,
            ) -> Result<serde_json::Value, agentloop_types::ToolError> {
                Ok(serde_json::json!("contents"))
            }
        }
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ReadTool));

        let agent = AgentLoopBuilder::new(provider, model_config(), template())
            .with_tools(Arc::new(registry))
            .build();
        let mut history = Vec::new();
        let handle = LoopHandle::new();
        let budget = TokenCeilingBudget::new(1_000_000);
        let outcome = agent
            .run("check a.txt", &mut history, &handle, &NullEventEmitter, &budget)
            .await;
        match outcome {
            AgentOutcome::Completed { final_text } => assert_eq!(final_text, "done"),
            other => panic!("expected Completed, got {other:?}"),
        }
        assert!(history.iter().any(|m| m.is_meta
            && m.content.as_text().is_some_and(|t| t.contains("without having made any change"))));
    }
}
