//! Composition integration tests: verify the facade crate's `prelude`
//! exposes enough surface to assemble and run an `AgentLoop` end to end
//! against a mock provider and a mock tool, without reaching into any
//! `agentloop-*` crate directly.

use agentloop::prelude::*;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

struct MockProvider {
    responses: Mutex<Vec<ModelResponse>>,
}

impl MockProvider {
    fn new(responses: Vec<ModelResponse>) -> Self {
        Self { responses: Mutex::new(responses) }
    }

    fn text(text: &str) -> ModelResponse {
        ModelResponse {
            content: Some(text.to_string()),
            thinking: None,
            tool_calls: None,
            truncated: false,
            finish_reason: Some(agentloop_types::FinishReason::EndTurn),
            usage: None,
        }
    }

    fn tool_call(id: &str, name: &str, args: serde_json::Value) -> ModelResponse {
        ModelResponse {
            content: None,
            thinking: None,
            tool_calls: Some(vec![agentloop_types::RawToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments_json: args.to_string(),
            }]),
            truncated: false,
            finish_reason: Some(agentloop_types::FinishReason::ToolUse),
            usage: None,
        }
    }
}

impl Provider for MockProvider {
    async fn infer(
        &self,
        _messages: Vec<agentloop_types::ProviderMessage>,
        _tools: Vec<agentloop_types::ToolDefinition>,
        _model_config: ModelConfig,
        _on_chunk: Box<dyn FnMut(agentloop_types::StreamChunk) + Send>,
        _cancel: CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        Ok(self.responses.lock().unwrap().remove(0))
    }
}

struct EchoTool;

#[async_trait::async_trait]
impl ToolDyn for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "echo text back"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }

    fn kind(&self) -> ToolKind {
        ToolKind::ParallelSafe
    }

    async fn call(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
        _context: &ToolContext,
    ) -> Result<serde_json::Value, agentloop_types::ToolError> {
        let text = arguments.get("text").and_then(|v| v.as_str()).unwrap_or_default();
        Ok(serde_json::json!({ "echoed": text }))
    }
}

fn template() -> PromptTemplate {
    PromptTemplate {
        tier: GenerationTier(1),
        complexity: TaskComplexity::Full,
        working_directory: "/tmp/project".to_string(),
        working_directory_kind: WorkingDirectoryKind::UserProject,
        base_prompt_simple: "You are a helpful assistant.".to_string(),
        base_prompt_full: "You are a helpful assistant.".to_string(),
    }
}

fn model_config() -> ModelConfig {
    ModelConfig { model: "mock".to_string(), max_tokens: 1024, temperature: None, system: None }
}

#[tokio::test]
async fn minimal_agent_text_response() {
    let provider = MockProvider::new(vec![MockProvider::text("Paris")]);
    let agent = AgentLoopBuilder::new(provider, model_config(), template()).build();

    let mut history: Vec<Message> = Vec::new();
    let handle = LoopHandle::new();
    let budget = TokenCeilingBudget::new(100_000);
    let outcome = agent
        .run("What is the capital of France?", &mut history, &handle, &NullEventEmitter, &budget)
        .await;

    match outcome {
        AgentOutcome::Completed { final_text } => assert_eq!(final_text, "Paris"),
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn agent_with_tool_calls_then_text_response() {
    let provider = MockProvider::new(vec![
        MockProvider::tool_call("call-1", "echo", serde_json::json!({"text": "hello"})),
        MockProvider::text("I echoed: hello"),
    ]);
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));

    let agent = AgentLoopBuilder::new(provider, model_config(), template())
        .with_tools(Arc::new(tools))
        .build();

    let mut history: Vec<Message> = Vec::new();
    let handle = LoopHandle::new();
    let budget = TokenCeilingBudget::new(100_000);
    let outcome =
        agent.run("Echo hello", &mut history, &handle, &NullEventEmitter, &budget).await;

    match outcome {
        AgentOutcome::Completed { final_text } => assert_eq!(final_text, "I echoed: hello"),
        other => panic!("expected Completed, got {other:?}"),
    }
    assert!(history.iter().any(|m| m.tool_calls.is_some()));
    assert!(history.iter().any(|m| m.tool_results.is_some()));
}

#[tokio::test]
async fn agent_respects_max_iterations() {
    let responses = (0..5)
        .map(|i| MockProvider::tool_call(&format!("call-{i}"), "echo", serde_json::json!({"text": i.to_string()})))
        .collect();
    let provider = MockProvider::new(responses);
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));

    let mut config = LoopConfig::default();
    config.max_iterations = Some(2);
    let agent = AgentLoopBuilder::new(provider, model_config(), template())
        .with_tools(Arc::new(tools))
        .with_config(config)
        .build();

    let mut history: Vec<Message> = Vec::new();
    let handle = LoopHandle::new();
    let budget = TokenCeilingBudget::new(100_000);
    let outcome = agent.run("keep echoing", &mut history, &handle, &NullEventEmitter, &budget).await;
    assert!(matches!(outcome, AgentOutcome::MaxIterations));
}

#[tokio::test]
async fn hook_dispatcher_blocks_pre_tool_call() {
    struct BlockEverything;
    #[async_trait::async_trait]
    impl agentloop_hooks::Hook for BlockEverything {
        fn name(&self) -> &str {
            "block_everything"
        }
        fn points(&self) -> &[HookPoint] {
            &[HookPoint::PreToolUse]
        }
        async fn on_event(
            &self,
            _ctx: &HookContext,
        ) -> Result<HookDecision, agentloop_types::HookError> {
            Ok(HookDecision::halt("blocked by policy"))
        }
    }

    let mut dispatcher = HookDispatcher::new();
    dispatcher.register(Arc::new(BlockEverything));
    let decision = dispatcher.dispatch(&HookContext::for_point(HookPoint::PreToolUse)).await;
    assert!(!decision.should_proceed);
    assert_eq!(decision.message.as_deref(), Some("blocked by policy"));
}

#[test]
fn prelude_types_are_accessible() {
    let _config = LoopConfig::default();
    let _budget = TokenCeilingBudget::new(0);
    let tools = ToolRegistry::new();
    let _ = tools.kind_of("anything");
}
