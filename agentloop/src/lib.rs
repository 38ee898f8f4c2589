#![deny(missing_docs)]
//! # agentloop — umbrella crate
//!
//! Single import surface for the agent control loop workspace: the
//! iteration controller, tool scheduler, anti-pattern detector, circuit
//! breaker, context/message manager, and fallback router described in the
//! crate's design document. Re-exports the component crates behind
//! feature flags, plus a [`prelude`] for the common case of building an
//! [`agentloop_core::AgentLoop`].
//!
//! ```no_run
//! use agentloop::prelude::*;
//!
//! # async fn example<P: Provider>(provider: P, model_config: ModelConfig, prompt: PromptTemplate) {
//! let agent = AgentLoopBuilder::new(provider, model_config, prompt).build();
//! let mut history = Vec::new();
//! let handle = LoopHandle::new();
//! let budget = TokenCeilingBudget::new(100_000);
//! let _outcome = agent.run("fix the failing test", &mut history, &handle, &NullEventEmitter, &budget).await;
//! # }
//! ```

#[cfg(feature = "core")]
pub use agentloop_context;
#[cfg(feature = "core")]
pub use agentloop_core;
#[cfg(feature = "hooks")]
pub use agentloop_hooks;
#[cfg(feature = "core")]
pub use agentloop_tool;
#[cfg(feature = "core")]
pub use agentloop_types;

/// Happy-path imports for composing an agent loop.
pub mod prelude {
    #[cfg(feature = "core")]
    pub use agentloop_types::{
        AgentEvent, ChannelEventEmitter, EventEmitter, Message, ModelConfig, ModelResponse,
        NullEventEmitter, Provider, ProviderError, Role, ToolCall, ToolResult,
    };

    #[cfg(feature = "core")]
    pub use agentloop_tool::{ToolContext, ToolDyn, ToolKind, ToolRegistry};

    #[cfg(feature = "core")]
    pub use agentloop_context::{
        Budget, ContextManager, GenerationTier, TaskComplexity, TokenCeilingBudget,
        WorkingDirectoryKind,
    };

    #[cfg(feature = "hooks")]
    pub use agentloop_hooks::{HookContext, HookDecision, HookDispatcher, HookPoint};

    #[cfg(feature = "core")]
    pub use agentloop_core::{
        AgentLoop, AgentLoopBuilder, AgentOutcome, LoopConfig, LoopHandle, PromptTemplate,
    };
}
