//! Tool registry and dependency-aware scheduler (spec §4.2).
//!
//! Any tool source (local function, MCP server, HTTP endpoint) implements
//! [`ToolDyn`]. The [`ToolRegistry`] holds them as `Arc<dyn ToolDyn>` keyed
//! by name, classified as [`ToolKind::ParallelSafe`] or
//! [`ToolKind::Mutating`] so the [`scheduler`] can maximise parallelism
//! while preserving causal ordering.

pub mod dag;
pub mod sanitize;
pub mod scheduler;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use agentloop_types::{ToolArguments, ToolCall, ToolError};
use tokio_util::sync::CancellationToken;

/// Whether a tool's effect is limited to reading external state (safe to
/// run concurrently with other parallel-safe tools) or whether it mutates
/// state (must be serialized relative to other mutating calls).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    ParallelSafe,
    Mutating,
}

/// Per-call execution context handed to a tool by the scheduler (spec
/// §4.2's `(name, args, context)` contract).
#[derive(Clone)]
pub struct ToolContext {
    pub generation_id: String,
    pub working_directory: String,
    pub session_id: Option<String>,
    pub model_config_name: String,
    pub pre_approved_tools: Arc<std::collections::HashSet<String>>,
    pub attachments: Vec<agentloop_types::Attachment>,
    pub tool_call_id: agentloop_types::ToolCallId,
    pub cancellation: CancellationToken,
}

impl ToolContext {
    pub fn is_pre_approved(&self, tool_name: &str) -> bool {
        self.pre_approved_tools.contains(tool_name)
    }
}

/// Object-safe trait for tool implementations.
///
/// Mirrors the embedder-facing `execute(name, args, context) -> ToolResult`
/// contract in spec §6: the core never inspects tool internals, only the
/// returned value.
#[async_trait::async_trait]
pub trait ToolDyn: Send + Sync {
    /// The tool's unique, registry-key name.
    fn name(&self) -> &str;

    /// Human-readable description offered to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;

    /// Parallel-safe vs. mutating classification (spec §4.2).
    fn kind(&self) -> ToolKind {
        ToolKind::Mutating
    }

    /// File paths this call would read, derived from `arguments` (used to
    /// build WAR edges in the dependency DAG). Default: none.
    fn reads(&self, _arguments: &serde_json::Map<String, serde_json::Value>) -> Vec<String> {
        Vec::new()
    }

    /// File paths this call would write (used to build WAR/WAW edges).
    /// Default: none — override for `write_file`, `edit_file`, shell tools
    /// whose command redirects output.
    fn writes(&self, _arguments: &serde_json::Map<String, serde_json::Value>) -> Vec<String> {
        Vec::new()
    }

    /// Execute the tool with the given arguments and context.
    async fn call(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
        context: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Classifies a tool by the MCP-style naming convention: names prefixed
/// with `mcp_` that don't contain "write"/"create" are read-only (spec
/// §4.2). Used as a fallback when a dynamically-registered tool (e.g. an
/// MCP server's tool) has no statically-declared [`ToolKind`].
pub fn classify_by_name(name: &str) -> ToolKind {
    if let Some(rest) = name.strip_prefix("mcp_") {
        let lower = rest.to_ascii_lowercase();
        if !lower.contains("write") && !lower.contains("create") {
            return ToolKind::ParallelSafe;
        }
    }
    ToolKind::Mutating
}

/// Registry of tools available to a run.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolDyn>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registers a tool, overwriting any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn ToolDyn>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolDyn>> {
        self.tools.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ToolDyn>> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// The classification the scheduler should use for `name`: the tool's
    /// own declared [`ToolKind`] if registered, else the naming-convention
    /// fallback (spec §4.2).
    pub fn kind_of(&self, name: &str) -> ToolKind {
        self.tools
            .get(name)
            .map(|t| t.kind())
            .unwrap_or_else(|| classify_by_name(name))
    }

    /// Tool definitions offered to the model, for building the `tools`
    /// parameter of the provider's `infer` call.
    pub fn definitions(&self) -> Vec<agentloop_types::ToolDefinition> {
        self.tools
            .values()
            .map(|t| agentloop_types::ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.input_schema(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A closure-backed [`ToolDyn`] for quick registration of simple tools
/// without a dedicated type, mirroring how tests across the workspace wire
/// up mock tools.
pub struct FnTool<F> {
    name: String,
    description: String,
    schema: serde_json::Value,
    kind: ToolKind,
    func: F,
}

impl<F> FnTool<F>
where
    F: Fn(
            serde_json::Map<String, serde_json::Value>,
        ) -> Pin<
            Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send>,
        > + Send
        + Sync,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
        kind: ToolKind,
        func: F,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            kind,
            func,
        }
    }
}

#[async_trait::async_trait]
impl<F> ToolDyn for FnTool<F>
where
    F: Fn(
            serde_json::Map<String, serde_json::Value>,
        ) -> Pin<
            Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send>,
        > + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn input_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }
    fn kind(&self) -> ToolKind {
        self.kind
    }
    async fn call(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
        _context: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        (self.func)(arguments).await
    }
}

/// Resolves a [`ToolCall`]'s arguments, surfacing a parse-error failure
/// tuple instead of panicking when the model's JSON was malformed (spec
/// §7, `TOOL_ARGUMENTS_PARSE_ERROR`).
pub fn resolve_arguments(
    call: &ToolCall,
) -> Result<&serde_json::Map<String, serde_json::Value>, ToolError> {
    match &call.arguments {
        ToolArguments::Parsed(map) => Ok(map),
        ToolArguments::ParseError { raw, message } => Err(ToolError::ArgumentsParseError {
            raw: raw.clone(),
            message: message.clone(),
        }),
    }
}
