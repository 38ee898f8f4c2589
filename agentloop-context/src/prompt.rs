//! System-prompt assembly (spec §4.5).
//!
//! Base prompt selection per generation/task-complexity, RAG augmentation
//! for higher tiers, proactive/cloud context for the highest tier, and the
//! working-directory block. Grounded on the teacher's `SystemInjector`
//! (turn/token-gated content) generalized from a turn-count trigger to a
//! generation-tier trigger, since this crate assembles a prompt once per
//! inference rather than injecting mid-history.

use sha2::{Digest, Sha256};

/// How capable the active model generation is, gating which prompt
/// sections are assembled (spec §4.5: "tier ≥ 3" for RAG, "tier ≥ 5" for
/// proactive/cloud context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GenerationTier(pub u8);

/// Whether the task at hand warrants the full system prompt or a
/// stripped-down fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskComplexity {
    Simple,
    Full,
}

/// Where the working directory points, selecting which directory block
/// variant is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingDirectoryKind {
    UserProject,
    DefaultScratch,
}

/// Externally-sourced content blocks a caller may supply for assembly.
/// Each is optional; a `None` section is simply omitted.
#[derive(Debug, Clone, Default)]
pub struct PromptSources {
    pub rag_context: Option<String>,
    pub proactive_context: Option<String>,
    pub cloud_context: Option<String>,
}

/// Inputs to one system-prompt assembly call.
#[derive(Debug, Clone)]
pub struct PromptRequest<'a> {
    pub tier: GenerationTier,
    pub complexity: TaskComplexity,
    pub working_directory: &'a str,
    pub working_directory_kind: WorkingDirectoryKind,
    pub base_prompt_simple: &'a str,
    pub base_prompt_full: &'a str,
    pub sources: PromptSources,
}

/// An assembled system prompt plus its telemetry hash.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub text: String,
    /// SHA-256 hex digest of `text`, captured once per turn per spec §4.5.
    pub telemetry_hash: String,
}

const RAG_TIER_THRESHOLD: u8 = 3;
const PROACTIVE_TIER_THRESHOLD: u8 = 5;

/// Assembles the system prompt for one inference, following spec §4.5's
/// ordering: base prompt, RAG (tier ≥ 3), proactive/cloud (tier ≥ 5),
/// working-directory block, then hash the result.
pub fn assemble_system_prompt(request: &PromptRequest<'_>) -> AssembledPrompt {
    let mut sections = Vec::new();

    let base = match request.complexity {
        TaskComplexity::Simple => request.base_prompt_simple,
        TaskComplexity::Full => request.base_prompt_full,
    };
    sections.push(base.to_string());

    if request.tier.0 >= RAG_TIER_THRESHOLD {
        if let Some(rag) = &request.sources.rag_context {
            sections.push(rag.clone());
        }
    }

    if request.tier.0 >= PROACTIVE_TIER_THRESHOLD {
        if let Some(proactive) = &request.sources.proactive_context {
            sections.push(proactive.clone());
        }
        if let Some(cloud) = &request.sources.cloud_context {
            sections.push(cloud.clone());
        }
    }

    sections.push(working_directory_block(
        request.working_directory,
        request.working_directory_kind,
    ));

    let text = sections.join("\n\n");
    let telemetry_hash = hash_prompt(&text);
    AssembledPrompt { text, telemetry_hash }
}

fn working_directory_block(path: &str, kind: WorkingDirectoryKind) -> String {
    match kind {
        WorkingDirectoryKind::UserProject => {
            format!("You are working in the project directory: {path}\nTreat this as the user's own codebase.")
        }
        WorkingDirectoryKind::DefaultScratch => {
            format!(
                "You are working in a scratch directory: {path}\nNo project has been selected; avoid assuming existing structure."
            )
        }
    }
}

/// Replaces a minimal vision-only instruction when a fallback model lacks
/// tool-call support (spec §4.6), superseding whatever the normal assembly
/// path would have produced.
pub fn vision_only_prompt() -> String {
    "You can see and describe images, but tool use is temporarily unavailable for this response. \
     Answer using only what is visible in the attached content."
        .to_string()
}

fn hash_prompt(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
