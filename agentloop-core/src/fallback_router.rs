//! The Fallback Router (spec §4.6): detects capabilities the current model
//! lacks, swaps to a configured fallback model for a single inference, or
//! strips incompatible content when no fallback is available.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use agentloop_types::{Attachment, AttachmentData, ContentPart, Message, MessageBody};

/// A capability a model may or may not support. Only `Vision` exists
/// today; more may be added without changing the router's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Capability {
    Vision,
}

/// An opaque credential handed back by a [`CredentialSource`], scoped to
/// one inference and never logged or serialized.
pub struct Credential {
    value: String,
}

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").field("value", &"[REDACTED]").finish()
    }
}

/// Errors raised while acquiring a fallback credential.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential configured for {model}")]
    NotConfigured { model: String },
    #[error("credential source requires a privileged caller for {model}")]
    PrivilegedOnly { model: String },
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A source of credentials for a fallback model (spec §4.6: "local key,
/// else a cloud-proxy path reserved for privileged users").
///
/// Implementations are tried in order by [`CredentialChain`], mirroring an
/// auth-provider chain: local-key lookups are attempted first, cheaper
/// reserved-path credential brokers last.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn acquire(&self, model: &str, privileged: bool) -> Result<Credential, CredentialError>;
}

/// Tries configured credential sources in order until one succeeds.
#[derive(Default)]
pub struct CredentialChain {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Box<dyn CredentialSource>) -> Self {
        self.sources.push(source);
        self
    }
}

#[async_trait]
impl CredentialSource for CredentialChain {
    async fn acquire(&self, model: &str, privileged: bool) -> Result<Credential, CredentialError> {
        let mut last_err = None;
        for source in &self.sources {
            match source.acquire(model, privileged).await {
                Ok(credential) => return Ok(credential),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(CredentialError::NotConfigured { model: model.to_string() }))
    }
}

/// A model the router may fall back to for a given capability.
#[derive(Debug, Clone)]
pub struct FallbackModel {
    pub model: String,
    pub supports_tool_calls: bool,
    /// Whether acquiring this model's credential requires a privileged
    /// caller (the reserved cloud-proxy path).
    pub requires_privileged_credential: bool,
}

/// Configured fallback targets, keyed by the capability they provide.
#[derive(Debug, Clone, Default)]
pub struct FallbackConfig {
    vision_model: Option<FallbackModel>,
}

impl FallbackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vision_model(mut self, model: FallbackModel) -> Self {
        self.vision_model = Some(model);
        self
    }

    fn model_for(&self, capability: Capability) -> Option<&FallbackModel> {
        match capability {
            Capability::Vision => self.vision_model.as_ref(),
        }
    }
}

/// The minimal vision-only system prompt substituted in when a fallback
/// model lacks tool-call support (spec §4.6).
pub const VISION_ONLY_NOTICE: &str =
    "Tools are temporarily disabled for this turn: the model handling image \
     content does not support tool calls. Describe what you observe in the \
     image instead of attempting to call a tool.";

/// What the router decided for one inference, surfaced to the loop
/// controller so it can emit the right events and adjust the request.
#[derive(Debug, Clone, Default)]
pub struct RoutingOutcome {
    /// Set when the effective model for this inference changed.
    pub model_override: Option<String>,
    /// Emit `model_fallback { reason, from, to }` for each of these.
    pub fallback_events: Vec<FallbackEvent>,
    /// Emit `api_key_required` for each of these.
    pub api_key_required: Vec<Capability>,
    /// Strip image content parts/attachments before sending.
    pub strip_images: bool,
    /// Clear the tool list and substitute [`VISION_ONLY_NOTICE`] as the
    /// system prompt for this inference.
    pub disable_tools: bool,
}

#[derive(Debug, Clone)]
pub struct FallbackEvent {
    pub reason: Capability,
    pub from: String,
    pub to: String,
}

/// Routes one inference request around capability gaps in the primary
/// model.
///
/// Holds its credential source as a trait object rather than a generic
/// parameter: the loop controller is already generic over `P: Provider`
/// and adding a second type parameter here would only complicate its
/// signature for a collaborator called once per inference, off the hot
/// tool-dispatch path.
pub struct FallbackRouter {
    config: FallbackConfig,
    credentials: Arc<dyn CredentialSource>,
}

impl FallbackRouter {
    pub fn new(config: FallbackConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        Self { config, credentials }
    }

    /// Decides how to route this inference given the primary model's
    /// declared capabilities and the outgoing messages.
    ///
    /// `primary_model` identifies the model currently configured; `privileged`
    /// gates the reserved cloud-proxy credential path; `heuristic_override`
    /// should be `true` when the caller detected the user asking for a
    /// *tool* operation on the image (annotate/draw/box) — in that case the
    /// router must not hand the turn to a vision-only fallback.
    pub async fn route(
        &self,
        primary_model: &str,
        primary_has_vision: bool,
        messages: &[Message],
        privileged: bool,
        heuristic_override: bool,
    ) -> RoutingOutcome {
        let mut outcome = RoutingOutcome::default();

        if primary_has_vision || !has_image_content(messages) {
            return outcome;
        }

        if heuristic_override {
            outcome.strip_images = true;
            return outcome;
        }

        let Some(fallback) = self.config.model_for(Capability::Vision) else {
            outcome.api_key_required.push(Capability::Vision);
            outcome.strip_images = true;
            return outcome;
        };

        match self
            .credentials
            .acquire(&fallback.model, fallback.requires_privileged_credential && privileged)
            .await
        {
            Ok(_credential) => {
                outcome.model_override = Some(fallback.model.clone());
                outcome.fallback_events.push(FallbackEvent {
                    reason: Capability::Vision,
                    from: primary_model.to_string(),
                    to: fallback.model.clone(),
                });
                if !fallback.supports_tool_calls {
                    outcome.disable_tools = true;
                }
            }
            Err(_err) => {
                outcome.api_key_required.push(Capability::Vision);
                outcome.strip_images = true;
            }
        }

        outcome
    }
}

/// Whether any message in the tail of history carries image content, as
/// content parts or as an unconverted base64 attachment.
fn has_image_content(messages: &[Message]) -> bool {
    messages.iter().rev().take(1).any(|message| {
        let parts_have_image = matches!(&message.content, MessageBody::Parts(parts)
            if parts.iter().any(|part| matches!(part, ContentPart::Image { .. })));
        let attachments_have_image = message
            .attachments
            .as_ref()
            .is_some_and(|attachments| attachments.iter().any(is_image_attachment));
        parts_have_image || attachments_have_image
    })
}

fn is_image_attachment(attachment: &Attachment) -> bool {
    attachment.media_type.starts_with("image/")
        && matches!(attachment.data, AttachmentData::Base64 { .. })
}

/// Strips image content parts and image attachments from a message list,
/// leaving text content untouched (spec §4.6: on credential failure,
/// "strip images from the messages before sending").
pub fn strip_images(messages: &mut [Message]) {
    for message in messages.iter_mut() {
        if let MessageBody::Parts(parts) = &mut message.content {
            parts.retain(|part| !matches!(part, ContentPart::Image { .. }));
        }
        if let Some(attachments) = &mut message.attachments {
            attachments.retain(|attachment| !is_image_attachment(attachment));
        }
    }
}

/// Heuristic detection of a user request that demands a *tool* operate on
/// an image (annotate/draw/box) rather than the model merely describing
/// it (spec §4.6). When this returns `true`, the router must not hand the
/// turn to a vision-only fallback.
pub fn requires_image_tool_operation(user_text: &str) -> bool {
    const VERBS: &[&str] = &["annotate", "draw", "box", "highlight", "crop", "mark up", "circle"];
    let lower = user_text.to_lowercase();
    VERBS.iter().any(|verb| lower.contains(verb))
}
