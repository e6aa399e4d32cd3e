//! Port traits for infrastructure boundaries.
//!
//! These are the only abstractions in the engine. Ports exist for:
//! - AI platform calls (OpenAI / Ollama / Mock)
//! - Persistence of sessions and messages (external relational store)

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use fabula_domain::{GameSession, MessageId, PlayerInput, SessionId, SessionMessage, TokenUsage};

// =============================================================================
// Error Types
// =============================================================================

/// AI platform failure, one variant per remediation the client can offer.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("Invalid API key")]
    InvalidApiKey,
    #[error("No active billing on this account")]
    BillingInactive,
    #[error("Organization verification required")]
    VerificationRequired,
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Quota exhausted")]
    QuotaExhausted,
    #[error("Content filtered: {0}")]
    ContentFiltered(String),
    #[error("Malformed AI response: {0}")]
    InvalidResponse(String),
    #[error("AI request failed: {0}")]
    RequestFailed(String),
}

impl AiError {
    /// Machine-readable code surfaced to the client (api-key "last error
    /// code", or the terminal error chunk).
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidApiKey => "invalid_api_key",
            Self::BillingInactive => "billing_inactive",
            Self::VerificationRequired => "verification_required",
            Self::RateLimited => "rate_limited",
            Self::QuotaExhausted => "quota_exhausted",
            Self::ContentFiltered(_) => "content_filtered",
            Self::InvalidResponse(_) => "invalid_response",
            Self::RequestFailed(_) => "ai_error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Not found")]
    NotFound,
    #[error("Storage error: {0}")]
    Storage(String),
}

// =============================================================================
// AI Platform Port
// =============================================================================

/// What the resolve phase produced: the authoritative turn state, before
/// any streaming embellishment runs.
#[derive(Debug, Clone)]
pub struct TurnResolution {
    /// Short plot outline the narrative phase expands.
    pub plot_outline: String,
    /// Flat field map; ordering is restored by the status codec.
    pub status: HashMap<String, String>,
    pub image_prompt: Option<String>,
    pub usage: TokenUsage,
    /// Raw backend response, persisted for debugging.
    pub raw_response: String,
}

/// JSON payload the resolve phase asks the backend to return,
/// schema-constrained via [`crate::status_schema::build_response_schema`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnPayload {
    pub plot_outline: String,
    #[serde(default)]
    pub status: HashMap<String, String>,
    #[serde(default)]
    pub image_prompt: Option<String>,
}

/// Result of the streaming narrative phase.
#[derive(Debug, Clone)]
pub struct NarrativeResult {
    pub text: String,
    pub usage: TokenUsage,
}

/// Incremental prose deltas from the narrative phase.
pub type TextSink = mpsc::Sender<String>;

/// Progressively-refined full images (not diffs) from the image phase.
pub type ImageSink = mpsc::Sender<Vec<u8>>;

/// Which optional phases a platform supports. Unsupported phases are
/// skipped by the orchestrator rather than surfaced as errors.
#[derive(Debug, Clone, Copy)]
pub struct AiCapabilities {
    pub images: bool,
    pub audio: bool,
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
}

/// Capability interface over AI platform backends.
///
/// `resolve_turn` is the cheap, blocking, schema-exact call whose result
/// is persisted as authoritative state. The streaming operations are
/// expensive and best-effort: they write incremental output to their sink
/// while running and return the final artifact when done.
#[async_trait]
pub trait AiPort: Send + Sync {
    fn capabilities(&self) -> AiCapabilities;

    /// Resolve a player action (or the session-start marker) into
    /// structured turn state. Must fail with a distinguishable
    /// [`AiError`] variant for credential, billing, verification, rate
    /// limit, quota, and content-filter conditions.
    async fn resolve_turn(
        &self,
        session: &GameSession,
        input: &PlayerInput,
        schema: serde_json::Value,
    ) -> Result<TurnResolution, AiError>;

    /// Expand the plot outline into 1-3 sentences of prose in the
    /// scenario's language, streaming deltas into `sink`.
    async fn expand_narrative(
        &self,
        session: &GameSession,
        plot_outline: &str,
        sink: TextSink,
    ) -> Result<NarrativeResult, AiError>;

    /// Produce an illustration, streaming refined full-image frames into
    /// `sink` and returning the final bytes.
    async fn generate_image(
        &self,
        session: &GameSession,
        prompt: &str,
        sink: ImageSink,
    ) -> Result<Vec<u8>, AiError>;

    /// Narrate `text`. Platforms without narration support return a
    /// no-op success with empty bytes.
    async fn generate_audio(&self, session: &GameSession, text: &str) -> Result<Vec<u8>, AiError>;

    async fn list_models(&self, session: &GameSession) -> Result<Vec<ModelInfo>, AiError>;

    async fn translate(
        &self,
        session: &GameSession,
        text: &str,
        language: &str,
    ) -> Result<(String, TokenUsage), AiError>;

    async fn generate_theme(
        &self,
        session: &GameSession,
        prompt: &str,
    ) -> Result<(String, TokenUsage), AiError>;
}

// =============================================================================
// Persistence Ports
// =============================================================================

#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn get(&self, id: SessionId) -> Result<Option<GameSession>, RepoError>;
    async fn save(&self, session: &GameSession) -> Result<(), RepoError>;
}

/// Message persistence. The setters are called from background phase
/// tasks after the initiating request may already have returned, so they
/// must be safe to call without a request context.
#[async_trait]
pub trait MessageRepo: Send + Sync {
    async fn create(&self, message: &SessionMessage) -> Result<(), RepoError>;
    async fn get(&self, id: MessageId) -> Result<Option<SessionMessage>, RepoError>;
    async fn set_text(&self, id: MessageId, text: &str, usage: TokenUsage)
        -> Result<(), RepoError>;
    async fn set_image(&self, id: MessageId, image: Vec<u8>) -> Result<(), RepoError>;
    async fn set_audio(&self, id: MessageId, audio: Vec<u8>) -> Result<(), RepoError>;
}
