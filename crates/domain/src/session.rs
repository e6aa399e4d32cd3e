//! Session and message entities.
//!
//! A `GameSession` is one running game instance; a `SessionMessage` is the
//! record of a single turn. Both are owned by the persistence layer — the
//! engine receives them per turn and must not assume they outlive it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{GameId, MessageId, SessionId, UserId};

/// An ordered (name, value) pair of game state.
///
/// Order is semantically meaningful: it drives both display order and the
/// field order presented to the AI backend. Map-based intermediate
/// representations must never be allowed to reorder or drop fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusField {
    pub name: String,
    pub value: String,
}

impl StatusField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Which AI platform backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiPlatformKind {
    OpenAi,
    Ollama,
    Mock,
}

impl AiPlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::Mock => "mock",
        }
    }
}

impl std::fmt::Display for AiPlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the player submitted for a turn.
///
/// The first turn of a session is driven by the game's system
/// instructions rather than player text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum PlayerInput {
    /// System "start" marker for the opening turn.
    Start,
    /// Free-form player action text.
    Action(String),
}

impl PlayerInput {
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    /// Text sent to the AI backend for this input.
    pub fn as_text(&self) -> &str {
        match self {
            Self::Start => "",
            Self::Action(text) => text,
        }
    }
}

/// Token usage reported by an AI backend call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Accumulate usage from another call into this one.
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A running game instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSession {
    pub id: SessionId,
    pub game_id: GameId,
    pub user_id: UserId,
    /// Selected platform and model for this session.
    pub platform: AiPlatformKind,
    pub model: String,
    /// Already-resolved credential for the platform (billing/permission
    /// checks happen upstream).
    pub api_key: String,
    /// The game's declared ordered status-field list, as authored
    /// (newline/comma separated names).
    pub status_fields_definition: String,
    /// Accumulated status-field values after the most recent turn.
    pub status_fields: Vec<StatusField>,
    /// Scenario system instructions used for the opening turn.
    pub system_instructions: String,
    /// BCP-47 language tag for narration.
    pub language: String,
    pub created_at: DateTime<Utc>,
}

/// One turn's record.
///
/// Created at turn start and mutated in place as each phase completes;
/// persisted through the repo port once each phase finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub input: PlayerInput,
    /// Resolved narrative plot outline from the blocking phase.
    pub plot_outline: String,
    /// Final expanded narration text (filled by the narrative phase).
    pub message: String,
    /// Ordered status-field snapshot after this turn.
    pub status_fields: Vec<StatusField>,
    pub image_prompt: Option<String>,
    /// Final image bytes once persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
    /// Final narrated audio bytes once persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Vec<u8>>,
    pub usage: TokenUsage,
    /// Raw resolve-phase AI response, kept for debugging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SessionMessage {
    /// Create the empty record for a turn that is about to run.
    pub fn new(session_id: SessionId, input: PlayerInput) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            input,
            plot_outline: String::new(),
            message: String::new(),
            status_fields: Vec::new(),
            image_prompt: None,
            image: None,
            audio: None,
            usage: TokenUsage::default(),
            raw_response: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_input_start_has_no_text() {
        assert!(PlayerInput::Start.is_start());
        assert_eq!(PlayerInput::Start.as_text(), "");
        assert_eq!(
            PlayerInput::Action("go north".into()).as_text(),
            "go north"
        );
    }

    #[test]
    fn token_usage_accumulates() {
        let mut usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        usage.add(TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(usage.total_tokens, 18);
    }
}
