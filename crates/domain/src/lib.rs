//! Fabula domain types.
//!
//! Core types shared between the engine and any future client crates:
//! typed identifiers, session/message entities, the streamed chunk wire
//! type, and workshop change events. No async, no I/O.

pub mod chunk;
pub mod events;
pub mod ids;
pub mod session;

pub use chunk::Chunk;
pub use events::{WorkshopEvent, WorkshopEventType};
pub use ids::{ApiKeyId, GameId, MessageId, SessionId, UserId, WorkshopId};
pub use session::{
    AiPlatformKind, GameSession, PlayerInput, SessionMessage, StatusField, TokenUsage,
};
