//! Workshop change events.
//!
//! Small notifications multicast to every client watching a workshop so
//! their views refresh live. Transient: never persisted, and may be
//! dropped under backpressure.

use serde::{Deserialize, Serialize};

use crate::ids::{GameId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkshopEventType {
    WorkshopUpdated,
    GameCreated,
    GameUpdated,
    GameDeleted,
}

/// A typed workshop notification.
///
/// `data` is a pre-serialized JSON string payload (the frontend contract),
/// carrying the acting user so receivers can ignore self-triggered
/// refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkshopEvent {
    #[serde(rename = "type")]
    pub event_type: WorkshopEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GamePayload {
    game_id: GameId,
    triggered_by: UserId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserPayload {
    triggered_by: UserId,
}

impl WorkshopEvent {
    pub fn workshop_updated(triggered_by: UserId) -> Self {
        Self {
            event_type: WorkshopEventType::WorkshopUpdated,
            data: serde_json::to_string(&UserPayload { triggered_by }).ok(),
        }
    }

    pub fn game_created(game_id: GameId, triggered_by: UserId) -> Self {
        Self::game_event(WorkshopEventType::GameCreated, game_id, triggered_by)
    }

    pub fn game_updated(game_id: GameId, triggered_by: UserId) -> Self {
        Self::game_event(WorkshopEventType::GameUpdated, game_id, triggered_by)
    }

    pub fn game_deleted(game_id: GameId, triggered_by: UserId) -> Self {
        Self::game_event(WorkshopEventType::GameDeleted, game_id, triggered_by)
    }

    fn game_event(event_type: WorkshopEventType, game_id: GameId, triggered_by: UserId) -> Self {
        Self {
            event_type,
            data: serde_json::to_string(&GamePayload {
                game_id,
                triggered_by,
            })
            .ok(),
        }
    }
}
