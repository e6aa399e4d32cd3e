//! HTTP routes.
//!
//! Thin delivery boundary: turn triggers, the per-message chunk stream,
//! image status/pull, and the workshop event feed. Everything stateful
//! lives in [`App`]; handlers only translate between HTTP and the ports.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use fabula_domain::{
    AiPlatformKind, Chunk, GameId, GameSession, MessageId, PlayerInput, SessionId, SessionMessage,
    StatusField, TokenUsage, UserId, WorkshopEvent, WorkshopId,
};

use crate::app::App;
use crate::use_cases::TurnError;

/// Create all HTTP routes.
pub fn routes() -> Router<Arc<App>> {
    Router::new()
        .route("/", get(health))
        .route("/api/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/turns", post(post_turn))
        .route(
            "/api/sessions/{session_id}/messages/{message_id}/stream",
            get(stream_turn),
        )
        .route("/api/messages/{id}", get(get_message))
        .route("/api/messages/{id}/image/status", get(image_status))
        .route("/api/messages/{id}/image", get(pull_image))
        .route("/api/messages/{id}/audio", get(pull_audio))
        .route(
            "/api/workshops/{id}/events",
            get(workshop_events).post(publish_workshop_event),
        )
}

async fn health() -> &'static str {
    "OK"
}

// =============================================================================
// Sessions and turns
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub game_id: Option<Uuid>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub platform: Option<AiPlatformKind>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub status_fields_definition: Option<String>,
    #[serde(default)]
    pub system_instructions: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

async fn create_session(
    State(app): State<Arc<App>>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<GameSession>, ApiError> {
    let session = GameSession {
        id: SessionId::new(),
        game_id: body.game_id.map(GameId::from_uuid).unwrap_or_default(),
        user_id: body.user_id.map(UserId::from_uuid).unwrap_or_default(),
        platform: body.platform.unwrap_or(AiPlatformKind::Mock),
        model: body.model.unwrap_or_else(|| "mock-small".to_string()),
        api_key: body.api_key.unwrap_or_default(),
        status_fields_definition: body.status_fields_definition.unwrap_or_default(),
        system_instructions: body.system_instructions.unwrap_or_default(),
        status_fields: Vec::new(),
        language: body.language.unwrap_or_else(|| "en".to_string()),
        created_at: chrono::Utc::now(),
    };
    app.sessions.save(&session).await?;
    Ok(Json(session))
}

async fn get_session(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> Result<Json<GameSession>, ApiError> {
    let session = app
        .sessions
        .get(SessionId::from_uuid(id))
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(session))
}

#[derive(Deserialize)]
pub struct TurnRequest {
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub message_id: MessageId,
    pub plot_outline: String,
    pub status_fields: Vec<StatusField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_prompt: Option<String>,
    pub usage: TokenUsage,
}

/// Run the blocking phase of a turn, then let the streaming phases run in
/// the background while the client attaches to the chunk stream.
async fn post_turn(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
    Json(body): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    let session = app
        .sessions
        .get(SessionId::from_uuid(id))
        .await?
        .ok_or(ApiError::NotFound)?;

    let input = match body.action {
        Some(action) if !action.trim().is_empty() => PlayerInput::Action(action),
        _ => PlayerInput::Start,
    };

    let started = app.turns.run_turn(&session, input).await?;
    tokio::spawn(started.phases.join());

    let message = started.message;
    Ok(Json(TurnResponse {
        message_id: message.id,
        plot_outline: message.plot_outline,
        status_fields: message.status_fields,
        image_prompt: message.image_prompt,
        usage: message.usage,
    }))
}

// =============================================================================
// Chunk stream (SSE)
// =============================================================================

/// Tracks the two sub-stream completion flags for one consumer.
#[derive(Default)]
struct DeliveryState {
    text_done: bool,
    image_done: bool,
}

impl DeliveryState {
    /// Returns true when `chunk` terminates the stream: an error chunk,
    /// or the chunk that completes the second of the two done flags.
    fn observe(&mut self, chunk: &Chunk) -> bool {
        if chunk.is_error() {
            return true;
        }
        if chunk.text_done == Some(true) {
            self.text_done = true;
        }
        if chunk.image_done == Some(true) {
            self.image_done = true;
        }
        self.text_done && self.image_done
    }
}

async fn stream_turn(
    State(app): State<Arc<App>>,
    Path((session_id, message_id)): Path<(Uuid, Uuid)>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let session_id = SessionId::from_uuid(session_id);
    let message_id = MessageId::from_uuid(message_id);

    let message = app
        .messages
        .get(message_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if message.session_id != session_id {
        return Err(ApiError::NotFound);
    }

    // Single consumer: the first attach takes the receiver.
    let rx = app.streams.attach(message_id).await.ok_or(ApiError::NotFound)?;
    let streams = Arc::clone(&app.streams);

    struct StreamState {
        rx: mpsc::Receiver<Chunk>,
        delivery: DeliveryState,
        finished: bool,
    }

    let state = StreamState {
        rx,
        delivery: DeliveryState::default(),
        finished: false,
    };

    let stream = stream::unfold(state, move |mut state| {
        let streams = Arc::clone(&streams);
        async move {
            if state.finished {
                streams.remove(message_id).await;
                return None;
            }
            let chunk = match state.rx.recv().await {
                Some(chunk) => chunk,
                None => {
                    streams.remove(message_id).await;
                    return None;
                }
            };
            state.finished = state.delivery.observe(&chunk);
            Some((Event::default().json_data(&chunk), state))
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// =============================================================================
// Messages and artifacts
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: MessageId,
    pub session_id: SessionId,
    pub plot_outline: String,
    pub message: String,
    pub status_fields: Vec<StatusField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_prompt: Option<String>,
    pub has_image: bool,
    pub has_audio: bool,
    pub usage: TokenUsage,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<SessionMessage> for MessageView {
    fn from(message: SessionMessage) -> Self {
        Self {
            id: message.id,
            session_id: message.session_id,
            plot_outline: message.plot_outline,
            message: message.message,
            status_fields: message.status_fields,
            image_prompt: message.image_prompt,
            has_image: message.image.is_some(),
            has_audio: message.audio.is_some(),
            usage: message.usage,
            created_at: message.created_at,
        }
    }
}

async fn get_message(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageView>, ApiError> {
    let message = app
        .messages
        .get(MessageId::from_uuid(id))
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(MessageView::from(message)))
}

async fn image_status(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> Result<Json<crate::streams::ImageStatus>, ApiError> {
    let status = app
        .images
        .status(MessageId::from_uuid(id))
        .await
        .ok_or(ApiError::NotFound)?;
    Ok(Json(status))
}

/// Latest image bytes for a message: the cache while generation is in
/// flight, the persisted message after the entry has been evicted.
async fn pull_image(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, ApiError> {
    let message_id = MessageId::from_uuid(id);

    if let Some((bytes, hash)) = app.images.image(message_id).await {
        return Ok((
            [
                (header::CONTENT_TYPE, "image/png".to_string()),
                (header::ETAG, format!("\"{hash}\"")),
            ],
            bytes,
        )
            .into_response());
    }

    let message = app
        .messages
        .get(message_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let bytes = message.image.ok_or(ApiError::NotFound)?;
    Ok(([(header::CONTENT_TYPE, "image/png".to_string())], bytes).into_response())
}

async fn pull_audio(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let message = app
        .messages
        .get(MessageId::from_uuid(id))
        .await?
        .ok_or(ApiError::NotFound)?;
    let bytes = message.audio.ok_or(ApiError::NotFound)?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg".to_string())], bytes))
}

// =============================================================================
// Workshop events
// =============================================================================

async fn workshop_events(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = app.events.subscribe(WorkshopId::from_uuid(id));

    let stream = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((Event::default().json_data(&event), subscription))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Relay endpoint for services that own game CRUD: they publish change
/// notifications here and every watching client gets them fanned out.
async fn publish_workshop_event(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
    Json(event): Json<WorkshopEvent>,
) -> StatusCode {
    app.events.publish(WorkshopId::from_uuid(id), event);
    StatusCode::ACCEPTED
}

// =============================================================================
// Errors
// =============================================================================

pub enum ApiError {
    NotFound,
    BadRequest(String),
    Upstream { code: &'static str, message: String },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found").into_response(),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Upstream { code, message } => (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": code, "message": message })),
            )
                .into_response(),
            ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}

impl From<crate::infrastructure::ports::RepoError> for ApiError {
    fn from(e: crate::infrastructure::ports::RepoError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<TurnError> for ApiError {
    fn from(e: TurnError) -> Self {
        match e {
            TurnError::Ai(err) => ApiError::Upstream {
                code: err.code(),
                message: err.to_string(),
            },
            TurnError::Repo(err) => ApiError::Internal(err.to_string()),
        }
    }
}
