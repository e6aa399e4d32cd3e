//! OpenAI platform client.
//!
//! Implements the full `AiPort` surface: schema-constrained turn
//! resolution, SSE-streamed narrative expansion, progressive image
//! generation, and TTS narration, plus the ancillary blocking calls.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use fabula_domain::{GameSession, PlayerInput, TokenUsage};

use crate::infrastructure::ports::{
    AiCapabilities, AiError, AiPort, ImageSink, ModelInfo, NarrativeResult, TextSink, TurnPayload,
    TurnResolution,
};
use crate::status_schema;

/// Default OpenAI base URL.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

const IMAGE_MODEL: &str = "gpt-image-1";
const AUDIO_MODEL: &str = "gpt-4o-mini-tts";
const AUDIO_VOICE: &str = "alloy";
/// Partial frames requested per image generation (plus the final one).
const PARTIAL_IMAGE_COUNT: u8 = 2;

/// Client for the OpenAI API.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str) -> Self {
        // Streaming generations can be slow; image calls override this
        // per request.
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create client from the `OPENAI_BASE_URL` environment variable,
    /// falling back to the public endpoint.
    pub fn from_env() -> Self {
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string());
        Self::new(&base_url)
    }

    /// Non-streaming chat completion.
    async fn chat(
        &self,
        session: &GameSession,
        request: &ChatRequest,
    ) -> Result<ChatResponse, AiError> {
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&session.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_api_error(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| AiError::InvalidResponse(e.to_string()))
    }

    /// Extract the first choice's content, honoring the content filter
    /// finish reason.
    fn first_content(response: ChatResponse) -> Result<(String, TokenUsage), AiError> {
        let usage = response.usage.map(convert_usage).unwrap_or_default();
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AiError::InvalidResponse("no choices in response".to_string()))?;
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(AiError::ContentFiltered(
                "response stopped by content filter".to_string(),
            ));
        }
        Ok((choice.message.content.unwrap_or_default(), usage))
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new(DEFAULT_OPENAI_BASE_URL)
    }
}

#[async_trait]
impl AiPort for OpenAiClient {
    fn capabilities(&self) -> AiCapabilities {
        AiCapabilities {
            images: true,
            audio: true,
        }
    }

    async fn resolve_turn(
        &self,
        session: &GameSession,
        input: &PlayerInput,
        schema: serde_json::Value,
    ) -> Result<TurnResolution, AiError> {
        let request = ChatRequest {
            model: session.model.clone(),
            messages: resolve_messages(session, input),
            temperature: Some(0.7),
            stream: None,
            stream_options: None,
            response_format: Some(ResponseFormat {
                r#type: "json_schema".to_string(),
                json_schema: JsonSchemaFormat {
                    name: "turn_resolution".to_string(),
                    strict: true,
                    schema,
                },
            }),
        };

        let response = self.chat(session, &request).await?;
        let (content, usage) = Self::first_content(response)?;

        let payload: TurnPayload = serde_json::from_str(&content)
            .map_err(|e| AiError::InvalidResponse(format!("non-conforming turn JSON: {e}")))?;

        Ok(TurnResolution {
            plot_outline: payload.plot_outline,
            status: payload.status,
            image_prompt: payload.image_prompt,
            usage,
            raw_response: content,
        })
    }

    async fn expand_narrative(
        &self,
        session: &GameSession,
        plot_outline: &str,
        sink: TextSink,
    ) -> Result<NarrativeResult, AiError> {
        let request = ChatRequest {
            model: session.model.clone(),
            messages: vec![
                ChatMessage::system(narrative_system_prompt(session)),
                ChatMessage::user(plot_outline),
            ],
            temperature: Some(0.9),
            stream: Some(true),
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
            response_format: None,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&session.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_api_error(status, &body));
        }

        let mut text = String::new();
        let mut usage = TokenUsage::default();
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| AiError::RequestFailed(e.to_string()))?;
            if event.data == "[DONE]" {
                break;
            }
            let chunk: ChatStreamChunk = serde_json::from_str(&event.data)
                .map_err(|e| AiError::InvalidResponse(e.to_string()))?;
            if let Some(chunk_usage) = chunk.usage {
                usage = convert_usage(chunk_usage);
            }
            if let Some(choice) = chunk.choices.into_iter().next() {
                if choice.finish_reason.as_deref() == Some("content_filter") {
                    return Err(AiError::ContentFiltered(
                        "narration stopped by content filter".to_string(),
                    ));
                }
                if let Some(delta) = choice.delta.content {
                    if !delta.is_empty() {
                        text.push_str(&delta);
                        // A vanished consumer cancels the pipeline but
                        // must not fail the generation.
                        let _ = sink.send(delta).await;
                    }
                }
            }
        }

        Ok(NarrativeResult { text, usage })
    }

    async fn generate_image(
        &self,
        session: &GameSession,
        prompt: &str,
        sink: ImageSink,
    ) -> Result<Vec<u8>, AiError> {
        let request = ImageRequest {
            model: IMAGE_MODEL.to_string(),
            prompt: prompt.to_string(),
            size: "1024x1024".to_string(),
            stream: true,
            partial_images: PARTIAL_IMAGE_COUNT,
        };

        let response = self
            .client
            .post(format!("{}/v1/images/generations", self.base_url))
            .bearer_auth(&session.api_key)
            .timeout(Duration::from_secs(300))
            .json(&request)
            .send()
            .await
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_api_error(status, &body));
        }

        let mut final_bytes: Option<Vec<u8>> = None;
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| AiError::RequestFailed(e.to_string()))?;
            if event.data == "[DONE]" {
                break;
            }
            let frame: ImageStreamEvent = serde_json::from_str(&event.data)
                .map_err(|e| AiError::InvalidResponse(e.to_string()))?;
            let Some(b64) = frame.b64_json else { continue };
            let bytes = BASE64
                .decode(b64.as_bytes())
                .map_err(|e| AiError::InvalidResponse(format!("bad image payload: {e}")))?;
            match frame.r#type.as_str() {
                "image_generation.partial_image" => {
                    let _ = sink.send(bytes).await;
                }
                "image_generation.completed" => {
                    final_bytes = Some(bytes);
                }
                _ => {}
            }
        }

        final_bytes
            .ok_or_else(|| AiError::InvalidResponse("no completed image in stream".to_string()))
    }

    async fn generate_audio(&self, session: &GameSession, text: &str) -> Result<Vec<u8>, AiError> {
        let request = SpeechRequest {
            model: AUDIO_MODEL.to_string(),
            voice: AUDIO_VOICE.to_string(),
            input: text.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .bearer_auth(&session.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_api_error(status, &body));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| AiError::RequestFailed(e.to_string()))
    }

    async fn list_models(&self, session: &GameSession) -> Result<Vec<ModelInfo>, AiError> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(&session.api_key)
            .send()
            .await
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_api_error(status, &body));
        }

        let list: ModelListResponse = response
            .json()
            .await
            .map_err(|e| AiError::InvalidResponse(e.to_string()))?;
        Ok(list
            .data
            .into_iter()
            .map(|model| ModelInfo { id: model.id })
            .collect())
    }

    async fn translate(
        &self,
        session: &GameSession,
        text: &str,
        language: &str,
    ) -> Result<(String, TokenUsage), AiError> {
        let request = ChatRequest {
            model: session.model.clone(),
            messages: vec![
                ChatMessage::system(format!(
                    "Translate the user's text into {language}. Reply with the translation only."
                )),
                ChatMessage::user(text),
            ],
            temperature: Some(0.2),
            stream: None,
            stream_options: None,
            response_format: None,
        };
        let response = self.chat(session, &request).await?;
        Self::first_content(response)
    }

    async fn generate_theme(
        &self,
        session: &GameSession,
        prompt: &str,
    ) -> Result<(String, TokenUsage), AiError> {
        let request = ChatRequest {
            model: session.model.clone(),
            messages: vec![
                ChatMessage::system(
                    "Invent a short, evocative adventure scenario theme from the user's idea. \
                     Reply with two or three sentences of scenario description."
                        .to_string(),
                ),
                ChatMessage::user(prompt),
            ],
            temperature: Some(1.0),
            stream: None,
            stream_options: None,
            response_format: None,
        };
        let response = self.chat(session, &request).await?;
        Self::first_content(response)
    }
}

/// Build the resolve-phase conversation.
///
/// The opening turn sends the game's system instructions; later turns
/// send the accumulated status map plus the player's action.
fn resolve_messages(session: &GameSession, input: &PlayerInput) -> Vec<ChatMessage> {
    let status_json = serde_json::to_string(&status_schema::to_map(&session.status_fields))
        .unwrap_or_else(|_| "{}".to_string());
    let system = format!(
        "{}\n\nYou resolve one turn of the adventure at a time. \
         Current status: {status_json}\n\
         Respond with a short plot outline of what happens next, the full \
         updated status, and a prompt for an illustration of the scene.",
        session.system_instructions
    );

    let user = match input {
        PlayerInput::Start => "Begin the adventure.".to_string(),
        PlayerInput::Action(text) => text.clone(),
    };

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

fn narrative_system_prompt(session: &GameSession) -> String {
    format!(
        "Expand the given plot outline into one to three sentences of vivid \
         second-person prose in the language '{}'. Do not add events that \
         are not in the outline.",
        session.language
    )
}

/// Map an error response to the matching `AiError` variant so the client
/// can render targeted remediation.
fn map_api_error(status: StatusCode, body: &str) -> AiError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|b| b.error.code.as_deref())
        .unwrap_or("");
    let message = parsed
        .as_ref()
        .map(|b| b.error.message.clone())
        .unwrap_or_else(|| body.to_string());

    match status.as_u16() {
        401 => AiError::InvalidApiKey,
        402 => AiError::BillingInactive,
        403 => AiError::VerificationRequired,
        429 if code == "insufficient_quota" => AiError::QuotaExhausted,
        429 => AiError::RateLimited,
        400 if code == "content_policy_violation" || code == "moderation_blocked" => {
            AiError::ContentFiltered(message)
        }
        _ => AiError::RequestFailed(message),
    }
}

fn convert_usage(usage: ApiUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

// =============================================================================
// OpenAI API types
// =============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

impl ChatMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    #[serde(default)]
    delta: ChatStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamDelta {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageRequest {
    model: String,
    prompt: String,
    size: String,
    stream: bool,
    partial_images: u8,
}

#[derive(Debug, Deserialize)]
struct ImageStreamEvent {
    r#type: String,
    b64_json: Option<String>,
}

#[derive(Debug, Serialize)]
struct SpeechRequest {
    model: String,
    voice: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    code: Option<String>,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_statuses_map_to_distinct_error_kinds() {
        let quota = r#"{"error":{"code":"insufficient_quota","message":"out of credits"}}"#;
        assert!(matches!(
            map_api_error(StatusCode::TOO_MANY_REQUESTS, quota),
            AiError::QuotaExhausted
        ));
        assert!(matches!(
            map_api_error(StatusCode::TOO_MANY_REQUESTS, "{}"),
            AiError::RateLimited
        ));
        assert!(matches!(
            map_api_error(StatusCode::UNAUTHORIZED, "nope"),
            AiError::InvalidApiKey
        ));
        assert!(matches!(
            map_api_error(StatusCode::PAYMENT_REQUIRED, "{}"),
            AiError::BillingInactive
        ));
        assert!(matches!(
            map_api_error(StatusCode::FORBIDDEN, "{}"),
            AiError::VerificationRequired
        ));
        let filtered = r#"{"error":{"code":"moderation_blocked","message":"rejected"}}"#;
        assert!(matches!(
            map_api_error(StatusCode::BAD_REQUEST, filtered),
            AiError::ContentFiltered(_)
        ));
    }

    #[test]
    fn error_codes_are_machine_readable() {
        assert_eq!(AiError::QuotaExhausted.code(), "quota_exhausted");
        assert_eq!(AiError::InvalidApiKey.code(), "invalid_api_key");
        assert_eq!(
            AiError::ContentFiltered(String::new()).code(),
            "content_filtered"
        );
    }
}
