//! Ollama platform client (OpenAI-compatible API).
//!
//! Optional local backend for offline play. Text-only: image and audio
//! phases are skipped via `capabilities()`. The whole platform can be
//! disabled at startup (`OLLAMA_ENABLED=false`).

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use fabula_domain::{GameSession, PlayerInput, TokenUsage};

use crate::infrastructure::ports::{
    AiCapabilities, AiError, AiPort, ImageSink, ModelInfo, NarrativeResult, TextSink, TurnPayload,
    TurnResolution,
};
use crate::status_schema;

/// Default Ollama base URL.
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Client for Ollama's OpenAI-compatible API.
#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Self {
        // Local models can be slow on first load
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create client from the `OLLAMA_BASE_URL` environment variable.
    pub fn from_env() -> Self {
        let base_url = std::env::var("OLLAMA_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_OLLAMA_BASE_URL.to_string());
        Self::new(&base_url)
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::RequestFailed(body));
        }

        response
            .json()
            .await
            .map_err(|e| AiError::InvalidResponse(e.to_string()))
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new(DEFAULT_OLLAMA_BASE_URL)
    }
}

#[async_trait]
impl AiPort for OllamaClient {
    fn capabilities(&self) -> AiCapabilities {
        AiCapabilities {
            images: false,
            audio: false,
        }
    }

    async fn resolve_turn(
        &self,
        session: &GameSession,
        input: &PlayerInput,
        schema: serde_json::Value,
    ) -> Result<TurnResolution, AiError> {
        let status_json = serde_json::to_string(&status_schema::to_map(&session.status_fields))
            .unwrap_or_else(|_| "{}".to_string());
        let system = format!(
            "{}\n\nYou resolve one turn of the adventure at a time. \
             Current status: {status_json}\n\
             Respond with a short plot outline of what happens next, the \
             full updated status, and a prompt for an illustration.",
            session.system_instructions
        );
        let user = match input {
            PlayerInput::Start => "Begin the adventure.".to_string(),
            PlayerInput::Action(text) => text.clone(),
        };

        let request = ChatRequest {
            model: session.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system,
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            temperature: Some(0.7),
            stream: None,
            response_format: Some(ResponseFormat {
                r#type: "json_schema".to_string(),
                json_schema: JsonSchemaFormat {
                    name: "turn_resolution".to_string(),
                    strict: true,
                    schema,
                },
            }),
        };

        let response = self.chat(&request).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AiError::InvalidResponse("no choices in response".to_string()))?;
        let usage = response.usage.map(convert_usage).unwrap_or_default();

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
                ChatMessage {
                    role: "system".to_string(),
                    content: format!(
                        "Expand the given plot outline into one to three sentences \
                         of vivid second-person prose in the language '{}'.",
                        session.language
                    ),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: plot_outline.to_string(),
                },
            ],
            temperature: Some(0.9),
            stream: Some(true),
            response_format: None,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::RequestFailed(body));
        }

        let mut text = String::new();
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| AiError::RequestFailed(e.to_string()))?;
            if event.data == "[DONE]" {
                break;
            }
            let chunk: ChatStreamChunk = serde_json::from_str(&event.data)
                .map_err(|e| AiError::InvalidResponse(e.to_string()))?;
            if let Some(delta) = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
            {
                if !delta.is_empty() {
                    text.push_str(&delta);
                    let _ = sink.send(delta).await;
                }
            }
        }

        Ok(NarrativeResult {
            text,
            usage: TokenUsage::default(),
        })
    }

    async fn generate_image(
        &self,
        _session: &GameSession,
        _prompt: &str,
        _sink: ImageSink,
    ) -> Result<Vec<u8>, AiError> {
        Err(AiError::RequestFailed(
            "image generation is not supported by this platform".to_string(),
        ))
    }

    async fn generate_audio(
        &self,
        _session: &GameSession,
        _text: &str,
    ) -> Result<Vec<u8>, AiError> {
        // No narration support: no-op success.
        Ok(Vec::new())
    }

    async fn list_models(&self, _session: &GameSession) -> Result<Vec<ModelInfo>, AiError> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::RequestFailed(body));
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
                ChatMessage {
                    role: "system".to_string(),
                    content: format!(
                        "Translate the user's text into {language}. \
                         Reply with the translation only."
                    ),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: text.to_string(),
                },
            ],
            temperature: Some(0.2),
            stream: None,
            response_format: None,
        };
        let response = self.chat(&request).await?;
        let usage = response.usage.map(convert_usage).unwrap_or_default();
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AiError::InvalidResponse("no choices in response".to_string()))?;
        Ok((content, usage))
    }

    async fn generate_theme(
        &self,
        session: &GameSession,
        prompt: &str,
    ) -> Result<(String, TokenUsage), AiError> {
        self.translate(session, prompt, "an adventure scenario theme")
            .await
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
// OpenAI-compatible API types
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
    response_format: Option<ResponseFormat>,
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

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    #[serde(default)]
    delta: ChatStreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamDelta {
    content: Option<String>,
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
