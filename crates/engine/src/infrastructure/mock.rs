//! Deterministic mock platform.
//!
//! A first-class `AiPort` implementation (not a test-only stub) used for
//! offline development. It honors the same timing and streaming contract
//! as the real vendors: incremental narrative deltas, progressively
//! "refined" image frames, and schema-conforming turn resolutions.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use fabula_domain::{GameSession, PlayerInput, TokenUsage};

use crate::infrastructure::ports::{
    AiCapabilities, AiError, AiPort, ImageSink, ModelInfo, NarrativeResult, TextSink,
    TurnResolution,
};
use crate::status_schema;

const DEFAULT_LATENCY: Duration = Duration::from_millis(25);

/// Offline AI platform with deterministic output.
#[derive(Clone)]
pub struct MockPlatform {
    latency: Duration,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            latency: DEFAULT_LATENCY,
        }
    }

    /// Zero-latency variant for tests.
    pub fn instant() -> Self {
        Self {
            latency: Duration::ZERO,
        }
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

/// Declared field names, read back out of the response schema's required
/// list so the mock honors the same generation contract as real vendors.
fn declared_names(schema: &serde_json::Value) -> Vec<String> {
    schema["properties"]["status"]["required"]
        .as_array()
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn refinement_frame(prompt: &str, step: u8) -> Vec<u8> {
    let mut bytes = format!("mock-image:{step}:{prompt}").into_bytes();
    bytes.resize(64 * step as usize, step);
    bytes
}

#[async_trait]
impl AiPort for MockPlatform {
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
        self.simulate_latency().await;

        let previous = status_schema::to_map(&session.status_fields);
        let mut status = HashMap::new();
        for name in declared_names(&schema) {
            let value = previous.get(&name).cloned().unwrap_or_else(|| "10".to_string());
            status.insert(name, value);
        }

        let plot_outline = match input {
            PlayerInput::Start => "A dark forest looms ahead.".to_string(),
            PlayerInput::Action(action) => format!("You {action}. The forest answers."),
        };

        let raw_response = serde_json::json!({
            "plotOutline": plot_outline,
            "status": status,
            "imagePrompt": "a dark forest",
        })
        .to_string();

        Ok(TurnResolution {
            plot_outline,
            status,
            image_prompt: Some("a dark forest".to_string()),
            usage: TokenUsage {
                prompt_tokens: 12,
                completion_tokens: 34,
                total_tokens: 46,
            },
            raw_response,
        })
    }

    async fn expand_narrative(
        &self,
        _session: &GameSession,
        plot_outline: &str,
        sink: TextSink,
    ) -> Result<NarrativeResult, AiError> {
        let deltas = [
            plot_outline.to_string(),
            " Mist curls between the trees.".to_string(),
        ];

        let mut text = String::new();
        for delta in deltas {
            self.simulate_latency().await;
            text.push_str(&delta);
            let _ = sink.send(delta).await;
        }

        Ok(NarrativeResult {
            text,
            usage: TokenUsage {
                prompt_tokens: 8,
                completion_tokens: 16,
                total_tokens: 24,
            },
        })
    }

    async fn generate_image(
        &self,
        _session: &GameSession,
        prompt: &str,
        sink: ImageSink,
    ) -> Result<Vec<u8>, AiError> {
        for step in 1..=2 {
            self.simulate_latency().await;
            let _ = sink.send(refinement_frame(prompt, step)).await;
        }
        self.simulate_latency().await;
        Ok(refinement_frame(prompt, 3))
    }

    async fn generate_audio(&self, _session: &GameSession, text: &str) -> Result<Vec<u8>, AiError> {
        self.simulate_latency().await;
        Ok(format!("mock-audio:{}", text.len()).into_bytes())
    }

    async fn list_models(&self, _session: &GameSession) -> Result<Vec<ModelInfo>, AiError> {
        Ok(vec![
            ModelInfo {
                id: "mock-small".to_string(),
            },
            ModelInfo {
                id: "mock-large".to_string(),
            },
        ])
    }

    async fn translate(
        &self,
        _session: &GameSession,
        text: &str,
        _language: &str,
    ) -> Result<(String, TokenUsage), AiError> {
        Ok((text.to_string(), TokenUsage::default()))
    }

    async fn generate_theme(
        &self,
        _session: &GameSession,
        _prompt: &str,
    ) -> Result<(String, TokenUsage), AiError> {
        Ok((
            "A moonlit expedition through a whispering forest.".to_string(),
            TokenUsage::default(),
        ))
    }
}
