//! Streamed chunk wire type.

use serde::{Deserialize, Serialize};

/// One unit of streamed turn output.
///
/// At most one payload field is populated per chunk; an absent field means
/// "no update to that channel". The text and image sub-streams complete
/// independently — a turn is fully delivered only once both done flags
/// have been observed, or an error chunk arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_done: Option<bool>,
    /// Base64-encoded full image (each frame replaces the previous one).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_done: Option<bool>,
    /// Terminal error code; ends the turn for the consumer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Chunk {
    pub fn text(fragment: impl Into<String>) -> Self {
        Self {
            text: Some(fragment.into()),
            ..Self::default()
        }
    }

    pub fn text_done() -> Self {
        Self {
            text_done: Some(true),
            ..Self::default()
        }
    }

    pub fn image(base64_data: impl Into<String>) -> Self {
        Self {
            image_data: Some(base64_data.into()),
            ..Self::default()
        }
    }

    pub fn image_done() -> Self {
        Self {
            image_done: Some(true),
            ..Self::default()
        }
    }

    pub fn error(code: impl Into<String>) -> Self {
        Self {
            error: Some(code.into()),
            ..Self::default()
        }
    }

    /// True for chunks that terminate the whole turn early.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_fields_are_omitted_from_json() {
        let json = serde_json::to_string(&Chunk::text("The door creaks")).expect("serialize");
        assert_eq!(json, r#"{"text":"The door creaks"}"#);

        let json = serde_json::to_string(&Chunk::image_done()).expect("serialize");
        assert_eq!(json, r#"{"imageDone":true}"#);
    }

    #[test]
    fn error_chunk_is_terminal() {
        assert!(Chunk::error("rate_limit").is_error());
        assert!(!Chunk::text_done().is_error());
    }
}
