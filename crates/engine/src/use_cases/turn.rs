//! Turn orchestration.
//!
//! One turn: a cheap, blocking resolve call whose result is persisted as
//! authoritative state, followed by concurrent best-effort streaming
//! phases (narrative, image, audio) that fan their output into the
//! stream registry and image cache. Resolve errors abort the turn
//! synchronously; streaming errors surface as error chunks or the image
//! cache's error flag, never through the orchestrator's return value.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use fabula_domain::{Chunk, GameSession, MessageId, PlayerInput, SessionMessage};

use crate::infrastructure::ports::{AiError, AiPort, MessageRepo, RepoError, SessionRepo};
use crate::status_schema;
use crate::streams::{ImageCache, PersistFn, StreamHandle, StreamRegistry};

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("AI error: {0}")]
    Ai(#[from] AiError),
    #[error("Repository error: {0}")]
    Repo(#[from] RepoError),
}

/// Handle on a turn's in-flight streaming phases.
///
/// The orchestrator's caller owns the join point: await [`join`] for a
/// well-defined completion (tests, CLI), or spawn it and let the phases
/// finish in the background (HTTP).
///
/// [`join`]: TurnPhases::join
#[derive(Debug)]
pub struct TurnPhases {
    tasks: JoinSet<()>,
}

impl TurnPhases {
    /// Wait for every streaming phase of the turn to finish or fail.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                tracing::error!("turn phase task failed: {err}");
            }
        }
    }

    /// Cancel phases that are still running.
    pub fn abort(&mut self) {
        self.tasks.abort_all();
    }
}

/// Outcome of starting a turn: the persisted authoritative state plus
/// the phase handle.
#[derive(Debug)]
pub struct TurnStarted {
    pub message: SessionMessage,
    pub phases: TurnPhases,
}

/// Drives a session turn end to end.
pub struct TurnOrchestrator {
    ai: Arc<dyn AiPort>,
    streams: Arc<StreamRegistry>,
    images: Arc<ImageCache>,
    sessions: Arc<dyn SessionRepo>,
    messages: Arc<dyn MessageRepo>,
    narration_enabled: bool,
}

impl TurnOrchestrator {
    pub fn new(
        ai: Arc<dyn AiPort>,
        streams: Arc<StreamRegistry>,
        images: Arc<ImageCache>,
        sessions: Arc<dyn SessionRepo>,
        messages: Arc<dyn MessageRepo>,
        narration_enabled: bool,
    ) -> Self {
        Self {
            ai,
            streams,
            images,
            sessions,
            messages,
            narration_enabled,
        }
    }

    /// Run the blocking resolve phase, persist the turn's authoritative
    /// state, then launch the streaming phases.
    pub async fn run_turn(
        &self,
        session: &GameSession,
        input: PlayerInput,
    ) -> Result<TurnStarted, TurnError> {
        let schema = status_schema::build_response_schema(&session.status_fields_definition);
        let resolution = self.ai.resolve_turn(session, &input, schema).await?;

        let names = status_schema::field_names(&session.status_fields_definition);
        let fallback = status_schema::to_map(&session.status_fields);
        let fields = status_schema::to_field_list(&resolution.status, &names, &fallback);

        let mut message = SessionMessage::new(session.id, input);
        message.plot_outline = resolution.plot_outline.clone();
        message.status_fields = fields.clone();
        message.image_prompt = resolution.image_prompt.clone();
        message.usage = resolution.usage;
        message.raw_response = Some(resolution.raw_response);
        self.messages.create(&message).await?;

        let mut updated_session = session.clone();
        updated_session.status_fields = fields;
        self.sessions.save(&updated_session).await?;

        let handle = self.streams.create(message.id).await;
        let mut tasks = JoinSet::new();

        self.spawn_narrative_phase(&mut tasks, session, &message, &handle);
        self.spawn_image_phase(&mut tasks, session, &message, &handle)
            .await;

        Ok(TurnStarted {
            message,
            phases: TurnPhases { tasks },
        })
    }

    fn spawn_narrative_phase(
        &self,
        tasks: &mut JoinSet<()>,
        session: &GameSession,
        message: &SessionMessage,
        handle: &StreamHandle,
    ) {
        let ai = Arc::clone(&self.ai);
        let messages = Arc::clone(&self.messages);
        let handle = handle.clone();
        let session = session.clone();
        let outline = message.plot_outline.clone();
        let message_id = message.id;
        let narrate = self.narration_enabled && self.ai.capabilities().audio;

        tasks.spawn(async move {
            let (tx, mut rx) = mpsc::channel::<String>(32);
            let generate = ai.expand_narrative(&session, &outline, tx);
            let forward = async {
                while let Some(delta) = rx.recv().await {
                    handle.send(Chunk::text(delta));
                }
            };
            let (result, ()) = tokio::join!(generate, forward);

            match result {
                Ok(narrative) => {
                    if let Err(err) = messages
                        .set_text(message_id, &narrative.text, narrative.usage)
                        .await
                    {
                        tracing::warn!(message_id = %message_id, "failed to persist narration: {err}");
                    }
                    handle.send(Chunk::text_done());

                    // Narration depends on the final text, so it runs as
                    // a tail of this phase. Best effort: a narration
                    // failure must not end a turn whose text already
                    // completed.
                    if narrate {
                        match ai.generate_audio(&session, &narrative.text).await {
                            Ok(bytes) if !bytes.is_empty() => {
                                if let Err(err) = messages.set_audio(message_id, bytes).await {
                                    tracing::warn!(
                                        message_id = %message_id,
                                        "failed to persist audio: {err}"
                                    );
                                }
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(
                                    message_id = %message_id,
                                    code = err.code(),
                                    "audio generation failed: {err}"
                                );
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        message_id = %message_id,
                        code = err.code(),
                        "narrative expansion failed: {err}"
                    );
                    handle.send(Chunk::error(err.code()));
                }
            }
        });
    }

    async fn spawn_image_phase(
        &self,
        tasks: &mut JoinSet<()>,
        session: &GameSession,
        message: &SessionMessage,
        handle: &StreamHandle,
    ) {
        let prompt = match &message.image_prompt {
            Some(prompt) if self.ai.capabilities().images => prompt.clone(),
            _ => {
                // No image for this turn: complete the image sub-stream
                // immediately so the consumer's both-done contract holds.
                handle.send(Chunk::image_done());
                return;
            }
        };

        let message_id = message.id;
        self.images
            .create(message_id, persist_via_repo(Arc::clone(&self.messages)))
            .await;

        let ai = Arc::clone(&self.ai);
        let cache = Arc::clone(&self.images);
        let handle = handle.clone();
        let session = session.clone();

        tasks.spawn(async move {
            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(8);
            let generate = ai.generate_image(&session, &prompt, tx);
            let forward = async {
                while let Some(frame) = rx.recv().await {
                    cache.update(message_id, frame.clone(), false).await;
                    handle.send(Chunk::image(BASE64.encode(&frame)));
                }
            };
            let (result, ()) = tokio::join!(generate, forward);

            match result {
                Ok(final_bytes) => {
                    cache.update(message_id, final_bytes.clone(), true).await;
                    handle.send(Chunk::image(BASE64.encode(&final_bytes)));
                    handle.send(Chunk::image_done());
                }
                Err(err) => {
                    tracing::warn!(
                        message_id = %message_id,
                        code = err.code(),
                        "image generation failed: {err}"
                    );
                    // Image errors are reported through the cache's error
                    // flag, not the chunk stream: an error chunk is
                    // terminal for the consumer and would cut off a
                    // narration that is still streaming. The done flag
                    // keeps the both-done completion contract intact.
                    cache
                        .set_error(message_id, err.code(), &err.to_string())
                        .await;
                    handle.send(Chunk::image_done());
                }
            }
        });
    }
}

/// Bind the at-most-once image persistence hook to the message repo.
fn persist_via_repo(messages: Arc<dyn MessageRepo>) -> PersistFn {
    Arc::new(move |id: MessageId, bytes: Vec<u8>| {
        let messages = Arc::clone(&messages);
        Box::pin(async move {
            messages
                .set_image(id, bytes)
                .await
                .map_err(anyhow::Error::new)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::Utc;

    use fabula_domain::{AiPlatformKind, GameId, SessionId, StatusField, TokenUsage, UserId};

    use crate::infrastructure::memory_store::InMemoryStore;
    use crate::infrastructure::mock::MockPlatform;
    use crate::infrastructure::ports::{
        AiCapabilities, ImageSink, ModelInfo, NarrativeResult, TextSink, TurnResolution,
    };

    fn session() -> GameSession {
        GameSession {
            id: SessionId::new(),
            game_id: GameId::new(),
            user_id: UserId::new(),
            platform: AiPlatformKind::Mock,
            model: "mock-small".to_string(),
            api_key: String::new(),
            status_fields_definition: "Health".to_string(),
            status_fields: Vec::new(),
            system_instructions: "You are a forest.".to_string(),
            language: "en".to_string(),
            created_at: Utc::now(),
        }
    }

    struct Harness {
        orchestrator: TurnOrchestrator,
        streams: Arc<StreamRegistry>,
        images: Arc<ImageCache>,
        store: Arc<InMemoryStore>,
    }

    fn harness(ai: Arc<dyn AiPort>) -> Harness {
        let streams = Arc::new(StreamRegistry::new());
        let images = Arc::new(ImageCache::new());
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = TurnOrchestrator::new(
            ai,
            Arc::clone(&streams),
            Arc::clone(&images),
            store.clone(),
            store.clone(),
            true,
        );
        Harness {
            orchestrator,
            streams,
            images,
            store,
        }
    }

    async fn settle() {
        // Let detached persistence tasks run.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    /// Resolve-phase failure double; streaming phases must never start.
    struct FailingPlatform;

    #[async_trait]
    impl AiPort for FailingPlatform {
        fn capabilities(&self) -> AiCapabilities {
            AiCapabilities {
                images: true,
                audio: false,
            }
        }

        async fn resolve_turn(
            &self,
            _session: &GameSession,
            _input: &PlayerInput,
            _schema: serde_json::Value,
        ) -> Result<TurnResolution, AiError> {
            Err(AiError::QuotaExhausted)
        }

        async fn expand_narrative(
            &self,
            _session: &GameSession,
            _plot_outline: &str,
            _sink: TextSink,
        ) -> Result<NarrativeResult, AiError> {
            unreachable!("streaming must not start after a resolve failure")
        }

        async fn generate_image(
            &self,
            _session: &GameSession,
            _prompt: &str,
            _sink: ImageSink,
        ) -> Result<Vec<u8>, AiError> {
            unreachable!("streaming must not start after a resolve failure")
        }

        async fn generate_audio(
            &self,
            _session: &GameSession,
            _text: &str,
        ) -> Result<Vec<u8>, AiError> {
            Ok(Vec::new())
        }

        async fn list_models(&self, _session: &GameSession) -> Result<Vec<ModelInfo>, AiError> {
            Ok(Vec::new())
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
            Ok((String::new(), TokenUsage::default()))
        }
    }

    /// Resolve succeeds; selected streaming phases fail.
    struct FlakyPlatform {
        inner: MockPlatform,
        fail_narrative: bool,
        fail_image: bool,
    }

    #[async_trait]
    impl AiPort for FlakyPlatform {
        fn capabilities(&self) -> AiCapabilities {
            AiCapabilities {
                images: true,
                audio: false,
            }
        }

        async fn resolve_turn(
            &self,
            session: &GameSession,
            input: &PlayerInput,
            schema: serde_json::Value,
        ) -> Result<TurnResolution, AiError> {
            self.inner.resolve_turn(session, input, schema).await
        }

        async fn expand_narrative(
            &self,
            session: &GameSession,
            plot_outline: &str,
            sink: TextSink,
        ) -> Result<NarrativeResult, AiError> {
            if self.fail_narrative {
                return Err(AiError::RateLimited);
            }
            self.inner.expand_narrative(session, plot_outline, sink).await
        }

        async fn generate_image(
            &self,
            session: &GameSession,
            prompt: &str,
            sink: ImageSink,
        ) -> Result<Vec<u8>, AiError> {
            if self.fail_image {
                return Err(AiError::ContentFiltered("prompt rejected".to_string()));
            }
            self.inner.generate_image(session, prompt, sink).await
        }

        async fn generate_audio(
            &self,
            _session: &GameSession,
            _text: &str,
        ) -> Result<Vec<u8>, AiError> {
            Ok(Vec::new())
        }

        async fn list_models(&self, _session: &GameSession) -> Result<Vec<ModelInfo>, AiError> {
            Ok(Vec::new())
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
            Ok((String::new(), TokenUsage::default()))
        }
    }

    #[tokio::test]
    async fn resolve_failure_aborts_the_turn_synchronously() {
        let h = harness(Arc::new(FailingPlatform));
        let err = h
            .orchestrator
            .run_turn(&session(), PlayerInput::Start)
            .await
            .expect_err("turn must fail");

        assert!(matches!(err, TurnError::Ai(AiError::QuotaExhausted)));
        assert!(h.streams.is_empty().await);
    }

    #[tokio::test]
    async fn full_turn_delivers_both_substreams_and_persists_artifacts() {
        let h = harness(Arc::new(MockPlatform::instant()));
        let session = session();

        let started = h
            .orchestrator
            .run_turn(&session, PlayerInput::Start)
            .await
            .expect("turn");
        let message_id = started.message.id;
        assert_eq!(
            started.message.status_fields,
            vec![StatusField::new("Health", "10")]
        );
        assert_eq!(started.message.image_prompt.as_deref(), Some("a dark forest"));

        let mut rx = h.streams.attach(message_id).await.expect("consumer");
        started.phases.join().await;
        settle().await;

        // Drain everything the phases buffered.
        let mut text_chunks = 0;
        let mut image_chunks = 0;
        let mut text_done = false;
        let mut image_done = false;
        while let Ok(chunk) = rx.try_recv() {
            assert!(!chunk.is_error());
            if chunk.text.is_some() {
                assert!(!text_done, "text after textDone");
                text_chunks += 1;
            }
            if chunk.text_done == Some(true) {
                text_done = true;
            }
            if chunk.image_data.is_some() {
                assert!(!image_done, "image after imageDone");
                image_chunks += 1;
            }
            if chunk.image_done == Some(true) {
                image_done = true;
            }
        }
        assert_eq!(text_chunks, 2);
        assert_eq!(image_chunks, 3);
        assert!(text_done && image_done);

        // Final artifacts persisted through the repo ports; the cache
        // entry is gone after successful persistence.
        let stored = MessageRepo::get(h.store.as_ref(), message_id)
            .await
            .expect("get")
            .expect("message");
        assert_eq!(
            stored.message,
            "A dark forest looms ahead. Mist curls between the trees."
        );
        let final_image = stored.image.expect("final image persisted");
        assert!(!final_image.is_empty());
        assert!(stored.audio.is_some());
        assert!(h.images.status(message_id).await.is_none());

        // Session snapshot advanced.
        let saved = SessionRepo::get(h.store.as_ref(), session.id)
            .await
            .expect("get")
            .expect("session");
        assert_eq!(saved.status_fields, vec![StatusField::new("Health", "10")]);
    }

    #[tokio::test]
    async fn image_failure_flags_the_cache_without_cutting_off_narration() {
        let h = harness(Arc::new(FlakyPlatform {
            inner: MockPlatform::instant(),
            fail_narrative: false,
            fail_image: true,
        }));

        let started = h
            .orchestrator
            .run_turn(&session(), PlayerInput::Start)
            .await
            .expect("turn");
        let message_id = started.message.id;

        let mut rx = h.streams.attach(message_id).await.expect("consumer");
        started.phases.join().await;
        settle().await;

        let mut text_chunks = 0;
        let mut text_done = false;
        let mut image_done = false;
        let mut image_chunks = 0;
        while let Ok(chunk) = rx.try_recv() {
            // The failure must never surface as a terminal error chunk:
            // that would end the stream for a narration still in flight.
            assert!(!chunk.is_error());
            if chunk.text.is_some() {
                text_chunks += 1;
            }
            if chunk.text_done == Some(true) {
                text_done = true;
            }
            if chunk.image_data.is_some() {
                image_chunks += 1;
            }
            if chunk.image_done == Some(true) {
                image_done = true;
            }
        }
        assert_eq!(text_chunks, 2);
        assert!(text_done, "narration must still complete");
        assert!(image_done, "image sub-stream must still terminate");
        assert_eq!(image_chunks, 0);

        // The error stays readable through the cache until the sweep.
        let status = h.images.status(message_id).await.expect("entry retained");
        assert!(status.has_error);
        assert_eq!(status.error_code.as_deref(), Some("content_filtered"));
    }

    #[tokio::test]
    async fn narrative_failure_surfaces_as_a_terminal_error_chunk() {
        let h = harness(Arc::new(FlakyPlatform {
            inner: MockPlatform::instant(),
            fail_narrative: true,
            fail_image: true,
        }));

        let started = h
            .orchestrator
            .run_turn(&session(), PlayerInput::Start)
            .await
            .expect("turn");
        let message_id = started.message.id;

        let mut rx = h.streams.attach(message_id).await.expect("consumer");
        started.phases.join().await;

        let mut error_code = None;
        let mut text_done = false;
        while let Ok(chunk) = rx.try_recv() {
            if let Some(code) = &chunk.error {
                error_code = Some(code.clone());
            }
            if chunk.text_done == Some(true) {
                text_done = true;
            }
        }
        assert_eq!(error_code.as_deref(), Some("rate_limited"));
        assert!(!text_done);
    }

    #[tokio::test]
    async fn turn_without_image_completes_the_image_substream_immediately() {
        // Ollama-style platform: no image capability.
        struct TextOnly(MockPlatform);

        #[async_trait]
        impl AiPort for TextOnly {
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
                self.0.resolve_turn(session, input, schema).await
            }

            async fn expand_narrative(
                &self,
                session: &GameSession,
                plot_outline: &str,
                sink: TextSink,
            ) -> Result<NarrativeResult, AiError> {
                self.0.expand_narrative(session, plot_outline, sink).await
            }

            async fn generate_image(
                &self,
                _session: &GameSession,
                _prompt: &str,
                _sink: ImageSink,
            ) -> Result<Vec<u8>, AiError> {
                unreachable!("image phase must be skipped")
            }

            async fn generate_audio(
                &self,
                _session: &GameSession,
                _text: &str,
            ) -> Result<Vec<u8>, AiError> {
                Ok(Vec::new())
            }

            async fn list_models(&self, _session: &GameSession) -> Result<Vec<ModelInfo>, AiError> {
                Ok(Vec::new())
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
                Ok((String::new(), TokenUsage::default()))
            }
        }

        let h = harness(Arc::new(TextOnly(MockPlatform::instant())));
        let started = h
            .orchestrator
            .run_turn(&session(), PlayerInput::Action("go north".to_string()))
            .await
            .expect("turn");
        let message_id = started.message.id;

        let mut rx = h.streams.attach(message_id).await.expect("consumer");
        started.phases.join().await;

        let mut image_done = false;
        let mut image_chunks = 0;
        while let Ok(chunk) = rx.try_recv() {
            if chunk.image_done == Some(true) {
                image_done = true;
            }
            if chunk.image_data.is_some() {
                image_chunks += 1;
            }
        }
        assert!(image_done);
        assert_eq!(image_chunks, 0);
        assert!(h.images.status(message_id).await.is_none());
    }
}
