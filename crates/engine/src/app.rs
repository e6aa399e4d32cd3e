//! Application state and composition.

use std::sync::Arc;

use crate::infrastructure::ports::{AiPort, MessageRepo, SessionRepo};
use crate::streams::image_cache::SWEEP_INTERVAL;
use crate::streams::{ImageCache, StreamRegistry, WorkshopEventBroker};
use crate::use_cases::TurnOrchestrator;

/// Main application state.
///
/// Holds the AI platform, the repo ports, and the process-wide streaming
/// state. Passed to HTTP handlers via axum state.
pub struct App {
    pub ai: Arc<dyn AiPort>,
    pub sessions: Arc<dyn SessionRepo>,
    pub messages: Arc<dyn MessageRepo>,
    pub streams: Arc<StreamRegistry>,
    pub images: Arc<ImageCache>,
    pub events: Arc<WorkshopEventBroker>,
    pub turns: TurnOrchestrator,
}

impl App {
    pub fn new(
        ai: Arc<dyn AiPort>,
        sessions: Arc<dyn SessionRepo>,
        messages: Arc<dyn MessageRepo>,
        narration_enabled: bool,
    ) -> Self {
        let streams = Arc::new(StreamRegistry::new());
        let images = Arc::new(ImageCache::new());
        let events = Arc::new(WorkshopEventBroker::new());
        let turns = TurnOrchestrator::new(
            Arc::clone(&ai),
            Arc::clone(&streams),
            Arc::clone(&images),
            Arc::clone(&sessions),
            Arc::clone(&messages),
            narration_enabled,
        );

        Self {
            ai,
            sessions,
            messages,
            streams,
            images,
            events,
            turns,
        }
    }

    /// Launch the recurring image-cache sweep.
    pub fn start_background_tasks(&self) {
        tokio::spawn(Arc::clone(&self.images).run_sweeper(SWEEP_INTERVAL));
    }
}
