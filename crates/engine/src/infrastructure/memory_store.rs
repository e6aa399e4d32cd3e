//! In-memory session/message store for development and testing.
//!
//! The real relational store is an external collaborator reached through
//! the repo ports; this adapter keeps everything in process memory and
//! does not persist across restarts.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use fabula_domain::{GameSession, MessageId, SessionId, SessionMessage, TokenUsage};

use crate::infrastructure::ports::{MessageRepo, RepoError, SessionRepo};

#[derive(Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<SessionId, GameSession>>,
    messages: RwLock<HashMap<MessageId, SessionMessage>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepo for InMemoryStore {
    async fn get(&self, id: SessionId) -> Result<Option<GameSession>, RepoError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn save(&self, session: &GameSession) -> Result<(), RepoError> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }
}

#[async_trait]
impl MessageRepo for InMemoryStore {
    async fn create(&self, message: &SessionMessage) -> Result<(), RepoError> {
        self.messages
            .write()
            .await
            .insert(message.id, message.clone());
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Option<SessionMessage>, RepoError> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn set_text(
        &self,
        id: MessageId,
        text: &str,
        usage: TokenUsage,
    ) -> Result<(), RepoError> {
        let mut messages = self.messages.write().await;
        let message = messages.get_mut(&id).ok_or(RepoError::NotFound)?;
        message.message = text.to_string();
        message.usage.add(usage);
        Ok(())
    }

    async fn set_image(&self, id: MessageId, image: Vec<u8>) -> Result<(), RepoError> {
        let mut messages = self.messages.write().await;
        let message = messages.get_mut(&id).ok_or(RepoError::NotFound)?;
        message.image = Some(image);
        Ok(())
    }

    async fn set_audio(&self, id: MessageId, audio: Vec<u8>) -> Result<(), RepoError> {
        let mut messages = self.messages.write().await;
        let message = messages.get_mut(&id).ok_or(RepoError::NotFound)?;
        message.audio = Some(audio);
        Ok(())
    }
}
