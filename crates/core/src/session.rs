//! Session persistence seam.
//!
//! A session store loads and saves one conversation's history. Durable
//! formats (JSONL files, databases) are implemented by collaborators; the
//! in-memory store here backs tests and embedded use.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::SessionError;
use crate::message::ChatMessage;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session's history. Unknown sessions load as empty.
    async fn load(&self, session_id: &str) -> std::result::Result<Vec<ChatMessage>, SessionError>;

    /// Replace a session's history.
    async fn save(
        &self,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> std::result::Result<(), SessionError>;
}

/// Keeps histories in a process-local map.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> std::result::Result<Vec<ChatMessage>, SessionError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(
        &self,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> std::result::Result<(), SessionError> {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), messages.to_vec());
        Ok(())
    }
}
