//! The conversation handler: one conversation's state behind a dispatcher.
//!
//! Each inbound message runs through the same pipeline:
//!
//! 1. Append the user message to a working copy of the history
//! 2. Sanitize tool-call pairing
//! 3. Compact to the token budget, then sanitize again
//! 4. Run the conversation loop
//! 5. On success, adopt the new history, persist it and reply
//!
//! A failed turn leaves the stored history exactly as it was.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use palaver_config::AppConfig;
use palaver_core::approval::{Approver, AutonomyApprover};
use palaver_core::channel::{ChannelMessage, Handler, ResponseWriter};
use palaver_core::error::{Error, Result};
use palaver_core::memory::MemoryBackend;
use palaver_core::message::ChatMessage;
use palaver_core::provider::Provider;
use palaver_core::session::SessionStore;
use palaver_core::tool::ToolRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::spawn_detached_summary;
use crate::context::compactor::Compactor;
use crate::context::sanitizer::sanitize;
use crate::loop_runner::ConversationLoop;

pub const RESET_ACKNOWLEDGEMENT: &str = "Conversation cleared. Starting fresh.";

const DEFAULT_RESET_COMMAND: &str = "/reset";
const DEFAULT_SUMMARY_TIMEOUT: Duration = Duration::from_secs(60);

/// [`Handler`] that owns one conversation's history and runs each inbound
/// message through sanitizing, compaction and the [`ConversationLoop`].
///
/// The reset command clears the history instead of reaching the model.
pub struct ConversationHandler {
    session_id: String,
    system_prompt: String,
    history: Vec<ChatMessage>,
    agent: ConversationLoop,
    compactor: Compactor,
    store: Option<Arc<dyn SessionStore>>,

    /// Receives a summary of every conversation cleared by reset
    archive: Option<Arc<dyn MemoryBackend>>,

    reset_command: String,
    archive_on_reset: bool,
    summary_timeout: Duration,
}

impl ConversationHandler {
    pub fn new(system_prompt: impl Into<String>, agent: ConversationLoop, compactor: Compactor) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            system_prompt: system_prompt.into(),
            history: Vec::new(),
            agent,
            compactor,
            store: None,
            archive: None,
            reset_command: DEFAULT_RESET_COMMAND.to_string(),
            archive_on_reset: true,
            summary_timeout: DEFAULT_SUMMARY_TIMEOUT,
        }
    }

    /// Wire a handler from settings.
    ///
    /// Tool calls are gated by an [`AutonomyApprover`] at the configured level;
    /// use [`with_approver`](Self::with_approver) to attach a supervisor.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let mut agent = ConversationLoop::new()
            .with_provider(provider.clone())
            .with_tools(tools)
            .with_approver(Arc::new(AutonomyApprover::new(config.agent.autonomy)))
            .with_max_iterations(config.agent.max_iterations)
            .with_tool_output_cap(config.agent.tool_output_cap);
        if let Some(max_tokens) = config.agent.max_tokens {
            agent = agent.with_max_tokens(max_tokens);
        }

        let compactor = Compactor::new(
            provider,
            config.context.max_context_tokens,
            config.context.recent_message_count,
        )
        .with_summary_max_tokens(config.context.summary_max_tokens);

        Self::new(config.agent.system_prompt.clone(), agent, compactor)
            .with_reset_command(config.reset.command.clone())
            .with_archive_on_reset(config.reset.archive_summary)
            .with_summary_timeout(Duration::from_secs(config.reset.summary_timeout_secs))
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn MemoryBackend>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Replace the approver gating tool calls.
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.agent = self.agent.with_approver(approver);
        self
    }

    pub fn with_reset_command(mut self, command: impl Into<String>) -> Self {
        self.reset_command = command.into();
        self
    }

    /// Whether reset summarizes the cleared conversation into the archive.
    pub fn with_archive_on_reset(mut self, enabled: bool) -> Self {
        self.archive_on_reset = enabled;
        self
    }

    pub fn with_summary_timeout(mut self, timeout: Duration) -> Self {
        self.summary_timeout = timeout;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Replace the in-memory history with the stored one.
    pub async fn load(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let history = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            history = store.load(&self.session_id) => history?,
        };
        debug!(session_id = %self.session_id, messages = history.len(), "Loaded session history");
        self.history = history;
        Ok(())
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&self.session_id, &self.history).await {
            warn!(session_id = %self.session_id, error = %e, "Failed to save session history");
        }
    }

    async fn reset(&mut self, cancel: &CancellationToken, writer: &dyn ResponseWriter) -> Result<()> {
        let cleared = std::mem::take(&mut self.history);
        info!(session_id = %self.session_id, cleared = cleared.len(), "Resetting conversation");
        self.persist().await;

        if let Some(archive) = &self.archive {
            if self.archive_on_reset && !cleared.is_empty() {
                spawn_detached_summary(
                    self.compactor.provider().clone(),
                    archive.clone(),
                    self.session_id.clone(),
                    cleared,
                    self.compactor.summary_max_tokens(),
                    self.summary_timeout,
                );
            }
        }

        writer.write_message(cancel, RESET_ACKNOWLEDGEMENT).await?;
        Ok(())
    }
}

#[async_trait]
impl Handler for ConversationHandler {
    async fn handle_message(
        &mut self,
        cancel: &CancellationToken,
        writer: &dyn ResponseWriter,
        message: ChannelMessage,
    ) -> Result<()> {
        if message.content.trim() == self.reset_command {
            return self.reset(cancel, writer).await;
        }

        let mut working = self.history.clone();
        working.push(ChatMessage::user(message.content));

        let (working, repaired) = sanitize(&working);
        if repaired {
            warn!(session_id = %self.session_id, "Repaired tool-call pairing in stored history");
        }

        let compacted = self
            .compactor
            .compact(cancel, &self.system_prompt, &working)
            .await?;
        let (mut turn, _) = sanitize(&compacted);

        let response = self.agent.run(cancel, &self.system_prompt, &mut turn).await?;

        self.history = turn;
        self.persist().await;

        if !response.content.is_empty() {
            writer.write_message(cancel, &response.content).await?;
        }
        Ok(())
    }
}
