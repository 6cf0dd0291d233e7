//! Channel-facing capabilities.
//!
//! Channel transports (terminal, bot APIs, webhooks) live outside the
//! runtime. They hand inbound [`ChannelMessage`]s to a dispatcher, which
//! invokes a [`Handler`]; replies flow back through a [`ResponseWriter`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ChannelError, Result};

/// Unique identifier for a channel instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// The channel this message belongs to
    pub channel_id: ChannelId,

    /// Sender identifier (platform-specific user ID)
    pub sender_id: String,

    /// The chat/group/DM identifier within the channel
    pub chat_id: String,

    /// The text content
    pub content: String,

    /// Platform-specific metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ChannelMessage {
    /// Build a message with only a channel name and text, as local channels do.
    pub fn text(channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel_id: ChannelId(channel.into()),
            sender_id: "local".into(),
            chat_id: "local".into(),
            content: content.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Where replies for one conversation are delivered.
#[async_trait]
pub trait ResponseWriter: Send + Sync {
    async fn write_message(
        &self,
        cancel: &CancellationToken,
        text: &str,
    ) -> std::result::Result<(), ChannelError>;
}

/// Processes one inbound message for a conversation.
///
/// The dispatcher owns its handler exclusively and never invokes it
/// concurrently, so implementations may keep conversation state in plain
/// fields behind `&mut self`.
#[async_trait]
pub trait Handler: Send {
    async fn handle_message(
        &mut self,
        cancel: &CancellationToken,
        writer: &dyn ResponseWriter,
        message: ChannelMessage,
    ) -> Result<()>;
}
