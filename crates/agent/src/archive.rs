//! Background archiving of conversations cleared by a reset.

use std::sync::Arc;
use std::time::Duration;

use palaver_core::memory::{MemoryBackend, MemoryEntry};
use palaver_core::message::ChatMessage;
use palaver_core::provider::Provider;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::compactor::summarize;

pub const ARCHIVE_TAGS: [&str; 2] = ["conversation", "reset-summary"];

/// Summarize `messages` and store the summary in `archive`, in the background.
///
/// The task runs under its own token and `timeout`, independent of the
/// request that triggered it. It is best-effort: failures are logged and
/// nobody waits for it, so a summary still in flight when the process exits
/// is lost. The handle is only useful to tests.
pub fn spawn_detached_summary(
    provider: Arc<dyn Provider>,
    archive: Arc<dyn MemoryBackend>,
    session_id: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        debug!(%session_id, messages = messages.len(), "Archiving reset conversation");
        let summary = match tokio::time::timeout(
            timeout,
            summarize(provider.as_ref(), &cancel, &messages, max_tokens),
        )
        .await
        {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                warn!(%session_id, error = %e, "Reset summary failed");
                return;
            }
            Err(_) => {
                warn!(%session_id, timeout_secs = timeout.as_secs(), "Reset summary timed out");
                return;
            }
        };

        let tags = ARCHIVE_TAGS.iter().map(|tag| tag.to_string()).collect();
        let entry = MemoryEntry::new(summary, tags).with_source(session_id.clone());
        match archive.store(entry).await {
            Ok(id) => info!(%session_id, memory_id = %id, backend = archive.name(), "Archived reset conversation"),
            Err(e) => warn!(%session_id, error = %e, "Failed to archive reset conversation"),
        }
    })
}
