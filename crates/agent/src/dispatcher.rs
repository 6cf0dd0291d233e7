//! Per-conversation message dispatcher.
//!
//! Inbound messages are queued and handed to a single worker task, which
//! runs the handler for one message at a time in arrival order. The worker
//! owns the handler outright, so conversation state behind it is never
//! shared between tasks.
//!
//! Each run gets a child token of the dispatcher's root token. [`Dispatcher::stop`]
//! cancels the in-flight run and drops everything queued behind it: every
//! message is stamped with the stop epoch it was admitted under, and the
//! worker discards messages from an older epoch.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use palaver_config::AppConfig;
use palaver_core::channel::{ChannelMessage, Handler, ResponseWriter};
use palaver_core::error::{Error, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Shown to the user when a run fails for a reason other than cancellation.
pub const GENERIC_FAILURE_MESSAGE: &str =
    "Sorry, something went wrong while handling your message. Please try again.";

struct Envelope {
    epoch: u64,
    message: ChannelMessage,
}

/// State shared between the dispatcher handle and its worker.
#[derive(Default)]
struct Shared {
    /// Messages admitted but not yet picked up by the worker
    pending: AtomicUsize,

    /// Bumped by every stop
    epoch: AtomicU64,

    /// Token of the run in flight, if any
    current_run: Mutex<Option<CancellationToken>>,
}

impl Shared {
    fn current_run(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.current_run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serializes message handling for one conversation.
pub struct Dispatcher {
    queue_capacity: usize,
    idle_poll_interval: Duration,
    handler: Option<Box<dyn Handler>>,
    writer: Option<Arc<dyn ResponseWriter>>,
    shared: Arc<Shared>,
    sender: Option<mpsc::Sender<Envelope>>,
    root: Option<CancellationToken>,
    exited: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher whose queue holds `queue_capacity` messages.
    ///
    /// A capacity of 0 is treated as 1.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            idle_poll_interval: DEFAULT_IDLE_POLL_INTERVAL,
            handler: None,
            writer: None,
            shared: Arc::new(Shared::default()),
            sender: None,
            root: None,
            exited: CancellationToken::new(),
        }
    }

    /// Create a dispatcher sized and paced from `[dispatcher]` settings.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.dispatcher.queue_capacity).with_idle_poll_interval(Duration::from_millis(
            config.dispatcher.idle_poll_interval_ms,
        ))
    }

    pub fn with_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn ResponseWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// How often [`wait_until_idle`](Self::wait_until_idle) re-checks.
    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Spawn the worker. The dispatcher shuts down when `parent` is cancelled.
    ///
    /// Must be called from within a tokio runtime, and only once.
    pub fn start(&mut self, parent: &CancellationToken) -> Result<()> {
        if self.sender.is_some() {
            return Err(Error::config("dispatcher already started"));
        }
        if self.handler.is_none() {
            return Err(Error::config("dispatcher has no handler"));
        }
        let Some(writer) = self.writer.clone() else {
            return Err(Error::config("dispatcher has no response writer"));
        };
        let Some(handler) = self.handler.take() else {
            return Err(Error::config("dispatcher has no handler"));
        };

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let root = parent.child_token();

        let worker = Worker {
            handler,
            writer,
            shared: self.shared.clone(),
            root: root.clone(),
        };
        tokio::spawn(worker.run(rx, self.exited.clone()));

        info!(queue_capacity = self.queue_capacity, "Dispatcher started");
        self.sender = Some(tx);
        self.root = Some(root);
        Ok(())
    }

    /// Queue `message`, waiting for a free slot while the queue is full.
    ///
    /// Fails with [`Error::Cancelled`] when `cancel` or the dispatcher's root
    /// token fires first; the message is then not queued.
    pub async fn enqueue(&self, cancel: &CancellationToken, message: ChannelMessage) -> Result<()> {
        let (Some(sender), Some(root)) = (&self.sender, &self.root) else {
            return Err(Error::config("dispatcher not started"));
        };

        let permit = tokio::select! {
            biased;
            _ = root.cancelled() => return Err(Error::Cancelled),
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = sender.reserve() => permit.map_err(|_| Error::Cancelled)?,
        };

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        permit.send(Envelope { epoch, message });
        Ok(())
    }

    /// Cancel the running message and discard everything queued.
    ///
    /// Messages enqueued after `stop` returns are handled normally.
    pub fn stop(&self) {
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let run = self.shared.current_run().clone();
        if let Some(run) = run {
            run.cancel();
        }
        debug!(
            epoch,
            discarded = self.shared.pending.load(Ordering::SeqCst),
            "Dispatcher stopped"
        );
    }

    /// Resolve once nothing is running or queued.
    pub async fn wait_until_idle(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if self.is_idle() {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.idle_poll_interval) => {}
            }
        }
    }

    /// Resolve once the worker has exited. Returns at once if never started.
    pub async fn wait(&self) {
        if self.sender.is_none() {
            return;
        }
        self.exited.cancelled().await;
    }

    /// Whether a message is being handled right now.
    pub fn is_running(&self) -> bool {
        self.shared.current_run().is_some()
    }

    /// Number of messages waiting for the worker.
    pub fn queued(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        if self.exited.is_cancelled() {
            return true;
        }
        // The worker records the run before releasing the pending slot, so
        // reading pending first never misses a message in hand-off.
        self.queued() == 0 && !self.is_running()
    }
}

struct Worker {
    handler: Box<dyn Handler>,
    writer: Arc<dyn ResponseWriter>,
    shared: Arc<Shared>,
    root: CancellationToken,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>, exited: CancellationToken) {
        let _exited = exited.drop_guard();

        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let run = self.root.child_token();
            *self.shared.current_run() = Some(run.clone());
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);

            if envelope.epoch < self.shared.epoch.load(Ordering::SeqCst) {
                *self.shared.current_run() = None;
                debug!(
                    channel = %envelope.message.channel_id,
                    "Discarding message queued before stop"
                );
                continue;
            }

            self.handle(&run, envelope.message).await;
            *self.shared.current_run() = None;
        }

        info!("Dispatcher worker exited");
    }

    async fn handle(&mut self, run: &CancellationToken, message: ChannelMessage) {
        let channel = message.channel_id.clone();
        debug!(%channel, "Handling message");

        let result = self
            .handler
            .handle_message(run, self.writer.as_ref(), message)
            .await;

        match result {
            Ok(()) => debug!(%channel, "Message handled"),
            Err(e) if e.is_cancelled() || run.is_cancelled() => {
                debug!(%channel, error = %e, "Message handling cancelled");
            }
            Err(e) => {
                error!(%channel, error = %e, "Message handling failed");
                if let Err(write_err) = self
                    .writer
                    .write_message(&self.root, GENERIC_FAILURE_MESSAGE)
                    .await
                {
                    warn!(%channel, error = %write_err, "Failed to report failure to the user");
                }
            }
        }
    }
}
