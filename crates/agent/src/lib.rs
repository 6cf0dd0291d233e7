//! The Palaver conversation runtime.
//!
//! A conversation is served by a [`Dispatcher`] that feeds inbound messages,
//! one at a time, to a [`ConversationHandler`]. For each message the handler:
//!
//! 1. **Sanitizes** the history so every tool call is paired with its results
//! 2. **Compacts** it to the token budget, summarizing the older prefix
//! 3. **Runs** the [`ConversationLoop`]: ask the model, execute the tools it
//!    requests, ask again, until it answers with text only or the iteration
//!    limit is reached
//! 4. **Persists** the new history and writes the answer back to the channel

pub mod archive;
pub mod context;
pub mod dispatcher;
pub mod handler;
pub mod loop_runner;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use archive::spawn_detached_summary;
pub use context::{estimate_tokens, recent_window_start, sanitize, Compactor};
pub use dispatcher::{Dispatcher, GENERIC_FAILURE_MESSAGE};
pub use handler::{ConversationHandler, RESET_ACKNOWLEDGEMENT};
pub use loop_runner::{ConversationLoop, UsageCallback};
