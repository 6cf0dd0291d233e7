//! Keeping a conversation history fit to send.
//!
//! | Step | Module | Guarantees |
//! |------|--------|------------|
//! | Sanitize | [`sanitizer`] | Every tool result answers a call of the assistant message heading its block |
//! | Estimate | [`token`] | Cheap, monotonic token estimate |
//! | Compact | [`compactor`] | History fits the budget; older turns survive as one summary message |

pub mod compactor;
pub mod sanitizer;
pub mod token;

pub use compactor::{recent_window_start, Compactor};
pub use sanitizer::{is_well_paired, sanitize};
pub use token::estimate_tokens;
