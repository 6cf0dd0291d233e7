//! # Palaver Core
//!
//! Domain types, capability traits, and error definitions for the Palaver
//! conversation runtime. Nothing here talks to a network or a disk: this
//! crate defines the message model and the seams that every collaborator
//! (model providers, tools, approvers, channels, stores) implements against.
//!
//! ## Design Philosophy
//!
//! Every external capability is a trait here. Implementations live outside
//! the runtime. This enables:
//! - Swapping providers and transports without touching the agent loop
//! - Easy testing with scripted mock implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod approval;
pub mod channel;
pub mod error;
pub mod memory;
pub mod message;
pub mod provider;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use approval::{
    execute_tool, ApprovalDecision, ApprovalRequest, Approver, AutoApprover, AutonomyApprover,
    AutonomyLevel,
};
pub use channel::{ChannelId, ChannelMessage, Handler, ResponseWriter};
pub use error::{Error, Result};
pub use memory::{MemoryBackend, MemoryEntry};
pub use message::{ChatMessage, MessageKind, Role, ToolCall};
pub use provider::{ChatRequest, ChatResponse, Provider, TokenUsage, ToolDefinition};
pub use session::{InMemorySessionStore, SessionStore};
pub use tool::{Tool, ToolOutput, ToolRegistry};

/// Cancellation handle threaded through every suspending operation.
pub use tokio_util::sync::CancellationToken;
