//! Shared test doubles for the agent crate.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use palaver_core::channel::ResponseWriter;
use palaver_core::error::{ChannelError, MemoryError, ProviderError, ToolError};
use palaver_core::memory::{MemoryBackend, MemoryEntry};
use palaver_core::message::ToolCall;
use palaver_core::provider::{ChatRequest, ChatResponse, Provider, TokenUsage};
use palaver_core::tool::{Tool, ToolOutput};
use tokio_util::sync::CancellationToken;

/// Returns scripted responses in order and records every request.
///
/// Once the script runs out every call fails with an API error.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        _cancel: &CancellationToken,
        request: ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 500,
                message: "script exhausted".into(),
            })
    }
}

/// Fails every call.
pub struct FailingProvider;

pub fn failing_provider() -> FailingProvider {
    FailingProvider
}

#[async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    async fn chat(
        &self,
        _cancel: &CancellationToken,
        _request: ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        Err(ProviderError::Network("connection refused".into()))
    }
}

/// Never answers; resolves only when the request is cancelled.
pub struct PendingProvider;

#[async_trait]
impl Provider for PendingProvider {
    fn name(&self) -> &str {
        "pending"
    }

    async fn chat(
        &self,
        cancel: &CancellationToken,
        _request: ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        cancel.cancelled().await;
        Err(ProviderError::Cancelled)
    }
}

fn mock_usage() -> Option<TokenUsage> {
    Some(TokenUsage {
        input_tokens: 10,
        output_tokens: 5,
        total_tokens: 15,
        cost_usd: None,
    })
}

/// A final text response with usage attached.
pub fn text_response(text: &str) -> ChatResponse {
    ChatResponse {
        usage: mock_usage(),
        ..ChatResponse::text(text)
    }
}

/// A response requesting `calls`, with usage attached.
pub fn tool_call_response(calls: Vec<ToolCall>) -> ChatResponse {
    ChatResponse {
        usage: mock_usage(),
        ..ChatResponse::with_tool_calls(calls)
    }
}

/// Answers with `"{name}: {arguments}"`.
pub struct EchoTool {
    name: String,
}

impl EchoTool {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Echoes its arguments"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::new(format!("{}: {arguments}", self.name)))
    }
}

/// Always fails with an execution error.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "always_fails"
    }

    fn description(&self) -> &str {
        "Fails every time"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _arguments: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "always_fails".into(),
            reason: "disk on fire".into(),
        })
    }
}

/// Collects everything written to it.
#[derive(Default)]
pub struct RecordingWriter {
    messages: Mutex<Vec<String>>,
}

impl RecordingWriter {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseWriter for RecordingWriter {
    async fn write_message(&self, _cancel: &CancellationToken, text: &str) -> Result<(), ChannelError> {
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Memory backend that keeps stored entries for inspection.
#[derive(Default)]
pub struct RecordingMemory {
    entries: Mutex<Vec<MemoryEntry>>,
}

impl RecordingMemory {
    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl MemoryBackend for RecordingMemory {
    fn name(&self) -> &str {
        "recording"
    }

    async fn store(&self, entry: MemoryEntry) -> Result<String, MemoryError> {
        let id = entry.id.clone();
        self.entries.lock().unwrap().push(entry);
        Ok(id)
    }
}
