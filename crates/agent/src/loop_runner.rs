//! The conversation loop: ask the model, run the tools it requests, ask again.

use std::collections::HashSet;
use std::sync::Arc;

use palaver_core::approval::{execute_tool, Approver, AutoApprover};
use palaver_core::error::{Error, Result, ToolError};
use palaver_core::message::{ChatMessage, ToolCall};
use palaver_core::provider::{ChatRequest, ChatResponse, Provider, TokenUsage};
use palaver_core::tool::ToolRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Longest argument preview shown in approval descriptions.
const DESCRIPTION_ARGS_LIMIT: usize = 200;

/// Receives the usage accumulated over one run.
pub type UsageCallback = Arc<dyn Fn(&TokenUsage) + Send + Sync>;

/// Drives one model-and-tool turn to a final answer.
///
/// Configure with the `with_*` builder methods; provider and tools are
/// required and checked when [`run`](Self::run) is called.
#[derive(Clone, Default)]
pub struct ConversationLoop {
    provider: Option<Arc<dyn Provider>>,
    tools: Option<Arc<ToolRegistry>>,
    approver: Option<Arc<dyn Approver>>,

    /// Rounds before giving up; 0 means the default
    max_iterations: usize,

    /// Byte cap on tool output kept in history; 0 means uncapped
    tool_output_cap: usize,

    /// Response budget forwarded to the provider
    max_tokens: Option<u32>,

    usage_callback: Option<UsageCallback>,
}

impl ConversationLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Gate tool execution behind `approver`. Without one every call is approved.
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Set the maximum number of model rounds per run.
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Truncate tool output to `cap` bytes before it enters the history.
    pub fn with_tool_output_cap(mut self, cap: usize) -> Self {
        self.tool_output_cap = cap;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Report accumulated token usage after every run.
    pub fn with_usage_callback(mut self, callback: UsageCallback) -> Self {
        self.usage_callback = Some(callback);
        self
    }

    pub fn max_iterations(&self) -> usize {
        if self.max_iterations == 0 {
            DEFAULT_MAX_ITERATIONS
        } else {
            self.max_iterations
        }
    }

    /// Run the loop over `messages` until the model answers without tool calls.
    ///
    /// Every assistant message and tool result is appended to `messages` as
    /// it happens, so the caller sees the partial history on failure too.
    /// Returns the terminal response with usage summed across all rounds.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        system_prompt: &str,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<ChatResponse> {
        let provider = self
            .provider
            .as_deref()
            .ok_or_else(|| Error::config("conversation loop has no provider"))?;
        let tools = self
            .tools
            .as_deref()
            .ok_or_else(|| Error::config("conversation loop has no tool registry"))?;

        let mut usage: Option<TokenUsage> = None;
        let result = self
            .run_rounds(cancel, provider, tools, system_prompt, messages, &mut usage)
            .await;

        if let Some(callback) = &self.usage_callback {
            callback(&usage.clone().unwrap_or_default());
        }

        result.map(|mut response| {
            response.usage = usage;
            response
        })
    }

    async fn run_rounds(
        &self,
        cancel: &CancellationToken,
        provider: &dyn Provider,
        tools: &ToolRegistry,
        system_prompt: &str,
        messages: &mut Vec<ChatMessage>,
        usage: &mut Option<TokenUsage>,
    ) -> Result<ChatResponse> {
        let max_iterations = self.max_iterations();
        let definitions = tools.definitions();

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            debug!(
                iteration,
                messages = messages.len(),
                provider = provider.name(),
                "Conversation loop iteration"
            );

            let request = ChatRequest {
                system_prompt: system_prompt.to_string(),
                messages: messages.clone(),
                tools: definitions.clone(),
                max_tokens: self.max_tokens,
            };

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                response = provider.chat(cancel, request) => response?,
            };

            if let Some(reported) = &response.usage {
                usage.get_or_insert_with(TokenUsage::default).accumulate(reported);
            }

            if response.tool_calls.is_empty() {
                if !response.content.is_empty() {
                    messages.push(ChatMessage::assistant(response.content.clone()));
                }
                info!(iterations = iteration, "Conversation loop finished");
                return Ok(response);
            }

            debug!(tool_count = response.tool_calls.len(), "Executing tool calls");
            let calls = assign_call_ids(&response.tool_calls);
            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content.clone(),
                calls.clone(),
            ));

            for call in &calls {
                let output = self.execute_call(cancel, tools, call).await?;
                messages.push(ChatMessage::tool_result(&call.id, output));
            }
        }

        warn!(iterations = max_iterations, "Max iterations reached without a final answer");
        Err(Error::IterationLimit {
            iterations: max_iterations,
        })
    }

    /// Produce the tool-result text for one call.
    ///
    /// Unknown tools, bad arguments and tool failures become error text for
    /// the model to read; only cancellation aborts the run.
    async fn execute_call(
        &self,
        cancel: &CancellationToken,
        tools: &ToolRegistry,
        call: &ToolCall,
    ) -> Result<String> {
        let Some(tool) = tools.lookup(&call.name) else {
            let mut available = tools.names();
            available.sort_unstable();
            warn!(tool = %call.name, "Model requested an unknown tool");
            return Ok(format!(
                "Error: {}. Available tools: {}",
                ToolError::NotFound(call.name.clone()),
                if available.is_empty() {
                    "none".to_string()
                } else {
                    available.join(", ")
                }
            ));
        };

        let arguments = match parse_arguments(&call.arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool call has malformed arguments");
                return Ok(format!(
                    "Error: {}",
                    ToolError::InvalidArguments(format!("{}: {e}", call.name))
                ));
            }
        };

        let description = describe_tool_call(call);
        let approver: &dyn Approver = match &self.approver {
            Some(approver) => approver.as_ref(),
            None => &AutoApprover,
        };

        match execute_tool(cancel, approver, tool.as_ref(), arguments, &description).await {
            Ok(output) => Ok(truncate_output(output.output, self.tool_output_cap)),
            Err(ToolError::Cancelled) => Err(Error::Cancelled),
            Err(_) if cancel.is_cancelled() => Err(Error::Cancelled),
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                Ok(format!("Error: {e}"))
            }
        }
    }
}

/// Give every call in one response a non-blank ID unique within it.
///
/// Blank and repeated IDs are replaced with fresh ones so each tool result
/// answers exactly one call.
fn assign_call_ids(calls: &[ToolCall]) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .iter()
        .map(|call| {
            let mut call = call.clone();
            if call.id.trim().is_empty() || !seen.insert(call.id.clone()) {
                let fresh = format!("call_{}", Uuid::new_v4().simple());
                warn!(tool = %call.name, id = %call.id, replacement = %fresh, "Replacing unusable tool call id");
                seen.insert(fresh.clone());
                call.id = fresh;
            }
            call
        })
        .collect()
}

/// Parse a call's JSON argument string; blank means no arguments.
fn parse_arguments(raw: &str) -> serde_json::Result<serde_json::Value> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
}

/// Human-readable summary of a call, shown to approvers.
pub fn describe_tool_call(call: &ToolCall) -> String {
    let args = call.arguments.trim();
    if args.is_empty() || args == "{}" {
        return format!("run {}", call.name);
    }
    let preview = truncate_output(args.to_string(), DESCRIPTION_ARGS_LIMIT);
    let ellipsis = if preview.len() < args.len() { "…" } else { "" };
    format!("run {} with {preview}{ellipsis}", call.name)
}

/// Cut `output` to at most `cap` bytes on a char boundary; 0 disables the cap.
fn truncate_output(mut output: String, cap: usize) -> String {
    if cap == 0 || output.len() <= cap {
        return output;
    }
    let mut end = cap;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output.truncate(end);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        failing_provider, text_response, tool_call_response, EchoTool, FailingTool, ScriptedProvider,
    };
    use palaver_core::approval::{AutonomyApprover, AutonomyLevel};
    use crate::context::sanitizer::{is_well_paired, sanitize};
    use palaver_core::message::Role;
    use std::sync::Mutex;

    fn registry() -> Arc<ToolRegistry> {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool::named("read_file")));
        tools.register(Arc::new(EchoTool::named("list_dir")));
        tools.register(Arc::new(FailingTool));
        Arc::new(tools)
    }

    fn agent(provider: Arc<ScriptedProvider>) -> ConversationLoop {
        ConversationLoop::new().with_provider(provider).with_tools(registry())
    }

    #[tokio::test]
    async fn plain_answer_is_appended() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_response("Hello!")]));
        let mut history = vec![ChatMessage::user("hi")];

        let response = agent(provider.clone())
            .run(&CancellationToken::new(), "be brief", &mut history)
            .await
            .unwrap();

        assert_eq!(response.content, "Hello!");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Hello!");

        let request = &provider.requests()[0];
        assert_eq!(request.system_prompt, "be brief");
        assert_eq!(request.tools.len(), 3);
    }

    #[tokio::test]
    async fn empty_final_answer_is_not_appended() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_response("")]));
        let mut history = vec![ChatMessage::user("hi")];

        agent(provider)
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn tool_call_then_answer() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_response(vec![ToolCall::new("1", "read_file", r#"{"path":"a.txt"}"#)]),
            text_response("done"),
        ]));
        let mut history = vec![ChatMessage::user("hi")];

        let response = agent(provider.clone())
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap();

        assert_eq!(response.content, "done");
        assert_eq!(history.len(), 4);
        assert!(history[1].has_tool_calls());
        assert_eq!(history[2].role, Role::Tool);
        assert_eq!(history[2].tool_call_id.as_deref(), Some("1"));
        assert!(history[2].content.contains("a.txt"));
        assert_eq!(history[3].content, "done");

        // Second round sees the tool result.
        assert_eq!(provider.requests()[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn blank_and_repeated_call_ids_are_replaced() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_response(vec![
                ToolCall::new("", "read_file", "{}"),
                ToolCall::new("7", "list_dir", "{}"),
                ToolCall::new("7", "read_file", "{}"),
            ]),
            text_response("done"),
        ]));
        let mut history = vec![ChatMessage::user("hi")];

        agent(provider.clone())
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap();

        let requests = provider.requests();
        let second = &requests[1].messages;
        assert_eq!(second.len(), 5);
        assert!(is_well_paired(second));
        assert!(!sanitize(second).1);

        let ids: Vec<&str> = second[1].tool_calls.iter().map(|call| call.id.as_str()).collect();
        assert!(!ids[0].trim().is_empty());
        assert_eq!(ids[1], "7");
        assert_ne!(ids[2], "7");
        assert_ne!(ids[0], ids[2]);
        for (call, result) in second[1].tool_calls.iter().zip(&second[2..]) {
            assert_eq!(result.tool_call_id.as_deref(), Some(call.id.as_str()));
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_and_loop_continues() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_response(vec![ToolCall::new("1", "delete_everything", "{}")]),
            text_response("sorry, using read_file instead"),
        ]));
        let mut history = vec![ChatMessage::user("hi")];

        let response = agent(provider)
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap();

        assert_eq!(response.content, "sorry, using read_file instead");
        let error = &history[2].content;
        assert!(error.contains("unknown tool"), "{error}");
        assert!(error.contains("always_fails, list_dir, read_file"), "{error}");
    }

    #[tokio::test]
    async fn malformed_arguments_are_reported() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_response(vec![ToolCall::new("1", "read_file", "{not json")]),
            text_response("retrying"),
        ]));
        let mut history = vec![ChatMessage::user("hi")];

        agent(provider)
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap();
        assert!(history[2].content.starts_with("Error: Invalid tool arguments: read_file"));
    }

    #[tokio::test]
    async fn blank_arguments_mean_empty_object() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_response(vec![ToolCall::new("1", "list_dir", "  ")]),
            text_response("ok"),
        ]));
        let mut history = vec![ChatMessage::user("hi")];

        agent(provider)
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap();
        assert_eq!(history[2].content, "list_dir: {}");
    }

    #[tokio::test]
    async fn tool_failure_is_fed_back() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_response(vec![ToolCall::new("1", "always_fails", "{}")]),
            text_response("that failed"),
        ]));
        let mut history = vec![ChatMessage::user("hi")];

        agent(provider)
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap();
        assert!(history[2].content.starts_with("Error: Tool execution failed"));
    }

    #[tokio::test]
    async fn denied_tool_is_fed_back() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_response(vec![ToolCall::new("1", "read_file", "{}")]),
            text_response("not allowed"),
        ]));
        let mut history = vec![ChatMessage::user("hi")];

        agent(provider)
            .with_approver(Arc::new(AutonomyApprover::new(AutonomyLevel::ReadOnly)))
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap();
        assert!(history[2].content.contains("Permission denied"));
    }

    #[tokio::test]
    async fn iteration_limit_keeps_partial_history() {
        let responses = (0..3)
            .map(|n| tool_call_response(vec![ToolCall::new(n.to_string(), "read_file", "{}")]))
            .collect();
        let provider = Arc::new(ScriptedProvider::new(responses));
        let mut history = vec![ChatMessage::user("loop forever")];

        let err = agent(provider)
            .with_max_iterations(3)
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("max iterations exceeded"), "{text}");
        assert!(text.contains('3'), "{text}");
        // user + 3 × (assistant + tool result)
        assert_eq!(history.len(), 7);
    }

    #[tokio::test]
    async fn zero_iterations_uses_default() {
        assert_eq!(ConversationLoop::new().max_iterations(), 10);
        assert_eq!(ConversationLoop::new().with_max_iterations(4).max_iterations(), 4);
    }

    #[tokio::test]
    async fn missing_collaborators_are_config_errors() {
        let mut history = vec![ChatMessage::user("hi")];
        let err = ConversationLoop::new()
            .with_tools(registry())
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let err = ConversationLoop::new()
            .with_provider(Arc::new(ScriptedProvider::new(vec![])))
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_calling_provider() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_response("unused")]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut history = vec![ChatMessage::user("hi")];

        let err = agent(provider.clone())
            .run(&cancel, "", &mut history)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(provider.call_count(), 0);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn provider_error_is_fatal() {
        let mut history = vec![ChatMessage::user("hi")];
        let err = ConversationLoop::new()
            .with_provider(Arc::new(failing_provider()))
            .with_tools(registry())
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[tokio::test]
    async fn usage_is_accumulated_and_reported() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_response(vec![ToolCall::new("1", "read_file", "{}")]),
            text_response("done"),
        ]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut history = vec![ChatMessage::user("hi")];

        let response = agent(provider)
            .with_usage_callback(Arc::new(move |usage: &TokenUsage| {
                sink.lock().unwrap().push(usage.clone());
            }))
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap();

        let usage = response.usage.unwrap();
        assert_eq!(usage.total_tokens, 30);
        assert_eq!(usage.input_tokens, 20);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], usage);
    }

    #[tokio::test]
    async fn usage_callback_fires_on_failure() {
        let provider = Arc::new(ScriptedProvider::new(vec![tool_call_response(vec![
            ToolCall::new("1", "read_file", "{}"),
        ])]));
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let mut history = vec![ChatMessage::user("hi")];

        let result = agent(provider)
            .with_max_iterations(1)
            .with_usage_callback(Arc::new(move |_: &TokenUsage| {
                *counter.lock().unwrap() += 1;
            }))
            .run(&CancellationToken::new(), "", &mut history)
            .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn tool_output_is_capped_on_char_boundary() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_response(vec![ToolCall::new("1", "read_file", r#"{"text":"héllo wörld"}"#)]),
            text_response("ok"),
        ]));
        let mut history = vec![ChatMessage::user("hi")];

        agent(provider)
            .with_tool_output_cap(20)
            .run(&CancellationToken::new(), "", &mut history)
            .await
            .unwrap();
        assert!(history[2].content.len() <= 20);
    }

    #[test]
    fn truncation_respects_utf8() {
        assert_eq!(truncate_output("héllo".to_string(), 2), "h");
        assert_eq!(truncate_output("héllo".to_string(), 3), "hé");
        assert_eq!(truncate_output("short".to_string(), 0), "short");
        assert_eq!(truncate_output("short".to_string(), 10), "short");
    }

    #[test]
    fn description_previews_arguments() {
        assert_eq!(describe_tool_call(&ToolCall::new("1", "list_dir", "")), "run list_dir");
        assert_eq!(
            describe_tool_call(&ToolCall::new("1", "read_file", r#"{"path":"a"}"#)),
            r#"run read_file with {"path":"a"}"#
        );
        let long = format!(r#"{{"text":"{}"}}"#, "x".repeat(500));
        assert!(describe_tool_call(&ToolCall::new("1", "echo", long)).ends_with('…'));
    }
}
