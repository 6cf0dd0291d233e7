//! Approval gating for tool execution.
//!
//! Every tool call the model requests passes through an [`Approver`] before
//! it runs. Channels that can ask a human implement the trait with their own
//! prompt UI; the runtime ships the policy-only approvers below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ToolError;
use crate::tool::{Tool, ToolOutput};

/// How much freedom the agent has to act.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    /// Can only talk, never execute tools
    ReadOnly,
    /// Must ask permission for every tool call (default)
    #[default]
    Supervised,
    /// Full autonomy, execute everything
    Full,
}

/// What the approver is asked to allow.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    /// Human-readable summary of the call, shown in approval prompts
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: String },
}

/// Decides whether a tool call may run.
///
/// Implementations may block indefinitely (waiting on a human) but must
/// return [`ToolError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(
        &self,
        cancel: &CancellationToken,
        request: &ApprovalRequest,
    ) -> std::result::Result<ApprovalDecision, ToolError>;
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprover;

#[async_trait]
impl Approver for AutoApprover {
    async fn approve(
        &self,
        _cancel: &CancellationToken,
        _request: &ApprovalRequest,
    ) -> std::result::Result<ApprovalDecision, ToolError> {
        Ok(ApprovalDecision::Approved)
    }
}

/// Applies an [`AutonomyLevel`] policy, delegating supervised calls to an
/// interactive approver when one is attached.
#[derive(Clone, Default)]
pub struct AutonomyApprover {
    level: AutonomyLevel,
    supervisor: Option<Arc<dyn Approver>>,
}

impl AutonomyApprover {
    pub fn new(level: AutonomyLevel) -> Self {
        Self {
            level,
            supervisor: None,
        }
    }

    /// Attach the interactive approver consulted at [`AutonomyLevel::Supervised`].
    pub fn with_supervisor(mut self, supervisor: Arc<dyn Approver>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }
}

#[async_trait]
impl Approver for AutonomyApprover {
    async fn approve(
        &self,
        cancel: &CancellationToken,
        request: &ApprovalRequest,
    ) -> std::result::Result<ApprovalDecision, ToolError> {
        match (self.level, &self.supervisor) {
            (AutonomyLevel::Full, _) => Ok(ApprovalDecision::Approved),
            (AutonomyLevel::ReadOnly, _) => Ok(ApprovalDecision::Denied {
                reason: "tool execution is disabled in read-only mode".into(),
            }),
            (AutonomyLevel::Supervised, Some(supervisor)) => {
                supervisor.approve(cancel, request).await
            }
            (AutonomyLevel::Supervised, None) => Ok(ApprovalDecision::Denied {
                reason: "no approver is available to supervise this call".into(),
            }),
        }
    }
}

/// Run `tool` once `approver` allows it.
///
/// Denial surfaces as [`ToolError::PermissionDenied`]; cancellation before
/// or during execution surfaces as [`ToolError::Cancelled`].
pub async fn execute_tool(
    cancel: &CancellationToken,
    approver: &dyn Approver,
    tool: &dyn Tool,
    arguments: serde_json::Value,
    description: &str,
) -> std::result::Result<ToolOutput, ToolError> {
    let request = ApprovalRequest {
        tool_name: tool.name().to_string(),
        arguments,
        description: description.to_string(),
    };

    let decision = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ToolError::Cancelled),
        decision = approver.approve(cancel, &request) => decision?,
    };

    if let ApprovalDecision::Denied { reason } = decision {
        debug!(tool = %request.tool_name, %reason, "Tool call denied");
        return Err(ToolError::PermissionDenied {
            tool_name: request.tool_name,
            reason,
        });
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ToolError::Cancelled),
        output = tool.execute(cancel, request.arguments) => output,
    }
}
