use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::policy::PolicyViolation;

/// Persisted output is capped at this many bytes.
pub const OUTPUT_CAP: usize = 2048;

/// Lifecycle status of an action. Exactly one terminal status per result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Accepted, not yet running.
    Pending,
    /// Handler in flight.
    Running,
    /// Completed without error.
    Success,
    /// Completed with an error.
    Failed,
    /// Abandoned at the deadline.
    Timeout,
}

impl ActionStatus {
    /// Whether this is a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Timeout)
    }
}

/// Result of one action execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Action identifier (`action_...`).
    pub id: String,
    /// Requested action type, as spelled by the caller.
    pub action_type: String,
    /// Status.
    pub status: ActionStatus,
    /// Handler output (capped at [`OUTPUT_CAP`] when persisted).
    pub output: String,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured handler data.
    #[serde(default)]
    pub data: Value,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// Completion timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration.
    pub duration_ms: i64,
    /// True when the safety policy denied the action.
    #[serde(default)]
    pub policy_blocked: bool,
    /// Action-specific post-check outcome, when the handler ran one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective_success: Option<bool>,
}

/// Output of a successful handler invocation.
#[derive(Debug, Clone, Default)]
pub struct ActionOutput {
    /// Human-readable output.
    pub output: String,
    /// Structured data.
    pub data: Value,
    /// Post-check outcome, when the handler verified its own effect.
    pub objective_success: Option<bool>,
}

impl ActionOutput {
    /// Convenience constructor.
    #[must_use]
    pub fn new(output: impl Into<String>, data: Value) -> Self {
        Self {
            output: output.into(),
            data,
            objective_success: None,
        }
    }

    /// Attaches a post-check outcome.
    #[must_use]
    pub const fn verified(mut self, ok: bool) -> Self {
        self.objective_success = Some(ok);
        self
    }
}

/// Errors surfaced by action handlers. These never escape the executor: each
/// becomes a failed [`ActionResult`].
#[derive(Debug, Error)]
pub enum ActionError {
    /// A required parameter is missing.
    #[error("{0} parameter required")]
    MissingParam(&'static str),
    /// A parameter has the wrong shape.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    /// A referenced path or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The safety policy denied the action.
    #[error("policy denied: {0}")]
    PolicyDenied(#[from] PolicyViolation),
    /// The handler ran and failed.
    #[error("{0}")]
    ExecutionFailed(String),
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// HTTP failure.
    #[error("http error: {0}")]
    Http(String),
}

impl ActionError {
    /// Whether this error is a policy denial.
    #[must_use]
    pub const fn is_policy_denied(&self) -> bool {
        matches!(self, Self::PolicyDenied(_))
    }
}
