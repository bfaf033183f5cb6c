use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task priority. Ordering is queue order: `Critical` runs first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
    /// Immediate, safety-related work.
    Critical,
    /// Time-sensitive work.
    High,
    /// Default urgency.
    Medium,
    /// Opportunistic work.
    Low,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued.
    Pending,
    /// Executing.
    Running,
    /// Verifying the result.
    Verifying,
    /// Finished successfully.
    Completed,
    /// Retries exhausted.
    Failed,
    /// Extracting learnings.
    Learning,
}

/// Actions the loop can dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// Fetch a URL and verify it responds.
    VerifyUrl,
    /// Verify a local file exists and is readable.
    VerifyFile,
    /// Run a validated shell command (no metacharacters).
    RunCommand,
    /// Run Python code with the result envelope.
    RunPython,
    /// Record a learning event directly.
    LearnFromInput,
    /// Anything else; fails with an unknown-action error.
    #[serde(other)]
    Unknown,
}

impl TaskAction {
    /// Canonical snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VerifyUrl => "verify_url",
            Self::VerifyFile => "verify_file",
            Self::RunCommand => "run_command",
            Self::RunPython => "run_python",
            Self::LearnFromInput => "learn_from_input",
            Self::Unknown => "unknown",
        }
    }
}

/// One task in the autonomous loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopTask {
    /// Task identifier (`task_...`).
    pub id: String,
    /// Short name.
    pub name: String,
    /// Longer description.
    pub description: String,
    /// Dispatched action.
    pub action: TaskAction,
    /// Action parameters.
    #[serde(default)]
    pub params: Value,
    /// Priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Status.
    pub status: TaskStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Execution start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution result.
    #[serde(default)]
    pub result: Value,
    /// Verification payload.
    #[serde(default)]
    pub verification: Value,
    /// Learnings extracted from the outcome.
    #[serde(default)]
    pub learnings: Vec<String>,
    /// Retries so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
}

impl LoopTask {
    /// Creates a pending task.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        action: TaskAction,
        params: Value,
        priority: TaskPriority,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            action,
            params,
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: Value::Null,
            verification: Value::Null,
            learnings: Vec::new(),
            retry_count: 0,
            max_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_critical_first() {
        assert!(TaskPriority::Critical < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Medium);
        assert!(TaskPriority::Medium < TaskPriority::Low);
    }

    #[test]
    fn unknown_actions_deserialize_to_unknown() {
        let action: TaskAction = serde_json::from_str("\"launch_rocket\"").unwrap();
        assert_eq!(action, TaskAction::Unknown);
        let action: TaskAction = serde_json::from_str("\"verify_url\"").unwrap();
        assert_eq!(action, TaskAction::VerifyUrl);
    }
}
