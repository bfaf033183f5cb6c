use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Issue severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Low,
    /// Worth attention.
    Medium,
    /// Needs action soon.
    High,
    /// Needs immediate action.
    Critical,
}

impl Severity {
    /// Ordering weight: lower sorts first in top-issue lists.
    #[must_use]
    pub const fn sort_weight(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

/// Issue classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Latency or slowness.
    Performance,
    /// Error frequency or recurrence.
    Error,
    /// Output quality regression.
    Quality,
    /// Suspicious behavioural pattern.
    Behavior,
    /// Resource exhaustion.
    Resource,
}

impl IssueKind {
    /// The canned fix proposal for this kind of issue.
    #[must_use]
    pub fn fix_proposal(self) -> Value {
        let recommended = match self {
            Self::Performance => "Optimize prompts, implement caching, or use a faster model",
            Self::Error => "Add input validation and implement retry with backoff",
            Self::Quality => "Enhance prompts with examples and clearer instructions",
            Self::Behavior => "Add iteration limits and progress detection",
            Self::Resource => "Optimize resource usage and add cleanup routines",
        };
        serde_json::json!({
            "method": "5_whys_analysis",
            "recommended_fix": recommended,
        })
    }
}

/// One tracked issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Issue identifier.
    pub id: String,
    /// Creation timestamp.
    pub timestamp: DateTime<Utc>,
    /// Classification.
    #[serde(rename = "type")]
    pub kind: IssueKind,
    /// Severity.
    pub severity: Severity,
    /// Short title (≤100 chars).
    pub title: String,
    /// Description (≤500 chars).
    pub description: String,
    /// Agent the issue is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_agent: Option<String>,
    /// `open` or `resolved`.
    pub status: String,
    /// Times this issue has been observed.
    pub occurrence_count: u64,
    /// Last observation time.
    pub last_seen: DateTime<Utc>,
    /// Canned fix proposal.
    #[serde(default)]
    pub fix_proposal: Value,
    /// Resolution timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Resolution note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

/// One logged decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEntry {
    /// Timestamp.
    pub timestamp: DateTime<Utc>,
    /// Deciding agent.
    pub agent: String,
    /// Decision kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Description.
    pub description: String,
    /// Reasoning, when provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Alternatives considered (≤5).
    #[serde(default)]
    pub alternatives: Vec<String>,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// One logged action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    /// Timestamp.
    pub timestamp: DateTime<Utc>,
    /// Acting agent.
    pub agent: String,
    /// Action kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Structured detail.
    #[serde(default)]
    pub details: Value,
    /// Whether the action succeeded.
    pub success: bool,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Tokens consumed, when applicable.
    pub tokens_used: u64,
}

/// One logged error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Timestamp.
    pub timestamp: DateTime<Utc>,
    /// Affected agent.
    pub agent: String,
    /// Error kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Message (≤500 chars).
    pub message: String,
    /// Structured context.
    #[serde(default)]
    pub context: Value,
    /// Whether the caller recovered.
    pub recoverable: bool,
}

/// One logged metric sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEntry {
    /// Timestamp.
    pub timestamp: DateTime<Utc>,
    /// Metric name.
    pub name: String,
    /// Value.
    pub value: f64,
    /// Emitting agent, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: Value,
}

/// Aggregate statistics for one session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionStats {
    /// Decisions logged.
    pub total_decisions: usize,
    /// Actions logged.
    pub total_actions: usize,
    /// Errors logged.
    pub total_errors: usize,
    /// Errors per action.
    pub error_rate: f64,
    /// Mean action duration.
    pub avg_duration_ms: f64,
    /// Total tokens consumed.
    pub total_tokens: u64,
    /// Successful actions per action.
    pub success_rate: f64,
}

/// Overall system status derived from the health score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Score ≥ 80.
    Healthy,
    /// Score ≥ 50.
    Degraded,
    /// Score < 50.
    Critical,
}

/// Health report consumed by verification and status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// 0–100 score penalised by open issues.
    pub health_score: f64,
    /// Derived status.
    pub status: HealthStatus,
    /// Open issue count.
    pub open_issues: usize,
    /// Open critical issue count.
    pub critical_issues: usize,
    /// Latest recorded session stats.
    pub recent_stats: SessionStats,
    /// Up to five worst open issues.
    pub top_issues: Vec<Issue>,
}
