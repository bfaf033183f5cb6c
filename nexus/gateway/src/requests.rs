use serde::{Deserialize, Serialize};
use shared_logging::truncate;
use thiserror::Error;

/// A request failed schema or range validation. The HTTP adapter maps this
/// to a 422 response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    /// Offending field.
    pub field: &'static str,
    /// Human-readable reason.
    pub reason: String,
}

fn check_len(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(ValidationError {
            field,
            reason: format!("length {len} outside {min}..={max}"),
        });
    }
    Ok(())
}

fn check_range(
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), ValidationError> {
    if !(min..=max).contains(&value) {
        return Err(ValidationError {
            field,
            reason: format!("value {value} outside {min}..={max}"),
        });
    }
    Ok(())
}

/// Body of `POST /learn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnRequest {
    /// Source name, 1–200 chars.
    pub source: String,
    /// Item kind, 1–50 chars.
    #[serde(rename = "type")]
    pub kind: String,
    /// Title, 1–500 chars.
    pub title: String,
    /// Content, 1–50 000 chars.
    pub content: String,
    /// Optional URL, ≤ 2000 chars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Relevance in `[0, 1]`.
    #[serde(default)]
    pub relevance: f64,
    /// Tags, ≤ 20, each truncated to 100 chars.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl LearnRequest {
    /// Validates bounds, truncating tags. Returns the normalised request.
    pub fn validated(mut self) -> Result<Self, ValidationError> {
        check_len("source", &self.source, 1, 200)?;
        check_len("type", &self.kind, 1, 50)?;
        check_len("title", &self.title, 1, 500)?;
        check_len("content", &self.content, 1, 50_000)?;
        if let Some(url) = &self.url {
            check_len("url", url, 0, 2000)?;
        }
        check_range("relevance", self.relevance, 0.0, 1.0)?;
        if self.tags.len() > 20 {
            return Err(ValidationError {
                field: "tags",
                reason: format!("{} tags exceed the limit of 20", self.tags.len()),
            });
        }
        self.tags = self.tags.iter().map(|tag| truncate(tag, 100)).collect();
        Ok(self)
    }
}

/// Body of `POST /search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Query, 1–1000 chars.
    pub query: String,
    /// Result limit, 1–100.
    #[serde(default = "default_search_limit")]
    pub limit: u32,
}

fn default_search_limit() -> u32 {
    10
}

impl SearchRequest {
    /// Validates bounds.
    pub fn validated(self) -> Result<Self, ValidationError> {
        check_len("query", &self.query, 1, 1000)?;
        check_range("limit", f64::from(self.limit), 1.0, 100.0)?;
        Ok(self)
    }
}

/// Body of `POST /execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Task description, 1–5000 chars.
    pub task: String,
    /// Cycle budget, 1–100.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Whether a failed verification should reject the call.
    #[serde(default)]
    pub verification_required: bool,
}

fn default_max_cycles() -> u32 {
    10
}

impl ExecuteRequest {
    /// Validates bounds.
    pub fn validated(self) -> Result<Self, ValidationError> {
        check_len("task", &self.task, 1, 5000)?;
        check_range("max_cycles", f64::from(self.max_cycles), 1.0, 100.0)?;
        Ok(self)
    }
}

/// Body of `POST /feedback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    /// Feedback content, 1–10 000 chars.
    pub content: String,
}

impl FeedbackRequest {
    /// Validates bounds.
    pub fn validated(self) -> Result<Self, ValidationError> {
        check_len("content", &self.content, 1, 10_000)?;
        Ok(self)
    }
}

/// Body of `POST /task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionRequest {
    /// Executed task name.
    pub task_name: String,
    /// Duration; must be non-negative.
    pub duration_ms: f64,
    /// Whether the task succeeded.
    pub success: bool,
}

impl TaskExecutionRequest {
    /// Validates bounds.
    pub fn validated(self) -> Result<Self, ValidationError> {
        check_len("task_name", &self.task_name, 1, 200)?;
        if self.duration_ms < 0.0 {
            return Err(ValidationError {
                field: "duration_ms",
                reason: format!("value {} is negative", self.duration_ms),
            });
        }
        Ok(self)
    }
}
