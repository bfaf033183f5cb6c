use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use nexus_learning::advisor::Advisor;
use nexus_memory::MemoryStore;

use crate::task::LoopTask;

/// One extracted learning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    /// Learning kind: `failure_pattern`, `success_pattern`, `retry_pattern`,
    /// or `reflection`.
    pub kind: String,
    /// Learning content.
    pub content: String,
    /// Value in `[0, 1]`; failures score high because they teach the most.
    pub value_score: f64,
    /// Suggested follow-up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Analysis of one finished task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Task id.
    pub task_id: String,
    /// Whether the task succeeded.
    pub success: bool,
    /// Extracted learnings.
    pub learnings: Vec<Learning>,
    /// Improvement suggestions.
    pub improvements: Vec<String>,
    /// Advisor quality score, when a reflection ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    /// Advisor summary, when a reflection ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Records approvals and denials of executed actions.
pub trait FeedbackSink: Send + Sync {
    /// Records a successful execution.
    fn record_approval(&self, action: &str, details: Value);
    /// Records a failed execution with its reason.
    fn record_denial(&self, action: &str, reason: &str, details: Value);
}

/// Feedback sink backed by the memory store's feedback log.
#[derive(Debug)]
pub struct FeedbackRecorder {
    store: Arc<MemoryStore>,
}

impl FeedbackRecorder {
    /// Creates a recorder over the store.
    #[must_use]
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

impl FeedbackSink for FeedbackRecorder {
    fn record_approval(&self, action: &str, details: Value) {
        let _ = self.store.record_feedback(&json!({
            "ts": Utc::now(),
            "kind": "approval",
            "action": action,
            "details": details,
        }));
    }

    fn record_denial(&self, action: &str, reason: &str, details: Value) {
        let _ = self.store.record_feedback(&json!({
            "ts": Utc::now(),
            "kind": "denial",
            "action": action,
            "reason": reason,
            "details": details,
        }));
    }
}

/// Extracts learnings from task outcomes, advisor-assisted when available.
pub struct LearningAnalyzer {
    advisor: Option<Arc<dyn Advisor>>,
}

impl std::fmt::Debug for LearningAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningAnalyzer")
            .field("advisor", &self.advisor.is_some())
            .finish()
    }
}

impl LearningAnalyzer {
    /// Creates an analyzer without an advisor (pure heuristics).
    #[must_use]
    pub const fn new() -> Self {
        Self { advisor: None }
    }

    /// Attaches an advisor; analysis falls back to heuristics on error.
    #[must_use]
    pub fn with_advisor(mut self, advisor: Arc<dyn Advisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    /// Analyses one finished task.
    pub async fn analyze_result(&self, task: &LoopTask, verification: &Value) -> Analysis {
        let success = verification
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| {
                task.result
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            });

        let mut analysis = Analysis {
            task_id: task.id.clone(),
            success,
            learnings: Vec::new(),
            improvements: Vec::new(),
            quality_score: None,
            summary: None,
        };

        if let Some(advisor) = &self.advisor {
            let work = format!(
                "Task: {} ({})\nAction: {:?}\nResult: {}\nVerification: {}\nRetries: {}/{}",
                task.name,
                task.description,
                task.action,
                task.result,
                verification,
                task.retry_count,
                task.max_retries,
            );
            if let Ok(reflection) = advisor.reflect(&work).await {
                analysis.quality_score = Some(reflection.quality_score);
                analysis.improvements.clone_from(&reflection.improvements);
                analysis.summary = Some(reflection.summary.clone());
                analysis.learnings.push(Learning {
                    kind: "reflection".into(),
                    content: reflection.summary,
                    value_score: reflection.quality_score,
                    suggestion: reflection.improvements.first().cloned(),
                });
                return analysis;
            }
        }

        if success {
            analysis.learnings.push(Learning {
                kind: "success_pattern".into(),
                content: format!("Task '{}' completed successfully", task.name),
                value_score: 0.6,
                suggestion: None,
            });
        } else {
            let error = task
                .result
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            analysis.learnings.push(Learning {
                kind: "failure_pattern".into(),
                content: format!("Task '{}' failed: {error}", task.name),
                value_score: 0.8,
                suggestion: Some("Investigate the root cause and fix it".into()),
            });
        }

        if task.retry_count > 0 {
            analysis.learnings.push(Learning {
                kind: "retry_pattern".into(),
                content: format!("Task '{}' needed {} retries", task.name, task.retry_count),
                value_score: 0.7,
                suggestion: Some("Improve task reliability".into()),
            });
        }

        analysis
    }

    /// Derives improvement suggestions from an analysis.
    #[must_use]
    pub fn improvement_suggestions(analysis: &Analysis) -> Vec<Value> {
        let mut suggestions = Vec::new();
        for learning in &analysis.learnings {
            match learning.kind.as_str() {
                "failure_pattern" => suggestions.push(json!({
                    "priority": "high",
                    "type": "bug_fix",
                    "description": learning.content,
                    "suggested_action": "Investigate and fix the root cause",
                })),
                "retry_pattern" => suggestions.push(json!({
                    "priority": "medium",
                    "type": "reliability",
                    "description": learning.content,
                    "suggested_action": "Improve task stability",
                })),
                _ => {}
            }
        }
        suggestions
    }
}

impl Default for LearningAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskAction, TaskPriority};
    use nexus_learning::advisor::HeuristicAdvisor;

    fn task(retries: u32) -> LoopTask {
        let mut task = LoopTask::new(
            "task_1",
            "probe",
            "probe the endpoint",
            TaskAction::VerifyUrl,
            Value::Null,
            TaskPriority::Medium,
        );
        task.retry_count = retries;
        task
    }

    #[tokio::test]
    async fn failure_produces_high_value_learning() {
        let analyzer = LearningAnalyzer::new();
        let mut failed = task(0);
        failed.result = json!({"success": false, "error": "connection refused"});
        let analysis = analyzer
            .analyze_result(&failed, &json!({"success": false}))
            .await;
        assert!(!analysis.success);
        assert_eq!(analysis.learnings[0].kind, "failure_pattern");
        assert!((analysis.learnings[0].value_score - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn retries_add_a_retry_pattern() {
        let analyzer = LearningAnalyzer::new();
        let analysis = analyzer
            .analyze_result(&task(2), &json!({"success": true}))
            .await;
        assert!(analysis.success);
        let kinds: Vec<&str> = analysis.learnings.iter().map(|l| l.kind.as_str()).collect();
        assert_eq!(kinds, vec!["success_pattern", "retry_pattern"]);
        let suggestions = LearningAnalyzer::improvement_suggestions(&analysis);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0]["type"], "reliability");
    }

    #[tokio::test]
    async fn advisor_reflection_takes_precedence() {
        let analyzer = LearningAnalyzer::new().with_advisor(Arc::new(HeuristicAdvisor));
        let analysis = analyzer
            .analyze_result(&task(0), &json!({"success": true}))
            .await;
        assert_eq!(analysis.learnings.len(), 1);
        assert_eq!(analysis.learnings[0].kind, "reflection");
        assert!(analysis.quality_score.is_some());
    }
}
