use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Structured reflection over a finished piece of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    /// Quality in `[0, 1]`.
    pub quality_score: f64,
    /// Concrete improvement suggestions.
    pub improvements: Vec<String>,
    /// One-paragraph summary.
    pub summary: String,
}

/// Judgement and reflection seam.
///
/// The heuristic implementation always exists and is deterministic; the LLM
/// implementation is optional and every call site falls back to the
/// heuristic on error.
#[async_trait]
pub trait Advisor: Send + Sync {
    /// Reflects on a described piece of work.
    async fn reflect(&self, work: &str) -> anyhow::Result<Reflection>;

    /// Rates a data source description in `[0, 1]`.
    async fn judge_quality(&self, description: &str) -> anyhow::Result<f64>;
}

/// Deterministic advisor built from keyword heuristics.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicAdvisor;

#[async_trait]
impl Advisor for HeuristicAdvisor {
    async fn reflect(&self, work: &str) -> anyhow::Result<Reflection> {
        let lowered = work.to_lowercase();
        let failed = ["fail", "error", "denied", "timeout"]
            .iter()
            .any(|token| lowered.contains(token));
        let retried = lowered.contains("retry");

        let mut quality: f64 = if failed { 0.3 } else { 0.7 };
        let mut improvements = Vec::new();
        if failed {
            improvements.push("Investigate the root cause and add a targeted fix".to_string());
        }
        if retried {
            quality -= 0.1;
            improvements.push("Improve first-attempt reliability to avoid retries".to_string());
        }

        Ok(Reflection {
            quality_score: quality.clamp(0.0, 1.0),
            improvements,
            summary: if failed {
                "Work finished with failures worth investigating.".to_string()
            } else {
                "Work finished cleanly.".to_string()
            },
        })
    }

    async fn judge_quality(&self, description: &str) -> anyhow::Result<f64> {
        let lowered = description.to_lowercase();
        let mut score: f64 = 0.5;
        if lowered.contains("error") {
            score -= 0.2;
        }
        if lowered.contains("findings") {
            score += 0.1;
        }
        Ok(score.clamp(0.0, 1.0))
    }
}

/// Advisor backed by an HTTP JSON completion endpoint.
///
/// Expects the endpoint to accept `{model, prompt}` and reply with
/// `{text: "..."}` where the text body is JSON matching the request shape.
#[derive(Debug, Clone)]
pub struct LlmAdvisor {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl LlmAdvisor {
    /// Creates an advisor against the given endpoint and model name.
    #[must_use]
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({"model": self.model, "prompt": prompt}))
            .send()
            .await?;
        let payload: Value = response.json().await?;
        payload
            .get("text")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| anyhow::anyhow!("advisor response missing text field"))
    }
}

#[async_trait]
impl Advisor for LlmAdvisor {
    async fn reflect(&self, work: &str) -> anyhow::Result<Reflection> {
        let prompt = format!(
            "Reflect on this work and answer ONLY with JSON \
             {{\"quality_score\": 0..1, \"improvements\": [..], \"summary\": \"...\"}}.\n{work}"
        );
        let text = self.complete(&prompt).await?;
        let parsed: Reflection = serde_json::from_str(extract_json(&text))?;
        anyhow::ensure!(
            (0.0..=1.0).contains(&parsed.quality_score),
            "quality_score out of range"
        );
        anyhow::ensure!(!parsed.summary.trim().is_empty(), "summary empty");
        Ok(parsed)
    }

    async fn judge_quality(&self, description: &str) -> anyhow::Result<f64> {
        let prompt = format!("Rate this data source 0..1; answer with a single number.\n{description}");
        let text = self.complete(&prompt).await?;
        let score: f64 = text.trim().parse()?;
        anyhow::ensure!((0.0..=1.0).contains(&score), "score out of range");
        Ok(score)
    }
}

/// Strips a Markdown code fence when the model wrapped its JSON in one.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim().trim_end_matches("```").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heuristic_reflection_scores_failures_low() {
        let advisor = HeuristicAdvisor;
        let ok = advisor.reflect("task completed successfully").await.unwrap();
        let bad = advisor.reflect("task failed with error after retry").await.unwrap();
        assert!(ok.quality_score > bad.quality_score);
        assert!(bad.improvements.len() >= 2);
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("{\"a\":1}"), "{\"a\":1}");
    }
}
