use std::{path::Path, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of verifying a URL or file target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// Verified target (URL or path).
    pub target: String,
    /// Whether verification passed.
    pub success: bool,
    /// HTTP status, for URL targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Task the verification belongs to.
    pub task_id: String,
    /// Verification time.
    pub timestamp: DateTime<Utc>,
}

/// Verifies task results against the outside world: URLs by fetching them,
/// files by checking they exist and are readable.
#[derive(Debug, Clone)]
pub struct TargetVerifier {
    http: reqwest::Client,
}

impl TargetVerifier {
    /// Builds a verifier with a bounded request deadline.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
        })
    }

    /// Verifies that a URL responds with a non-error status.
    pub async fn verify_url(&self, url: &str, task_id: &str) -> VerificationOutcome {
        match self.http.get(url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                VerificationOutcome {
                    target: url.to_string(),
                    success: status < 400,
                    status: Some(status),
                    error: (status >= 400).then(|| format!("HTTP {status}")),
                    task_id: task_id.to_string(),
                    timestamp: Utc::now(),
                }
            }
            Err(err) => VerificationOutcome {
                target: url.to_string(),
                success: false,
                status: None,
                error: Some(err.to_string()),
                task_id: task_id.to_string(),
                timestamp: Utc::now(),
            },
        }
    }

    /// Verifies that a local file exists and is readable.
    #[must_use]
    pub fn verify_file(&self, path: &Path, task_id: &str) -> VerificationOutcome {
        let readable = path.is_file() && std::fs::File::open(path).is_ok();
        VerificationOutcome {
            target: path.display().to_string(),
            success: readable,
            status: None,
            error: (!readable).then(|| format!("File not found or unreadable: {}", path.display())),
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_verification_checks_existence() {
        let dir = tempdir().unwrap();
        let verifier = TargetVerifier::new().unwrap();
        let path = dir.path().join("exists.txt");
        std::fs::write(&path, "ok").unwrap();
        assert!(verifier.verify_file(&path, "task_1").success);
        let missing = verifier.verify_file(&dir.path().join("missing.txt"), "task_1");
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("missing.txt"));
    }
}
