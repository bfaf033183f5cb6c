use std::{collections::HashMap, env, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nexus_memory::{load_json_or_default, save_json_atomic, StorageV2, Verdict};

use crate::cafe::CafeScorer;

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Calibration knobs, ENV-backed (`CAFE_CALIBRATION_*`).
#[derive(Debug, Clone)]
pub struct CalibratorConfig {
    /// Minimum evidences per family before a bias is computed (floor 2).
    pub min_samples: usize,
    /// Multiplier from the win/loss score to the bias target.
    pub bias_scale: f64,
    /// Absolute cap on any bias value.
    pub bias_cap: f64,
    /// Exponential smoothing factor toward the new target.
    pub smoothing: f64,
    /// Model-family tokens matched as substrings of model names.
    pub family_tokens: Vec<String>,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            min_samples: 6,
            bias_scale: 0.12,
            bias_cap: 0.15,
            smoothing: 0.3,
            family_tokens: [
                "codex", "gpt", "chatgpt", "claude", "sonnet", "opus", "haiku", "gemini",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl CalibratorConfig {
    /// Reads configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let family_tokens = env::var("CAFE_MODEL_FAMILY_KEYS").map_or(defaults.family_tokens.clone(), |raw| {
            raw.split(',')
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        });
        Self {
            min_samples: env_usize("CAFE_CALIBRATION_MIN_SAMPLES", defaults.min_samples).max(2),
            bias_scale: env_f64("CAFE_CALIBRATION_BIAS_SCALE", defaults.bias_scale),
            bias_cap: env_f64("CAFE_CALIBRATION_BIAS_CAP", defaults.bias_cap),
            smoothing: env_f64("CAFE_CALIBRATION_SMOOTHING", defaults.smoothing),
            family_tokens,
        }
    }
}

/// Per-family verdict statistics from one calibration pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FamilyStats {
    /// Win fraction.
    pub win_rate: f64,
    /// Loss fraction.
    pub loss_rate: f64,
    /// Inconclusive fraction.
    pub inconclusive_rate: f64,
    /// `win − loss − 0.5·inconclusive`.
    pub score: f64,
    /// Evidence count.
    pub samples: usize,
}

/// Persisted CAFE calibration state (`cafe_state.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CafeState {
    /// Per-family confidence bias.
    #[serde(default)]
    pub model_bias: HashMap<String, f64>,
    /// Per-family statistics behind the bias.
    #[serde(default)]
    pub model_stats: HashMap<String, FamilyStats>,
    /// Last calibration time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Summary returned from one calibration pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSummary {
    /// Families whose bias was updated.
    pub updated: usize,
    /// Minimum samples required.
    pub min_samples: usize,
    /// Calibration time.
    pub last_updated: DateTime<Utc>,
    /// The updated bias table.
    pub model_bias: HashMap<String, f64>,
}

/// Recomputes per-model-family confidence bias from historical verdicts and
/// pushes it into the live scorer.
pub struct CafeCalibrator {
    storage: Arc<StorageV2>,
    state_path: PathBuf,
    config: CalibratorConfig,
}

impl std::fmt::Debug for CafeCalibrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CafeCalibrator")
            .field("state_path", &self.state_path)
            .finish_non_exhaustive()
    }
}

impl CafeCalibrator {
    /// Creates a calibrator persisting into `state_path`.
    #[must_use]
    pub fn new(storage: Arc<StorageV2>, state_path: impl Into<PathBuf>, config: CalibratorConfig) -> Self {
        Self {
            storage,
            state_path: state_path.into(),
            config,
        }
    }

    fn family_key(&self, model: &str) -> String {
        let name = model.trim().to_lowercase();
        for token in &self.config.family_tokens {
            if !token.is_empty() && name.contains(token) {
                return token.clone();
            }
        }
        if name.is_empty() {
            "unknown".to_string()
        } else {
            name
        }
    }

    /// Runs one calibration pass over recent evidence.
    pub fn calibrate(&self, scorer: &CafeScorer) -> CalibrationSummary {
        let evidences = self.storage.list_outcome_evidence(1200);

        let mut stats: HashMap<String, (usize, usize, usize)> = HashMap::new();
        for evidence in &evidences {
            let Some(model) = evidence.model.as_deref().filter(|m| !m.trim().is_empty()) else {
                continue;
            };
            let key = self.family_key(model);
            let row = stats.entry(key).or_insert((0, 0, 0));
            match evidence.verdict {
                Verdict::Win => row.0 += 1,
                Verdict::Loss => row.1 += 1,
                Verdict::Inconclusive => row.2 += 1,
            }
        }

        let previous: CafeState = load_json_or_default(&self.state_path);
        let mut model_bias = HashMap::new();
        let mut model_stats = HashMap::new();
        for (family, (wins, losses, inconclusive)) in stats {
            let total = wins + losses + inconclusive;
            if total < self.config.min_samples {
                continue;
            }
            let win_rate = wins as f64 / total as f64;
            let loss_rate = losses as f64 / total as f64;
            let inconclusive_rate = inconclusive as f64 / total as f64;
            let score = inconclusive_rate.mul_add(-0.5, win_rate - loss_rate);
            let target = (score * self.config.bias_scale).clamp(-self.config.bias_cap, self.config.bias_cap);
            let prev = previous.model_bias.get(&family).copied().unwrap_or(0.0);
            let blended = (1.0 - self.config.smoothing).mul_add(prev, self.config.smoothing * target);
            model_bias.insert(
                family.clone(),
                blended.clamp(-self.config.bias_cap, self.config.bias_cap),
            );
            model_stats.insert(
                family,
                FamilyStats {
                    win_rate,
                    loss_rate,
                    inconclusive_rate,
                    score,
                    samples: total,
                },
            );
        }

        let now = Utc::now();
        let state = CafeState {
            model_bias: model_bias.clone(),
            model_stats,
            last_updated: Some(now),
        };
        let _ = save_json_atomic(&self.state_path, &state);
        scorer.set_model_bias(model_bias.clone());

        CalibrationSummary {
            updated: model_bias.len(),
            min_samples: self.config.min_samples,
            last_updated: now,
            model_bias,
        }
    }

    /// The persisted state.
    #[must_use]
    pub fn state(&self) -> CafeState {
        load_json_or_default(&self.state_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cafe::CafeConfig;
    use nexus_memory::{
        ExecutionSummary, MetricsDelta, NexusPaths, OutcomeEvidence, ThroughputSnapshot,
        VerdictSignals,
    };
    use tempfile::tempdir;

    fn evidence(model: &str, verdict: Verdict) -> OutcomeEvidence {
        OutcomeEvidence {
            id: String::new(),
            experiment_id: "run".into(),
            ts: Utc::now(),
            metrics_before: serde_json::Value::Null,
            metrics_after: serde_json::Value::Null,
            delta: MetricsDelta::default(),
            verdict,
            confidence: 0.7,
            signals: VerdictSignals::default(),
            notes: String::new(),
            throughput_before: ThroughputSnapshot::default(),
            throughput_after: ThroughputSnapshot::default(),
            execution: ExecutionSummary::default(),
            pending_recheck: false,
            attempt: 1,
            holdout_pending: None,
            next_recheck_after: None,
            model: Some(model.to_string()),
            cafe: None,
        }
    }

    #[test]
    fn winning_family_earns_positive_bias() {
        let dir = tempdir().unwrap();
        let paths = NexusPaths::new(dir.path());
        let storage = Arc::new(StorageV2::open(&paths).unwrap());
        for _ in 0..6 {
            storage
                .record_outcome_evidence(evidence("claude-sonnet-4", Verdict::Win))
                .unwrap();
        }
        // Below min_samples: ignored.
        storage
            .record_outcome_evidence(evidence("gpt-5", Verdict::Loss))
            .unwrap();

        let scorer = CafeScorer::new(CafeConfig::default());
        let calibrator = CafeCalibrator::new(
            Arc::clone(&storage),
            paths.cafe_state_file(),
            CalibratorConfig::default(),
        );
        let summary = calibrator.calibrate(&scorer);
        assert_eq!(summary.updated, 1);
        let bias = summary.model_bias.get("sonnet").copied().unwrap();
        // First pass: smoothing·(score·scale) = 0.3 · 0.12 = 0.036.
        assert!((bias - 0.036).abs() < 1e-9, "bias={bias}");
        assert!(calibrator.state().model_stats.contains_key("sonnet"));
    }

    #[test]
    fn repeated_calibration_blends_toward_target() {
        let dir = tempdir().unwrap();
        let paths = NexusPaths::new(dir.path());
        let storage = Arc::new(StorageV2::open(&paths).unwrap());
        for _ in 0..8 {
            storage
                .record_outcome_evidence(evidence("gemini-pro", Verdict::Loss))
                .unwrap();
        }
        let scorer = CafeScorer::new(CafeConfig::default());
        let calibrator = CafeCalibrator::new(
            Arc::clone(&storage),
            paths.cafe_state_file(),
            CalibratorConfig::default(),
        );
        let first = calibrator.calibrate(&scorer).model_bias["gemini"];
        let second = calibrator.calibrate(&scorer).model_bias["gemini"];
        assert!(first < 0.0);
        assert!(second < first, "second={second} first={first}");
        assert!(second >= -0.15);
    }
}
