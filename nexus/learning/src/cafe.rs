use std::{collections::HashMap, env, path::Path};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use nexus_memory::{LearningEvent, OutcomeEvidence, Verdict};

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let avg = mean(values);
    values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name).map_or(default, |raw| {
        matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on")
    })
}

/// CAFE thresholds and weights, ENV-backed.
#[derive(Debug, Clone, Copy)]
pub struct CafeConfig {
    /// Master switch (`ENABLE_CAFE_LOOP`).
    pub enabled: bool,
    /// Confidence floor below which blocking is considered.
    pub conf_min: f64,
    /// Helpfulness floor for the reasons list.
    pub helpful_min: f64,
    /// Harmlessness floor; combined with low confidence this blocks.
    pub harmless_min: f64,
    /// Weight of the helpful channel.
    pub weight_helpful: f64,
    /// Weight of the harmless channel.
    pub weight_harmless: f64,
    /// Weight of the reliability channel.
    pub weight_reliability: f64,
}

impl Default for CafeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            conf_min: 0.6,
            helpful_min: 0.5,
            harmless_min: 0.55,
            weight_helpful: 0.5,
            weight_harmless: 0.3,
            weight_reliability: 0.2,
        }
    }
}

impl CafeConfig {
    /// Reads configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("ENABLE_CAFE_LOOP", defaults.enabled),
            conf_min: env_f64("CAFE_CONFIDENCE_MIN", defaults.conf_min),
            helpful_min: env_f64("CAFE_HELPFUL_MIN", defaults.helpful_min),
            harmless_min: env_f64("CAFE_HARMLESS_MIN", defaults.harmless_min),
            weight_helpful: env_f64("CAFE_WEIGHT_HELPFUL", defaults.weight_helpful),
            weight_harmless: env_f64("CAFE_WEIGHT_HARMLESS", defaults.weight_harmless),
            weight_reliability: env_f64("CAFE_WEIGHT_RELIABILITY", defaults.weight_reliability),
        }
    }
}

/// Multi-channel score with uncertainty estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeScore {
    /// Whether scoring was enabled.
    pub enabled: bool,
    /// Weighted combined score.
    pub score: f64,
    /// Combined confidence (ensemble agreement plus model bias).
    pub confidence: f64,
    /// Helpful channel.
    pub helpful: f64,
    /// Harmless channel.
    pub harmless: f64,
    /// Reliability channel.
    pub reliability: f64,
    /// True when low confidence coincides with low harmlessness.
    pub blocked: bool,
    /// Threshold-violation reason tokens.
    pub reasons: Vec<String>,
    /// Model the payload was attributed to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Bias applied for that model family.
    pub model_conf_bias: f64,
}

impl CafeScore {
    fn disabled() -> Self {
        Self {
            enabled: false,
            score: 0.0,
            confidence: 0.0,
            helpful: 0.0,
            harmless: 0.0,
            reliability: 0.0,
            blocked: false,
            reasons: Vec::new(),
            model: None,
            model_conf_bias: 0.0,
        }
    }
}

/// Heuristic multi-channel scorer with per-model-family confidence bias.
#[derive(Debug)]
pub struct CafeScorer {
    config: CafeConfig,
    model_bias: RwLock<HashMap<String, f64>>,
}

impl CafeScorer {
    /// Creates a scorer with no model bias loaded.
    #[must_use]
    pub fn new(config: CafeConfig) -> Self {
        Self {
            config,
            model_bias: RwLock::new(HashMap::new()),
        }
    }

    /// Loads the model bias table: `CAFE_MODEL_CONF_BIAS_JSON` (a JSON
    /// object of family → bias) takes precedence; otherwise the persisted
    /// CAFE state file is read. Absence and corruption both yield an empty
    /// table.
    #[must_use]
    pub fn with_state_file(self, path: &Path) -> Self {
        let bias = load_model_bias(path);
        *self.model_bias.write() = bias;
        self
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &CafeConfig {
        &self.config
    }

    /// Replaces the model bias table (calibration pushes through here).
    pub fn set_model_bias(&self, bias: HashMap<String, f64>) {
        *self.model_bias.write() = bias
            .into_iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v))
            .filter(|(k, _)| !k.is_empty())
            .collect();
    }

    fn model_bias_for(&self, model: &str) -> f64 {
        if model.is_empty() {
            return 0.0;
        }
        let name = model.trim().to_lowercase();
        let bias = self.model_bias.read();
        if let Some(value) = bias.get(&name) {
            return value.clamp(-0.2, 0.2);
        }
        for (key, value) in bias.iter() {
            if !key.is_empty() && name.contains(key) {
                return value.clamp(-0.2, 0.2);
            }
        }
        0.0
    }

    /// Scores a learning event over its value/novelty/risk/confidence.
    #[must_use]
    pub fn score_event(&self, event: &LearningEvent) -> CafeScore {
        if !self.config.enabled {
            return CafeScore::disabled();
        }

        let value = clamp01(event.value);
        let novelty = clamp01(event.novelty);
        let confidence = clamp01(event.confidence);
        let risk = clamp01(event.risk);
        let model = extract_model(event.model.as_deref(), &event.context);
        let model_bias = self.model_bias_for(&model);

        let helpful_candidates = [
            value,
            clamp01((value + novelty) / 2.0),
            clamp01(value.mul_add(0.7, confidence * 0.3)),
        ];
        let harmless_candidates = [
            clamp01(1.0 - risk),
            clamp01(risk.mul_add(-1.1, 1.0)),
            clamp01((1.0 - risk).mul_add(0.8, 0.2)),
        ];
        let reliability_candidates = [
            confidence,
            clamp01((confidence + (1.0 - risk)) / 2.0),
            clamp01(1.0 - (value - risk).abs()),
        ];

        let helpful = clamp01(mean(&helpful_candidates));
        let harmless = clamp01(mean(&harmless_candidates));
        let reliability = clamp01(mean(&reliability_candidates));

        let ensemble_variance = mean(&[
            variance(&helpful_candidates),
            variance(&harmless_candidates),
            variance(&reliability_candidates),
        ]);
        let ensemble_conf = clamp01(ensemble_variance.mul_add(-2.0, 1.0));
        let mut combined_conf = clamp01((confidence + ensemble_conf) / 2.0);
        if model_bias != 0.0 {
            combined_conf = clamp01(combined_conf + model_bias);
        }

        let score = clamp01(
            self.config.weight_helpful * helpful
                + self.config.weight_harmless * harmless
                + self.config.weight_reliability * reliability,
        );

        let blocked = combined_conf < self.config.conf_min && harmless < self.config.harmless_min;
        let mut reasons = Vec::new();
        if combined_conf < self.config.conf_min {
            reasons.push("low_confidence".to_string());
        }
        if helpful < self.config.helpful_min {
            reasons.push("low_helpfulness".to_string());
        }
        if harmless < self.config.harmless_min {
            reasons.push("low_harmlessness".to_string());
        }

        CafeScore {
            enabled: true,
            score,
            confidence: combined_conf,
            helpful,
            harmless,
            reliability,
            blocked,
            reasons,
            model: (!model.is_empty()).then_some(model),
            model_conf_bias: model_bias,
        }
    }

    /// Scores post-run evidence: the verdict sets the helpful baseline, the
    /// delta shapes harmlessness, and confidence drives reliability.
    #[must_use]
    pub fn score_evidence(&self, evidence: &OutcomeEvidence) -> CafeScore {
        if !self.config.enabled {
            return CafeScore::disabled();
        }

        let conf = clamp01(evidence.confidence);
        let delta_health = evidence.delta.health_score;
        let delta_errors = evidence.delta.total_errors;
        let delta_success = evidence.delta.success_rate;

        let base_helpful = match evidence.verdict {
            Verdict::Win => 0.85,
            Verdict::Loss => 0.2,
            Verdict::Inconclusive => 0.5,
        };
        let helpful = clamp01(base_helpful + clamp01(delta_success * 5.0));

        let harmless = if delta_health <= -2.0 || delta_errors >= 2 {
            0.2
        } else if delta_health >= 0.5 && delta_errors <= 0 {
            0.85
        } else {
            0.7
        };

        let verdict_bonus = if evidence.verdict == Verdict::Inconclusive { 0.0 } else { 0.2 };
        let mut reliability = clamp01(conf.mul_add(0.8, verdict_bonus));

        let model = extract_model(evidence.model.as_deref(), &Value::Null);
        let model_bias = self.model_bias_for(&model);
        if model_bias != 0.0 {
            reliability = clamp01(reliability + model_bias);
        }

        let score = clamp01(
            self.config.weight_helpful * helpful
                + self.config.weight_harmless * harmless
                + self.config.weight_reliability * reliability,
        );

        let blocked = reliability < self.config.conf_min && harmless < self.config.harmless_min;
        let mut reasons = Vec::new();
        if reliability < self.config.conf_min {
            reasons.push("low_confidence".to_string());
        }
        if harmless < self.config.harmless_min {
            reasons.push("low_harmlessness".to_string());
        }

        CafeScore {
            enabled: true,
            score,
            confidence: reliability,
            helpful,
            harmless,
            reliability,
            blocked,
            reasons,
            model: (!model.is_empty()).then_some(model),
            model_conf_bias: model_bias,
        }
    }
}

fn extract_model(model: Option<&str>, context: &Value) -> String {
    if let Some(model) = model {
        if !model.trim().is_empty() {
            return model.trim().to_string();
        }
    }
    for key in ["model", "model_name", "selected_model", "route_model"] {
        if let Some(value) = context.get(key).and_then(Value::as_str) {
            if !value.trim().is_empty() {
                return value.trim().to_string();
            }
        }
    }
    String::new()
}

fn load_model_bias(path: &Path) -> HashMap<String, f64> {
    // Env override wins; when set but unparsable it yields an empty table
    // rather than falling through to the state file.
    if let Ok(raw) = env::var("CAFE_MODEL_CONF_BIAS_JSON") {
        if !raw.trim().is_empty() {
            return serde_json::from_str::<Value>(&raw)
                .ok()
                .as_ref()
                .and_then(Value::as_object)
                .map(bias_table)
                .unwrap_or_default();
        }
    }

    let Ok(bytes) = std::fs::read(path) else {
        return HashMap::new();
    };
    let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
        return HashMap::new();
    };
    value
        .get("model_bias")
        .and_then(Value::as_object)
        .map(bias_table)
        .unwrap_or_default()
}

fn bias_table(map: &serde_json::Map<String, Value>) -> HashMap<String, f64> {
    map.iter()
        .filter_map(|(k, v)| v.as_f64().map(|f| (k.trim().to_lowercase(), f)))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}
