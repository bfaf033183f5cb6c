use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use nexus_memory::{StorageV2, Verdict};

/// Beta posterior parameters for one arm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BetaParams {
    /// Success pseudo-count.
    pub a: f64,
    /// Failure pseudo-count.
    pub b: f64,
}

impl Default for BetaParams {
    fn default() -> Self {
        Self { a: 1.0, b: 1.0 }
    }
}

impl BetaParams {
    /// Posterior mean.
    #[must_use]
    pub fn mean(self) -> f64 {
        let total = self.a + self.b;
        if total > 0.0 {
            self.a / total
        } else {
            0.5
        }
    }
}

/// One policy update entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyHistoryEntry {
    /// Update timestamp.
    pub ts: DateTime<Utc>,
    /// Selection the update rewarded.
    pub selected: IndexMap<String, String>,
    /// Verdict (or `drift_guard`).
    pub verdict: String,
    /// Update weight.
    pub weight: f64,
    /// Arbitrary context.
    #[serde(default)]
    pub metadata: Value,
}

/// Persisted bandit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyState {
    /// Family → arm → Beta posterior.
    pub arms: IndexMap<String, IndexMap<String, BetaParams>>,
    /// Current selection per family.
    pub selected: IndexMap<String, String>,
    /// Bounded update history.
    #[serde(default)]
    pub history: Vec<PolicyHistoryEntry>,
    /// When the selection was last sampled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_at: Option<DateTime<Utc>>,
}

impl Default for PolicyState {
    fn default() -> Self {
        let mut arms = IndexMap::new();
        arms.insert(
            "approve_threshold".to_string(),
            ["0.78", "0.82", "0.86"]
                .into_iter()
                .map(|arm| (arm.to_string(), BetaParams::default()))
                .collect(),
        );
        arms.insert(
            "scan_min_score".to_string(),
            ["5.8", "6.0", "6.2"]
                .into_iter()
                .map(|arm| (arm.to_string(), BetaParams::default()))
                .collect(),
        );
        arms.insert(
            "focus_policy".to_string(),
            ["reliability_first", "execution_first", "learning_first"]
                .into_iter()
                .map(|arm| (arm.to_string(), BetaParams::default()))
                .collect(),
        );
        let selected = IndexMap::from([
            ("approve_threshold".to_string(), "0.82".to_string()),
            ("scan_min_score".to_string(), "6.0".to_string()),
            ("focus_policy".to_string(), "reliability_first".to_string()),
        ]);
        Self {
            arms,
            selected,
            history: Vec::new(),
            selected_at: None,
        }
    }
}

/// Summary of one drift-guard pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftGuardSummary {
    /// Families with at least one adjusted arm.
    pub families_adjusted: usize,
    /// Total arms adjusted.
    pub arms_adjusted: usize,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

const HISTORY_CAP: usize = 1000;

/// Thompson-sampling tuner over the learning policy arms.
pub struct PolicyBandit {
    storage: Arc<StorageV2>,
    state: Mutex<PolicyState>,
}

impl std::fmt::Debug for PolicyBandit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyBandit").finish_non_exhaustive()
    }
}

impl PolicyBandit {
    /// Loads bandit state from storage, defaulting missing or corrupt state.
    #[must_use]
    pub fn new(storage: Arc<StorageV2>) -> Self {
        let stored: Value = storage.policy_state();
        let state = serde_json::from_value::<PolicyState>(stored)
            .ok()
            .filter(|s| !s.arms.is_empty())
            .unwrap_or_default();
        Self {
            storage,
            state: Mutex::new(state),
        }
    }

    fn persist(&self, state: &PolicyState) {
        let _ = self.storage.save_policy_state(state);
    }

    fn sample_arm<R: Rng>(family: &IndexMap<String, BetaParams>, rng: &mut R) -> Option<String> {
        let mut best: Option<(String, f64)> = None;
        for (arm, params) in family {
            let a = params.a.max(1e-6);
            let b = params.b.max(1e-6);
            let sample = Beta::new(a, b).map_or(0.0, |beta| beta.sample(rng));
            if best.as_ref().map_or(true, |(_, s)| sample > *s) {
                best = Some((arm.clone(), sample));
            }
        }
        best.map(|(arm, _)| arm)
    }

    /// Samples each family's posterior and persists the argmax selection.
    pub fn select_policy(&self) -> IndexMap<String, String> {
        let mut rng = rand::thread_rng();
        let mut state = self.state.lock();
        let mut selected = IndexMap::new();
        for (family, arms) in &state.arms {
            if let Some(arm) = Self::sample_arm(arms, &mut rng) {
                selected.insert(family.clone(), arm);
            }
        }
        state.selected.clone_from(&selected);
        state.selected_at = Some(Utc::now());
        self.persist(&state);
        selected
    }

    /// Rewards the chosen arms for a non-inconclusive verdict.
    ///
    /// Wins add the clamped weight to `a`, losses to `b`; inconclusive
    /// verdicts leave the state untouched.
    pub fn update(
        &self,
        verdict: Verdict,
        selected: Option<&IndexMap<String, String>>,
        weight: f64,
        metadata: Value,
    ) {
        if verdict == Verdict::Inconclusive {
            return;
        }
        let weight = weight.clamp(0.1, 4.0);
        let win = verdict == Verdict::Win;

        let mut state = self.state.lock();
        let chosen = selected.cloned().unwrap_or_else(|| state.selected.clone());
        for (family, arm) in &chosen {
            let Some(family_state) = state.arms.get_mut(family) else {
                continue;
            };
            let Some(params) = family_state.get_mut(arm) else {
                continue;
            };
            if win {
                params.a += weight;
            } else {
                params.b += weight;
            }
        }

        state.history.push(PolicyHistoryEntry {
            ts: Utc::now(),
            selected: chosen,
            verdict: match verdict {
                Verdict::Win => "win".into(),
                Verdict::Loss => "loss".into(),
                Verdict::Inconclusive => "inconclusive".into(),
            },
            weight: (weight * 10_000.0).round() / 10_000.0,
            metadata,
        });
        if state.history.len() > HISTORY_CAP {
            let excess = state.history.len() - HISTORY_CAP;
            state.history.drain(..excess);
        }
        self.persist(&state);
    }

    /// Shrinks overgrown or extreme posteriors toward the weak prior,
    /// preserving direction. Prevents runaway overconfidence.
    pub fn apply_drift_guard(
        &self,
        max_posterior_total: f64,
        min_mean: f64,
        max_mean: f64,
        shrink_ratio: f64,
        dry_run: bool,
    ) -> DriftGuardSummary {
        let total_cap = max_posterior_total.max(50.0);
        let lo = min_mean.clamp(0.01, 0.49);
        let hi = max_mean.clamp(0.51, 0.99);
        let shrink = shrink_ratio.clamp(0.05, 0.9);

        let mut state = self.state.lock();
        let mut families_adjusted = 0;
        let mut arms_adjusted = 0;
        for family_state in state.arms.values_mut() {
            let mut family_touched = false;
            for params in family_state.values_mut() {
                let a = params.a.max(1e-6);
                let b = params.b.max(1e-6);
                let total = a + b;
                let mean = a / total;
                if total <= total_cap && (lo..=hi).contains(&mean) {
                    continue;
                }
                family_touched = true;
                arms_adjusted += 1;
                if dry_run {
                    continue;
                }
                params.a = (1.0 + (a - 1.0) * (1.0 - shrink)).max(1.0);
                params.b = (1.0 + (b - 1.0) * (1.0 - shrink)).max(1.0);
            }
            if family_touched {
                families_adjusted += 1;
            }
        }

        if arms_adjusted > 0 && !dry_run {
            let selected = state.selected.clone();
            state.history.push(PolicyHistoryEntry {
                ts: Utc::now(),
                selected,
                verdict: "drift_guard".into(),
                weight: 0.0,
                metadata: serde_json::json!({
                    "families_adjusted": families_adjusted,
                    "arms_adjusted": arms_adjusted,
                    "max_posterior_total": total_cap,
                    "min_mean": lo,
                    "max_mean": hi,
                    "shrink_ratio": shrink,
                }),
            });
            if state.history.len() > HISTORY_CAP {
                let excess = state.history.len() - HISTORY_CAP;
                state.history.drain(..excess);
            }
            self.persist(&state);
        }

        DriftGuardSummary {
            families_adjusted,
            arms_adjusted,
            dry_run,
        }
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> PolicyState {
        self.state.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_memory::NexusPaths;
    use tempfile::tempdir;

    fn bandit(dir: &std::path::Path) -> PolicyBandit {
        let storage = Arc::new(StorageV2::open(&NexusPaths::new(dir)).unwrap());
        PolicyBandit::new(storage)
    }

    #[test]
    fn selection_covers_every_family() {
        let dir = tempdir().unwrap();
        let bandit = bandit(dir.path());
        let selected = bandit.select_policy();
        assert_eq!(selected.len(), 3);
        assert!(selected.contains_key("approve_threshold"));
        assert!(selected.contains_key("scan_min_score"));
        assert!(selected.contains_key("focus_policy"));
        assert!(bandit.state().selected_at.is_some());
    }

    #[test]
    fn update_adds_exactly_the_weight() {
        let dir = tempdir().unwrap();
        let bandit = bandit(dir.path());
        let selected = IndexMap::from([("approve_threshold".to_string(), "0.82".to_string())]);
        bandit.update(Verdict::Win, Some(&selected), 1.0, Value::Null);
        let state = bandit.state();
        let params = state.arms["approve_threshold"]["0.82"];
        assert!((params.a - 2.0).abs() < f64::EPSILON);
        assert!((params.b - 1.0).abs() < f64::EPSILON);

        bandit.update(Verdict::Loss, Some(&selected), 2.5, Value::Null);
        let params = bandit.state().arms["approve_threshold"]["0.82"];
        assert!((params.a - 2.0).abs() < f64::EPSILON);
        assert!((params.b - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn inconclusive_leaves_state_unchanged() {
        let dir = tempdir().unwrap();
        let bandit = bandit(dir.path());
        let before = serde_json::to_value(bandit.state()).unwrap();
        bandit.update(Verdict::Inconclusive, None, 1.0, Value::Null);
        let after = serde_json::to_value(bandit.state()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn weight_is_clamped() {
        let dir = tempdir().unwrap();
        let bandit = bandit(dir.path());
        let selected = IndexMap::from([("focus_policy".to_string(), "learning_first".to_string())]);
        bandit.update(Verdict::Win, Some(&selected), 100.0, Value::Null);
        let params = bandit.state().arms["focus_policy"]["learning_first"];
        assert!((params.a - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rewarded_arm_wins_the_sampling_race() {
        let dir = tempdir().unwrap();
        let bandit = bandit(dir.path());
        let selected = IndexMap::from([("approve_threshold".to_string(), "0.82".to_string())]);
        for _ in 0..10 {
            bandit.update(Verdict::Win, Some(&selected), 1.0, Value::Null);
        }
        let params = bandit.state().arms["approve_threshold"]["0.82"];
        assert!((params.a - 11.0).abs() < f64::EPSILON);
        // With a=11 the rewarded arm dominates the samples.
        let mut wins = 0;
        for _ in 0..50 {
            if bandit.select_policy()["approve_threshold"] == "0.82" {
                wins += 1;
            }
        }
        assert!(wins > 25, "rewarded arm selected only {wins}/50 times");
    }

    #[test]
    fn drift_guard_shrinks_overgrown_posteriors() {
        let dir = tempdir().unwrap();
        let bandit = bandit(dir.path());
        let selected = IndexMap::from([("scan_min_score".to_string(), "6.0".to_string())]);
        for _ in 0..200 {
            bandit.update(Verdict::Win, Some(&selected), 4.0, Value::Null);
        }
        let before = bandit.state().arms["scan_min_score"]["6.0"];
        assert!(before.mean() > 0.92);
        let summary = bandit.apply_drift_guard(400.0, 0.08, 0.92, 0.35, false);
        assert_eq!(summary.arms_adjusted, 1);
        let after = bandit.state().arms["scan_min_score"]["6.0"];
        assert!(after.a < before.a);
        assert!(after.a >= 1.0 && after.b >= 1.0);
    }

    #[test]
    fn state_persists_across_reloads() {
        let dir = tempdir().unwrap();
        {
            let bandit = bandit(dir.path());
            let selected = IndexMap::from([("approve_threshold".to_string(), "0.86".to_string())]);
            bandit.update(Verdict::Win, Some(&selected), 1.0, Value::Null);
        }
        let reloaded = bandit(dir.path());
        let params = reloaded.state().arms["approve_threshold"]["0.86"];
        assert!((params.a - 2.0).abs() < f64::EPSILON);
    }
}
