use std::{env, sync::Arc};

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use nexus_memory::{
    ExecutionProfile, ExecutionStatus, ExperimentRun, ProposalStatus, RunArtifacts, StorageV2,
    ThroughputSnapshot,
};
use nexus_metacognition::SelfDebugger;

use crate::proposals::ProposalEngineV2;

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name).map_or(default, |raw| {
        matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on")
    })
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Real-apply knobs, ENV-backed.
#[derive(Debug, Clone, Copy)]
pub struct ExperimentConfig {
    /// Whether normal-mode runs may apply real patches.
    pub enable_real_apply: bool,
    /// Patch budget per real-apply cycle.
    pub max_real_apply_patches: u32,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            enable_real_apply: false,
            max_real_apply_patches: 1,
        }
    }
}

impl ExperimentConfig {
    /// Reads configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enable_real_apply: env_bool("ENABLE_EXECUTOR_REAL_APPLY", defaults.enable_real_apply),
            max_real_apply_patches: env_u32(
                "EXECUTOR_REAL_APPLY_MAX_PATCHES",
                defaults.max_real_apply_patches,
            )
            .max(1),
        }
    }
}

/// Result of one self-improvement cycle run by the hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementCycle {
    /// Patches attempted.
    pub patches_applied: u32,
    /// Patches that passed their checks.
    pub patches_successful: u32,
    /// Estimated cost of the cycle.
    pub estimated_cost_usd: f64,
    /// Arbitrary cycle detail.
    #[serde(default)]
    pub detail: Value,
}

/// Hook invoked for real (normal-mode) applies. The orchestrator wires the
/// production implementation; safe mode never calls it.
pub trait ImprovementHook: Send + Sync {
    /// Runs one self-improvement cycle with the given patch budget.
    fn run_cycle(&self, max_patches: u32) -> anyhow::Result<ImprovementCycle>;
}

/// Why a proposal could not be executed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecuteError {
    /// No actionable proposal with that id.
    #[error("proposal_not_found: {0}")]
    ProposalNotFound(String),
    /// The proposal is still awaiting approval.
    #[error("proposal_requires_approval: {0}")]
    RequiresApproval(String),
    /// The proposal is in a state that cannot be executed.
    #[error("proposal_not_actionable: {0}")]
    NotActionable(String),
}

/// Outcome of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Whether execution succeeded.
    pub ok: bool,
    /// Created run id.
    pub run_id: String,
    /// Executed proposal id.
    pub proposal_id: String,
    /// Mode the run used.
    pub mode: ExecutionProfile,
    /// Terminal execution status.
    pub status: ExecutionStatus,
}

/// Applies approved proposals in safe (simulated) or normal (real) mode,
/// snapshotting baseline health before any mutation.
pub struct ExperimentExecutor {
    storage: Arc<StorageV2>,
    proposals: Arc<ProposalEngineV2>,
    debugger: Arc<SelfDebugger>,
    hook: Option<Arc<dyn ImprovementHook>>,
    config: ExperimentConfig,
}

impl std::fmt::Debug for ExperimentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExperimentExecutor {
    /// Creates the executor.
    #[must_use]
    pub fn new(
        storage: Arc<StorageV2>,
        proposals: Arc<ProposalEngineV2>,
        debugger: Arc<SelfDebugger>,
        config: ExperimentConfig,
    ) -> Self {
        Self {
            storage,
            proposals,
            debugger,
            hook: None,
            config,
        }
    }

    /// Wires the real-apply hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn ImprovementHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Whether real applies are enabled.
    #[must_use]
    pub const fn real_apply_enabled(&self) -> bool {
        self.config.enable_real_apply
    }

    fn throughput_snapshot(&self) -> ThroughputSnapshot {
        let proposals = self.storage.proposals().proposals;
        ThroughputSnapshot {
            executed_or_verified: proposals
                .iter()
                .filter(|p| matches!(p.status, ProposalStatus::Executed | ProposalStatus::Verified))
                .count() as i64,
            verified: proposals
                .iter()
                .filter(|p| p.status == ProposalStatus::Verified)
                .count() as i64,
        }
    }

    /// Executes an approved proposal.
    ///
    /// Still-pending proposals return [`ExecuteError::RequiresApproval`];
    /// executed/verified/rejected ones are not actionable. The proposal is
    /// promoted to `executed` only when the run succeeds.
    pub fn execute_proposal(
        &self,
        proposal_id: &str,
        mode: ExecutionProfile,
    ) -> Result<ExecutionOutcome, ExecuteError> {
        let proposal = self
            .proposals
            .get(proposal_id)
            .ok_or_else(|| ExecuteError::ProposalNotFound(proposal_id.to_string()))?;
        match proposal.status {
            ProposalStatus::Approved => {}
            ProposalStatus::PendingApproval => {
                return Err(ExecuteError::RequiresApproval(proposal_id.to_string()))
            }
            _ => return Err(ExecuteError::NotActionable(proposal_id.to_string())),
        }

        let started_at = Utc::now();
        let run_id = format!("run_{}", started_at.format("%Y%m%d_%H%M%S_%f"));
        let baseline = self.debugger.health_report();

        let mut artifacts = RunArtifacts {
            baseline_health: serde_json::to_value(&baseline).unwrap_or(Value::Null),
            baseline_stats: serde_json::to_value(baseline.recent_stats).unwrap_or(Value::Null),
            throughput_before: self.throughput_snapshot(),
            dry_run: mode == ExecutionProfile::Safe,
            ..RunArtifacts::default()
        };

        let run = ExperimentRun {
            id: run_id.clone(),
            proposal_id: proposal_id.to_string(),
            mode,
            started_at,
            finished_at: None,
            actions: vec![
                "collect_baseline".into(),
                "apply_change".into(),
                "verify_checks".into(),
            ],
            artifacts: artifacts.clone(),
            execution_status: ExecutionStatus::Running,
            verification: None,
        };
        let _ = self.storage.add_experiment_run(run);

        let status = if mode == ExecutionProfile::Normal && self.config.enable_real_apply {
            if let Some(hook) = &self.hook {
                match hook.run_cycle(self.config.max_real_apply_patches.max(1)) {
                    Ok(cycle) => {
                        artifacts.patches_applied = cycle.patches_applied;
                        artifacts.patches_successful = cycle.patches_successful;
                        artifacts.estimated_cost_usd = cycle.estimated_cost_usd;
                        artifacts.result = "real_apply_cycle_executed".into();
                        if cycle.patches_applied > 0 {
                            ExecutionStatus::Completed
                        } else {
                            ExecutionStatus::NoChanges
                        }
                    }
                    Err(err) => {
                        artifacts.result = "real_apply_failed".into();
                        artifacts.error = Some(err.to_string());
                        artifacts.estimated_cost_usd = 0.0;
                        ExecutionStatus::Failed
                    }
                }
            } else {
                artifacts.result = "controlled_apply_success".into();
                artifacts.reason = Some("real_apply_hook_unavailable".into());
                artifacts.estimated_cost_usd = 0.01;
                ExecutionStatus::Completed
            }
        } else {
            artifacts.result = if mode == ExecutionProfile::Safe {
                "simulated_apply_success".into()
            } else {
                "controlled_apply_success".into()
            };
            artifacts.reason = Some("real_apply_disabled_or_unavailable".into());
            artifacts.estimated_cost_usd = if mode == ExecutionProfile::Safe { 0.0 } else { 0.01 };
            ExecutionStatus::Completed
        };

        let finished_at = Utc::now();
        artifacts.duration_ms = (finished_at - started_at).num_milliseconds().max(0);
        artifacts.execution_success = status.is_success();

        let artifacts_final = artifacts.clone();
        let _ = self.storage.update_experiment_run(&run_id, |run| {
            run.execution_status = status;
            run.finished_at = Some(finished_at);
            run.artifacts = artifacts_final;
        });

        if status.is_success() {
            let mut annotations = IndexMap::new();
            annotations.insert("executed_at".to_string(), json!(finished_at));
            annotations.insert("last_run_id".to_string(), json!(run_id));
            annotations.insert("execution_mode".to_string(), json!(mode));
            self.proposals
                .mark_status(proposal_id, ProposalStatus::Executed, annotations);
        }

        Ok(ExecutionOutcome {
            ok: status.is_success(),
            run_id,
            proposal_id: proposal_id.to_string(),
            mode,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cafe::{CafeConfig, CafeScorer};
    use crate::proposals::ProposalConfig;
    use nexus_memory::{LearningEvent, NexusPaths};
    use nexus_metacognition::DebuggerConfig;
    use tempfile::tempdir;

    struct Harness {
        storage: Arc<StorageV2>,
        proposals: Arc<ProposalEngineV2>,
        executor: ExperimentExecutor,
    }

    fn harness(dir: &std::path::Path, config: ExperimentConfig) -> Harness {
        let paths = NexusPaths::new(dir);
        let storage = Arc::new(StorageV2::open(&paths).unwrap());
        let scorer = Arc::new(CafeScorer::new(CafeConfig::default()));
        let proposals = Arc::new(ProposalEngineV2::new(
            Arc::clone(&storage),
            scorer,
            ProposalConfig {
                enable_cafe: false,
                auto_approve_threshold: 0.7,
                ..ProposalConfig::default()
            },
        ));
        let debugger = Arc::new(SelfDebugger::new(
            paths.decision_log_file(),
            paths.issues_file(),
            paths.metrics_file(),
            DebuggerConfig::default(),
        ));
        let executor = ExperimentExecutor::new(
            Arc::clone(&storage),
            Arc::clone(&proposals),
            debugger,
            config,
        );
        Harness {
            storage,
            proposals,
            executor,
        }
    }

    fn approved_proposal(harness: &Harness) -> String {
        let mut event = LearningEvent::new("scan", "scan_insight", "optimise pipeline");
        event.id = "evt_1".into();
        event.value = 0.9;
        event.novelty = 0.9;
        event.risk = 0.1;
        event.confidence = 0.9;
        let created = harness.proposals.generate_from_events(&[event], 5, false);
        created[0].id.clone()
    }

    #[test]
    fn safe_mode_simulates_and_promotes_to_executed() {
        let dir = tempdir().unwrap();
        let harness = harness(dir.path(), ExperimentConfig::default());
        let id = approved_proposal(&harness);
        let outcome = harness
            .executor
            .execute_proposal(&id, ExecutionProfile::Safe)
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.status, ExecutionStatus::Completed);

        let run = harness.storage.find_run(&outcome.run_id).unwrap();
        assert!(run.artifacts.dry_run);
        assert_eq!(run.artifacts.result, "simulated_apply_success");
        assert!((run.artifacts.estimated_cost_usd - 0.0).abs() < f64::EPSILON);
        assert!(run.artifacts.execution_success);
        assert!(run.finished_at.is_some());

        let proposal = harness.proposals.get(&id).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Executed);
    }

    #[test]
    fn pending_proposal_requires_approval() {
        let dir = tempdir().unwrap();
        let harness = harness(dir.path(), ExperimentConfig::default());
        let mut event = LearningEvent::new("scan", "scan_insight", "middling idea");
        event.id = "evt_2".into();
        event.value = 0.7;
        event.novelty = 0.6;
        event.risk = 0.2;
        event.confidence = 0.6;
        let created = harness.proposals.generate_from_events(&[event], 5, false);
        assert_eq!(created[0].status, ProposalStatus::PendingApproval);
        let err = harness
            .executor
            .execute_proposal(&created[0].id, ExecutionProfile::Safe)
            .unwrap_err();
        assert!(matches!(err, ExecuteError::RequiresApproval(_)));
    }

    #[test]
    fn real_apply_hook_drives_status() {
        struct NoopHook;
        impl ImprovementHook for NoopHook {
            fn run_cycle(&self, _max_patches: u32) -> anyhow::Result<ImprovementCycle> {
                Ok(ImprovementCycle {
                    patches_applied: 0,
                    patches_successful: 0,
                    estimated_cost_usd: 0.0,
                    detail: Value::Null,
                })
            }
        }

        let dir = tempdir().unwrap();
        let harness = harness(
            dir.path(),
            ExperimentConfig {
                enable_real_apply: true,
                max_real_apply_patches: 1,
            },
        );
        let id = approved_proposal(&harness);
        let executor = harness.executor.with_hook(Arc::new(NoopHook));
        let outcome = executor.execute_proposal(&id, ExecutionProfile::Normal).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::NoChanges);
        assert!(outcome.ok);
        let run = harness.storage.find_run(&outcome.run_id).unwrap();
        assert_eq!(run.artifacts.result, "real_apply_cycle_executed");
    }

    #[test]
    fn unknown_proposal_is_reported() {
        let dir = tempdir().unwrap();
        let harness = harness(dir.path(), ExperimentConfig::default());
        let err = harness
            .executor
            .execute_proposal("pv2_missing", ExecutionProfile::Safe)
            .unwrap_err();
        assert!(matches!(err, ExecuteError::ProposalNotFound(_)));
    }
}
