use std::{env, sync::Arc};

use chrono::{Duration, Utc};
use indexmap::IndexMap;
use serde_json::{json, Value};
use thiserror::Error;

use nexus_memory::{
    ExecutionSummary, ExperimentRun, MetricsDelta, OutcomeEvidence, ProposalStatus, RunVerification,
    StorageV2, ThroughputSnapshot, Verdict, VerdictSignals,
};
use nexus_metacognition::{HealthReport, HealthStatus, SelfDebugger};

use crate::cafe::CafeScorer;
use crate::proposals::ProposalEngineV2;

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name).map_or(default, |raw| {
        matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on")
    })
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Holdout knobs, ENV-backed (`VERIFICATION_HOLDOUT_*`).
#[derive(Debug, Clone, Copy)]
pub struct VerifierConfig {
    /// Whether verdicts are deferred for a holdout window after execution.
    pub holdout_enabled: bool,
    /// Holdout window length (floor 30 s).
    pub holdout_seconds: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            holdout_enabled: true,
            holdout_seconds: 180,
        }
    }
}

impl VerifierConfig {
    /// Reads configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            holdout_enabled: env_bool("VERIFICATION_HOLDOUT_ENABLED", defaults.holdout_enabled),
            holdout_seconds: env_u64("VERIFICATION_HOLDOUT_SECONDS", defaults.holdout_seconds),
        }
    }
}

/// Verification failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// No run with that id.
    #[error("run_not_found: {0}")]
    RunNotFound(String),
}

/// Result of one verification attempt.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    /// Recorded evidence id.
    pub evidence_id: String,
    /// The evidence itself.
    pub evidence: OutcomeEvidence,
    /// Whether another attempt is scheduled.
    pub pending_recheck: bool,
}

/// Compares before/after health metrics for an executed run and emits a
/// verdict with evidence.
pub struct OutcomeVerifier {
    storage: Arc<StorageV2>,
    proposals: Arc<ProposalEngineV2>,
    debugger: Arc<SelfDebugger>,
    scorer: Arc<CafeScorer>,
    config: VerifierConfig,
}

impl std::fmt::Debug for OutcomeVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeVerifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OutcomeVerifier {
    /// Creates the verifier.
    #[must_use]
    pub fn new(
        storage: Arc<StorageV2>,
        proposals: Arc<ProposalEngineV2>,
        debugger: Arc<SelfDebugger>,
        scorer: Arc<CafeScorer>,
        config: VerifierConfig,
    ) -> Self {
        Self {
            storage,
            proposals,
            debugger,
            scorer,
            config,
        }
    }

    /// Verifies one experiment run.
    ///
    /// Inside the holdout window a deferred (pending-recheck) evidence is
    /// recorded instead of a measured verdict. Outside it, metric deltas are
    /// scored into win/loss/inconclusive; weak inconclusive signals also
    /// defer, and only measured attempts promote the proposal to `verified`.
    pub fn verify_experiment(&self, run_id: &str) -> Result<VerifyOutcome, VerifyError> {
        let run = self
            .storage
            .find_run(run_id)
            .ok_or_else(|| VerifyError::RunNotFound(run_id.to_string()))?;
        let previous_attempts = run.verification.as_ref().map_or(0, |v| v.attempts);

        if self.config.holdout_enabled {
            if let Some(finished_at) = run.finished_at {
                let holdout = Duration::seconds(self.config.holdout_seconds.max(30) as i64);
                let holdout_until = finished_at + holdout;
                if Utc::now() < holdout_until {
                    return Ok(self.record_holdout(&run, previous_attempts, holdout_until));
                }
            }
        }

        let before: HealthReport = serde_json::from_value(run.artifacts.baseline_health.clone())
            .unwrap_or_else(|_| empty_report());
        let after = self.debugger.health_report();

        let mut delta = MetricsDelta {
            health_score: round4(after.health_score - before.health_score),
            open_issues: after.open_issues as i64 - before.open_issues as i64,
            total_errors: after.recent_stats.total_errors as i64
                - before.recent_stats.total_errors as i64,
            avg_duration_ms: round2(
                after.recent_stats.avg_duration_ms - before.recent_stats.avg_duration_ms,
            ),
            success_rate: round4(after.recent_stats.success_rate - before.recent_stats.success_rate),
            proposal_throughput: 0,
            verified_count: 0,
        };

        let mut positives = 0u32;
        let mut negatives = 0u32;
        let mut reasons: Vec<String> = Vec::new();
        let mut tally = |up: bool, reason: &str| {
            if up {
                positives += 1;
            } else {
                negatives += 1;
            }
            reasons.push(reason.to_string());
        };

        if delta.health_score >= 1.0 {
            tally(true, "health_score_improved");
        } else if delta.health_score <= -1.0 {
            tally(false, "health_score_declined");
        }
        if delta.open_issues <= -1 {
            tally(true, "open_issues_reduced");
        } else if delta.open_issues >= 1 {
            tally(false, "open_issues_increased");
        }
        if delta.total_errors <= -1 {
            tally(true, "errors_reduced");
        } else if delta.total_errors >= 1 {
            tally(false, "errors_increased");
        }
        if delta.avg_duration_ms <= -100.0 {
            tally(true, "latency_improved");
        } else if delta.avg_duration_ms >= 200.0 {
            tally(false, "latency_regressed");
        }
        if delta.success_rate >= 0.02 {
            tally(true, "success_rate_improved");
        } else if delta.success_rate <= -0.02 {
            tally(false, "success_rate_regressed");
        }

        let execution_success = run.artifacts.execution_success;
        let critical_loss = delta.health_score <= -2.0
            || delta.open_issues >= 1
            || delta.total_errors >= 2
            || !execution_success;

        let (mut verdict, mut confidence): (Verdict, f64) = if critical_loss {
            (Verdict::Loss, 0.85)
        } else if negatives >= 2 {
            (Verdict::Loss, 0.75)
        } else if positives >= 1 && negatives == 0 {
            (Verdict::Win, if positives == 1 { 0.66 } else { 0.8 })
        } else {
            (Verdict::Inconclusive, if positives > 0 { 0.55 } else { 0.5 })
        };

        let after_throughput = self.throughput_now();
        delta.proposal_throughput =
            after_throughput.executed_or_verified - run.artifacts.throughput_before.executed_or_verified;
        delta.verified_count = after_throughput.verified - run.artifacts.throughput_before.verified;

        // Throughput gain without health regression rescues a flat verdict,
        // unless the execution itself was only simulated.
        let simulated = matches!(
            run.artifacts.result.as_str(),
            "simulated_apply_success" | "controlled_apply_success"
        );
        if verdict == Verdict::Inconclusive
            && delta.proposal_throughput > 0
            && !simulated
            && delta.health_score >= 0.0
            && delta.open_issues <= 0
        {
            verdict = Verdict::Win;
            confidence = confidence.max(0.62);
            positives += 1;
            reasons.push("throughput_improved_without_regression".to_string());
        }

        let weak_signal = delta.health_score.abs() < 0.5
            && delta.open_issues == 0
            && delta.total_errors == 0
            && delta.avg_duration_ms.abs() < 50.0
            && delta.success_rate.abs() < 0.01;
        let pending_recheck = verdict == Verdict::Inconclusive && confidence < 0.58 && weak_signal;

        let mut evidence = OutcomeEvidence {
            id: String::new(),
            experiment_id: run_id.to_string(),
            ts: Utc::now(),
            metrics_before: run.artifacts.baseline_health.clone(),
            metrics_after: serde_json::to_value(&after).unwrap_or(Value::Null),
            delta,
            verdict,
            confidence,
            signals: VerdictSignals {
                positives,
                negatives,
                reasons,
                execution_success,
                execution_status: run.artifacts.result.clone(),
                run_duration_ms: run.artifacts.duration_ms,
            },
            notes: "Automated outcome verification".into(),
            throughput_before: run.artifacts.throughput_before,
            throughput_after: after_throughput,
            execution: execution_summary(&run),
            pending_recheck,
            attempt: previous_attempts + 1,
            holdout_pending: None,
            next_recheck_after: None,
            model: self.proposal_model(&run.proposal_id),
            cafe: None,
        };
        evidence.cafe = Some(json!(self.scorer.score_evidence(&evidence)));
        let evidence_id = self
            .storage
            .record_outcome_evidence(evidence.clone())
            .unwrap_or_default();
        evidence.id.clone_from(&evidence_id);

        let verification = RunVerification {
            evidence_id: evidence_id.clone(),
            verdict,
            confidence,
            pending_recheck,
            attempts: previous_attempts + 1,
            verified_at: Utc::now(),
            holdout_pending: None,
            next_recheck_after: None,
            retry_exhausted: None,
            finalized_reason: None,
        };
        let _ = self.storage.update_experiment_run(run_id, |run| {
            run.verification = Some(verification.clone());
        });

        let mut annotations = IndexMap::new();
        annotations.insert("verdict".to_string(), json!(verdict));
        annotations.insert("verdict_confidence".to_string(), json!(confidence));
        annotations.insert("evidence_id".to_string(), json!(evidence_id));
        annotations.insert(
            "verification_last_attempt_at".to_string(),
            json!(Utc::now()),
        );
        if pending_recheck {
            annotations.insert("verification_pending".to_string(), json!(true));
            self.proposals
                .mark_status(&run.proposal_id, ProposalStatus::Executed, annotations);
        } else {
            annotations.insert("verification_pending".to_string(), json!(false));
            annotations.insert("verified_at".to_string(), json!(Utc::now()));
            self.proposals
                .mark_status(&run.proposal_id, ProposalStatus::Verified, annotations);
        }

        Ok(VerifyOutcome {
            evidence_id,
            evidence,
            pending_recheck,
        })
    }

    fn record_holdout(
        &self,
        run: &ExperimentRun,
        previous_attempts: u32,
        holdout_until: chrono::DateTime<Utc>,
    ) -> VerifyOutcome {
        let mut evidence = OutcomeEvidence {
            id: String::new(),
            experiment_id: run.id.clone(),
            ts: Utc::now(),
            metrics_before: run.artifacts.baseline_health.clone(),
            metrics_after: Value::Null,
            delta: MetricsDelta::default(),
            verdict: Verdict::Inconclusive,
            confidence: 0.45,
            signals: VerdictSignals {
                positives: 0,
                negatives: 0,
                reasons: vec!["holdout_window".to_string()],
                execution_success: run.artifacts.execution_success,
                execution_status: run.artifacts.result.clone(),
                run_duration_ms: run.artifacts.duration_ms,
            },
            notes: "Holdout window active; deferred verification".into(),
            throughput_before: ThroughputSnapshot::default(),
            throughput_after: ThroughputSnapshot::default(),
            execution: execution_summary(run),
            pending_recheck: true,
            attempt: previous_attempts + 1,
            holdout_pending: Some(true),
            next_recheck_after: Some(holdout_until),
            model: self.proposal_model(&run.proposal_id),
            cafe: None,
        };
        evidence.cafe = Some(json!(self.scorer.score_evidence(&evidence)));
        let evidence_id = self
            .storage
            .record_outcome_evidence(evidence.clone())
            .unwrap_or_default();
        evidence.id.clone_from(&evidence_id);

        let verification = RunVerification {
            evidence_id: evidence_id.clone(),
            verdict: Verdict::Inconclusive,
            confidence: 0.45,
            pending_recheck: true,
            attempts: previous_attempts + 1,
            verified_at: Utc::now(),
            holdout_pending: Some(true),
            next_recheck_after: Some(holdout_until),
            retry_exhausted: None,
            finalized_reason: None,
        };
        let _ = self.storage.update_experiment_run(&run.id, |run| {
            run.verification = Some(verification.clone());
        });

        let mut annotations = IndexMap::new();
        annotations.insert("verification_pending".to_string(), json!(true));
        annotations.insert("verdict".to_string(), json!(Verdict::Inconclusive));
        annotations.insert("verdict_confidence".to_string(), json!(0.45));
        annotations.insert("evidence_id".to_string(), json!(evidence_id));
        self.proposals
            .mark_status(&run.proposal_id, ProposalStatus::Executed, annotations);

        VerifyOutcome {
            evidence_id,
            evidence,
            pending_recheck: true,
        }
    }

    fn throughput_now(&self) -> ThroughputSnapshot {
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

    fn proposal_model(&self, proposal_id: &str) -> Option<String> {
        self.proposals
            .get(proposal_id)?
            .metadata
            .get("model")?
            .as_str()
            .map(String::from)
    }
}

fn execution_summary(run: &ExperimentRun) -> ExecutionSummary {
    ExecutionSummary {
        status: format!("{:?}", run.execution_status).to_lowercase(),
        duration_ms: run.artifacts.duration_ms,
        estimated_cost_usd: run.artifacts.estimated_cost_usd,
        result: run.artifacts.result.clone(),
    }
}

fn empty_report() -> HealthReport {
    HealthReport {
        health_score: 0.0,
        status: HealthStatus::Critical,
        open_issues: 0,
        critical_issues: 0,
        recent_stats: nexus_metacognition::SessionStats::default(),
        top_issues: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cafe::{CafeConfig, CafeScorer};
    use crate::experiment::{ExperimentConfig, ExperimentExecutor};
    use crate::proposals::{ProposalConfig, ProposalEngineV2};
    use nexus_memory::{ExecutionProfile, LearningEvent, NexusPaths};
    use nexus_metacognition::{DebuggerConfig, IssueKind, Severity};
    use tempfile::tempdir;

    struct Harness {
        storage: Arc<StorageV2>,
        proposals: Arc<ProposalEngineV2>,
        debugger: Arc<SelfDebugger>,
        executor: ExperimentExecutor,
    }

    fn harness(dir: &std::path::Path) -> Harness {
        let paths = NexusPaths::new(dir);
        let storage = Arc::new(StorageV2::open(&paths).unwrap());
        let scorer = Arc::new(CafeScorer::new(CafeConfig::default()));
        let proposals = Arc::new(ProposalEngineV2::new(
            Arc::clone(&storage),
            Arc::clone(&scorer),
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
            Arc::clone(&debugger),
            ExperimentConfig::default(),
        );
        Harness {
            storage,
            proposals,
            debugger,
            executor,
        }
    }

    fn verifier(harness: &Harness, config: VerifierConfig) -> OutcomeVerifier {
        OutcomeVerifier::new(
            Arc::clone(&harness.storage),
            Arc::clone(&harness.proposals),
            Arc::clone(&harness.debugger),
            Arc::new(CafeScorer::new(CafeConfig::default())),
            config,
        )
    }

    fn executed_run(harness: &Harness) -> (String, String) {
        let mut event = LearningEvent::new("scan", "scan_insight", "optimise pipeline");
        event.id = "evt_1".into();
        event.value = 0.9;
        event.novelty = 0.9;
        event.risk = 0.1;
        event.confidence = 0.9;
        let created = harness.proposals.generate_from_events(&[event], 5, false);
        let id = created[0].id.clone();
        let outcome = harness
            .executor
            .execute_proposal(&id, ExecutionProfile::Safe)
            .unwrap();
        (id, outcome.run_id)
    }

    #[test]
    fn holdout_window_defers_the_verdict() {
        let dir = tempdir().unwrap();
        let harness = harness(dir.path());
        let (proposal_id, run_id) = executed_run(&harness);
        let verifier = verifier(
            &harness,
            VerifierConfig {
                holdout_enabled: true,
                holdout_seconds: 3600,
            },
        );
        let outcome = verifier.verify_experiment(&run_id).unwrap();
        assert!(outcome.pending_recheck);
        assert_eq!(outcome.evidence.verdict, Verdict::Inconclusive);
        assert_eq!(outcome.evidence.holdout_pending, Some(true));
        assert!(outcome.evidence.next_recheck_after.is_some());
        assert!(outcome
            .evidence
            .signals
            .reasons
            .contains(&"holdout_window".to_string()));
        // The proposal stays executed, never verified.
        let proposal = harness.proposals.get(&proposal_id).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Executed);
    }

    #[test]
    fn flat_safe_run_is_inconclusive_with_pending_recheck() {
        let dir = tempdir().unwrap();
        let harness = harness(dir.path());
        let (proposal_id, run_id) = executed_run(&harness);
        let verifier = verifier(
            &harness,
            VerifierConfig {
                holdout_enabled: false,
                holdout_seconds: 0,
            },
        );
        let outcome = verifier.verify_experiment(&run_id).unwrap();
        assert_eq!(outcome.evidence.verdict, Verdict::Inconclusive);
        assert!(outcome.evidence.confidence < 0.58);
        assert!(outcome.pending_recheck);
        // Simulated success never rescues via throughput.
        assert!(!outcome
            .evidence
            .signals
            .reasons
            .contains(&"throughput_improved_without_regression".to_string()));
        let proposal = harness.proposals.get(&proposal_id).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Executed);
    }

    #[test]
    fn health_collapse_is_a_critical_loss() {
        let dir = tempdir().unwrap();
        let harness = harness(dir.path());
        let (proposal_id, run_id) = executed_run(&harness);
        // Degrade health after the baseline snapshot.
        for i in 0..3 {
            harness.debugger.create_issue(
                IssueKind::Error,
                Severity::Critical,
                &format!("incident {i}"),
                "post-run regression",
                None,
            );
        }
        let verifier = verifier(
            &harness,
            VerifierConfig {
                holdout_enabled: false,
                holdout_seconds: 0,
            },
        );
        let outcome = verifier.verify_experiment(&run_id).unwrap();
        assert_eq!(outcome.evidence.verdict, Verdict::Loss);
        assert!((outcome.evidence.confidence - 0.85).abs() < f64::EPSILON);
        assert!(!outcome.pending_recheck);
        // Loss finalises verification; proposal is promoted to verified.
        let proposal = harness.proposals.get(&proposal_id).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Verified);
        // P5: loss implies at least one critical signal.
        assert!(outcome.evidence.delta.open_issues >= 1);
    }

    #[test]
    fn issue_resolution_scores_a_win() {
        let dir = tempdir().unwrap();
        let harness = harness(dir.path());
        // Open issues before the baseline, resolve them after execution.
        let issue = harness.debugger.create_issue(
            IssueKind::Performance,
            Severity::High,
            "slow path",
            "latency",
            None,
        );
        let (proposal_id, run_id) = executed_run(&harness);
        harness.debugger.resolve_issue(&issue.id, Some("tuned"));
        let verifier = verifier(
            &harness,
            VerifierConfig {
                holdout_enabled: false,
                holdout_seconds: 0,
            },
        );
        let outcome = verifier.verify_experiment(&run_id).unwrap();
        assert_eq!(outcome.evidence.verdict, Verdict::Win);
        assert!(outcome.evidence.delta.health_score >= 0.0);
        assert!(outcome.evidence.confidence >= 0.66);
        let proposal = harness.proposals.get(&proposal_id).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Verified);
    }

    #[test]
    fn unknown_run_is_an_error() {
        let dir = tempdir().unwrap();
        let harness = harness(dir.path());
        let verifier = verifier(&harness, VerifierConfig::default());
        assert_eq!(
            verifier.verify_experiment("run_missing").unwrap_err(),
            VerifyError::RunNotFound("run_missing".into())
        );
    }
}
