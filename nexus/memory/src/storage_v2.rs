use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::store::{append_jsonl, tail_jsonl, MemoryError};

/// Experiment runs retained on disk.
const RUNS_CAP: usize = 3000;
/// Proposals retained on disk.
const PROPOSALS_CAP: usize = 5000;

/// Source stream classification of a learning event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStream {
    /// Produced by the live system.
    Production,
    /// Produced by tests, demos, or manual pokes.
    NonProduction,
}

/// A scored observation eligible for proposal generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    /// Event identifier (`evt_...`).
    pub id: String,
    /// Recording timestamp.
    pub ts: DateTime<Utc>,
    /// Originating source name.
    pub source: String,
    /// Event kind (e.g. `scan_insight`).
    pub event_type: String,
    /// Observation body.
    pub content: String,
    /// Optional display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Optional hypothesis for the derived proposal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<String>,
    /// Optional expected impact summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_impact: Option<String>,
    /// Novelty in `[0, 1]`.
    #[serde(default)]
    pub novelty: f64,
    /// Value in `[0, 1]`.
    #[serde(default)]
    pub value: f64,
    /// Risk in `[0, 1]`.
    #[serde(default)]
    pub risk: f64,
    /// Confidence in `[0, 1]`.
    #[serde(default)]
    pub confidence: f64,
    /// Arbitrary structured context.
    #[serde(default)]
    pub context: Value,
    /// Model that produced the observation, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Stream classification, derived from the source when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<EventStream>,
    /// CAFE score attached at recording time, for observability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cafe: Option<Value>,
}

impl LearningEvent {
    /// Creates an event with clamped scores and a generated id.
    #[must_use]
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, content: impl Into<String>) -> Self {
        let ts = Utc::now();
        Self {
            id: format!("evt_{}", ts.format("%Y%m%d_%H%M%S_%f")),
            ts,
            source: source.into(),
            event_type: event_type.into(),
            content: content.into(),
            title: None,
            hypothesis: None,
            expected_impact: None,
            novelty: 0.0,
            value: 0.0,
            risk: 0.0,
            confidence: 0.0,
            context: Value::Null,
            model: None,
            stream: None,
            cafe: None,
        }
    }

    /// Stream of this event, deriving from the source when unset.
    #[must_use]
    pub fn resolved_stream(&self) -> EventStream {
        self.stream.unwrap_or_else(|| {
            if is_non_production_source(&self.source) {
                EventStream::NonProduction
            } else {
                EventStream::Production
            }
        })
    }
}

/// Whether a source name denotes a non-production stream.
#[must_use]
pub fn is_non_production_source(source: &str) -> bool {
    let src = source.trim().to_lowercase();
    if src.is_empty() {
        return false;
    }
    const EXACT: [&str; 7] = [
        "unit_test",
        "manual_test",
        "manual_check",
        "manual_boost",
        "demo",
        "debug",
        "local_debug",
    ];
    if EXACT.contains(&src.as_str()) {
        return true;
    }
    ["test_", "unit_", "manual_", "debug_", "demo_"]
        .iter()
        .any(|p| src.starts_with(p))
}

/// Risk classification of a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Risk below 0.45.
    Low,
    /// Risk in `[0.45, 0.75)`.
    Medium,
    /// Risk at or above 0.75.
    High,
}

impl RiskLevel {
    /// Classifies a clamped risk score.
    #[must_use]
    pub fn from_score(risk: f64) -> Self {
        if risk >= 0.75 {
            Self::High
        } else if risk >= 0.45 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Lifecycle status of a proposal. Transitions are strictly forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Awaiting approval.
    PendingApproval,
    /// Approved, not yet executed.
    Approved,
    /// Executed, awaiting verification.
    Executed,
    /// Verified with a final verdict.
    Verified,
    /// Rejected.
    Rejected,
}

impl ProposalStatus {
    /// Position in the forward-only transition order.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::PendingApproval => 0,
            Self::Approved => 1,
            Self::Executed => 2,
            Self::Verified | Self::Rejected => 3,
        }
    }

    /// Whether a transition from `self` to `next` respects the forward order.
    #[must_use]
    pub fn allows(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if matches!(self, Self::Verified | Self::Rejected) {
            return false;
        }
        next.rank() >= self.rank()
    }
}

/// A candidate improvement derived from learning events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalV2 {
    /// Proposal identifier (`pv2_...`).
    pub id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Approval timestamp, when approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    /// IDs of the learning events that produced this proposal.
    #[serde(default)]
    pub origin_event_ids: Vec<String>,
    /// Short title.
    pub title: String,
    /// Hypothesis the experiment tests.
    pub hypothesis: String,
    /// Ordered plan steps.
    #[serde(default)]
    pub plan_steps: Vec<String>,
    /// Expected impact summary.
    pub expected_impact: String,
    /// Risk classification.
    pub risk_level: RiskLevel,
    /// Lifecycle status.
    pub status: ProposalStatus,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Priority in `[0, 1]`.
    pub priority: f64,
    /// Dedup signature over the originating event.
    pub signature: String,
    /// Structured metadata and status annotations.
    #[serde(default)]
    pub metadata: IndexMap<String, Value>,
}

/// Persisted proposal store shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalsFile {
    /// All proposals, oldest first, capped.
    #[serde(default)]
    pub proposals: Vec<ProposalV2>,
    /// IDs still awaiting approval.
    #[serde(default)]
    pub pending: Vec<String>,
    /// Last write timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Execution mode of an experiment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionProfile {
    /// Simulated, non-destructive.
    Safe,
    /// Real patches applied.
    Normal,
}

/// Terminal execution status of an experiment run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Still executing.
    Running,
    /// Completed with changes.
    Completed,
    /// Completed without applying any change.
    NoChanges,
    /// Execution failed.
    Failed,
}

impl ExecutionStatus {
    /// Whether the run counts as an execution success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::NoChanges)
    }
}

/// Proposal throughput counters at a point in time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ThroughputSnapshot {
    /// Proposals in status executed or verified.
    #[serde(default)]
    pub executed_or_verified: i64,
    /// Proposals in status verified.
    #[serde(default)]
    pub verified: i64,
}

/// Artifacts captured around one experiment run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunArtifacts {
    /// Health report snapshot taken before mutation.
    #[serde(default)]
    pub baseline_health: Value,
    /// Recent-session stats from the baseline snapshot.
    #[serde(default)]
    pub baseline_stats: Value,
    /// Throughput counters before execution.
    #[serde(default)]
    pub throughput_before: ThroughputSnapshot,
    /// Whether this was a dry (safe-mode) run.
    #[serde(default)]
    pub dry_run: bool,
    /// Result marker (e.g. `simulated_apply_success`).
    #[serde(default)]
    pub result: String,
    /// Reason detail for the result, when meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Error detail on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Estimated cost of the run.
    #[serde(default)]
    pub estimated_cost_usd: f64,
    /// Wall-clock duration of the run.
    #[serde(default)]
    pub duration_ms: i64,
    /// Whether execution succeeded.
    #[serde(default)]
    pub execution_success: bool,
    /// Patches applied in normal mode.
    #[serde(default)]
    pub patches_applied: u32,
    /// Patches that passed their checks in normal mode.
    #[serde(default)]
    pub patches_successful: u32,
}

/// Verification summary attached to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunVerification {
    /// Evidence record id.
    pub evidence_id: String,
    /// Verdict of the latest attempt.
    pub verdict: Verdict,
    /// Confidence of the latest attempt.
    pub confidence: f64,
    /// Whether another verification attempt is scheduled.
    pub pending_recheck: bool,
    /// Attempts made so far.
    pub attempts: u32,
    /// Timestamp of the latest attempt.
    pub verified_at: DateTime<Utc>,
    /// Whether the holdout window deferred this attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holdout_pending: Option<bool>,
    /// Earliest time for the next attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_recheck_after: Option<DateTime<Utc>>,
    /// Set when retries were exhausted and the verdict finalised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_exhausted: Option<bool>,
    /// Reason the verification was finalised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_reason: Option<String>,
}

/// One invocation of the experiment executor on an approved proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRun {
    /// Run identifier (`run_...`).
    pub id: String,
    /// Proposal being exercised.
    pub proposal_id: String,
    /// Execution mode.
    pub mode: ExecutionProfile,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// Finish timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Ordered action names.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Captured artifacts.
    #[serde(default)]
    pub artifacts: RunArtifacts,
    /// Execution status.
    pub execution_status: ExecutionStatus,
    /// Verification summary, once attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<RunVerification>,
}

/// Persisted experiment run store shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunsFile {
    /// Runs, oldest first, capped.
    #[serde(default)]
    pub runs: Vec<ExperimentRun>,
    /// Last write timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Outcome of a verification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Measurable improvement.
    Win,
    /// Measurable regression.
    Loss,
    /// No clear signal.
    Inconclusive,
}

/// Before/after metric deltas.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricsDelta {
    /// Health score change.
    #[serde(default)]
    pub health_score: f64,
    /// Open-issue count change.
    #[serde(default)]
    pub open_issues: i64,
    /// Total error count change.
    #[serde(default)]
    pub total_errors: i64,
    /// Average action latency change.
    #[serde(default)]
    pub avg_duration_ms: f64,
    /// Success-rate change.
    #[serde(default)]
    pub success_rate: f64,
    /// Proposal throughput change (executed-or-verified).
    #[serde(default)]
    pub proposal_throughput: i64,
    /// Verified-proposal count change.
    #[serde(default)]
    pub verified_count: i64,
}

/// Scored verdict signals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerdictSignals {
    /// Count of positive signals.
    #[serde(default)]
    pub positives: u32,
    /// Count of negative signals.
    #[serde(default)]
    pub negatives: u32,
    /// Signal reason tokens.
    #[serde(default)]
    pub reasons: Vec<String>,
    /// Whether execution itself succeeded.
    #[serde(default)]
    pub execution_success: bool,
    /// Execution result marker.
    #[serde(default)]
    pub execution_status: String,
    /// Execution duration.
    #[serde(default)]
    pub run_duration_ms: i64,
}

/// Execution summary carried on evidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Execution status label.
    #[serde(default)]
    pub status: String,
    /// Duration of the run.
    #[serde(default)]
    pub duration_ms: i64,
    /// Estimated cost.
    #[serde(default)]
    pub estimated_cost_usd: f64,
    /// Result marker.
    #[serde(default)]
    pub result: String,
}

/// A verifier's post-run record comparing before/after metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvidence {
    /// Evidence identifier (`evd_...`).
    pub id: String,
    /// Verified experiment run id.
    pub experiment_id: String,
    /// Recording timestamp.
    pub ts: DateTime<Utc>,
    /// Baseline metrics.
    #[serde(default)]
    pub metrics_before: Value,
    /// Post-run metrics.
    #[serde(default)]
    pub metrics_after: Value,
    /// Metric deltas.
    pub delta: MetricsDelta,
    /// Verdict.
    pub verdict: Verdict,
    /// Verdict confidence.
    pub confidence: f64,
    /// Scored signals.
    #[serde(default)]
    pub signals: VerdictSignals,
    /// Free-form note.
    #[serde(default)]
    pub notes: String,
    /// Throughput before execution.
    #[serde(default)]
    pub throughput_before: ThroughputSnapshot,
    /// Throughput at verification time.
    #[serde(default)]
    pub throughput_after: ThroughputSnapshot,
    /// Execution summary.
    #[serde(default)]
    pub execution: ExecutionSummary,
    /// Whether a recheck is pending.
    #[serde(default)]
    pub pending_recheck: bool,
    /// Verification attempt number.
    #[serde(default)]
    pub attempt: u32,
    /// Whether the holdout window deferred this attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holdout_pending: Option<bool>,
    /// Earliest time for the next attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_recheck_after: Option<DateTime<Utc>>,
    /// Model associated with the originating proposal, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// CAFE score attached at recording time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cafe: Option<Value>,
}

/// Typed file storage for the self-learning v2 pipeline.
///
/// All JSON writes are atomic; readers return defaults on missing or
/// malformed files.
#[derive(Debug)]
pub struct StorageV2 {
    learning_events_path: PathBuf,
    proposals_path: PathBuf,
    runs_path: PathBuf,
    evidence_path: PathBuf,
    policy_state_path: PathBuf,
    lock: Mutex<()>,
}

impl StorageV2 {
    /// Opens the storage over the standard layout.
    pub fn open(paths: &crate::paths::NexusPaths) -> Result<Self, MemoryError> {
        fs::create_dir_all(paths.memory_dir())?;
        fs::create_dir_all(paths.experiments_dir())?;
        fs::create_dir_all(paths.state_dir())?;
        Ok(Self {
            learning_events_path: paths.learning_events_file(),
            proposals_path: paths.proposals_file(),
            runs_path: paths.runs_file(),
            evidence_path: paths.evidence_file(),
            policy_state_path: paths.policy_state_file(),
            lock: Mutex::new(()),
        })
    }

    /// Records a learning event, deriving stream and id when absent.
    pub fn record_learning_event(&self, mut event: LearningEvent) -> Result<String, MemoryError> {
        let _guard = self.lock.lock();
        if event.id.is_empty() {
            event.id = format!("evt_{}", Utc::now().format("%Y%m%d_%H%M%S_%f"));
        }
        event.stream = Some(event.resolved_stream());
        append_jsonl(&self.learning_events_path, &event)?;
        Ok(event.id)
    }

    /// Returns the last `limit` learning events.
    #[must_use]
    pub fn list_learning_events(&self, limit: usize) -> Vec<LearningEvent> {
        tail_jsonl(&self.learning_events_path, limit)
    }

    /// Loads the proposal store.
    #[must_use]
    pub fn proposals(&self) -> ProposalsFile {
        let _guard = self.lock.lock();
        load_json_or_default(&self.proposals_path)
    }

    /// Saves the proposal store, stamping `updated_at` and applying the cap.
    pub fn save_proposals(&self, mut data: ProposalsFile) -> Result<(), MemoryError> {
        let _guard = self.lock.lock();
        if data.proposals.len() > PROPOSALS_CAP {
            let excess = data.proposals.len() - PROPOSALS_CAP;
            data.proposals.drain(..excess);
        }
        data.updated_at = Some(Utc::now());
        save_json_atomic(&self.proposals_path, &data)
    }

    /// Appends an experiment run.
    pub fn add_experiment_run(&self, run: ExperimentRun) -> Result<(), MemoryError> {
        let _guard = self.lock.lock();
        let mut data: RunsFile = load_json_or_default(&self.runs_path);
        data.runs.push(run);
        if data.runs.len() > RUNS_CAP {
            let excess = data.runs.len() - RUNS_CAP;
            data.runs.drain(..excess);
        }
        data.updated_at = Some(Utc::now());
        save_json_atomic(&self.runs_path, &data)
    }

    /// Applies an in-place update to a run. Returns whether it was found.
    pub fn update_experiment_run(
        &self,
        run_id: &str,
        update: impl FnOnce(&mut ExperimentRun),
    ) -> Result<bool, MemoryError> {
        let _guard = self.lock.lock();
        let mut data: RunsFile = load_json_or_default(&self.runs_path);
        let Some(run) = data.runs.iter_mut().find(|run| run.id == run_id) else {
            return Ok(false);
        };
        update(run);
        data.updated_at = Some(Utc::now());
        save_json_atomic(&self.runs_path, &data)?;
        Ok(true)
    }

    /// Returns the last `limit` experiment runs.
    #[must_use]
    pub fn experiment_runs(&self, limit: usize) -> Vec<ExperimentRun> {
        let _guard = self.lock.lock();
        let data: RunsFile = load_json_or_default(&self.runs_path);
        let skip = data.runs.len().saturating_sub(limit.max(1));
        data.runs.into_iter().skip(skip).collect()
    }

    /// Finds one run by id.
    #[must_use]
    pub fn find_run(&self, run_id: &str) -> Option<ExperimentRun> {
        let _guard = self.lock.lock();
        let data: RunsFile = load_json_or_default(&self.runs_path);
        data.runs.into_iter().find(|run| run.id == run_id)
    }

    /// Records outcome evidence, generating an id when absent.
    pub fn record_outcome_evidence(&self, mut evidence: OutcomeEvidence) -> Result<String, MemoryError> {
        let _guard = self.lock.lock();
        if evidence.id.is_empty() {
            evidence.id = format!("evd_{}", Utc::now().format("%Y%m%d_%H%M%S_%f"));
        }
        append_jsonl(&self.evidence_path, &evidence)?;
        Ok(evidence.id)
    }

    /// Returns the last `limit` evidence records.
    #[must_use]
    pub fn list_outcome_evidence(&self, limit: usize) -> Vec<OutcomeEvidence> {
        tail_jsonl(&self.evidence_path, limit)
    }

    /// Loads typed state from the policy state file.
    #[must_use]
    pub fn policy_state<T: DeserializeOwned + Default>(&self) -> T {
        let _guard = self.lock.lock();
        load_json_or_default(&self.policy_state_path)
    }

    /// Saves typed state to the policy state file.
    pub fn save_policy_state<T: Serialize>(&self, state: &T) -> Result<(), MemoryError> {
        let _guard = self.lock.lock();
        save_json_atomic(&self.policy_state_path, state)
    }
}

/// Loads a JSON file, returning the default on absence or corruption.
#[must_use]
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

/// Writes JSON through a temp file and rename so readers never observe a
/// partial write.
pub fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp.{}", process::id()));
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::NexusPaths;
    use tempfile::tempdir;

    fn storage(root: &Path) -> StorageV2 {
        StorageV2::open(&NexusPaths::new(root)).unwrap()
    }

    fn sample_run(id: &str) -> ExperimentRun {
        ExperimentRun {
            id: id.into(),
            proposal_id: "pv2_test".into(),
            mode: ExecutionProfile::Safe,
            started_at: Utc::now(),
            finished_at: None,
            actions: vec!["collect_baseline".into()],
            artifacts: RunArtifacts::default(),
            execution_status: ExecutionStatus::Running,
            verification: None,
        }
    }

    #[test]
    fn records_and_lists_learning_events() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let mut event = LearningEvent::new("scan", "scan_insight", "optimise X");
        event.value = 0.9;
        let id = storage.record_learning_event(event).unwrap();
        assert!(id.starts_with("evt_"));
        let events = storage.list_learning_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].resolved_stream(), EventStream::Production);
    }

    #[test]
    fn derives_non_production_stream() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        storage
            .record_learning_event(LearningEvent::new("unit_test", "probe", "x"))
            .unwrap();
        let events = storage.list_learning_events(1);
        assert_eq!(events[0].stream, Some(EventStream::NonProduction));
    }

    #[test]
    fn run_update_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        storage.add_experiment_run(sample_run("run_1")).unwrap();
        let updated = storage
            .update_experiment_run("run_1", |run| {
                run.execution_status = ExecutionStatus::Completed;
                run.finished_at = Some(Utc::now());
            })
            .unwrap();
        assert!(updated);
        let run = storage.find_run("run_1").unwrap();
        assert_eq!(run.execution_status, ExecutionStatus::Completed);
        assert!(!storage.update_experiment_run("missing", |_| {}).unwrap());
    }

    #[test]
    fn proposal_status_transitions_are_forward_only() {
        use ProposalStatus::{Approved, Executed, PendingApproval, Rejected, Verified};
        assert!(PendingApproval.allows(Approved));
        assert!(Approved.allows(Executed));
        assert!(Executed.allows(Verified));
        assert!(Executed.allows(Rejected));
        assert!(Executed.allows(Executed));
        assert!(!Verified.allows(Executed));
        assert!(!Verified.allows(Rejected));
        assert!(!Approved.allows(PendingApproval));
        assert!(!Rejected.allows(Approved));
    }

    #[test]
    fn evidence_appends_preserve_prior_bytes() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        let evidence = OutcomeEvidence {
            id: String::new(),
            experiment_id: "run_1".into(),
            ts: Utc::now(),
            metrics_before: Value::Null,
            metrics_after: Value::Null,
            delta: MetricsDelta::default(),
            verdict: Verdict::Inconclusive,
            confidence: 0.5,
            signals: VerdictSignals::default(),
            notes: String::new(),
            throughput_before: ThroughputSnapshot::default(),
            throughput_after: ThroughputSnapshot::default(),
            execution: ExecutionSummary::default(),
            pending_recheck: false,
            attempt: 1,
            holdout_pending: None,
            next_recheck_after: None,
            model: None,
            cafe: None,
        };
        storage.record_outcome_evidence(evidence.clone()).unwrap();
        let path = NexusPaths::new(dir.path()).evidence_file();
        let before = fs::read(&path).unwrap();
        storage.record_outcome_evidence(evidence).unwrap();
        let after = fs::read(&path).unwrap();
        assert_eq!(&after[..before.len()], &before[..]);
        assert_eq!(storage.list_outcome_evidence(10).len(), 2);
    }

    #[test]
    fn corrupt_json_returns_default() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path());
        fs::write(NexusPaths::new(dir.path()).proposals_file(), b"{broken").unwrap();
        let data = storage.proposals();
        assert!(data.proposals.is_empty());
    }

    #[test]
    fn risk_level_boundaries() {
        assert_eq!(RiskLevel::from_score(0.1), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.45), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.75), RiskLevel::High);
    }
}
