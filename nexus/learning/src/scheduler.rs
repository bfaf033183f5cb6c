use std::{
    env,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration as StdDuration,
};

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::EventBus;
use shared_logging::DailyJsonLogger;

use nexus_knowledge::KnowledgeScout;
use nexus_memory::{
    save_json_atomic, ExecutionProfile, LearningEvent, MemoryGovernor, MemoryStore, NexusPaths,
    OperationLock, ProposalStatus, ProposalV2, RiskLevel, StorageV2, Verdict,
};
use nexus_metacognition::{SelfDebugger, SelfReminder};

use crate::bandit::PolicyBandit;
use crate::cafe::CafeScorer;
use crate::calibrator::CafeCalibrator;
use crate::experiment::ExperimentExecutor;
use crate::proposals::ProposalEngineV2;
use crate::verifier::OutcomeVerifier;

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name).map_or(default, |raw| {
        matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on")
    })
}

/// Portfolio focus areas rotated by the daily cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FocusArea {
    /// Fewer failures and regressions.
    Reliability,
    /// More and better learning events.
    Learning,
    /// More proposals carried through execution.
    Execution,
    /// Output quality.
    Quality,
    /// Latency.
    Speed,
    /// Spend.
    Cost,
    /// Hardening.
    Security,
    /// Operator experience.
    Ux,
}

impl FocusArea {
    const ROTATION: [Self; 8] = [
        Self::Reliability,
        Self::Learning,
        Self::Execution,
        Self::Quality,
        Self::Speed,
        Self::Cost,
        Self::Security,
        Self::Ux,
    ];

    /// The next area in the rotation.
    #[must_use]
    pub fn next(self) -> Self {
        let pos = Self::ROTATION.iter().position(|a| *a == self).unwrap_or(0);
        Self::ROTATION[(pos + 1) % Self::ROTATION.len()]
    }
}

/// Scheduler knobs, ENV-backed (§6.3 variables).
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Sleep between iterations.
    pub cycle_interval_secs: u64,
    /// Knowledge-scan cadence.
    pub knowledge_scan_interval_secs: u64,
    /// Advanced-review cadence.
    pub advanced_review_interval_secs: u64,
    /// Cleanup cadence.
    pub cleanup_interval_secs: u64,
    /// Daily self-learning cadence.
    pub daily_self_learning_interval_secs: u64,
    /// CAFE calibration cadence.
    pub cafe_calibration_interval_secs: u64,
    /// Whether the v2 pipeline runs.
    pub enable_proposal_v2: bool,
    /// Whether approved proposals are executed.
    pub enable_experiment_executor: bool,
    /// Whether the bandit selects policy per iteration.
    pub enable_policy_bandit: bool,
    /// Whether CAFE calibration runs.
    pub enable_cafe_calibration: bool,
    /// Whether v1 source-score auto-approval runs.
    pub enable_auto_approve: bool,
    /// Source score (0–10) at which v1 improvements auto-approve.
    pub auto_approve_source_score: f64,
    /// Whether stagnation may unblock one extra improvement.
    pub enable_stagnation_unblock: bool,
    /// Minimum source score for the stagnation unblock.
    pub unblock_min_score: f64,
    /// Streak length that triggers self-check warnings.
    pub self_check_warn_streak: u32,
    /// Scan score (0–10) below which findings are filtered out.
    pub scan_min_score: f64,
    /// Default execution mode for proposals.
    pub execution_mode_default: ExecutionProfile,
    /// Whether the normal-mode canary may promote runs.
    pub enable_normal_mode_canary: bool,
    /// Sliding-hour cap on normal-mode runs.
    pub normal_mode_max_per_hour: usize,
    /// Priority floor for normal-mode runs.
    pub normal_mode_min_priority: f64,
    /// Risk levels eligible for normal mode.
    pub normal_mode_allowed_risk: Vec<RiskLevel>,
    /// Cooldown after a normal-mode loss.
    pub normal_mode_cooldown_secs: u64,
    /// Minimum seconds between verification retries.
    pub verification_retry_interval_secs: u64,
    /// Retry budget before a pending verification finalises.
    pub verification_retry_max_attempts: u32,
    /// Idea cap for the daily cycle.
    pub daily_max_ideas: usize,
    /// Whether the self-reminder step runs.
    pub self_reminder_enabled: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 60,
            knowledge_scan_interval_secs: 3600,
            advanced_review_interval_secs: 21_600,
            cleanup_interval_secs: 604_800,
            daily_self_learning_interval_secs: 86_400,
            cafe_calibration_interval_secs: 21_600,
            enable_proposal_v2: true,
            enable_experiment_executor: true,
            enable_policy_bandit: true,
            enable_cafe_calibration: true,
            enable_auto_approve: true,
            auto_approve_source_score: 8.5,
            enable_stagnation_unblock: true,
            unblock_min_score: 7.2,
            self_check_warn_streak: 8,
            scan_min_score: 6.0,
            execution_mode_default: ExecutionProfile::Safe,
            enable_normal_mode_canary: true,
            normal_mode_max_per_hour: 1,
            normal_mode_min_priority: 0.9,
            normal_mode_allowed_risk: vec![RiskLevel::Low],
            normal_mode_cooldown_secs: 1800,
            verification_retry_interval_secs: 300,
            verification_retry_max_attempts: 3,
            daily_max_ideas: 6,
            self_reminder_enabled: true,
        }
    }
}

impl LoopConfig {
    /// Reads configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let allowed_risk = env::var("NORMAL_MODE_ALLOWED_RISK").map_or_else(
            |_| defaults.normal_mode_allowed_risk.clone(),
            |raw| {
                let parsed: Vec<RiskLevel> = raw
                    .split(',')
                    .filter_map(|token| match token.trim().to_lowercase().as_str() {
                        "low" => Some(RiskLevel::Low),
                        "medium" => Some(RiskLevel::Medium),
                        "high" => Some(RiskLevel::High),
                        _ => None,
                    })
                    .collect();
                if parsed.is_empty() {
                    vec![RiskLevel::Low]
                } else {
                    parsed
                }
            },
        );
        Self {
            cycle_interval_secs: env_u64("NEXUS_CYCLE_INTERVAL", defaults.cycle_interval_secs),
            knowledge_scan_interval_secs: env_u64(
                "KNOWLEDGE_SCAN_INTERVAL_SECONDS",
                defaults.knowledge_scan_interval_secs,
            ),
            advanced_review_interval_secs: env_u64(
                "ADVANCED_REVIEW_INTERVAL_SECONDS",
                defaults.advanced_review_interval_secs,
            ),
            cleanup_interval_secs: env_u64("CLEANUP_INTERVAL_SECONDS", defaults.cleanup_interval_secs),
            daily_self_learning_interval_secs: env_u64(
                "DAILY_SELF_LEARNING_INTERVAL_SECONDS",
                defaults.daily_self_learning_interval_secs,
            ),
            cafe_calibration_interval_secs: env_u64(
                "CAFE_CALIBRATION_INTERVAL_SECONDS",
                defaults.cafe_calibration_interval_secs,
            ),
            enable_proposal_v2: env_bool("ENABLE_PROPOSAL_V2", defaults.enable_proposal_v2),
            enable_experiment_executor: env_bool(
                "ENABLE_EXPERIMENT_EXECUTOR",
                defaults.enable_experiment_executor,
            ),
            enable_policy_bandit: env_bool("ENABLE_POLICY_BANDIT", defaults.enable_policy_bandit),
            enable_cafe_calibration: env_bool(
                "ENABLE_CAFE_CALIBRATION",
                defaults.enable_cafe_calibration,
            ),
            enable_auto_approve: env_bool(
                "ENABLE_AUTO_APPROVE_PROPOSALS",
                defaults.enable_auto_approve,
            ),
            auto_approve_source_score: env_f64(
                "AUTO_APPROVE_PROPOSAL_SCORE",
                defaults.auto_approve_source_score,
            ),
            enable_stagnation_unblock: env_bool(
                "ENABLE_STAGNATION_UNBLOCK",
                defaults.enable_stagnation_unblock,
            ),
            unblock_min_score: env_f64("UNBLOCK_MIN_PROPOSAL_SCORE", defaults.unblock_min_score),
            self_check_warn_streak: env_u64("SELF_CHECK_WARN_STREAK", u64::from(defaults.self_check_warn_streak))
                as u32,
            scan_min_score: defaults.scan_min_score,
            execution_mode_default: match env::var("EXECUTION_MODE_DEFAULT").as_deref() {
                Ok("normal") => ExecutionProfile::Normal,
                _ => ExecutionProfile::Safe,
            },
            enable_normal_mode_canary: env_bool(
                "ENABLE_NORMAL_MODE_CANARY",
                defaults.enable_normal_mode_canary,
            ),
            normal_mode_max_per_hour: env_u64(
                "NORMAL_MODE_MAX_PER_HOUR",
                defaults.normal_mode_max_per_hour as u64,
            ) as usize,
            normal_mode_min_priority: env_f64(
                "NORMAL_MODE_MIN_PRIORITY",
                defaults.normal_mode_min_priority,
            ),
            normal_mode_allowed_risk: allowed_risk,
            normal_mode_cooldown_secs: env_u64(
                "NORMAL_MODE_COOLDOWN_SECONDS",
                defaults.normal_mode_cooldown_secs,
            ),
            verification_retry_interval_secs: env_u64(
                "VERIFICATION_RETRY_INTERVAL_SECONDS",
                defaults.verification_retry_interval_secs,
            ),
            verification_retry_max_attempts: env_u64(
                "VERIFICATION_RETRY_MAX_ATTEMPTS",
                u64::from(defaults.verification_retry_max_attempts),
            ) as u32,
            daily_max_ideas: defaults.daily_max_ideas,
            self_reminder_enabled: env_bool("SELF_REMINDER_ENABLED", defaults.self_reminder_enabled),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct LoopStats {
    total_iterations: u64,
    knowledge_items_learned: u64,
    daily_self_learning_runs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoopState {
    iteration: u64,
    stats: LoopStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_scan: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_cleanup: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_advanced_review: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_daily_self_learning: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_cafe_calibration: Option<DateTime<Utc>>,
    #[serde(default)]
    applied_improvements: Vec<String>,
    #[serde(default)]
    no_learning_streak: u32,
    #[serde(default)]
    no_improvement_streak: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    normal_mode_cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    normal_mode_execution_history: Vec<DateTime<Utc>>,
    #[serde(default)]
    normal_mode_successes: u32,
    #[serde(default)]
    normal_mode_losses: u32,
    #[serde(default)]
    normal_mode_last_reason: String,
    current_focus_area: FocusArea,
    #[serde(default)]
    scan_min_score: f64,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            iteration: 0,
            stats: LoopStats::default(),
            last_scan: None,
            last_cleanup: None,
            last_advanced_review: None,
            last_daily_self_learning: None,
            last_cafe_calibration: None,
            applied_improvements: Vec::new(),
            no_learning_streak: 0,
            no_improvement_streak: 0,
            normal_mode_cooldown_until: None,
            normal_mode_execution_history: Vec::new(),
            normal_mode_successes: 0,
            normal_mode_losses: 0,
            normal_mode_last_reason: "not_evaluated".into(),
            current_focus_area: FocusArea::Reliability,
            scan_min_score: 6.0,
        }
    }
}

/// One scored scan item feeding the improvement paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopItem {
    /// Finding id.
    pub id: String,
    /// Finding title.
    pub title: String,
    /// Source name.
    pub source: String,
    /// Source URL.
    pub url: String,
    /// Score on a 0–10 scale.
    pub score: f64,
}

/// Scan step summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Sources scanned this pass.
    pub sources_scanned: usize,
    /// Findings across all sources.
    pub total_findings: usize,
    /// Findings at or above the scan score threshold.
    pub filtered_count: usize,
    /// Whether the scan was skipped because another process held the lock.
    #[serde(default)]
    pub skipped_due_to_lock: bool,
    /// Best findings, highest score first.
    #[serde(default)]
    pub top_items: Vec<TopItem>,
}

/// Improvement (v1 compatibility) step summary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ImprovementSummary {
    /// Candidates considered.
    pub total_seen: usize,
    /// Candidates auto-approved by source score.
    pub auto_approved: usize,
    /// Candidates applied.
    pub applied: usize,
    /// Candidates skipped.
    pub skipped: usize,
    /// Extra approvals granted under stagnation.
    pub stagnation_unblocked: usize,
    /// Whether the step was skipped because the lock was held.
    #[serde(default)]
    pub skipped_due_to_lock: bool,
}

/// One executed run in the v2 summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNote {
    /// Proposal id.
    pub proposal_id: String,
    /// Run id, when execution started.
    pub run_id: String,
    /// Verdict of the verification attempt.
    pub verdict: Verdict,
    /// Mode used.
    pub mode: ExecutionProfile,
    /// Canary decision reason.
    pub canary_reason: String,
}

/// V2 pipeline step summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct V2Summary {
    /// Proposals created.
    pub created: usize,
    /// Proposals approved (at creation plus second pass).
    pub approved: usize,
    /// Runs executed.
    pub executed: usize,
    /// Verifications finalised.
    pub verified: usize,
    /// Pending verifications retried.
    pub retry_attempted: usize,
    /// Retries that finalised.
    pub retry_verified: usize,
    /// Pending verifications finalised by retry exhaustion.
    pub retry_finalized_exhausted: usize,
    /// Safe-mode runs.
    pub safe_mode_runs: usize,
    /// Normal-mode runs.
    pub normal_mode_runs: usize,
    /// Runs forced safe by a canary condition.
    pub canary_blocked: usize,
    /// Win verdicts.
    pub wins: usize,
    /// Loss verdicts.
    pub losses: usize,
    /// Inconclusive verdicts.
    pub inconclusive: usize,
    /// Per-run notes.
    #[serde(default)]
    pub runs: Vec<RunNote>,
}

/// Self-check step summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelfCheck {
    /// Whether this iteration learned anything.
    pub learned_now: bool,
    /// Whether this iteration improved anything.
    pub improved_now: bool,
    /// Consecutive iterations without learning.
    pub no_learning_streak: u32,
    /// Consecutive iterations without improvement.
    pub no_improvement_streak: u32,
    /// Warnings at the streak threshold.
    pub warnings: Vec<String>,
    /// Suggested remediations.
    pub suggestions: Vec<String>,
}

/// Full report of one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationReport {
    /// Iteration counter.
    pub iteration: u64,
    /// Iteration start time.
    pub timestamp: DateTime<Utc>,
    /// Step names that ran.
    pub actions: Vec<String>,
    /// Per-step errors; the iteration never aborts.
    pub errors: Vec<Value>,
    /// Health report snapshot.
    pub health: Value,
    /// Self-reminder summary, when the step ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_reminders: Option<Value>,
    /// Scan summary, when the scan ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanSummary>,
    /// Improvement step summary.
    pub improvements: ImprovementSummary,
    /// V2 pipeline summary.
    pub v2_pipeline: V2Summary,
    /// Calibration summary, when it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Value>,
    /// Advanced-review summary, when it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced_review: Option<Value>,
    /// Cleanup summary, when it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<Value>,
    /// Self-check outcome.
    pub self_check: SelfCheck,
    /// Daily self-learning summary, when it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_self_learning: Option<Value>,
}

/// Components the loop drives.
pub struct LoopDeps {
    /// Filesystem layout.
    pub paths: NexusPaths,
    /// Knowledge scout.
    pub scout: Arc<KnowledgeScout>,
    /// Memory store.
    pub store: Arc<MemoryStore>,
    /// Learning storage.
    pub storage: Arc<StorageV2>,
    /// Self-debugger.
    pub debugger: Arc<SelfDebugger>,
    /// Self-reminder engine, when wired.
    pub reminder: Option<Arc<SelfReminder>>,
    /// Proposal engine.
    pub proposals: Arc<ProposalEngineV2>,
    /// Experiment executor.
    pub executor: Arc<ExperimentExecutor>,
    /// Outcome verifier.
    pub verifier: Arc<OutcomeVerifier>,
    /// Policy bandit.
    pub bandit: Arc<PolicyBandit>,
    /// CAFE calibrator.
    pub calibrator: Arc<CafeCalibrator>,
    /// CAFE scorer.
    pub scorer: Arc<CafeScorer>,
    /// Memory governor.
    pub governor: Arc<MemoryGovernor>,
    /// Event bus, when wired.
    pub bus: Option<Arc<EventBus>>,
}

/// The top-level scheduler: one driver loop multiplexing all periodic cycles
/// by wall-clock thresholds.
pub struct LearningLoop {
    deps: LoopDeps,
    config: LoopConfig,
    state: Mutex<LoopState>,
    notes: Option<DailyJsonLogger>,
    daily_log: Option<DailyJsonLogger>,
}

impl std::fmt::Debug for LearningLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningLoop")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn due(last: Option<DateTime<Utc>>, interval_secs: u64) -> bool {
    last.map_or(true, |last| {
        Utc::now() - last > Duration::seconds(interval_secs.max(1) as i64)
    })
}

impl LearningLoop {
    /// Creates the loop, restoring persisted state.
    pub fn new(deps: LoopDeps, config: LoopConfig) -> anyhow::Result<Self> {
        let state: LoopState =
            nexus_memory::load_json_or_default(&deps.paths.learning_state_file());
        let mut state = state;
        if state.scan_min_score <= 0.0 {
            state.scan_min_score = config.scan_min_score;
        }
        let notes = DailyJsonLogger::new(deps.paths.logs_dir(), "rnd_notes").ok();
        let daily_log = DailyJsonLogger::new(deps.paths.logs_dir(), "daily_self_learning").ok();
        Ok(Self {
            deps,
            config,
            state: Mutex::new(state),
            notes,
            daily_log,
        })
    }

    fn append_note(&self, note_type: &str, severity: &str, message: &str, context: Value) {
        if let Some(notes) = &self.notes {
            let _ = notes.append(&json!({
                "ts": Utc::now(),
                "note_type": note_type,
                "severity": severity,
                "message": message,
                "context": context,
            }));
        }
    }

    fn persist_state(&self, state: &LoopState) {
        let _ = save_json_atomic(&self.deps.paths.learning_state_file(), state);
    }

    /// Runs iterations until `shutdown` is set, sleeping the cycle interval
    /// between them in short cancellable ticks.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            let report = self.run_iteration().await;
            if let Some(bus) = &self.deps.bus {
                bus.emit(
                    "learning.iteration",
                    json!({"iteration": report.iteration, "actions": report.actions}),
                );
            }
            let deadline = StdDuration::from_secs(self.config.cycle_interval_secs.max(1));
            let started = std::time::Instant::now();
            while started.elapsed() < deadline {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(StdDuration::from_millis(250)).await;
            }
        }
    }

    /// Runs one learning iteration.
    pub async fn run_iteration(&self) -> IterationReport {
        let timestamp = Utc::now();
        let iteration = {
            let mut state = self.state.lock();
            state.iteration += 1;
            state.stats.total_iterations += 1;
            state.iteration
        };
        self.deps.debugger.log_decision(
            "SYSTEM",
            "iteration",
            &format!("Starting iteration {iteration}"),
            None,
            Vec::new(),
            0.5,
        );

        let mut report = IterationReport {
            iteration,
            timestamp,
            actions: Vec::new(),
            errors: Vec::new(),
            health: Value::Null,
            self_reminders: None,
            scan: None,
            improvements: ImprovementSummary::default(),
            v2_pipeline: V2Summary::default(),
            calibration: None,
            advanced_review: None,
            cleanup: None,
            self_check: SelfCheck::default(),
            daily_self_learning: None,
        };

        // 1. Health check, every iteration.
        let health = self.deps.debugger.health_report();
        report.health = serde_json::to_value(&health).unwrap_or(Value::Null);
        report.actions.push("health_check".into());
        self.deps
            .debugger
            .log_action("SYSTEM", "health_check", Value::Null, true, 0, 0);

        // 2. Self-reminder heartbeat: re-read any due principle files so
        // guardrails stay fresh. Per-source intervals gate the actual reads.
        if self.config.self_reminder_enabled {
            if let Some(reminder) = &self.deps.reminder {
                let events = reminder.check_and_remind();
                let changed = events.iter().filter(|e| e.changed_since_last).count();
                report.self_reminders = Some(json!({
                    "reminded": events.len(),
                    "changed": changed,
                }));
                report.actions.push("self_reminder".into());
                if changed > 0 {
                    self.append_note(
                        "principles_changed",
                        "info",
                        "Principle sources changed since the last reminder cycle.",
                        json!({"changed": changed}),
                    );
                }
            }
        }

        // 3. Knowledge scan, on its cadence, under the scan lock.
        let scan_due = due(self.state.lock().last_scan, self.config.knowledge_scan_interval_secs);
        if scan_due {
            match self.run_scan_step().await {
                Ok(summary) => {
                    report
                        .actions
                        .push(if summary.skipped_due_to_lock {
                            "knowledge_scan_skipped_locked".into()
                        } else {
                            "knowledge_scan".into()
                        });
                    report.scan = Some(summary);
                }
                Err(err) => {
                    report.errors.push(json!({"step": "knowledge_scan", "error": err.to_string()}));
                }
            }
        }

        // 4. Improvements (v1 compatibility path), under its lock.
        report.improvements =
            self.run_improvements_step(report.scan.as_ref(), health.open_issues);
        report.actions.push("apply_improvements".into());

        // 5. V2 proposal pipeline.
        if self.config.enable_proposal_v2 {
            report.v2_pipeline = self.run_v2_cycle(report.scan.as_ref());
            report.actions.push("v2_pipeline".into());
        }

        // 6. CAFE calibration.
        if self.config.enable_cafe_calibration
            && due(
                self.state.lock().last_cafe_calibration,
                self.config.cafe_calibration_interval_secs,
            )
        {
            let summary = self.deps.calibrator.calibrate(&self.deps.scorer);
            self.state.lock().last_cafe_calibration = Some(summary.last_updated);
            report.calibration = serde_json::to_value(&summary).ok();
            report.actions.push("cafe_calibration".into());
        }

        // 7. Advanced review.
        if due(
            self.state.lock().last_advanced_review,
            self.config.advanced_review_interval_secs,
        ) {
            report.advanced_review = Some(self.run_advanced_review());
            self.state.lock().last_advanced_review = Some(Utc::now());
            report.actions.push("advanced_review".into());
        }

        // 8. Cleanup.
        if due(self.state.lock().last_cleanup, self.config.cleanup_interval_secs) {
            let pruned = self.deps.store.prune(90, 1);
            self.deps.governor.forget_older_than(Duration::days(7));
            let events = self.deps.storage.list_learning_events(1000);
            let total_events = events.len();
            let live_events = self
                .deps
                .governor
                .prune_by_ttl(
                    events,
                    nexus_memory::RetentionCategory::LearningEvent,
                    |event| Some(event.ts),
                )
                .len();
            self.state.lock().last_cleanup = Some(Utc::now());
            report.cleanup = Some(json!({
                "pruned_items": pruned,
                "recent_events": total_events,
                "events_within_ttl": live_events,
            }));
            report.actions.push("cleanup".into());
        }

        // 9. Self-check.
        report.self_check = self.run_self_check(&report);
        report.actions.push("self_check".into());

        // 10. Daily self-learning cycle, under its lock.
        if due(
            self.state.lock().last_daily_self_learning,
            self.config.daily_self_learning_interval_secs,
        ) {
            match self.run_daily_cycle(&report) {
                Ok(Some(summary)) => {
                    report.daily_self_learning = Some(summary);
                    report.actions.push("daily_self_learning".into());
                }
                Ok(None) => {
                    report.actions.push("daily_self_learning_skipped_locked".into());
                }
                Err(err) => {
                    report
                        .errors
                        .push(json!({"step": "daily_self_learning", "error": err.to_string()}));
                }
            }
        }

        // 11. Persist state.
        {
            let state = self.state.lock();
            self.persist_state(&state);
        }
        report.actions.push("save_state".into());
        self.deps
            .debugger
            .log_action("SYSTEM", "save_state", Value::Null, true, 0, 0);

        report
    }

    async fn run_scan_step(&self) -> anyhow::Result<ScanSummary> {
        let lock = OperationLock::new("knowledge_scan", self.deps.paths.scan_lock());
        let guard = match lock.acquire(json!({"operation": "knowledge_scan"}))? {
            Ok(guard) => guard,
            Err(holder) => {
                self.append_note(
                    "operation_lock_busy",
                    "warning",
                    "Skipped knowledge scan because another process holds the scan lock.",
                    json!({"operation": "knowledge_scan", "holder": holder}),
                );
                return Ok(ScanSummary {
                    skipped_due_to_lock: true,
                    ..ScanSummary::default()
                });
            }
        };

        let results = self.deps.scout.scan_all().await;
        drop(guard);

        let scan_min_score = self.state.lock().scan_min_score;
        let mut total = 0;
        let mut top_items: Vec<TopItem> = Vec::new();
        for findings in results.values() {
            total += findings.len();
            for finding in findings {
                if finding.error.is_some() || finding.kind == "unavailable" || finding.kind == "unsupported"
                {
                    continue;
                }
                top_items.push(TopItem {
                    id: finding.id.clone(),
                    title: finding.title.clone(),
                    source: finding.source.clone(),
                    url: finding.url.clone(),
                    score: (finding.relevance * 10.0).clamp(0.0, 10.0),
                });
            }
        }
        top_items.sort_by(|a, b| b.score.total_cmp(&a.score));
        top_items.truncate(10);
        let filtered_count = top_items.iter().filter(|i| i.score >= scan_min_score).count();

        {
            let mut state = self.state.lock();
            state.last_scan = Some(Utc::now());
            state.stats.knowledge_items_learned += filtered_count as u64;
        }
        self.deps
            .debugger
            .log_action("SYSTEM", "knowledge_scan", json!({"findings": total}), true, 0, 0);

        Ok(ScanSummary {
            sources_scanned: results.len(),
            total_findings: total,
            filtered_count,
            skipped_due_to_lock: false,
            top_items,
        })
    }

    fn run_improvements_step(
        &self,
        scan: Option<&ScanSummary>,
        open_issues: usize,
    ) -> ImprovementSummary {
        let lock = OperationLock::new("improvement_apply", self.deps.paths.improvement_lock());
        let guard = match lock.acquire(json!({"operation": "improvement_apply"})) {
            Ok(Ok(guard)) => guard,
            Ok(Err(_)) | Err(_) => {
                return ImprovementSummary {
                    skipped_due_to_lock: true,
                    ..ImprovementSummary::default()
                };
            }
        };

        let mut summary = ImprovementSummary::default();
        let Some(scan) = scan else {
            drop(guard);
            return summary;
        };

        let mut state = self.state.lock();
        summary.total_seen = scan.top_items.len();
        for item in &scan.top_items {
            if state.applied_improvements.contains(&item.id) {
                summary.skipped += 1;
                continue;
            }
            if self.config.enable_auto_approve && item.score >= self.config.auto_approve_source_score {
                state.applied_improvements.push(item.id.clone());
                summary.auto_approved += 1;
                summary.applied += 1;
            } else {
                summary.skipped += 1;
            }
        }

        // One extra approval above the unblock floor when stagnating with a
        // clean issue slate.
        if self.config.enable_stagnation_unblock
            && summary.applied == 0
            && state.no_improvement_streak >= self.config.self_check_warn_streak
            && open_issues == 0
        {
            if let Some(item) = scan
                .top_items
                .iter()
                .find(|i| i.score >= self.config.unblock_min_score && !state.applied_improvements.contains(&i.id))
            {
                state.applied_improvements.push(item.id.clone());
                summary.applied += 1;
                summary.stagnation_unblocked += 1;
                drop(state);
                self.append_note(
                    "stagnation_unblock",
                    "warning",
                    "Auto-approved one proposal above the unblock floor to break stagnation.",
                    json!({"item": item.id, "score": item.score}),
                );
                drop(guard);
                return summary;
            }
        }
        drop(state);
        drop(guard);
        summary
    }

    fn events_from_scan(scan: Option<&ScanSummary>) -> Vec<LearningEvent> {
        let Some(scan) = scan else {
            return Vec::new();
        };
        scan.top_items
            .iter()
            .take(10)
            .map(|item| {
                let mut event = LearningEvent::new(
                    item.source.clone(),
                    "scan_insight",
                    item.title.clone(),
                );
                event.title = Some(format!("Integrate: {}", item.title));
                event.hypothesis =
                    Some("Integrating this insight improves the system.".to_string());
                event.expected_impact = Some(format!("score={:.2}", item.score));
                event.novelty = (item.score / 10.0).min(1.0);
                event.value = (item.score / 10.0).min(1.0);
                event.risk = if item.score >= 7.0 { 0.25 } else { 0.4 };
                event.confidence = if item.score >= 7.0 { 0.65 } else { 0.55 };
                event.context = json!({"url": item.url, "finding_id": item.id});
                event
            })
            .collect()
    }

    fn run_v2_cycle(&self, scan: Option<&ScanSummary>) -> V2Summary {
        let mut summary = V2Summary::default();

        let selected_policy = if self.config.enable_policy_bandit {
            let selected = self.deps.bandit.select_policy();
            if let Some(threshold) = selected
                .get("approve_threshold")
                .and_then(|t| t.parse::<f64>().ok())
            {
                self.deps.proposals.set_auto_approve_threshold(threshold);
            }
            if let Some(score) = selected
                .get("scan_min_score")
                .and_then(|s| s.parse::<f64>().ok())
            {
                self.state.lock().scan_min_score = score.max(0.0);
            }
            Some(selected)
        } else {
            None
        };

        let mut recorded: Vec<LearningEvent> = Vec::new();
        for mut event in Self::events_from_scan(scan) {
            if !self
                .deps
                .governor
                .should_keep(&event.source, &event.event_type, &event.content)
            {
                continue;
            }
            event.cafe = Some(json!(self.deps.scorer.score_event(&event)));
            if let Ok(id) = self.deps.storage.record_learning_event(event.clone()) {
                event.id = id;
                recorded.push(event);
            }
        }

        let created = self.deps.proposals.generate_from_events(&recorded, 20, false);
        summary.created = created.len();
        summary.approved = created
            .iter()
            .filter(|p| p.status == ProposalStatus::Approved)
            .count();

        let mut adaptive_threshold = self.deps.proposals.auto_approve_threshold();
        if self.state.lock().no_improvement_streak >= self.config.self_check_warn_streak {
            adaptive_threshold = (adaptive_threshold - 0.2).max(0.0);
        }
        summary.approved += self.deps.proposals.auto_approve_safe(3, Some(adaptive_threshold));

        if !self.config.enable_experiment_executor {
            return summary;
        }

        let actionable: Vec<ProposalV2> = self
            .deps
            .proposals
            .list_pending()
            .into_iter()
            .filter(|p| p.status == ProposalStatus::Approved)
            .take(3)
            .collect();

        for proposal in actionable {
            let (mode, reason) = self.select_execution_mode(&proposal);
            if mode == ExecutionProfile::Normal {
                summary.normal_mode_runs += 1;
            } else {
                summary.safe_mode_runs += 1;
                if reason != "default_safe_mode" && reason != "canary_allowed" {
                    summary.canary_blocked += 1;
                }
            }

            let Ok(outcome) = self.deps.executor.execute_proposal(&proposal.id, mode) else {
                continue;
            };
            if !outcome.ok {
                continue;
            }
            summary.executed += 1;

            let mut verdict = Verdict::Inconclusive;
            if let Ok(verify) = self.deps.verifier.verify_experiment(&outcome.run_id) {
                if !verify.pending_recheck {
                    summary.verified += 1;
                }
                verdict = verify.evidence.verdict;
                match verdict {
                    Verdict::Win => summary.wins += 1,
                    Verdict::Loss => summary.losses += 1,
                    Verdict::Inconclusive => summary.inconclusive += 1,
                }
                if mode == ExecutionProfile::Normal {
                    self.record_normal_mode_outcome(verdict, &proposal.id);
                }
                if self.config.enable_policy_bandit {
                    self.deps.bandit.update(
                        verdict,
                        selected_policy.as_ref(),
                        1.0,
                        json!({"proposal_id": proposal.id}),
                    );
                }
            }
            summary.runs.push(RunNote {
                proposal_id: proposal.id.clone(),
                run_id: outcome.run_id,
                verdict,
                mode,
                canary_reason: reason,
            });
        }

        let retry = self.retry_pending_verifications(3);
        summary.retry_attempted = retry.attempted;
        summary.retry_verified = retry.verified;
        summary.retry_finalized_exhausted = retry.finalized_exhausted;
        summary.verified += retry.verified;
        summary.wins += retry.wins;
        summary.losses += retry.losses;
        summary.inconclusive += retry.inconclusive;

        summary
    }

    /// Normal-mode canary guardrail: execution defaults to safe and promotes
    /// only when every condition holds.
    fn select_execution_mode(&self, proposal: &ProposalV2) -> (ExecutionProfile, String) {
        let mut state = self.state.lock();
        let reason = 'decision: {
            if self.config.execution_mode_default != ExecutionProfile::Normal {
                break 'decision "default_safe_mode";
            }
            if !self.config.enable_normal_mode_canary {
                break 'decision "canary_disabled";
            }
            if !self.deps.executor.real_apply_enabled() {
                break 'decision "real_apply_disabled";
            }
            let now = Utc::now();
            if state
                .normal_mode_cooldown_until
                .is_some_and(|until| until > now)
            {
                break 'decision "cooldown_active";
            }
            state
                .normal_mode_execution_history
                .retain(|ts| now - *ts <= Duration::hours(1));
            if state.normal_mode_execution_history.len() >= self.config.normal_mode_max_per_hour.max(1) {
                break 'decision "hourly_quota_exceeded";
            }
            if !self.config.normal_mode_allowed_risk.contains(&proposal.risk_level) {
                state.normal_mode_last_reason =
                    format!("risk_not_allowed:{:?}", proposal.risk_level).to_lowercase();
                return (ExecutionProfile::Safe, state.normal_mode_last_reason.clone());
            }
            if proposal.priority < self.config.normal_mode_min_priority {
                break 'decision "priority_below_canary_threshold";
            }
            "canary_allowed"
        };
        state.normal_mode_last_reason = reason.to_string();
        let mode = if reason == "canary_allowed" {
            ExecutionProfile::Normal
        } else {
            ExecutionProfile::Safe
        };
        (mode, reason.to_string())
    }

    fn record_normal_mode_outcome(&self, verdict: Verdict, proposal_id: &str) {
        let now = Utc::now();
        let cooldown_until = {
            let mut state = self.state.lock();
            state.normal_mode_execution_history.push(now);
            state
                .normal_mode_execution_history
                .retain(|ts| now - *ts <= Duration::hours(1));
            match verdict {
                Verdict::Loss => {
                    state.normal_mode_losses += 1;
                    let until =
                        now + Duration::seconds(self.config.normal_mode_cooldown_secs.max(60) as i64);
                    state.normal_mode_cooldown_until = Some(until);
                    Some(until)
                }
                Verdict::Win => {
                    state.normal_mode_successes += 1;
                    None
                }
                Verdict::Inconclusive => None,
            }
        };
        if let Some(until) = cooldown_until {
            let mut annotations = IndexMap::new();
            annotations.insert("rollback_guardrail_triggered".to_string(), json!(true));
            annotations.insert(
                "rollback_reason".to_string(),
                json!("loss_detected_after_normal_mode_execution"),
            );
            annotations.insert("rollback_triggered_at".to_string(), json!(now));
            self.deps
                .proposals
                .mark_status(proposal_id, ProposalStatus::Verified, annotations);
            self.append_note(
                "normal_mode_guardrail_cooldown",
                "warning",
                "Normal-mode loss detected; cooldown activated.",
                json!({"proposal_id": proposal_id, "cooldown_until": until}),
            );
        }
    }

    fn retry_pending_verifications(&self, limit: usize) -> RetrySummary {
        let mut summary = RetrySummary::default();
        let now = Utc::now();
        let max_attempts = self.config.verification_retry_max_attempts.max(1);
        let runs = self.deps.storage.experiment_runs(500);

        for run in runs.into_iter().rev() {
            if summary.attempted >= limit.max(1) {
                break;
            }
            let Some(verification) = run.verification.clone() else {
                continue;
            };
            if !verification.pending_recheck {
                continue;
            }

            if verification.attempts >= max_attempts {
                let finalized_at = Utc::now();
                let mut finalized = verification.clone();
                finalized.pending_recheck = false;
                finalized.retry_exhausted = Some(true);
                finalized.finalized_reason = Some("max_retries_exhausted".into());
                finalized.verified_at = finalized_at;
                let _ = self.deps.storage.update_experiment_run(&run.id, |r| {
                    r.verification = Some(finalized.clone());
                });
                let mut annotations = IndexMap::new();
                annotations.insert("verification_pending".to_string(), json!(false));
                annotations.insert("verification_exhausted".to_string(), json!(true));
                annotations.insert(
                    "verification_final_reason".to_string(),
                    json!("max_retries_exhausted"),
                );
                annotations.insert("verdict".to_string(), json!(verification.verdict));
                annotations.insert(
                    "verdict_confidence".to_string(),
                    json!(verification.confidence),
                );
                self.deps
                    .proposals
                    .mark_status(&run.proposal_id, ProposalStatus::Executed, annotations);
                summary.finalized_exhausted += 1;
                continue;
            }

            if verification
                .next_recheck_after
                .is_some_and(|after| now < after)
            {
                continue;
            }
            let min_gap = Duration::seconds(self.config.verification_retry_interval_secs.max(10) as i64);
            if now - verification.verified_at < min_gap {
                continue;
            }

            summary.attempted += 1;
            let Ok(outcome) = self.deps.verifier.verify_experiment(&run.id) else {
                continue;
            };
            match outcome.evidence.verdict {
                Verdict::Win => summary.wins += 1,
                Verdict::Loss => summary.losses += 1,
                Verdict::Inconclusive => summary.inconclusive += 1,
            }
            if !outcome.pending_recheck {
                summary.verified += 1;
            }
        }
        summary
    }

    fn run_advanced_review(&self) -> Value {
        let events = self.deps.storage.list_learning_events(5);
        let scores: Vec<f64> = events
            .iter()
            .map(|event| self.deps.scorer.score_event(event).score)
            .collect();
        let avg = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        json!({"reviewed_items": events.len(), "avg_quality": avg})
    }

    fn run_self_check(&self, report: &IterationReport) -> SelfCheck {
        let learned_now = report.scan.as_ref().is_some_and(|s| s.filtered_count > 0)
            || report
                .advanced_review
                .as_ref()
                .and_then(|r| r.get("reviewed_items"))
                .and_then(Value::as_u64)
                .unwrap_or(0)
                > 0;
        let v2 = &report.v2_pipeline;
        let improved_now = report.improvements.applied > 0
            || v2.wins > 0
            || (v2.verified > 0 && v2.losses == 0);

        let mut state = self.state.lock();
        state.no_learning_streak = if learned_now {
            0
        } else {
            state.no_learning_streak + 1
        };
        state.no_improvement_streak = if improved_now {
            0
        } else {
            state.no_improvement_streak + 1
        };

        let mut warnings = Vec::new();
        let mut suggestions = Vec::new();
        if state.no_learning_streak >= self.config.self_check_warn_streak {
            warnings.push(format!(
                "No meaningful learning events for {} iterations",
                state.no_learning_streak
            ));
            suggestions.push(
                "Increase scan frequency, widen sources, and refresh scoring thresholds.".to_string(),
            );
        }
        if state.no_improvement_streak >= self.config.self_check_warn_streak {
            warnings.push(format!(
                "No applied improvements for {} iterations",
                state.no_improvement_streak
            ));
            suggestions.push(
                "Lower approval friction or the auto-approve threshold for safe high-score proposals."
                    .to_string(),
            );
        }
        let open_issues = report
            .health
            .get("open_issues")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if open_issues > 0 {
            suggestions.push("Prioritize resolving open issues before generating new changes.".to_string());
        }

        let check = SelfCheck {
            learned_now,
            improved_now,
            no_learning_streak: state.no_learning_streak,
            no_improvement_streak: state.no_improvement_streak,
            warnings: warnings.clone(),
            suggestions,
        };
        drop(state);
        for warning in warnings {
            self.append_note("self_check_warning", "warning", &warning, Value::Null);
        }
        check
    }

    fn run_daily_cycle(&self, report: &IterationReport) -> anyhow::Result<Option<Value>> {
        let lock = OperationLock::new("daily_self_learning", self.deps.paths.daily_lock());
        let guard = match lock.acquire(json!({"operation": "daily_self_learning"}))? {
            Ok(guard) => guard,
            Err(_) => return Ok(None),
        };

        let mut ideas: Vec<String> = Vec::new();
        if let Some(issues) = report.health.get("top_issues").and_then(Value::as_array) {
            for issue in issues {
                if let Some(title) = issue.get("title").and_then(Value::as_str) {
                    ideas.push(format!("Resolve open issue: {title}"));
                }
            }
        }
        if let Some(scan) = &report.scan {
            for item in &scan.top_items {
                ideas.push(format!("Integrate: {}", item.title));
            }
        }
        for quality in self.deps.scout.ranked_sources().into_iter().rev().take(2) {
            if quality.quality_score < 0.4 {
                ideas.push(format!(
                    "Improve or disable low-quality source: {}",
                    quality.source
                ));
            }
        }
        ideas.truncate(self.config.daily_max_ideas);

        // Simulated experiments over recent events: threshold sensitivity
        // and source resilience.
        let events = self.deps.storage.list_learning_events(200);
        let create_threshold = 0.62;
        let above: usize = events
            .iter()
            .filter(|e| crate::proposals::priority(e.value, e.novelty, e.confidence, e.risk) >= create_threshold)
            .count();
        let sensitivity = json!({
            "experiment": "threshold_sensitivity",
            "events": events.len(),
            "above_create_threshold": above,
            "below_create_threshold": events.len().saturating_sub(above),
        });
        let stats = self.deps.scout.source_stats();
        let erroring = stats
            .get("sources")
            .and_then(Value::as_object)
            .map_or(0, |sources| {
                sources
                    .values()
                    .filter(|s| !s.get("last_error").map_or(true, Value::is_null))
                    .count()
            });
        let resilience = json!({
            "experiment": "source_resilience",
            "erroring_sources": erroring,
        });

        // Focus rotation: issues pin reliability, learning stagnation pins
        // learning, otherwise rotate.
        let open_issues = report
            .health
            .get("open_issues")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let recommended = {
            let state = self.state.lock();
            if open_issues > 0 {
                FocusArea::Reliability
            } else if state.no_learning_streak >= self.config.self_check_warn_streak {
                FocusArea::Learning
            } else {
                state.current_focus_area.next()
            }
        };

        // The daily digest re-reads every principle source so the cycle
        // starts from refreshed guardrails.
        let reminder_digest = self
            .deps
            .reminder
            .as_ref()
            .filter(|_| self.config.self_reminder_enabled)
            .map(|reminder| {
                let refreshed = reminder.force_remind_all().len();
                json!({"refreshed_sources": refreshed, "status": reminder.status()})
            });

        let summary = json!({
            "ts": Utc::now(),
            "ideas": ideas,
            "experiments": [sensitivity, resilience],
            "recommended_focus": recommended,
            "self_reminder": reminder_digest,
        });
        if let Some(log) = &self.daily_log {
            let _ = log.append(&summary);
        }

        {
            let mut state = self.state.lock();
            state.current_focus_area = recommended;
            state.last_daily_self_learning = Some(Utc::now());
            state.stats.daily_self_learning_runs += 1;
        }
        drop(guard);
        Ok(Some(summary))
    }

    /// Guardrail and progress snapshot for status surfaces.
    #[must_use]
    pub fn status_report(&self) -> Value {
        let state = self.state.lock();
        json!({
            "iteration": state.iteration,
            "stats": state.stats,
            "current_focus_area": state.current_focus_area,
            "no_learning_streak": state.no_learning_streak,
            "no_improvement_streak": state.no_improvement_streak,
            "scan_min_score": state.scan_min_score,
            "normal_mode": {
                "successes": state.normal_mode_successes,
                "losses": state.normal_mode_losses,
                "cooldown_until": state.normal_mode_cooldown_until,
                "last_reason": state.normal_mode_last_reason,
                "runs_last_hour": state.normal_mode_execution_history.len(),
            },
        })
    }
}

#[derive(Debug, Default)]
struct RetrySummary {
    attempted: usize,
    verified: usize,
    wins: usize,
    losses: usize,
    inconclusive: usize,
    finalized_exhausted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cafe::{CafeConfig, CafeScorer};
    use crate::calibrator::CalibratorConfig;
    use crate::experiment::ExperimentConfig;
    use crate::proposals::ProposalConfig;
    use crate::verifier::VerifierConfig;
    use async_trait::async_trait;
    use nexus_knowledge::{ParserKind, ScoutConfig, Source, SourceCategory, SourceFetcher};
    use nexus_metacognition::DebuggerConfig;
    use tempfile::tempdir;

    struct StaticFetcher(String);

    #[async_trait]
    impl SourceFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    fn build_loop(root: &std::path::Path, config: LoopConfig, body: &str) -> LearningLoop {
        let paths = NexusPaths::new(root);
        paths.ensure().unwrap();
        let storage = Arc::new(StorageV2::open(&paths).unwrap());
        let store = Arc::new(
            MemoryStore::open(
                paths.knowledge_file(),
                paths.patterns_file(),
                paths.feedback_file(),
            )
            .unwrap(),
        );
        let scorer = Arc::new(CafeScorer::new(CafeConfig::default()));
        let proposals = Arc::new(ProposalEngineV2::new(
            Arc::clone(&storage),
            Arc::clone(&scorer),
            ProposalConfig {
                enable_cafe: false,
                create_threshold: 0.5,
                auto_approve_threshold: 0.5,
                allow_blocked: false,
            },
        ));
        let debugger = Arc::new(SelfDebugger::new(
            paths.decision_log_file(),
            paths.issues_file(),
            paths.metrics_file(),
            DebuggerConfig::default(),
        ));
        let executor = Arc::new(ExperimentExecutor::new(
            Arc::clone(&storage),
            Arc::clone(&proposals),
            Arc::clone(&debugger),
            ExperimentConfig::default(),
        ));
        let verifier = Arc::new(OutcomeVerifier::new(
            Arc::clone(&storage),
            Arc::clone(&proposals),
            Arc::clone(&debugger),
            Arc::clone(&scorer),
            VerifierConfig {
                holdout_enabled: false,
                holdout_seconds: 0,
            },
        ));
        let bandit = Arc::new(PolicyBandit::new(Arc::clone(&storage)));
        let calibrator = Arc::new(CafeCalibrator::new(
            Arc::clone(&storage),
            paths.cafe_state_file(),
            CalibratorConfig::default(),
        ));
        let scout = Arc::new(KnowledgeScout::new(
            vec![Source::new(
                "test_feed",
                SourceCategory::Technology,
                "https://example.test",
                0,
                ParserKind::Html,
            )],
            Arc::new(StaticFetcher(body.to_string())),
            paths.findings_file(),
            paths.sources_file(),
            ScoutConfig::default(),
        ));
        let reminder = Arc::new(SelfReminder::new(
            root,
            paths.self_reminder_log_file(),
            vec![nexus_metacognition::PrincipleSource::new(
                "docs/principles.md",
                "Principles",
                9,
                0,
                "guardrails",
            )],
            true,
        ));
        LearningLoop::new(
            LoopDeps {
                paths,
                scout,
                store,
                storage,
                debugger,
                reminder: Some(reminder),
                proposals,
                executor,
                verifier,
                bandit,
                calibrator,
                scorer,
                governor: Arc::new(MemoryGovernor::new()),
                bus: None,
            },
            config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn iteration_runs_scan_and_v2_pipeline() {
        let dir = tempdir().unwrap();
        let config = LoopConfig {
            enable_policy_bandit: false,
            enable_cafe_calibration: false,
            ..LoopConfig::default()
        };
        let learning = build_loop(dir.path(), config, "<h1>Fast pipeline release</h1>");
        let report = learning.run_iteration().await;

        assert!(report.actions.contains(&"health_check".to_string()));
        let scan = report.scan.as_ref().unwrap();
        assert_eq!(scan.total_findings, 1);
        assert_eq!(scan.top_items.len(), 1);
        assert!((scan.top_items[0].score - 7.0).abs() < 1e-9);
        assert!(scan.filtered_count >= 1);

        // Score 7 events clear the lowered thresholds: created, approved,
        // executed in safe mode, verified inconclusive (flat metrics).
        let v2 = &report.v2_pipeline;
        assert_eq!(v2.created, 1);
        assert!(v2.approved >= 1);
        assert_eq!(v2.executed, 1);
        assert_eq!(v2.safe_mode_runs, 1);
        assert_eq!(v2.inconclusive, 1);
        assert_eq!(v2.runs[0].canary_reason, "default_safe_mode");

        assert!(report.self_check.learned_now);
        assert!(dir
            .path()
            .join("data/state/learning_state.json")
            .exists());
    }

    #[tokio::test]
    async fn scan_respects_its_interval() {
        let dir = tempdir().unwrap();
        let config = LoopConfig {
            enable_policy_bandit: false,
            enable_cafe_calibration: false,
            ..LoopConfig::default()
        };
        let learning = build_loop(dir.path(), config, "<h1>One</h1>");
        let first = learning.run_iteration().await;
        assert!(first.scan.is_some());
        let second = learning.run_iteration().await;
        assert!(second.scan.is_none());
    }

    #[tokio::test]
    async fn held_scan_lock_skips_the_step() {
        let dir = tempdir().unwrap();
        let config = LoopConfig {
            enable_policy_bandit: false,
            enable_cafe_calibration: false,
            ..LoopConfig::default()
        };
        let learning = build_loop(dir.path(), config, "<h1>One</h1>");
        let lock = OperationLock::new("knowledge_scan", NexusPaths::new(dir.path()).scan_lock());
        let _held = lock.acquire(Value::Null).unwrap().unwrap();
        let report = learning.run_iteration().await;
        assert!(report.scan.unwrap().skipped_due_to_lock);
        assert!(report
            .actions
            .contains(&"knowledge_scan_skipped_locked".to_string()));
    }

    #[tokio::test]
    async fn self_reminder_step_reads_due_principles() {
        let dir = tempdir().unwrap();
        let docs = dir.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("principles.md"), "# Rules\n- verify outcomes\n").unwrap();
        let config = LoopConfig {
            enable_policy_bandit: false,
            enable_cafe_calibration: false,
            ..LoopConfig::default()
        };
        let learning = build_loop(dir.path(), config, "<h1>One</h1>");
        let report = learning.run_iteration().await;

        assert!(report.actions.contains(&"self_reminder".to_string()));
        let reminders = report.self_reminders.as_ref().unwrap();
        assert_eq!(reminders["reminded"], 1);
        assert_eq!(reminders["changed"], 0);
        assert!(dir
            .path()
            .join("data/logs/self_reminder_log.jsonl")
            .exists());
        // The daily digest force-refreshes the catalogue.
        let daily = report.daily_self_learning.as_ref().unwrap();
        assert_eq!(daily["self_reminder"]["refreshed_sources"], 1);
    }

    #[tokio::test]
    async fn disabled_self_reminder_skips_the_step() {
        let dir = tempdir().unwrap();
        let config = LoopConfig {
            enable_policy_bandit: false,
            enable_cafe_calibration: false,
            self_reminder_enabled: false,
            ..LoopConfig::default()
        };
        let learning = build_loop(dir.path(), config, "<h1>One</h1>");
        let report = learning.run_iteration().await;
        assert!(report.self_reminders.is_none());
        assert!(!report.actions.contains(&"self_reminder".to_string()));
    }

    #[tokio::test]
    async fn unavailable_sources_grow_the_learning_streak() {
        let dir = tempdir().unwrap();
        let config = LoopConfig {
            enable_policy_bandit: false,
            enable_cafe_calibration: false,
            ..LoopConfig::default()
        };
        // Body with no parsable titles yields an `unavailable` finding.
        let learning = build_loop(dir.path(), config, "");
        let report = learning.run_iteration().await;
        assert!(!report.self_check.learned_now);
        assert_eq!(report.self_check.no_learning_streak, 1);
        assert_eq!(report.v2_pipeline.created, 0);
    }

    #[test]
    fn canary_defaults_to_safe_mode() {
        let dir = tempdir().unwrap();
        let learning = build_loop(dir.path(), LoopConfig::default(), "<h1>x</h1>");
        let proposal = sample_proposal(RiskLevel::Low, 0.95);
        let (mode, reason) = learning.select_execution_mode(&proposal);
        assert_eq!(mode, ExecutionProfile::Safe);
        assert_eq!(reason, "default_safe_mode");
    }

    #[test]
    fn canary_blocks_on_risk_priority_and_real_apply() {
        let dir = tempdir().unwrap();
        let config = LoopConfig {
            execution_mode_default: ExecutionProfile::Normal,
            ..LoopConfig::default()
        };
        let learning = build_loop(dir.path(), config, "<h1>x</h1>");
        // Real apply is disabled in the default experiment config.
        let proposal = sample_proposal(RiskLevel::Low, 0.95);
        let (mode, reason) = learning.select_execution_mode(&proposal);
        assert_eq!(mode, ExecutionProfile::Safe);
        assert_eq!(reason, "real_apply_disabled");
    }

    #[test]
    fn normal_mode_loss_activates_cooldown() {
        let dir = tempdir().unwrap();
        let config = LoopConfig {
            execution_mode_default: ExecutionProfile::Normal,
            normal_mode_cooldown_secs: 1800,
            ..LoopConfig::default()
        };
        let learning = build_loop(dir.path(), config, "<h1>x</h1>");
        learning.record_normal_mode_outcome(Verdict::Loss, "pv2_x");
        let status = learning.status_report();
        assert_eq!(status["normal_mode"]["losses"], 1);
        assert!(!status["normal_mode"]["cooldown_until"].is_null());
        // While cooling down, even an eligible proposal stays safe.
        let proposal = sample_proposal(RiskLevel::Low, 0.95);
        let (_, reason) = learning.select_execution_mode(&proposal);
        // Real-apply is disabled first in this harness; cooldown check sits
        // behind it, so force the precondition by checking state directly.
        assert!(reason == "real_apply_disabled" || reason == "cooldown_active");
    }

    fn sample_proposal(risk_level: RiskLevel, priority: f64) -> ProposalV2 {
        ProposalV2 {
            id: "pv2_sample".into(),
            created_at: Utc::now(),
            approved_at: Some(Utc::now()),
            origin_event_ids: vec!["evt".into()],
            title: "sample".into(),
            hypothesis: "h".into(),
            plan_steps: Vec::new(),
            expected_impact: "i".into(),
            risk_level,
            status: ProposalStatus::Approved,
            confidence: 0.8,
            priority,
            signature: "sig".into(),
            metadata: IndexMap::new(),
        }
    }
}
