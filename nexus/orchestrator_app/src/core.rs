//! Construction of the core components, once, in dependency order.
//!
//! Components receive `Arc` handles to exactly what they need; there is no
//! global mutable state and no back-pointer to a monolithic brain.

use std::{env, path::Path, sync::Arc};

use anyhow::{Context, Result};
use serde_json::Value;
use shared_event_bus::EventBus;

use nexus_actions::{
    ActionExecutor, ExecutionMode, ExecutorConfig, HandlerContext, KnowledgeBridge, PolicyGate,
};
use nexus_autonomy::{AutonomousLoop, FeedbackRecorder, LearningAnalyzer, TargetVerifier};
use nexus_gateway::{RateLimiter, RateLimiterConfig, RequestMetrics};
use nexus_knowledge::{default_sources, HttpFetcher, KnowledgeScout, ScoutConfig};
use nexus_learning::{
    CafeCalibrator, CafeConfig, CafeScorer, CalibratorConfig, ExperimentConfig, ExperimentExecutor,
    HeuristicAdvisor, LearningLoop, LoopConfig, LoopDeps, OutcomeVerifier, PolicyBandit,
    ProposalConfig, ProposalEngineV2, SkillTracker, VerifierConfig,
};
use nexus_memory::{BackupManager, MemoryGovernor, MemoryStore, NexusPaths, StorageV2};
use nexus_metacognition::{
    default_principle_sources, DebuggerConfig, SelfDebugger, SelfReminder,
};

/// Knowledge bridge backed by the memory store.
struct StoreBridge {
    store: Arc<MemoryStore>,
}

impl KnowledgeBridge for StoreBridge {
    fn learn(
        &self,
        source: &str,
        kind: &str,
        title: &str,
        content: &str,
        url: Option<String>,
        relevance: f64,
    ) -> Result<String> {
        Ok(self
            .store
            .learn(source, kind, title, content, url, relevance, Vec::new())?)
    }

    fn query(&self, query: &str, limit: usize) -> Vec<Value> {
        self.store
            .search(query, limit)
            .into_iter()
            .filter_map(|hit| serde_json::to_value(hit.item).ok())
            .collect()
    }
}

/// Every long-lived component, wired once at startup.
pub struct CoreContext {
    /// Filesystem layout.
    pub paths: NexusPaths,
    /// Event bus (durable sink into `events.jsonl`).
    pub bus: Arc<EventBus>,
    /// Memory store.
    pub store: Arc<MemoryStore>,
    /// Learning storage.
    pub storage: Arc<StorageV2>,
    /// Self-debugger.
    pub debugger: Arc<SelfDebugger>,
    /// Self-reminder engine.
    pub reminder: Arc<SelfReminder>,
    /// Action executor.
    pub actions: Arc<ActionExecutor>,
    /// Knowledge scout.
    pub scout: Arc<KnowledgeScout>,
    /// Skill tracker.
    pub skills: Arc<SkillTracker>,
    /// Learning loop driver.
    pub learning: Arc<LearningLoop>,
    /// Autonomous task loop.
    pub autonomous: Arc<AutonomousLoop>,
    /// API rate limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// API request metrics.
    pub metrics: Arc<RequestMetrics>,
    /// Backup manager.
    pub backups: BackupManager,
}

impl CoreContext {
    /// Builds the full control plane rooted at `root`.
    pub fn build(root: &Path) -> Result<Self> {
        let paths = NexusPaths::new(root);
        paths.ensure().context("creating data layout")?;

        let bus = Arc::new(
            EventBus::with_sink(paths.events_file()).context("opening event sink")?,
        );

        let store = Arc::new(
            MemoryStore::open(
                paths.knowledge_file(),
                paths.patterns_file(),
                paths.feedback_file(),
            )
            .context("opening memory store")?
            .with_bus(Arc::clone(&bus)),
        );
        let storage = Arc::new(StorageV2::open(&paths).context("opening learning storage")?);

        let debugger = Arc::new(
            SelfDebugger::new(
                paths.decision_log_file(),
                paths.issues_file(),
                paths.metrics_file(),
                DebuggerConfig::from_env(),
            )
            .with_pattern_sink(Arc::clone(&store))
            .with_bus(Arc::clone(&bus)),
        );

        let reminder = Arc::new(
            SelfReminder::new(
                root,
                paths.self_reminder_log_file(),
                default_principle_sources(),
                SelfReminder::enabled_from_env(),
            )
            .with_bus(Arc::clone(&bus)),
        );

        let gate = PolicyGate::new(
            ExecutionMode::from_env(),
            vec![
                paths.workspace_dir(),
                root.join("data"),
                root.join("src"),
            ],
        );
        let actions = Arc::new(
            ActionExecutor::new(
                gate,
                HandlerContext {
                    project_root: root.to_path_buf(),
                    workspace: paths.workspace_dir(),
                    tasks_file: paths.tasks_file(),
                    http: reqwest::Client::new(),
                    knowledge: Some(Arc::new(StoreBridge {
                        store: Arc::clone(&store),
                    })),
                },
                paths.action_history_file(),
                ExecutorConfig::default(),
            )
            .with_bus(Arc::clone(&bus)),
        );

        let scorer = Arc::new(
            CafeScorer::new(CafeConfig::from_env()).with_state_file(&paths.cafe_state_file()),
        );
        let scout = Arc::new(
            KnowledgeScout::new(
                default_sources(),
                Arc::new(HttpFetcher::new().context("building scout fetcher")?),
                paths.findings_file(),
                paths.sources_file(),
                ScoutConfig::default(),
            )
            .with_store(Arc::clone(&store))
            .with_bus(Arc::clone(&bus)),
        );

        let proposals = Arc::new(ProposalEngineV2::new(
            Arc::clone(&storage),
            Arc::clone(&scorer),
            ProposalConfig::from_env(),
        ));
        let executor = Arc::new(ExperimentExecutor::new(
            Arc::clone(&storage),
            Arc::clone(&proposals),
            Arc::clone(&debugger),
            ExperimentConfig::from_env(),
        ));
        let verifier = Arc::new(OutcomeVerifier::new(
            Arc::clone(&storage),
            Arc::clone(&proposals),
            Arc::clone(&debugger),
            Arc::clone(&scorer),
            VerifierConfig::from_env(),
        ));
        let bandit = Arc::new(PolicyBandit::new(Arc::clone(&storage)));
        let calibrator = Arc::new(CafeCalibrator::new(
            Arc::clone(&storage),
            paths.cafe_state_file(),
            CalibratorConfig::from_env(),
        ));
        let governor = Arc::new(MemoryGovernor::new());
        let skills = Arc::new(SkillTracker::open(paths.skills_file()));

        let learning = Arc::new(
            LearningLoop::new(
                LoopDeps {
                    paths: paths.clone(),
                    scout: Arc::clone(&scout),
                    store: Arc::clone(&store),
                    storage: Arc::clone(&storage),
                    debugger: Arc::clone(&debugger),
                    reminder: Some(Arc::clone(&reminder)),
                    proposals: Arc::clone(&proposals),
                    executor: Arc::clone(&executor),
                    verifier: Arc::clone(&verifier),
                    bandit,
                    calibrator,
                    scorer: Arc::clone(&scorer),
                    governor,
                    bus: Some(Arc::clone(&bus)),
                },
                LoopConfig::from_env(),
            )
            .context("restoring learning loop state")?,
        );

        let autonomous = Arc::new(
            AutonomousLoop::new(
                TargetVerifier::new().context("building target verifier")?,
                LearningAnalyzer::new().with_advisor(Arc::new(HeuristicAdvisor)),
                Arc::clone(&storage),
                paths.loop_state_file(),
                paths.completed_tasks_file(),
                root,
            )
            .with_feedback(Arc::new(FeedbackRecorder::new(Arc::clone(&store))))
            .with_skills(Arc::clone(&skills))
            .with_bus(Arc::clone(&bus)),
        );

        let backup_dir = env::var("NEXUS_BACKUP_DIR")
            .map_or_else(|_| paths.backups_dir(), Into::into);
        let max_backups = env::var("NEXUS_MAX_BACKUPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let backups = BackupManager::new(paths.brain_dir(), backup_dir, max_backups);

        Ok(Self {
            paths,
            bus,
            store,
            storage,
            debugger,
            reminder,
            actions,
            scout,
            skills,
            learning,
            autonomous,
            rate_limiter: Arc::new(RateLimiter::new(RateLimiterConfig::default())),
            metrics: Arc::new(RequestMetrics::new()),
            backups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn build_wires_the_full_control_plane() {
        let dir = tempdir().unwrap();
        let core = CoreContext::build(dir.path()).unwrap();
        assert!(core.paths.brain_dir().is_dir());
        assert_eq!(core.autonomous.pending_tasks(), 0);
        assert!(core.store.is_empty());
        let health = core.debugger.health_report();
        assert!((health.health_score - 100.0).abs() < f64::EPSILON);
    }
}
