use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Result;

/// Resolved data-directory layout rooted at the project directory.
///
/// The layout is a stable on-disk contract; components receive the specific
/// paths they need rather than a back-pointer to a monolithic brain.
#[derive(Debug, Clone)]
pub struct NexusPaths {
    root: PathBuf,
}

impl NexusPaths {
    /// Creates the layout rooted at `root` (the project directory).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates every directory of the layout.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.brain_dir(),
            self.memory_dir(),
            self.experiments_dir(),
            self.state_dir(),
            self.backups_dir(),
            self.logs_dir(),
            self.loop_dir(),
            self.workspace_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// `data/brain/` — knowledge, findings, action history, debugger files.
    #[must_use]
    pub fn brain_dir(&self) -> PathBuf {
        self.root.join("data").join("brain")
    }

    /// `data/memory/` — learning events, proposals, evidence.
    #[must_use]
    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("data").join("memory")
    }

    /// `data/experiments/` — experiment runs.
    #[must_use]
    pub fn experiments_dir(&self) -> PathBuf {
        self.root.join("data").join("experiments")
    }

    /// `data/state/` — loop state, policy state, locks.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("data").join("state")
    }

    /// `data/backups/` — backup archives.
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("data").join("backups")
    }

    /// `data/logs/` — daily note and self-learning logs.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("data").join("logs")
    }

    /// `data/loop/` — autonomous loop state.
    #[must_use]
    pub fn loop_dir(&self) -> PathBuf {
        self.root.join("data").join("loop")
    }

    /// `workspace/` — default mutable root for actions.
    #[must_use]
    pub fn workspace_dir(&self) -> PathBuf {
        self.root.join("workspace")
    }

    /// Knowledge items, one per line.
    #[must_use]
    pub fn knowledge_file(&self) -> PathBuf {
        self.brain_dir().join("knowledge.jsonl")
    }

    /// Learned behavioural patterns.
    #[must_use]
    pub fn patterns_file(&self) -> PathBuf {
        self.brain_dir().join("patterns.jsonl")
    }

    /// Durable event-bus sink.
    #[must_use]
    pub fn events_file(&self) -> PathBuf {
        self.brain_dir().join("events.jsonl")
    }

    /// Approval/denial feedback records.
    #[must_use]
    pub fn feedback_file(&self) -> PathBuf {
        self.brain_dir().join("feedback.jsonl")
    }

    /// Action results, output capped at 2 KB.
    #[must_use]
    pub fn action_history_file(&self) -> PathBuf {
        self.brain_dir().join("action_history.jsonl")
    }

    /// Scout findings.
    #[must_use]
    pub fn findings_file(&self) -> PathBuf {
        self.brain_dir().join("findings.jsonl")
    }

    /// Per-source scan state.
    #[must_use]
    pub fn sources_file(&self) -> PathBuf {
        self.brain_dir().join("sources.json")
    }

    /// Tasks created through the action surface.
    #[must_use]
    pub fn tasks_file(&self) -> PathBuf {
        self.brain_dir().join("tasks.json")
    }

    /// Skill progression records.
    #[must_use]
    pub fn skills_file(&self) -> PathBuf {
        self.brain_dir().join("skills.json")
    }

    /// Debugger session log.
    #[must_use]
    pub fn decision_log_file(&self) -> PathBuf {
        self.brain_dir().join("decision_log.json")
    }

    /// Open and resolved issues.
    #[must_use]
    pub fn issues_file(&self) -> PathBuf {
        self.brain_dir().join("issues.json")
    }

    /// Session metrics history.
    #[must_use]
    pub fn metrics_file(&self) -> PathBuf {
        self.brain_dir().join("metrics.json")
    }

    /// Learning events, append-only.
    #[must_use]
    pub fn learning_events_file(&self) -> PathBuf {
        self.memory_dir().join("learning_events.jsonl")
    }

    /// Proposal v2 store.
    #[must_use]
    pub fn proposals_file(&self) -> PathBuf {
        self.memory_dir().join("improvement_proposals_v2.json")
    }

    /// Outcome evidence, append-only.
    #[must_use]
    pub fn evidence_file(&self) -> PathBuf {
        self.memory_dir().join("outcome_evidence.jsonl")
    }

    /// Experiment runs.
    #[must_use]
    pub fn runs_file(&self) -> PathBuf {
        self.experiments_dir().join("experiment_runs_v2.json")
    }

    /// Bandit policy state.
    #[must_use]
    pub fn policy_state_file(&self) -> PathBuf {
        self.state_dir().join("learning_policy_state.json")
    }

    /// Learning loop iteration state.
    #[must_use]
    pub fn learning_state_file(&self) -> PathBuf {
        self.state_dir().join("learning_state.json")
    }

    /// CAFE calibration state.
    #[must_use]
    pub fn cafe_state_file(&self) -> PathBuf {
        self.state_dir().join("cafe_state.json")
    }

    /// Advisory lock for knowledge scans.
    #[must_use]
    pub fn scan_lock(&self) -> PathBuf {
        self.state_dir().join("knowledge_scan.lock")
    }

    /// Advisory lock for improvement application.
    #[must_use]
    pub fn improvement_lock(&self) -> PathBuf {
        self.state_dir().join("improvement_apply.lock")
    }

    /// Advisory lock for the daily self-learning cycle.
    #[must_use]
    pub fn daily_lock(&self) -> PathBuf {
        self.state_dir().join("daily_self_learning.lock")
    }

    /// Self-reminder cycle log.
    #[must_use]
    pub fn self_reminder_log_file(&self) -> PathBuf {
        self.logs_dir().join("self_reminder_log.jsonl")
    }

    /// Autonomous loop queue state.
    #[must_use]
    pub fn loop_state_file(&self) -> PathBuf {
        self.loop_dir().join("loop_state.json")
    }

    /// Completed autonomous loop tasks.
    #[must_use]
    pub fn completed_tasks_file(&self) -> PathBuf {
        self.loop_dir().join("completed_tasks.json")
    }
}
