use std::{env, path::PathBuf, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use shared_event_bus::EventBus;
use shared_logging::truncate;

use nexus_memory::{load_json_or_default, save_json_atomic, MemoryStore};

use crate::records::{
    ActionEntry, DecisionEntry, ErrorEntry, HealthReport, HealthStatus, Issue, IssueKind,
    MetricEntry, SessionStats, Severity,
};

const DURATION_WARNING_MS: u64 = 60_000;
const DURATION_CRITICAL_MS: u64 = 120_000;
const ERROR_RATE_CRITICAL: f64 = 0.10;
const QUALITY_WARNING: f64 = 6.0;
const QUALITY_CRITICAL: f64 = 4.0;
const REPEAT_ACTION_THRESHOLD: usize = 5;
const REPEAT_ACTION_WINDOW: usize = 20;
const ERROR_PATTERN_THRESHOLD: usize = 3;
const ERROR_PATTERN_WINDOW: usize = 10;
const DUPLICATE_ISSUE_COOLDOWN_SECS: i64 = 1800;

/// Action kinds expected to repeat; exempt from loop detection.
const EXPECTED_REPEATING: [&str; 8] = [
    "iteration",
    "health_check",
    "knowledge_scan",
    "save_state",
    "check_improvements",
    "heartbeat",
    "ping",
    "poll",
];

/// History caps, ENV-backed (`DEBUGGER_*_MAX`).
#[derive(Debug, Clone, Copy)]
pub struct DebuggerConfig {
    /// Sessions retained in the decision log.
    pub session_history_max: usize,
    /// Entries retained in the metrics history.
    pub metrics_history_max: usize,
    /// Resolved issues retained.
    pub resolved_issues_max: usize,
    /// Open issues retained.
    pub open_issues_max: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            session_history_max: 300,
            metrics_history_max: 1500,
            resolved_issues_max: 1000,
            open_issues_max: 500,
        }
    }
}

impl DebuggerConfig {
    /// Reads caps from the environment, keeping defaults on absence.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            session_history_max: env_usize("DEBUGGER_SESSION_HISTORY_MAX", defaults.session_history_max),
            metrics_history_max: env_usize("DEBUGGER_METRICS_HISTORY_MAX", defaults.metrics_history_max),
            resolved_issues_max: env_usize("DEBUGGER_RESOLVED_ISSUES_MAX", defaults.resolved_issues_max),
            open_issues_max: env_usize("DEBUGGER_OPEN_ISSUES_MAX", defaults.open_issues_max),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Session {
    start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<DateTime<Utc>>,
    decisions: Vec<DecisionEntry>,
    actions: Vec<ActionEntry>,
    errors: Vec<ErrorEntry>,
    metrics: Vec<MetricEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stats: Option<SessionStats>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DecisionLog {
    sessions: Vec<Session>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IssuesFile {
    issues: Vec<Issue>,
    resolved: Vec<Issue>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetricsFile {
    history: Vec<MetricsHistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetricsHistoryEntry {
    timestamp: DateTime<Utc>,
    stats: SessionStats,
}

/// Session-scoped observer of decisions, actions, errors, and metrics.
pub struct SelfDebugger {
    log_path: PathBuf,
    issues_path: PathBuf,
    metrics_path: PathBuf,
    config: DebuggerConfig,
    session: Mutex<Session>,
    file_lock: Mutex<()>,
    pattern_sink: Option<Arc<MemoryStore>>,
    bus: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for SelfDebugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfDebugger")
            .field("issues_path", &self.issues_path)
            .finish_non_exhaustive()
    }
}

impl SelfDebugger {
    /// Creates a debugger over the decision log, issues, and metrics files.
    #[must_use]
    pub fn new(
        log_path: impl Into<PathBuf>,
        issues_path: impl Into<PathBuf>,
        metrics_path: impl Into<PathBuf>,
        config: DebuggerConfig,
    ) -> Self {
        Self {
            log_path: log_path.into(),
            issues_path: issues_path.into(),
            metrics_path: metrics_path.into(),
            config,
            session: Mutex::new(Session {
                start_time: Some(Utc::now()),
                ..Session::default()
            }),
            file_lock: Mutex::new(()),
            pattern_sink: None,
            bus: None,
        }
    }

    /// Attaches a pattern sink; recurring error patterns are recorded there.
    #[must_use]
    pub fn with_pattern_sink(mut self, sink: Arc<MemoryStore>) -> Self {
        self.pattern_sink = Some(sink);
        self
    }

    /// Attaches an event bus; issue creation emits `debugger.issue` events.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Logs a decision; returns its index in the session.
    pub fn log_decision(
        &self,
        agent: &str,
        kind: &str,
        description: &str,
        reasoning: Option<&str>,
        alternatives: Vec<String>,
        confidence: f64,
    ) -> usize {
        let entry = DecisionEntry {
            timestamp: Utc::now(),
            agent: truncate(agent, 50),
            kind: truncate(kind, 50),
            description: truncate(description, 500),
            reasoning: reasoning.map(|r| truncate(r, 500)),
            alternatives: alternatives.into_iter().take(5).collect(),
            confidence: confidence.clamp(0.0, 1.0),
        };
        let mut session = self.session.lock();
        session.decisions.push(entry);
        session.decisions.len() - 1
    }

    /// Logs an action and runs anomaly checks.
    pub fn log_action(
        &self,
        agent: &str,
        kind: &str,
        details: Value,
        success: bool,
        duration_ms: u64,
        tokens_used: u64,
    ) {
        let entry = ActionEntry {
            timestamp: Utc::now(),
            agent: truncate(agent, 50),
            kind: truncate(kind, 50),
            details,
            success,
            duration_ms,
            tokens_used,
        };
        let repeats = {
            let mut session = self.session.lock();
            session.actions.push(entry.clone());
            let window_start = session.actions.len().saturating_sub(REPEAT_ACTION_WINDOW);
            session.actions[window_start..]
                .iter()
                .filter(|a| a.kind == entry.kind && a.agent == entry.agent)
                .count()
        };
        self.check_action_anomalies(&entry, repeats);
    }

    /// Logs an error and runs recurring-pattern checks.
    pub fn log_error(&self, agent: &str, kind: &str, message: &str, context: Value, recoverable: bool) {
        let entry = ErrorEntry {
            timestamp: Utc::now(),
            agent: truncate(agent, 50),
            kind: truncate(kind, 50),
            message: truncate(message, 500),
            context,
            recoverable,
        };
        let same_kind = {
            let mut session = self.session.lock();
            session.errors.push(entry.clone());
            let window_start = session.errors.len().saturating_sub(ERROR_PATTERN_WINDOW);
            session.errors[window_start..]
                .iter()
                .filter(|e| e.kind == entry.kind)
                .count()
        };
        if same_kind >= ERROR_PATTERN_THRESHOLD {
            if let Some(sink) = &self.pattern_sink {
                let _ = sink.record_pattern(
                    "error_pattern",
                    json!({
                        "error_type": entry.kind,
                        "agent": entry.agent,
                        "frequency": same_kind,
                    }),
                    0.0,
                );
            }
            self.create_issue(
                IssueKind::Error,
                Severity::High,
                "Recurring error pattern",
                &format!("{} occurred {same_kind} times", entry.kind),
                Some(&entry.agent),
            );
        }
    }

    /// Logs a metric sample and checks thresholds.
    pub fn log_metric(&self, name: &str, value: f64, agent: Option<&str>, tags: Value) {
        let entry = MetricEntry {
            timestamp: Utc::now(),
            name: truncate(name, 50),
            value,
            agent: agent.map(|a| truncate(a, 50)),
            tags,
        };
        self.session.lock().metrics.push(entry.clone());
        self.check_metric_thresholds(&entry);
    }

    fn check_action_anomalies(&self, action: &ActionEntry, repeats: usize) {
        if action.duration_ms >= DURATION_CRITICAL_MS {
            self.create_issue(
                IssueKind::Performance,
                Severity::Critical,
                "Very slow action detected",
                &format!(
                    "{} took {:.1}s for {}",
                    action.agent,
                    action.duration_ms as f64 / 1000.0,
                    action.kind
                ),
                Some(&action.agent),
            );
        } else if action.duration_ms >= DURATION_WARNING_MS {
            self.create_issue(
                IssueKind::Performance,
                Severity::Medium,
                "Slow action detected",
                &format!("{} took {:.1}s", action.agent, action.duration_ms as f64 / 1000.0),
                Some(&action.agent),
            );
        }

        if EXPECTED_REPEATING.contains(&action.kind.as_str()) {
            return;
        }
        if repeats >= REPEAT_ACTION_THRESHOLD {
            self.create_issue(
                IssueKind::Behavior,
                Severity::High,
                "Possible infinite loop detected",
                &format!("{} repeated {} {repeats} times", action.agent, action.kind),
                Some(&action.agent),
            );
        }
    }

    fn check_metric_thresholds(&self, metric: &MetricEntry) {
        match metric.name.as_str() {
            "quality_score" => {
                if metric.value < QUALITY_CRITICAL {
                    self.create_issue(
                        IssueKind::Quality,
                        Severity::Critical,
                        "Critical quality drop",
                        &format!("Quality score: {}", metric.value),
                        metric.agent.as_deref(),
                    );
                } else if metric.value < QUALITY_WARNING {
                    self.create_issue(
                        IssueKind::Quality,
                        Severity::Medium,
                        "Quality below target",
                        &format!("Quality score: {}", metric.value),
                        metric.agent.as_deref(),
                    );
                }
            }
            "error_rate" if metric.value > ERROR_RATE_CRITICAL => {
                self.create_issue(
                    IssueKind::Error,
                    Severity::Critical,
                    "High error rate",
                    &format!("Error rate: {:.1}%", metric.value * 100.0),
                    metric.agent.as_deref(),
                );
            }
            _ => {}
        }
    }

    /// Creates an issue, merging into a matching open issue seen within the
    /// duplicate cooldown instead of creating noise.
    pub fn create_issue(
        &self,
        kind: IssueKind,
        severity: Severity,
        title: &str,
        description: &str,
        affected_agent: Option<&str>,
    ) -> Issue {
        let _guard = self.file_lock.lock();
        let mut data: IssuesFile = load_json_or_default(&self.issues_path);
        let now = Utc::now();
        let title = truncate(title, 100);
        let agent = affected_agent.map(|a| truncate(a, 50));

        for existing in &mut data.issues {
            if existing.status != "open"
                || existing.kind != kind
                || existing.title != title
                || existing.affected_agent != agent
            {
                continue;
            }
            if now - existing.timestamp <= Duration::seconds(DUPLICATE_ISSUE_COOLDOWN_SECS) {
                existing.occurrence_count += 1;
                existing.last_seen = now;
                let merged = existing.clone();
                let _ = save_json_atomic(&self.issues_path, &data);
                return merged;
            }
        }

        let issue = Issue {
            id: issue_id(&title, description, agent.as_deref(), now),
            timestamp: now,
            kind,
            severity,
            title,
            description: truncate(description, 500),
            affected_agent: agent,
            status: "open".into(),
            occurrence_count: 1,
            last_seen: now,
            fix_proposal: kind.fix_proposal(),
            resolved_at: None,
            resolution: None,
        };
        data.issues.push(issue.clone());
        if self.config.open_issues_max > 0 && data.issues.len() > self.config.open_issues_max {
            let excess = data.issues.len() - self.config.open_issues_max;
            data.issues.drain(..excess);
        }
        let _ = save_json_atomic(&self.issues_path, &data);
        if let Some(bus) = &self.bus {
            bus.emit(
                "debugger.issue",
                json!({"id": issue.id, "severity": issue.severity, "title": issue.title}),
            );
        }
        issue
    }

    /// All open issues.
    #[must_use]
    pub fn open_issues(&self) -> Vec<Issue> {
        let _guard = self.file_lock.lock();
        let data: IssuesFile = load_json_or_default(&self.issues_path);
        data.issues.into_iter().filter(|i| i.status == "open").collect()
    }

    /// Marks an issue resolved. Returns whether it existed.
    pub fn resolve_issue(&self, issue_id: &str, resolution: Option<&str>) -> bool {
        let _guard = self.file_lock.lock();
        let mut data: IssuesFile = load_json_or_default(&self.issues_path);
        let Some(pos) = data.issues.iter().position(|i| i.id == issue_id) else {
            return false;
        };
        let mut issue = data.issues.remove(pos);
        issue.status = "resolved".into();
        issue.resolved_at = Some(Utc::now());
        issue.resolution = resolution.map(String::from);
        data.resolved.push(issue);
        if self.config.resolved_issues_max > 0 && data.resolved.len() > self.config.resolved_issues_max {
            let excess = data.resolved.len() - self.config.resolved_issues_max;
            data.resolved.drain(..excess);
        }
        let _ = save_json_atomic(&self.issues_path, &data);
        true
    }

    /// Health report: 100 minus weighted open-issue penalties, with the most
    /// recent session stats and the worst open issues attached.
    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        let open = self.open_issues();
        let open_count = open.len();
        let critical = open.iter().filter(|i| i.severity == Severity::Critical).count();
        let high = open.iter().filter(|i| i.severity == Severity::High).count();
        let medium = open.iter().filter(|i| i.severity == Severity::Medium).count();

        let mut score = 100.0;
        score -= critical as f64 * 20.0;
        score -= high as f64 * 10.0;
        score -= medium as f64 * 5.0;
        let health_score = score.clamp(0.0, 100.0);

        let status = if health_score >= 80.0 {
            HealthStatus::Healthy
        } else if health_score >= 50.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        };

        let metrics: MetricsFile = {
            let _guard = self.file_lock.lock();
            load_json_or_default(&self.metrics_path)
        };
        let recent_stats = metrics.history.last().map(|h| h.stats).unwrap_or_default();

        let mut top = open;
        top.sort_by_key(|i| i.severity.sort_weight());
        top.truncate(5);

        HealthReport {
            health_score,
            status,
            open_issues: open_count,
            critical_issues: critical,
            recent_stats,
            top_issues: top,
        }
    }

    /// Statistics of the in-flight session.
    #[must_use]
    pub fn session_stats(&self) -> SessionStats {
        let session = self.session.lock();
        compute_stats(&session)
    }

    /// Ends the session: persists it with its stats, appends to the metrics
    /// history, and starts a fresh session. Returns the stats.
    pub fn end_session(&self) -> SessionStats {
        let finished = {
            let mut session = self.session.lock();
            let mut finished = std::mem::take(&mut *session);
            session.start_time = Some(Utc::now());
            finished.end_time = Some(Utc::now());
            let stats = compute_stats(&finished);
            finished.stats = Some(stats);
            finished
        };
        let stats = finished.stats.unwrap_or_default();

        let _guard = self.file_lock.lock();
        let mut log: DecisionLog = load_json_or_default(&self.log_path);
        log.sessions.push(finished);
        if self.config.session_history_max > 0 && log.sessions.len() > self.config.session_history_max {
            let excess = log.sessions.len() - self.config.session_history_max;
            log.sessions.drain(..excess);
        }
        let _ = save_json_atomic(&self.log_path, &log);

        let mut metrics: MetricsFile = load_json_or_default(&self.metrics_path);
        metrics.history.push(MetricsHistoryEntry {
            timestamp: Utc::now(),
            stats,
        });
        if self.config.metrics_history_max > 0 && metrics.history.len() > self.config.metrics_history_max {
            let excess = metrics.history.len() - self.config.metrics_history_max;
            metrics.history.drain(..excess);
        }
        let _ = save_json_atomic(&self.metrics_path, &metrics);

        stats
    }
}

fn compute_stats(session: &Session) -> SessionStats {
    let actions = &session.actions;
    let total_actions = actions.len();
    let denom = total_actions.max(1) as f64;
    let durations: Vec<u64> = actions
        .iter()
        .map(|a| a.duration_ms)
        .filter(|d| *d > 0)
        .collect();
    let avg_duration_ms = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<u64>() as f64 / durations.len() as f64
    };
    SessionStats {
        total_decisions: session.decisions.len(),
        total_actions,
        total_errors: session.errors.len(),
        error_rate: session.errors.len() as f64 / denom,
        avg_duration_ms,
        total_tokens: actions.iter().map(|a| a.tokens_used).sum(),
        success_rate: actions.iter().filter(|a| a.success).count() as f64 / denom,
    }
}

fn issue_id(title: &str, description: &str, agent: Option<&str>, now: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(description.as_bytes());
    hasher.update(agent.unwrap_or_default().as_bytes());
    let digest = hasher.finalize();
    let tag = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 100_000;
    format!("issue_{}_{tag:05}", now.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn debugger(dir: &std::path::Path) -> SelfDebugger {
        SelfDebugger::new(
            dir.join("decision_log.json"),
            dir.join("issues.json"),
            dir.join("metrics.json"),
            DebuggerConfig::default(),
        )
    }

    #[test]
    fn slow_action_creates_performance_issue() {
        let dir = tempdir().unwrap();
        let debugger = debugger(dir.path());
        debugger.log_action("worker", "compile", Value::Null, true, 130_000, 0);
        let issues = debugger.open_issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Critical);
        assert_eq!(issues[0].kind, IssueKind::Performance);
    }

    #[test]
    fn repeat_threshold_needs_five_occurrences() {
        let dir = tempdir().unwrap();
        let debugger = debugger(dir.path());
        for _ in 0..4 {
            debugger.log_action("agent", "custom_probe", Value::Null, true, 10, 0);
        }
        assert!(debugger.open_issues().is_empty());
        debugger.log_action("agent", "custom_probe", Value::Null, true, 10, 0);
        let issues = debugger.open_issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::Behavior);
    }

    #[test]
    fn expected_repeating_actions_are_exempt() {
        let dir = tempdir().unwrap();
        let debugger = debugger(dir.path());
        for _ in 0..10 {
            debugger.log_action("loop", "heartbeat", Value::Null, true, 5, 0);
        }
        assert!(debugger.open_issues().is_empty());
    }

    #[test]
    fn duplicate_issues_merge_within_cooldown() {
        let dir = tempdir().unwrap();
        let debugger = debugger(dir.path());
        debugger.create_issue(IssueKind::Error, Severity::High, "Recurring", "desc", Some("a"));
        debugger.create_issue(IssueKind::Error, Severity::High, "Recurring", "desc", Some("a"));
        let issues = debugger.open_issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].occurrence_count, 2);
    }

    #[test]
    fn recurring_errors_raise_an_issue() {
        let dir = tempdir().unwrap();
        let debugger = debugger(dir.path());
        for _ in 0..3 {
            debugger.log_error("agent", "timeout", "deadline exceeded", Value::Null, true);
        }
        let issues = debugger.open_issues();
        assert!(issues.iter().any(|i| i.title == "Recurring error pattern"));
    }

    #[test]
    fn health_score_penalises_open_issues() {
        let dir = tempdir().unwrap();
        let debugger = debugger(dir.path());
        debugger.create_issue(IssueKind::Quality, Severity::Critical, "q", "d", None);
        debugger.create_issue(IssueKind::Error, Severity::High, "e", "d", None);
        let report = debugger.health_report();
        assert!((report.health_score - 70.0).abs() < f64::EPSILON);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.critical_issues, 1);
    }

    #[test]
    fn metric_thresholds_fire() {
        let dir = tempdir().unwrap();
        let debugger = debugger(dir.path());
        debugger.log_metric("quality_score", 3.0, Some("agent"), Value::Null);
        debugger.log_metric("error_rate", 0.2, Some("agent"), Value::Null);
        let issues = debugger.open_issues();
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.severity == Severity::Critical));
    }

    #[test]
    fn end_session_records_stats() {
        let dir = tempdir().unwrap();
        let debugger = debugger(dir.path());
        debugger.log_action("a", "write_file", Value::Null, true, 100, 10);
        debugger.log_action("a", "read_file", Value::Null, false, 300, 5);
        debugger.log_error("a", "io", "denied", Value::Null, true);
        let stats = debugger.end_session();
        assert_eq!(stats.total_actions, 2);
        assert!((stats.error_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.avg_duration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(stats.total_tokens, 15);
        // A fresh session begins.
        assert_eq!(debugger.session_stats().total_actions, 0);
        // Health report picks up the recorded stats.
        let report = debugger.health_report();
        assert_eq!(report.recent_stats.total_actions, 2);
    }
}
