use std::{
    env,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use shared_event_bus::EventBus;

/// A principle/guardrail file periodically re-read to prevent drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipleSource {
    /// Path relative to the project root.
    pub path: PathBuf,
    /// Display name.
    pub name: String,
    /// 1–10; higher means more critical.
    pub priority: u8,
    /// Seconds between reminders for this source.
    pub interval_secs: u64,
    /// Source category (e.g. `guardrails`, `learning`).
    pub category: String,
    /// Last time the source was read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    /// Hash of the content at the last read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl PrincipleSource {
    /// Creates a source with empty read state.
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        priority: u8,
        interval_secs: u64,
        category: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            priority: priority.clamp(1, 10),
            interval_secs,
            category: category.into(),
            last_read_at: None,
            content_hash: None,
        }
    }

    /// Whether the reminder interval has elapsed (or the source was never
    /// read).
    #[must_use]
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        self.last_read_at.map_or(true, |last| {
            (now - last).num_seconds() >= self.interval_secs as i64
        })
    }
}

/// The default principle catalogue. Higher-priority sources remind more
/// often.
#[must_use]
pub fn default_principle_sources() -> Vec<PrincipleSource> {
    vec![
        PrincipleSource::new(
            "docs/memory/USER_FEEDBACK_GUARDRAILS.md",
            "User Feedback Guardrails",
            10,
            900,
            "guardrails",
        ),
        PrincipleSource::new(
            "docs/memory/learning-principles.md",
            "Learning Principles",
            8,
            1800,
            "learning",
        ),
        PrincipleSource::new(
            "docs/memory/SELF_LEARNING_RUNBOOK.md",
            "Self-Learning Runbook",
            7,
            3600,
            "operations",
        ),
        PrincipleSource::new(
            "docs/memory/FEEDBACK_TRACK_LOG.md",
            "Feedback Track Log",
            6,
            3600,
            "feedback",
        ),
        PrincipleSource::new(
            "docs/memory/AUTO_PROGRESS.md",
            "Auto Progress",
            4,
            7200,
            "progress",
        ),
    ]
}

/// One reminder record, appended to the reminder log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderEvent {
    /// Reminder time.
    pub timestamp: DateTime<Utc>,
    /// Source name.
    pub source_name: String,
    /// Source path relative to the project root.
    pub source_path: PathBuf,
    /// Source category.
    pub category: String,
    /// Source priority.
    pub priority: u8,
    /// Content hash at this read.
    pub content_hash: String,
    /// Count of heading/bullet lines in the source.
    pub key_points_count: usize,
    /// Whether the content changed since the previous read.
    pub changed_since_last: bool,
    /// Seconds since the previous read (0 on the first).
    pub elapsed_since_last_secs: i64,
}

#[derive(Debug, Default)]
struct ReminderStats {
    total_reminders: u64,
    total_changes_detected: u64,
    last_cycle_at: Option<DateTime<Utc>>,
    last_cycle_count: usize,
}

/// Periodically re-reads principle files and records reminder events, so
/// the system keeps refreshing its own guardrails instead of drifting.
pub struct SelfReminder {
    enabled: bool,
    project_root: PathBuf,
    log_path: PathBuf,
    sources: Mutex<Vec<PrincipleSource>>,
    stats: Mutex<ReminderStats>,
    bus: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for SelfReminder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfReminder")
            .field("enabled", &self.enabled)
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}

impl SelfReminder {
    /// Creates the engine over the given catalogue.
    #[must_use]
    pub fn new(
        project_root: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
        sources: Vec<PrincipleSource>,
        enabled: bool,
    ) -> Self {
        Self {
            enabled,
            project_root: project_root.into(),
            log_path: log_path.into(),
            sources: Mutex::new(sources),
            stats: Mutex::new(ReminderStats::default()),
            bus: None,
        }
    }

    /// Reads the `SELF_REMINDER_ENABLED` switch (default on).
    #[must_use]
    pub fn enabled_from_env() -> bool {
        env::var("SELF_REMINDER_ENABLED").map_or(true, |raw| {
            matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on")
        })
    }

    /// Attaches an event bus; reminders emit `self_reminder.triggered`.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Whether reminders run at all.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Registers a source at runtime.
    pub fn add_source(&self, source: PrincipleSource) {
        self.sources.lock().push(source);
    }

    /// Removes a source by name. Returns whether it existed.
    pub fn remove_source(&self, name: &str) -> bool {
        let mut sources = self.sources.lock();
        let before = sources.len();
        sources.retain(|s| s.name != name);
        sources.len() < before
    }

    /// Reminds for every due source. The main entry point for the loop.
    pub fn check_and_remind(&self) -> Vec<ReminderEvent> {
        self.remind(false)
    }

    /// Reminds for every source regardless of schedule.
    pub fn force_remind_all(&self) -> Vec<ReminderEvent> {
        self.remind(true)
    }

    fn remind(&self, force: bool) -> Vec<ReminderEvent> {
        if !self.enabled {
            return Vec::new();
        }
        let now = Utc::now();
        let mut events = Vec::new();
        {
            let mut sources = self.sources.lock();
            for source in sources.iter_mut() {
                if !force && !source.due(now) {
                    continue;
                }
                if let Some(event) = self.process_source(source, now) {
                    events.push(event);
                }
            }
        }
        {
            let mut stats = self.stats.lock();
            stats.last_cycle_at = Some(now);
            stats.last_cycle_count = events.len();
        }
        events
    }

    /// Re-reads one source, updating its state. Missing or unreadable
    /// files are skipped silently; the schedule will retry them.
    fn process_source(&self, source: &mut PrincipleSource, now: DateTime<Utc>) -> Option<ReminderEvent> {
        let full_path = self.project_root.join(&source.path);
        let content = fs::read_to_string(full_path).ok()?;

        let new_hash = content_hash(&content);
        let changed = source
            .content_hash
            .as_ref()
            .is_some_and(|previous| previous != &new_hash);
        let elapsed = source
            .last_read_at
            .map_or(0, |last| (now - last).num_seconds().max(0));
        let key_points = content
            .lines()
            .map(str::trim)
            .filter(|line| {
                !line.is_empty()
                    && (line.starts_with('-') || line.starts_with('*') || line.starts_with('#'))
            })
            .count();

        source.last_read_at = Some(now);
        source.content_hash = Some(new_hash.clone());

        {
            let mut stats = self.stats.lock();
            stats.total_reminders += 1;
            if changed {
                stats.total_changes_detected += 1;
            }
        }

        let event = ReminderEvent {
            timestamp: now,
            source_name: source.name.clone(),
            source_path: source.path.clone(),
            category: source.category.clone(),
            priority: source.priority,
            content_hash: new_hash,
            key_points_count: key_points,
            changed_since_last: changed,
            elapsed_since_last_secs: elapsed,
        };

        let _ = append_log(&self.log_path, &event);
        if let Some(bus) = &self.bus {
            bus.emit(
                "self_reminder.triggered",
                json!({
                    "source": event.source_name,
                    "category": event.category,
                    "priority": event.priority,
                    "changed": event.changed_since_last,
                }),
            );
        }
        Some(event)
    }

    /// Status snapshot: engine totals plus per-source schedule state.
    #[must_use]
    pub fn status(&self) -> Value {
        let now = Utc::now();
        let sources = self.sources.lock();
        let source_rows: Vec<Value> = sources
            .iter()
            .map(|s| {
                let next_due_in = s.last_read_at.map_or(0, |last| {
                    (s.interval_secs as i64 - (now - last).num_seconds()).max(0)
                });
                json!({
                    "name": s.name,
                    "path": s.path,
                    "priority": s.priority,
                    "interval_secs": s.interval_secs,
                    "category": s.category,
                    "last_read_at": s.last_read_at,
                    "next_due_in_secs": next_due_in,
                    "content_hash": s.content_hash,
                })
            })
            .collect();
        let stats = self.stats.lock();
        json!({
            "enabled": self.enabled,
            "total_sources": sources.len(),
            "total_reminders": stats.total_reminders,
            "total_changes_detected": stats.total_changes_detected,
            "last_cycle_at": stats.last_cycle_at,
            "last_cycle_results_count": stats.last_cycle_count,
            "sources": source_rows,
        })
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

fn append_log(path: &Path, event: &ReminderEvent) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(event)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn principles(root: &Path, body: &str) -> PrincipleSource {
        let path = PathBuf::from("docs/principles.md");
        let full = root.join(&path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(&full, body).unwrap();
        PrincipleSource::new(path, "Principles", 9, 0, "guardrails")
    }

    fn reminder(root: &Path, sources: Vec<PrincipleSource>, enabled: bool) -> SelfReminder {
        SelfReminder::new(
            root,
            root.join("data/logs/self_reminder_log.jsonl"),
            sources,
            enabled,
        )
    }

    #[test]
    fn due_sources_are_read_and_logged() {
        let dir = tempdir().unwrap();
        let source = principles(dir.path(), "# Rules\n- stay safe\n- verify outcomes\nprose\n");
        let engine = reminder(dir.path(), vec![source], true);

        let events = engine.check_and_remind();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key_points_count, 3);
        assert!(!events[0].changed_since_last);
        assert_eq!(events[0].elapsed_since_last_secs, 0);

        let log = fs::read_to_string(dir.path().join("data/logs/self_reminder_log.jsonl")).unwrap();
        assert!(log.contains("Principles"));
        let status = engine.status();
        assert_eq!(status["total_reminders"], 1);
    }

    #[test]
    fn content_changes_are_detected() {
        let dir = tempdir().unwrap();
        let source = principles(dir.path(), "- old rule\n");
        let engine = reminder(dir.path(), vec![source], true);
        engine.check_and_remind();

        fs::write(dir.path().join("docs/principles.md"), "- new rule\n").unwrap();
        let events = engine.check_and_remind();
        assert_eq!(events.len(), 1);
        assert!(events[0].changed_since_last);
        assert_eq!(engine.status()["total_changes_detected"], 1);
    }

    #[test]
    fn interval_gates_rereads() {
        let dir = tempdir().unwrap();
        let mut source = principles(dir.path(), "- rule\n");
        source.interval_secs = 3600;
        let engine = reminder(dir.path(), vec![source], true);
        assert_eq!(engine.check_and_remind().len(), 1);
        // Not due again, but a forced pass still reads it.
        assert!(engine.check_and_remind().is_empty());
        assert_eq!(engine.force_remind_all().len(), 1);
    }

    #[test]
    fn missing_sources_are_skipped() {
        let dir = tempdir().unwrap();
        let engine = reminder(
            dir.path(),
            vec![PrincipleSource::new(
                "docs/absent.md",
                "Absent",
                5,
                0,
                "general",
            )],
            true,
        );
        assert!(engine.check_and_remind().is_empty());
    }

    #[test]
    fn disabled_engine_does_nothing() {
        let dir = tempdir().unwrap();
        let source = principles(dir.path(), "- rule\n");
        let engine = reminder(dir.path(), vec![source], false);
        assert!(engine.check_and_remind().is_empty());
        assert!(engine.force_remind_all().is_empty());
        assert!(!dir.path().join("data/logs/self_reminder_log.jsonl").exists());
    }

    #[test]
    fn sources_can_be_added_and_removed() {
        let dir = tempdir().unwrap();
        let engine = reminder(dir.path(), Vec::new(), true);
        engine.add_source(principles(dir.path(), "- rule\n"));
        assert_eq!(engine.check_and_remind().len(), 1);
        assert!(engine.remove_source("Principles"));
        assert!(!engine.remove_source("Principles"));
        assert!(engine.check_and_remind().is_empty());
    }

    #[test]
    fn default_catalogue_spans_categories() {
        let sources = default_principle_sources();
        assert_eq!(sources.len(), 5);
        assert!(sources.iter().any(|s| s.category == "guardrails"));
        assert!(sources.iter().all(|s| (1..=10).contains(&s.priority)));
    }
}
