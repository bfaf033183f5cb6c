use std::path::PathBuf;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use nexus_memory::{load_json_or_default, save_json_atomic};

/// One level change in a skill's history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LevelChange {
    /// Previous level.
    pub from: u8,
    /// New level.
    pub to: u8,
    /// When the change happened.
    pub at: DateTime<Utc>,
}

/// Progression record for one skill, level 1–10.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRecord {
    /// Current level.
    pub level: u8,
    /// Executions recorded.
    pub total_executions: u64,
    /// Failed executions.
    pub total_failures: u64,
    /// Total time across executions.
    pub total_time_ms: f64,
    /// Fastest execution, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_time_ms: Option<f64>,
    /// Mean execution time.
    pub avg_time_ms: f64,
    /// Level ≥ 8 with ≥ 90% success.
    pub mastered: bool,
    /// Level ≥ 9 with ≥ 50 executions.
    pub can_delegate: bool,
    /// First execution time.
    pub first_execution: DateTime<Utc>,
    /// Most recent execution time.
    pub last_execution: DateTime<Utc>,
    /// Level promotions.
    #[serde(default)]
    pub level_history: Vec<LevelChange>,
}

impl SkillRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            level: 1,
            total_executions: 0,
            total_failures: 0,
            total_time_ms: 0.0,
            best_time_ms: None,
            avg_time_ms: 0.0,
            mastered: false,
            can_delegate: false,
            first_execution: now,
            last_execution: now,
            level_history: Vec::new(),
        }
    }

    /// Successful executions per execution.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.total_executions.max(1) as f64;
        (self.total_executions - self.total_failures) as f64 / total
    }
}

/// How a task should be approached given the skill data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// No experience: learn first.
    Learn,
    /// Beginner: learn, then execute cautiously.
    LearnThenExecute,
    /// Learning phase: execute with verification.
    ExecuteWithVerification,
    /// Proficient: execute.
    Execute,
    /// Mastered and proven: delegate.
    Delegate,
}

/// Recommendation for handling a task type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// The recommendation.
    pub recommendation: RecommendationKind,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Human-readable reason.
    pub reason: String,
    /// Suggested approach label.
    pub suggested_approach: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SkillsFile {
    #[serde(default)]
    skills: IndexMap<String, SkillRecord>,
}

/// Tracks per-skill levels, success rates, and recommendations.
pub struct SkillTracker {
    path: PathBuf,
    skills: Mutex<IndexMap<String, SkillRecord>>,
}

impl std::fmt::Debug for SkillTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillTracker")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SkillTracker {
    /// Opens the tracker, loading existing records.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file: SkillsFile = load_json_or_default(&path);
        Self {
            path,
            skills: Mutex::new(file.skills),
        }
    }

    /// Records one execution, updating counters, level, and flags.
    pub fn record_execution(&self, skill_name: &str, duration_ms: f64, success: bool) {
        let now = Utc::now();
        let mut skills = self.skills.lock();
        let record = skills
            .entry(skill_name.to_string())
            .or_insert_with(|| SkillRecord::new(now));

        record.total_executions += 1;
        record.total_time_ms += duration_ms.max(0.0);
        record.avg_time_ms = record.total_time_ms / record.total_executions as f64;
        record.last_execution = now;
        if !success {
            record.total_failures += 1;
        }
        if record.best_time_ms.map_or(true, |best| duration_ms < best) {
            record.best_time_ms = Some(duration_ms.max(0.0));
        }

        update_level(record, now);

        let snapshot = SkillsFile {
            skills: skills.clone(),
        };
        let _ = save_json_atomic(&self.path, &snapshot);
    }

    /// Snapshot of one skill.
    #[must_use]
    pub fn get(&self, skill_name: &str) -> Option<SkillRecord> {
        self.skills.lock().get(skill_name).cloned()
    }

    /// Per-skill summary for status surfaces.
    #[must_use]
    pub fn skill_report(&self) -> Value {
        let skills = self.skills.lock();
        let mut report = serde_json::Map::new();
        for (name, record) in skills.iter() {
            report.insert(
                name.clone(),
                json!({
                    "level": record.level,
                    "executions": record.total_executions,
                    "success_rate": record.success_rate(),
                    "avg_time_ms": record.avg_time_ms,
                    "best_time_ms": record.best_time_ms.unwrap_or(0.0),
                    "mastered": record.mastered,
                    "can_delegate": record.can_delegate,
                }),
            );
        }
        Value::Object(report)
    }

    /// How to handle a task of the given type.
    #[must_use]
    pub fn get_skill_recommendation(&self, task_type: &str) -> Recommendation {
        let skills = self.skills.lock();
        let Some(skill) = skills.get(task_type) else {
            return Recommendation {
                recommendation: RecommendationKind::Learn,
                confidence: 0.0,
                reason: format!("No experience with {task_type}"),
                suggested_approach: "cautious".into(),
            };
        };

        let level = skill.level;
        let success_rate = skill.success_rate();
        if skill.can_delegate {
            Recommendation {
                recommendation: RecommendationKind::Delegate,
                confidence: success_rate.min(1.0),
                reason: format!("Mastered skill (level {level}, {:.0}% success)", success_rate * 100.0),
                suggested_approach: "autonomous".into(),
            }
        } else if skill.mastered {
            Recommendation {
                recommendation: RecommendationKind::Execute,
                confidence: success_rate.min(1.0),
                reason: format!("High proficiency (level {level})"),
                suggested_approach: "confident".into(),
            }
        } else if level >= 5 && success_rate >= 0.7 {
            Recommendation {
                recommendation: RecommendationKind::Execute,
                confidence: success_rate * 0.8,
                reason: format!("Moderate proficiency (level {level})"),
                suggested_approach: "standard".into(),
            }
        } else if level >= 3 {
            Recommendation {
                recommendation: RecommendationKind::ExecuteWithVerification,
                confidence: success_rate * 0.5,
                reason: format!("Learning phase (level {level})"),
                suggested_approach: "careful".into(),
            }
        } else {
            Recommendation {
                recommendation: RecommendationKind::LearnThenExecute,
                confidence: (success_rate * 0.3).max(0.1),
                reason: format!(
                    "Beginner (level {level}, {} attempts)",
                    skill.total_executions
                ),
                suggested_approach: "cautious".into(),
            }
        }
    }

    /// Most relevant skill for a free-text task, by keyword match blended
    /// with level and success rate.
    #[must_use]
    pub fn get_best_skill_for_task(&self, task_description: &str) -> Option<String> {
        let task = task_description.to_lowercase();
        let skills = self.skills.lock();
        let mut best: Option<(String, f64)> = None;
        for (name, record) in skills.iter() {
            let words: Vec<String> = name
                .to_lowercase()
                .replace(['_', '-'], " ")
                .split_whitespace()
                .map(String::from)
                .collect();
            let matched = words.iter().filter(|w| task.contains(w.as_str())).count();
            if matched == 0 {
                continue;
            }
            let keyword_score = matched as f64 / words.len().max(1) as f64;
            let level_score = f64::from(record.level) / 10.0;
            let combined = keyword_score.mul_add(0.4, level_score.mul_add(0.3, record.success_rate() * 0.3));
            if best.as_ref().map_or(true, |(_, score)| combined > *score) {
                best = Some((name.clone(), combined));
            }
        }
        best.map(|(name, _)| name)
    }
}

/// Level = 1 + experience bonus + success bonus + speed bonus, each capped at
/// 3, total capped at 10. Promotion is recorded; demotion never happens.
fn update_level(record: &mut SkillRecord, now: DateTime<Utc>) {
    let success_rate = record.success_rate();
    let speed_factor = record
        .best_time_ms
        .map_or(0.0, |best| best / record.avg_time_ms.max(1.0));

    let experience_bonus = (record.total_executions / 10).min(3) as u8;
    let success_bonus = ((success_rate * 3.0) as u64).min(3) as u8;
    let speed_bonus = ((speed_factor * 3.0) as u64).min(3) as u8;
    let new_level = (1 + experience_bonus + success_bonus + speed_bonus).min(10);

    if new_level > record.level {
        record.level_history.push(LevelChange {
            from: record.level,
            to: new_level,
            at: now,
        });
        record.level = new_level;
    }

    if record.level >= 8 && success_rate >= 0.9 {
        record.mastered = true;
    }
    if record.level >= 9 && record.total_executions >= 50 {
        record.can_delegate = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tracker(dir: &std::path::Path) -> SkillTracker {
        SkillTracker::open(dir.join("skills.json"))
    }

    #[test]
    fn first_execution_creates_a_record() {
        let dir = tempdir().unwrap();
        let tracker = tracker(dir.path());
        tracker.record_execution("web_scraping", 120.0, true);
        let record = tracker.get("web_scraping").unwrap();
        assert_eq!(record.total_executions, 1);
        assert_eq!(record.total_failures, 0);
        assert!((record.avg_time_ms - 120.0).abs() < f64::EPSILON);
        assert_eq!(record.best_time_ms, Some(120.0));
    }

    #[test]
    fn tenth_execution_adds_the_experience_bonus() {
        let dir = tempdir().unwrap();
        let tracker = tracker(dir.path());
        for _ in 0..9 {
            tracker.record_execution("deploys", 100.0, true);
        }
        let before = tracker.get("deploys").unwrap().level;
        tracker.record_execution("deploys", 100.0, true);
        let after = tracker.get("deploys").unwrap().level;
        assert_eq!(after, before + 1);
        assert!(!tracker.get("deploys").unwrap().level_history.is_empty());
    }

    #[test]
    fn mastery_requires_level_and_success() {
        let dir = tempdir().unwrap();
        let tracker = tracker(dir.path());
        for _ in 0..10 {
            tracker.record_execution("parsing", 100.0, true);
        }
        let record = tracker.get("parsing").unwrap();
        assert!(record.level >= 8);
        assert!(record.mastered);
        assert!(!record.can_delegate);
    }

    #[test]
    fn delegation_requires_fifty_executions() {
        let dir = tempdir().unwrap();
        let tracker = tracker(dir.path());
        for _ in 0..50 {
            tracker.record_execution("formatting", 50.0, true);
        }
        let record = tracker.get("formatting").unwrap();
        assert!(record.can_delegate);
        let rec = tracker.get_skill_recommendation("formatting");
        assert_eq!(rec.recommendation, RecommendationKind::Delegate);
        assert_eq!(rec.suggested_approach, "autonomous");
    }

    #[test]
    fn unknown_skill_recommends_learning() {
        let dir = tempdir().unwrap();
        let tracker = tracker(dir.path());
        let rec = tracker.get_skill_recommendation("quantum_chemistry");
        assert_eq!(rec.recommendation, RecommendationKind::Learn);
        assert!((rec.confidence - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failures_lower_the_recommendation() {
        let dir = tempdir().unwrap();
        let tracker = tracker(dir.path());
        for i in 0..10 {
            tracker.record_execution("flaky_task", 100.0, i % 2 == 0);
        }
        let rec = tracker.get_skill_recommendation("flaky_task");
        assert!(matches!(
            rec.recommendation,
            RecommendationKind::ExecuteWithVerification | RecommendationKind::LearnThenExecute
        ));
    }

    #[test]
    fn best_skill_matches_keywords() {
        let dir = tempdir().unwrap();
        let tracker = tracker(dir.path());
        tracker.record_execution("web_scraping", 100.0, true);
        tracker.record_execution("file_cleanup", 100.0, true);
        let best = tracker.get_best_skill_for_task("scraping the docs from the web");
        assert_eq!(best.as_deref(), Some("web_scraping"));
        assert!(tracker.get_best_skill_for_task("unrelated work").is_none());
    }

    #[test]
    fn records_persist_across_reloads() {
        let dir = tempdir().unwrap();
        {
            let tracker = tracker(dir.path());
            tracker.record_execution("persisted", 75.0, true);
        }
        let reloaded = tracker(dir.path());
        assert_eq!(reloaded.get("persisted").unwrap().total_executions, 1);
    }
}
