use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::store::hex_prefix;

/// Retention category for TTL pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetentionCategory {
    /// Learning events (30 days).
    LearningEvent,
    /// Proposals (60 days).
    Proposal,
    /// Outcome evidence (180 days).
    Evidence,
    /// Everything else (90 days).
    Default,
}

impl RetentionCategory {
    const fn ttl_days(self) -> i64 {
        match self {
            Self::LearningEvent => 30,
            Self::Proposal => 60,
            Self::Evidence => 180,
            Self::Default => 90,
        }
    }
}

/// Governance for long-running memory: dedup of immediate repeats and TTL
/// pruning per category.
#[derive(Debug, Default)]
pub struct MemoryGovernor {
    recent_signatures: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryGovernor {
    /// Creates a governor with no remembered signatures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dedup signature over a payload's identifying fields.
    #[must_use]
    pub fn signature(source: &str, event_type: &str, content: &str) -> String {
        let head: String = content.chars().take(180).collect();
        let base = format!("{source}|{event_type}|{head}").to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(base.as_bytes());
        hex_prefix(&hasher.finalize(), 16)
    }

    /// Whether the payload should be kept. Immediate repeats of the same
    /// signature are dropped; the sighting is remembered either way.
    pub fn should_keep(&self, source: &str, event_type: &str, content: &str) -> bool {
        let sig = Self::signature(source, event_type, content);
        let mut seen = self.recent_signatures.lock();
        let previous = seen.insert(sig, Utc::now());
        previous.is_none()
    }

    /// Drops remembered signatures older than `max_age` so sources can
    /// legitimately resurface.
    pub fn forget_older_than(&self, max_age: Duration) {
        let cutoff = Utc::now() - max_age;
        self.recent_signatures.lock().retain(|_, seen| *seen >= cutoff);
    }

    /// Retains only rows younger than the category TTL. Rows whose timestamp
    /// cannot be read are kept.
    pub fn prune_by_ttl<T>(
        &self,
        rows: Vec<T>,
        category: RetentionCategory,
        timestamp: impl Fn(&T) -> Option<DateTime<Utc>>,
    ) -> Vec<T> {
        let cutoff = Utc::now() - Duration::days(category.ttl_days());
        rows.into_iter()
            .filter(|row| timestamp(row).map_or(true, |ts| ts >= cutoff))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_v2::LearningEvent;

    #[test]
    fn immediate_repeat_is_dropped() {
        let governor = MemoryGovernor::new();
        assert!(governor.should_keep("scan", "scan_insight", "same content"));
        assert!(!governor.should_keep("scan", "scan_insight", "same content"));
        assert!(governor.should_keep("scan", "scan_insight", "different content"));
    }

    #[test]
    fn ttl_prune_keeps_recent_rows() {
        let governor = MemoryGovernor::new();
        let mut old = LearningEvent::new("scan", "scan_insight", "old");
        old.ts = Utc::now() - Duration::days(400);
        let fresh = LearningEvent::new("scan", "scan_insight", "fresh");
        let kept = governor.prune_by_ttl(
            vec![old, fresh],
            RetentionCategory::LearningEvent,
            |e| Some(e.ts),
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].content, "fresh");
    }

    #[test]
    fn signature_is_stable_and_case_insensitive() {
        let a = MemoryGovernor::signature("Scan", "Insight", "Content");
        let b = MemoryGovernor::signature("scan", "insight", "content");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }
}
