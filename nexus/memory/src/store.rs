use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use shared_event_bus::EventBus;
use thiserror::Error;

/// Persisted content is capped at this many bytes.
pub const CONTENT_CAP: usize = 2048;
/// Maximum number of tags kept per item.
pub const MAX_TAGS: usize = 20;
/// Maximum length of an individual tag.
pub const MAX_TAG_LEN: usize = 100;

/// Errors emitted by the memory stores.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Filesystem I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A single learned knowledge item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    /// Content-addressed identifier (hash of source, title, and time).
    pub id: String,
    /// Originating source name.
    pub source: String,
    /// Item kind (e.g. `paper`, `release`, `general`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Title.
    pub title: String,
    /// Body, capped at [`CONTENT_CAP`] bytes.
    pub content: String,
    /// Optional source URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Relevance in `[0, 1]`.
    pub relevance: f64,
    /// When the item was learned.
    pub learned_at: DateTime<Utc>,
    /// Last time a search returned this item.
    pub last_accessed: DateTime<Utc>,
    /// Number of search hits.
    pub access_count: u64,
    /// Tags, at most [`MAX_TAGS`] of at most [`MAX_TAG_LEN`] chars each.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A learned behavioural pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    /// Pattern kind (e.g. `error_pattern`, `success_pattern`).
    pub pattern_type: String,
    /// Structured pattern payload.
    pub data: Value,
    /// Observed success rate for the pattern.
    pub success_rate: f64,
    /// Recording timestamp.
    pub recorded_at: DateTime<Utc>,
}

/// A knowledge search hit with its ranking score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// The matched item.
    pub item: KnowledgeItem,
    /// Ranking score.
    pub score: f64,
}

/// Append-only JSONL memory with an in-memory knowledge index.
pub struct MemoryStore {
    knowledge_path: PathBuf,
    patterns_path: PathBuf,
    feedback_path: PathBuf,
    knowledge: Mutex<IndexMap<String, KnowledgeItem>>,
    skipped_lines: Mutex<u64>,
    bus: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("knowledge_path", &self.knowledge_path)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Opens the store, loading any existing knowledge file. Malformed lines
    /// are skipped and counted.
    pub fn open(
        knowledge_path: impl Into<PathBuf>,
        patterns_path: impl Into<PathBuf>,
        feedback_path: impl Into<PathBuf>,
    ) -> Result<Self, MemoryError> {
        let knowledge_path = knowledge_path.into();
        if let Some(parent) = knowledge_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (knowledge, skipped) = load_jsonl_map(&knowledge_path);
        Ok(Self {
            knowledge_path,
            patterns_path: patterns_path.into(),
            feedback_path: feedback_path.into(),
            knowledge: Mutex::new(knowledge),
            skipped_lines: Mutex::new(skipped),
            bus: None,
        })
    }

    /// Attaches an event bus; `knowledge.learned` events are emitted per item.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Learns a new item and returns its identifier.
    ///
    /// Content is capped at [`CONTENT_CAP`] bytes, tags at [`MAX_TAGS`]
    /// entries of [`MAX_TAG_LEN`] chars, and relevance clamped to `[0, 1]`.
    pub fn learn(
        &self,
        source: &str,
        kind: &str,
        title: &str,
        content: &str,
        url: Option<String>,
        relevance: f64,
        tags: Vec<String>,
    ) -> Result<String, MemoryError> {
        let now = Utc::now();
        let id = content_id(source, title, now);
        let item = KnowledgeItem {
            id: id.clone(),
            source: source.to_string(),
            kind: kind.to_string(),
            title: title.to_string(),
            content: shared_logging::truncate(content, CONTENT_CAP),
            url,
            relevance: relevance.clamp(0.0, 1.0),
            learned_at: now,
            last_accessed: now,
            access_count: 0,
            tags: tags
                .into_iter()
                .take(MAX_TAGS)
                .map(|tag| shared_logging::truncate(&tag, MAX_TAG_LEN))
                .collect(),
        };
        append_jsonl(&self.knowledge_path, &item)?;
        self.knowledge.lock().insert(id.clone(), item.clone());
        if let Some(bus) = &self.bus {
            bus.emit(
                "knowledge.learned",
                json!({"id": id, "source": item.source, "title": item.title}),
            );
        }
        Ok(id)
    }

    /// Searches the in-memory index.
    ///
    /// Score = `0.5·(query in title) + 0.3·(query in content) + 0.2·(query in
    /// tags) + relevance`. Hits update `access_count` and `last_accessed`.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let needle = query.to_lowercase();
        let mut knowledge = self.knowledge.lock();
        let mut hits: Vec<SearchHit> = Vec::new();
        for item in knowledge.values_mut() {
            let mut score = 0.0;
            if item.title.to_lowercase().contains(&needle) {
                score += 0.5;
            }
            if item.content.to_lowercase().contains(&needle) {
                score += 0.3;
            }
            if item.tags.iter().any(|t| t.to_lowercase().contains(&needle)) {
                score += 0.2;
            }
            if score <= 0.0 {
                continue;
            }
            score += item.relevance;
            item.access_count += 1;
            item.last_accessed = Utc::now();
            hits.push(SearchHit {
                item: item.clone(),
                score,
            });
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        hits
    }

    /// Fetches an item by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<KnowledgeItem> {
        self.knowledge.lock().get(id).cloned()
    }

    /// Number of items currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.knowledge.lock().len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.knowledge.lock().is_empty()
    }

    /// Removes items older than `max_age_days` with fewer than `min_access`
    /// hits; returns how many were dropped from the index.
    pub fn prune(&self, max_age_days: i64, min_access: u64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        let mut knowledge = self.knowledge.lock();
        let before = knowledge.len();
        knowledge.retain(|_, item| item.learned_at >= cutoff || item.access_count >= min_access);
        before - knowledge.len()
    }

    /// Records a behavioural pattern.
    pub fn record_pattern(
        &self,
        pattern_type: &str,
        data: Value,
        success_rate: f64,
    ) -> Result<(), MemoryError> {
        append_jsonl(
            &self.patterns_path,
            &PatternRecord {
                pattern_type: pattern_type.to_string(),
                data,
                success_rate: success_rate.clamp(0.0, 1.0),
                recorded_at: Utc::now(),
            },
        )
    }

    /// Records an approval/denial feedback entry.
    pub fn record_feedback(&self, payload: &Value) -> Result<(), MemoryError> {
        append_jsonl(&self.feedback_path, payload)
    }

    /// JSONL lines skipped as malformed since open.
    #[must_use]
    pub fn skipped_lines(&self) -> u64 {
        *self.skipped_lines.lock()
    }

    /// Summary statistics for status endpoints.
    #[must_use]
    pub fn stats(&self) -> Value {
        let knowledge = self.knowledge.lock();
        let total_access: u64 = knowledge.values().map(|i| i.access_count).sum();
        json!({
            "knowledge_items": knowledge.len(),
            "total_access_count": total_access,
            "skipped_lines": *self.skipped_lines.lock(),
        })
    }
}

/// Derives a content-addressed identifier from source, title, and time.
#[must_use]
pub fn content_id(source: &str, title: &str, at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(title.as_bytes());
    hasher.update(at.to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 12)
}

pub(crate) fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// Appends one serializable value as a JSON line.
pub(crate) fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, value)?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}

fn load_jsonl_map(path: &Path) -> (IndexMap<String, KnowledgeItem>, u64) {
    let mut map = IndexMap::new();
    let mut skipped = 0;
    let Ok(file) = File::open(path) else {
        return (map, skipped);
    };
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<KnowledgeItem>(&line) {
            Ok(item) => {
                map.insert(item.id.clone(), item);
            }
            Err(_) => skipped += 1,
        }
    }
    (map, skipped)
}

/// Reads the last `limit` parsed records of a JSONL file, skipping malformed
/// lines.
#[must_use]
pub fn tail_jsonl<T: DeserializeOwned>(path: &Path, limit: usize) -> Vec<T> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    let mut rows: Vec<T> = BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(&line).ok())
        .collect();
    let keep = limit.max(1);
    if rows.len() > keep {
        rows.drain(..rows.len() - keep);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> MemoryStore {
        MemoryStore::open(
            dir.join("knowledge.jsonl"),
            dir.join("patterns.jsonl"),
            dir.join("feedback.jsonl"),
        )
        .unwrap()
    }

    #[test]
    fn learn_then_search_returns_item() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let id = store
            .learn(
                "scan",
                "paper",
                "Rust async patterns",
                "Structured concurrency notes",
                None,
                0.8,
                vec!["rust".into()],
            )
            .unwrap();
        let hits = store.search("async", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item.id, id);
        assert_eq!(hits[0].item.access_count, 1);
    }

    #[test]
    fn search_ranks_title_above_tags() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .learn("a", "general", "tokio runtime", "body", None, 0.0, vec![])
            .unwrap();
        store
            .learn("b", "general", "other", "body", None, 0.0, vec!["tokio".into()])
            .unwrap();
        let hits = store.search("tokio", 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item.title, "tokio runtime");
    }

    #[test]
    fn caps_content_and_tags() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let long = "x".repeat(CONTENT_CAP * 2);
        let tags: Vec<String> = (0..40).map(|i| format!("tag{i}{}", "y".repeat(200))).collect();
        let id = store
            .learn("src", "general", "caps", &long, None, 2.0, tags)
            .unwrap();
        let item = store.get(&id).unwrap();
        assert_eq!(item.content.len(), CONTENT_CAP);
        assert_eq!(item.tags.len(), MAX_TAGS);
        assert!(item.tags.iter().all(|t| t.chars().count() <= MAX_TAG_LEN));
        assert!((item.relevance - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reload_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        {
            let store = store(dir.path());
            store
                .learn("src", "general", "keep me", "body", None, 0.5, vec![])
                .unwrap();
        }
        fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("knowledge.jsonl"))
            .unwrap()
            .write_all(b"{not json}\n")
            .unwrap();
        let reloaded = store(dir.path());
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.skipped_lines(), 1);
    }

    #[test]
    fn append_is_append_only() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .learn("src", "general", "first", "body", None, 0.5, vec![])
            .unwrap();
        let before = fs::read(dir.path().join("knowledge.jsonl")).unwrap();
        store
            .learn("src", "general", "second", "body", None, 0.5, vec![])
            .unwrap();
        let after = fs::read(dir.path().join("knowledge.jsonl")).unwrap();
        assert_eq!(&after[..before.len()], &before[..]);
    }

    #[test]
    fn prune_keeps_accessed_items() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .learn("src", "general", "fresh", "body", None, 0.5, vec![])
            .unwrap();
        assert_eq!(store.prune(90, 1), 0);
    }
}
