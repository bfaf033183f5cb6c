use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use shared_event_bus::EventBus;

use nexus_memory::{load_json_or_default, save_json_atomic, MemoryStore};

use crate::parser::{parse_html_titles, parse_rss_titles};
use crate::sources::{ParserKind, Source, SourceCategory};

/// One scout finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Content-addressed identifier.
    pub id: String,
    /// Title (≤240 chars).
    pub title: String,
    /// Finding kind: `paper`, `release`, `update`, `unavailable`, `unsupported`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Relevance in `[0, 1]`.
    pub relevance: f64,
    /// Source name.
    pub source: String,
    /// Source category.
    pub category: SourceCategory,
    /// Source URL.
    pub url: String,
    /// Error detail for `unavailable` findings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Scan timestamp.
    pub scanned_at: DateTime<Utc>,
}

/// Fetches a source payload. The HTTP implementation is the production path;
/// tests inject deterministic bodies.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetches the body at `url`.
    async fn fetch(&self, url: &str) -> anyhow::Result<String>;
}

/// Reqwest-backed fetcher with the scout user agent and a 20s deadline.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Builds the fetcher.
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("NexusScout/1.0 (+https://nexus.local)")
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {status}");
        }
        Ok(response.text().await?)
    }
}

/// Scout knobs.
#[derive(Debug, Clone, Copy)]
pub struct ScoutConfig {
    /// Bounded fan-out width for `scan_all`.
    pub max_concurrent_scans: usize,
    /// Whether findings are forwarded into the memory store.
    pub forward_to_store: bool,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scans: 5,
            forward_to_store: true,
        }
    }
}

/// Quality assessment of one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceQuality {
    /// Source name.
    pub source: String,
    /// Score in `[0, 1]`.
    pub quality_score: f64,
    /// Contributing reasons.
    pub reasons: Vec<String>,
    /// Source category.
    pub category: SourceCategory,
    /// Lifetime finding count.
    pub total_findings: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SourcesState {
    #[serde(default)]
    sources: HashMap<String, SourceScanState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SourceScanState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_scan: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(default)]
    total_findings: u64,
}

/// Advisor hook blended 50/50 into the heuristic quality score.
pub type QualityAdvisor = Arc<dyn Fn(&Source) -> Option<f64> + Send + Sync>;

/// Periodic scanner over the registered sources.
pub struct KnowledgeScout {
    sources: RwLock<IndexMap<String, Source>>,
    fetcher: Arc<dyn SourceFetcher>,
    findings_path: PathBuf,
    sources_path: PathBuf,
    findings_cache: Mutex<Vec<Finding>>,
    store: Option<Arc<MemoryStore>>,
    bus: Option<Arc<EventBus>>,
    quality_advisor: Option<QualityAdvisor>,
    config: ScoutConfig,
}

impl std::fmt::Debug for KnowledgeScout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeScout")
            .field("sources_path", &self.sources_path)
            .finish_non_exhaustive()
    }
}

impl KnowledgeScout {
    /// Creates a scout over the given catalogue, merging persisted scan state.
    #[must_use]
    pub fn new(
        catalogue: Vec<Source>,
        fetcher: Arc<dyn SourceFetcher>,
        findings_path: impl Into<PathBuf>,
        sources_path: impl Into<PathBuf>,
        config: ScoutConfig,
    ) -> Self {
        let sources_path = sources_path.into();
        let state: SourcesState = load_json_or_default(&sources_path);
        let mut sources = IndexMap::new();
        for mut source in catalogue {
            if let Some(saved) = state.sources.get(&source.name) {
                source.last_scan = saved.last_scan;
                source.last_error.clone_from(&saved.last_error);
                source.total_findings = saved.total_findings;
            }
            sources.insert(source.name.clone(), source);
        }
        Self {
            sources: RwLock::new(sources),
            fetcher,
            findings_path: findings_path.into(),
            sources_path,
            findings_cache: Mutex::new(Vec::new()),
            store: None,
            bus: None,
            quality_advisor: None,
            config,
        }
    }

    /// Forwards findings into the memory store as knowledge items.
    #[must_use]
    pub fn with_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Emits `scout.finding` events per stored finding.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Attaches an advisor whose judgment is blended into quality scores.
    #[must_use]
    pub fn with_quality_advisor(mut self, advisor: QualityAdvisor) -> Self {
        self.quality_advisor = Some(advisor);
        self
    }

    /// Registers or replaces a source.
    pub fn register_source(&self, source: Source) {
        self.sources.write().insert(source.name.clone(), source);
    }

    /// Enables or disables a source. Returns whether it exists.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut sources = self.sources.write();
        match sources.get_mut(name) {
            Some(source) => {
                source.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Snapshot of one source.
    #[must_use]
    pub fn get_source(&self, name: &str) -> Option<Source> {
        self.sources.read().get(name).cloned()
    }

    /// Scans one source, honouring its interval and enabled flag.
    ///
    /// Returns an empty list when the source is unknown, disabled, or not
    /// yet due. Fetch or parse failures yield exactly one `unavailable`
    /// finding.
    pub async fn scan_source(&self, name: &str) -> Vec<Finding> {
        let Some(source) = self.get_source(name) else {
            return Vec::new();
        };
        if !source.enabled || !source.due(Utc::now()) {
            return Vec::new();
        }

        let (findings, error) = self.collect_findings(&source).await;

        {
            let mut sources = self.sources.write();
            if let Some(live) = sources.get_mut(name) {
                live.last_scan = Some(Utc::now());
                live.last_error.clone_from(&error);
                live.total_findings += findings.len() as u64;
            }
        }

        for finding in &findings {
            self.store_finding(finding);
        }
        self.save_state();
        findings
    }

    async fn collect_findings(&self, source: &Source) -> (Vec<Finding>, Option<String>) {
        let now = Utc::now();
        match source.parser_type {
            ParserKind::Api => (
                vec![self.make_finding(
                    source,
                    format!("API source unsupported without credentials: {}", source.name),
                    "unsupported",
                    0.0,
                    None,
                    now,
                )],
                None,
            ),
            ParserKind::Html | ParserKind::Rss => match self.fetcher.fetch(&source.url).await {
                Ok(body) => {
                    let titles = if source.parser_type == ParserKind::Html {
                        parse_html_titles(&body)
                    } else {
                        parse_rss_titles(&body)
                    };
                    if titles.is_empty() {
                        return (
                            vec![self.make_finding(
                                source,
                                format!("No parsable content from {}", source.name),
                                "unavailable",
                                0.1,
                                None,
                                now,
                            )],
                            None,
                        );
                    }
                    let findings = titles
                        .into_iter()
                        .map(|title| {
                            let kind = classify(&title, &source.name);
                            let capped: String = title.chars().take(240).collect();
                            self.make_finding(source, capped, kind, 0.7, None, now)
                        })
                        .collect();
                    (findings, None)
                }
                Err(err) => {
                    let message = err.to_string();
                    (
                        vec![self.make_finding(
                            source,
                            format!("Source unavailable: {}", source.name),
                            "unavailable",
                            0.0,
                            Some(message.clone()),
                            now,
                        )],
                        Some(message),
                    )
                }
            },
        }
    }

    fn make_finding(
        &self,
        source: &Source,
        title: String,
        kind: &str,
        relevance: f64,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Finding {
        let mut hasher = Sha256::new();
        hasher.update(source.name.as_bytes());
        hasher.update(title.as_bytes());
        hasher.update(now.to_rfc3339().as_bytes());
        let digest = hasher.finalize();
        let id: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
        Finding {
            id,
            title,
            kind: kind.to_string(),
            relevance,
            source: source.name.clone(),
            category: source.category,
            url: source.url.clone(),
            error,
            scanned_at: now,
        }
    }

    fn store_finding(&self, finding: &Finding) {
        let _ = append_finding(&self.findings_path, finding);
        self.findings_cache.lock().push(finding.clone());
        if let Some(bus) = &self.bus {
            bus.emit(
                "scout.finding",
                json!({"source": finding.source, "title": finding.title, "type": finding.kind}),
            );
        }
        if self.config.forward_to_store && finding.error.is_none() {
            if let Some(store) = &self.store {
                let payload = serde_json::to_string(finding).unwrap_or_default();
                let _ = store.learn(
                    &finding.source,
                    &finding.kind,
                    &finding.title,
                    &payload,
                    Some(finding.url.clone()),
                    finding.relevance,
                    vec![format!("{:?}", finding.category).to_lowercase()],
                );
            }
        }
    }

    /// Scans every enabled source with bounded concurrency.
    pub async fn scan_all(&self) -> IndexMap<String, Vec<Finding>> {
        let names: Vec<String> = {
            let sources = self.sources.read();
            sources
                .values()
                .filter(|s| s.enabled)
                .map(|s| s.name.clone())
                .collect()
        };
        let width = self.config.max_concurrent_scans.max(1);
        let results: Vec<(String, Vec<Finding>)> = stream::iter(names)
            .map(|name| async move {
                let findings = self.scan_source(&name).await;
                (name, findings)
            })
            .buffer_unordered(width)
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// Scans every enabled source in a category.
    pub async fn scan_category(&self, category: SourceCategory) -> IndexMap<String, Vec<Finding>> {
        let names: Vec<String> = {
            let sources = self.sources.read();
            sources
                .values()
                .filter(|s| s.enabled && s.category == category)
                .map(|s| s.name.clone())
                .collect()
        };
        let mut out = IndexMap::new();
        for name in names {
            let findings = self.scan_source(&name).await;
            out.insert(name, findings);
        }
        out
    }

    /// Aggregate stats across the registry.
    #[must_use]
    pub fn source_stats(&self) -> Value {
        let sources = self.sources.read();
        let mut by_category: HashMap<String, usize> = HashMap::new();
        let mut detail = serde_json::Map::new();
        for source in sources.values() {
            *by_category
                .entry(format!("{:?}", source.category).to_lowercase())
                .or_default() += 1;
            detail.insert(
                source.name.clone(),
                json!({
                    "category": source.category,
                    "enabled": source.enabled,
                    "last_scan": source.last_scan,
                    "total_findings": source.total_findings,
                    "last_error": source.last_error,
                }),
            );
        }
        json!({
            "total_sources": sources.len(),
            "enabled_sources": sources.values().filter(|s| s.enabled).count(),
            "total_findings": sources.values().map(|s| s.total_findings).sum::<u64>(),
            "by_category": by_category,
            "sources": detail,
        })
    }

    /// Heuristic quality score for one source, blended 50/50 with the
    /// advisor's judgment when one is attached.
    #[must_use]
    pub fn score_source_quality(&self, name: &str) -> Option<SourceQuality> {
        let source = self.get_source(name)?;
        let mut score: f64 = 0.5;
        let mut reasons = Vec::new();

        if source.total_findings > 10 {
            score += 0.1;
            reasons.push(format!("High finding count ({})", source.total_findings));
        } else if source.total_findings == 0 {
            score -= 0.2;
            reasons.push("No findings yet".to_string());
        }

        if let Some(last) = source.last_scan {
            let hours = (Utc::now() - last).num_minutes() as f64 / 60.0;
            if hours < 24.0 {
                score += 0.1;
                reasons.push("Recently scanned".to_string());
            } else if hours > 168.0 {
                score -= 0.1;
                reasons.push("Stale (>7 days)".to_string());
            }
        }

        if let Some(error) = &source.last_error {
            score -= 0.2;
            let head: String = error.chars().take(50).collect();
            reasons.push(format!("Has error: {head}"));
        }

        if let Some(advisor) = &self.quality_advisor {
            if let Some(judged) = advisor(&source).filter(|s| (0.0..=1.0).contains(s)) {
                score = score * 0.5 + judged * 0.5;
                reasons.push(format!("Advisor quality score: {judged:.2}"));
            }
        }

        Some(SourceQuality {
            source: source.name,
            quality_score: (score.clamp(0.0, 1.0) * 100.0).round() / 100.0,
            reasons,
            category: source.category,
            total_findings: source.total_findings,
        })
    }

    /// All sources ranked by quality, best first.
    #[must_use]
    pub fn ranked_sources(&self) -> Vec<SourceQuality> {
        let names: Vec<String> = self.sources.read().keys().cloned().collect();
        let mut scores: Vec<SourceQuality> = names
            .iter()
            .filter_map(|name| self.score_source_quality(name))
            .collect();
        scores.sort_by(|a, b| b.quality_score.total_cmp(&a.quality_score));
        scores
    }

    /// The most recent findings from this process's cache.
    #[must_use]
    pub fn recent_findings(&self, limit: usize) -> Vec<Finding> {
        let cache = self.findings_cache.lock();
        let skip = cache.len().saturating_sub(limit);
        cache.iter().skip(skip).cloned().collect()
    }

    fn save_state(&self) {
        let state = {
            let sources = self.sources.read();
            SourcesState {
                sources: sources
                    .values()
                    .map(|s| {
                        (
                            s.name.clone(),
                            SourceScanState {
                                last_scan: s.last_scan,
                                last_error: s.last_error.clone(),
                                total_findings: s.total_findings,
                            },
                        )
                    })
                    .collect(),
                last_updated: Some(Utc::now()),
            }
        };
        let _ = save_json_atomic(&self.sources_path, &state);
    }
}

fn classify(title: &str, source_name: &str) -> &'static str {
    let lowered = title.to_lowercase();
    if lowered.contains("paper") || source_name.contains("arxiv") {
        "paper"
    } else if lowered.contains("release") || lowered.contains("launch") {
        "release"
    } else {
        "update"
    }
}

fn append_finding(path: &PathBuf, finding: &Finding) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(finding)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct StaticFetcher {
        body: anyhow::Result<String>,
    }

    impl StaticFetcher {
        fn ok(body: &str) -> Arc<Self> {
            Arc::new(Self {
                body: Ok(body.to_string()),
            })
        }

        fn err(message: &str) -> Arc<Self> {
            Arc::new(Self {
                body: Err(anyhow::anyhow!(message.to_string())),
            })
        }
    }

    #[async_trait]
    impl SourceFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> anyhow::Result<String> {
            match &self.body {
                Ok(body) => Ok(body.clone()),
                Err(err) => Err(anyhow::anyhow!(err.to_string())),
            }
        }
    }

    fn scout(dir: &std::path::Path, fetcher: Arc<dyn SourceFetcher>, sources: Vec<Source>) -> KnowledgeScout {
        KnowledgeScout::new(
            sources,
            fetcher,
            dir.join("findings.jsonl"),
            dir.join("sources.json"),
            ScoutConfig::default(),
        )
    }

    fn html_source(name: &str, interval: u64) -> Source {
        Source::new(name, SourceCategory::Technology, "https://example.test", interval, ParserKind::Html)
    }

    #[tokio::test]
    async fn scan_parses_titles_and_updates_state() {
        let dir = tempdir().unwrap();
        let scout = scout(
            dir.path(),
            StaticFetcher::ok("<h1>Big Release shipped</h1><h2>Other</h2>"),
            vec![html_source("tech", 0)],
        );
        let findings = scout.scan_source("tech").await;
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].kind, "release");
        let source = scout.get_source("tech").unwrap();
        assert_eq!(source.total_findings, 2);
        assert!(source.last_scan.is_some());
        assert!(source.last_error.is_none());
        assert!(dir.path().join("findings.jsonl").exists());
    }

    #[tokio::test]
    async fn fetch_failure_degrades_to_single_unavailable_finding() {
        let dir = tempdir().unwrap();
        let scout = scout(
            dir.path(),
            StaticFetcher::err("connection refused"),
            vec![html_source("down", 0)],
        );
        let findings = scout.scan_source("down").await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, "unavailable");
        assert!(findings[0].error.as_deref().unwrap().contains("connection refused"));
        let source = scout.get_source("down").unwrap();
        assert!(source.last_error.is_some());
    }

    #[tokio::test]
    async fn disabled_and_not_due_sources_are_skipped() {
        let dir = tempdir().unwrap();
        let mut gated = html_source("gated", 60);
        gated.last_scan = Some(Utc::now());
        let scout = scout(
            dir.path(),
            StaticFetcher::ok("<h1>X</h1>"),
            vec![gated, html_source("off", 0)],
        );
        scout.set_enabled("off", false);
        assert!(scout.scan_source("gated").await.is_empty());
        assert!(scout.scan_source("off").await.is_empty());
    }

    #[tokio::test]
    async fn scan_all_covers_enabled_sources() {
        let dir = tempdir().unwrap();
        let scout = scout(
            dir.path(),
            StaticFetcher::ok("<h2>One</h2>"),
            vec![html_source("a", 0), html_source("b", 0)],
        );
        let results = scout.scan_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|f| f.len() == 1));
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempdir().unwrap();
        {
            let scout = scout(
                dir.path(),
                StaticFetcher::ok("<h2>One</h2>"),
                vec![html_source("persist", 0)],
            );
            scout.scan_source("persist").await;
        }
        let reloaded = scout(
            dir.path(),
            StaticFetcher::ok("<h2>One</h2>"),
            vec![html_source("persist", 0)],
        );
        let source = reloaded.get_source("persist").unwrap();
        assert_eq!(source.total_findings, 1);
        assert!(source.last_scan.is_some());
    }

    #[tokio::test]
    async fn quality_scoring_reflects_errors_and_recency() {
        let dir = tempdir().unwrap();
        let scout = scout(
            dir.path(),
            StaticFetcher::err("boom"),
            vec![html_source("flaky", 0)],
        );
        scout.scan_source("flaky").await;
        let quality = scout.score_source_quality("flaky").unwrap();
        // 0.5 + 0.1 (recent) - 0.2 (error) = 0.4; the single unavailable
        // finding keeps the no-findings penalty away.
        assert!((quality.quality_score - 0.4).abs() < 0.01);
        assert!(quality.reasons.iter().any(|r| r.starts_with("Has error")));
    }

    #[tokio::test]
    async fn advisor_blend_is_half_weighted() {
        let dir = tempdir().unwrap();
        let scout = scout(
            dir.path(),
            StaticFetcher::ok("<h2>One</h2>"),
            vec![html_source("judged", 0)],
        )
        .with_quality_advisor(Arc::new(|_| Some(1.0)));
        let quality = scout.score_source_quality("judged").unwrap();
        // Heuristic 0.3 (no findings yet) blended with 1.0 → 0.65.
        assert!((quality.quality_score - 0.65).abs() < 0.01);
    }
}
