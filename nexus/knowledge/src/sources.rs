use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Knowledge source category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    /// General software and engineering.
    Technology,
    /// AI and machine learning.
    AiMl,
    /// Industry and business.
    Business,
    /// Research and science.
    Science,
    /// Developer tooling ecosystems.
    Devtools,
    /// Product launches and communities.
    Product,
}

/// How a source's payload is parsed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    /// Scrape titles out of HTML.
    Html,
    /// Extract `<item><title>` entries.
    Rss,
    /// Credentialled API (unsupported without keys).
    Api,
}

/// A registered knowledge source with its scan state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Unique name.
    pub name: String,
    /// Category.
    pub category: SourceCategory,
    /// Fetch URL.
    pub url: String,
    /// Minimum minutes between scans; `0` scans on every call.
    pub scan_interval_minutes: u64,
    /// Payload parser.
    pub parser_type: ParserKind,
    /// Disabled sources are never scanned.
    pub enabled: bool,
    /// Last successful scan attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan: Option<DateTime<Utc>>,
    /// Last scan error, when the most recent attempt degraded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Findings produced over the source's lifetime.
    #[serde(default)]
    pub total_findings: u64,
}

impl Source {
    /// Creates an enabled source with empty scan state.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        category: SourceCategory,
        url: impl Into<String>,
        scan_interval_minutes: u64,
        parser_type: ParserKind,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            url: url.into(),
            scan_interval_minutes,
            parser_type,
            enabled: true,
            last_scan: None,
            last_error: None,
            total_findings: 0,
        }
    }

    /// Whether the scan interval has elapsed (or never scanned).
    #[must_use]
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        if self.scan_interval_minutes == 0 {
            return true;
        }
        self.last_scan.map_or(true, |last| {
            now - last >= chrono::Duration::minutes(self.scan_interval_minutes as i64)
        })
    }
}

/// The default source catalogue, spanning every category.
#[must_use]
pub fn default_sources() -> Vec<Source> {
    use ParserKind::{Html, Rss};
    use SourceCategory::{AiMl, Business, Devtools, Product, Science, Technology};
    vec![
        Source::new("github_trending", Technology, "https://github.com/trending", 15, Html),
        Source::new(
            "github_agents",
            Technology,
            "https://github.com/topics/autonomous-agents",
            15,
            Html,
        ),
        Source::new("hacker_news", Technology, "https://news.ycombinator.com", 5, Html),
        Source::new(
            "reddit_programming",
            Technology,
            "https://www.reddit.com/r/programming",
            10,
            Html,
        ),
        Source::new("dev_to", Technology, "https://dev.to", 15, Html),
        Source::new(
            "stack_overflow",
            Technology,
            "https://stackoverflow.com/questions",
            30,
            Html,
        ),
        Source::new("papers_with_code", AiMl, "https://paperswithcode.com", 30, Html),
        Source::new("huggingface_models", AiMl, "https://huggingface.co/models", 30, Html),
        Source::new("arxiv_ai", AiMl, "https://arxiv.org/list/cs.AI/recent", 60, Html),
        Source::new("anthropic_blog", AiMl, "https://www.anthropic.com/news", 120, Html),
        Source::new("techcrunch", Business, "https://techcrunch.com", 30, Html),
        Source::new(
            "venturebeat_ai",
            Business,
            "https://venturebeat.com/category/ai",
            30,
            Html,
        ),
        Source::new("wired", Business, "https://www.wired.com", 60, Html),
        Source::new(
            "nature_ai",
            Science,
            "https://www.nature.com/subjects/machine-learning",
            120,
            Html,
        ),
        Source::new("arxiv_cs", Science, "https://arxiv.org/list/cs/recent", 60, Html),
        Source::new("pypi_new", Devtools, "https://pypi.org/rss/updates.xml", 30, Rss),
        Source::new("npm_trending", Devtools, "https://www.npmjs.com/browse/depended", 60, Html),
        Source::new("product_hunt", Product, "https://www.producthunt.com", 60, Html),
        Source::new("indie_hackers", Product, "https://www.indiehackers.com", 120, Html),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_sources_are_always_due() {
        let mut source = Source::new("s", SourceCategory::Technology, "http://x", 0, ParserKind::Html);
        source.last_scan = Some(Utc::now());
        assert!(source.due(Utc::now()));
    }

    #[test]
    fn interval_gates_rescans() {
        let mut source = Source::new("s", SourceCategory::Technology, "http://x", 30, ParserKind::Html);
        assert!(source.due(Utc::now()));
        source.last_scan = Some(Utc::now());
        assert!(!source.due(Utc::now()));
        source.last_scan = Some(Utc::now() - chrono::Duration::minutes(31));
        assert!(source.due(Utc::now()));
    }

    #[test]
    fn default_catalogue_covers_all_categories() {
        let sources = default_sources();
        for category in [
            SourceCategory::Technology,
            SourceCategory::AiMl,
            SourceCategory::Business,
            SourceCategory::Science,
            SourceCategory::Devtools,
            SourceCategory::Product,
        ] {
            assert!(sources.iter().any(|s| s.category == category), "{category:?}");
        }
    }
}
