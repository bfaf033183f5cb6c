use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, Default)]
struct EndpointStats {
    count: u64,
    errors: u64,
    total_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

/// Aggregated per-endpoint latency/error counters.
///
/// Recording is O(1); a snapshot is O(endpoints).
#[derive(Debug, Default)]
pub struct RequestMetrics {
    endpoints: Mutex<IndexMap<(String, String), EndpointStats>>,
}

impl RequestMetrics {
    /// Creates empty metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one request.
    pub fn record(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        let mut endpoints = self.endpoints.lock();
        let stats = endpoints
            .entry((method.to_uppercase(), path.to_string()))
            .or_default();
        if stats.count == 0 {
            stats.min_ms = duration_ms;
            stats.max_ms = duration_ms;
        } else {
            stats.min_ms = stats.min_ms.min(duration_ms);
            stats.max_ms = stats.max_ms.max(duration_ms);
        }
        stats.count += 1;
        stats.total_ms += duration_ms;
        if status >= 400 {
            stats.errors += 1;
        }
    }

    /// Per-endpoint averages.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let endpoints = self.endpoints.lock();
        let mut out = serde_json::Map::new();
        for ((method, path), stats) in endpoints.iter() {
            out.insert(
                format!("{method} {path}"),
                json!({
                    "count": stats.count,
                    "errors": stats.errors,
                    "avg_ms": if stats.count > 0 { stats.total_ms / stats.count as f64 } else { 0.0 },
                    "min_ms": stats.min_ms,
                    "max_ms": stats.max_ms,
                }),
            );
        }
        json!({"endpoints": out, "timestamp": Utc::now()})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_latency_and_errors() {
        let metrics = RequestMetrics::new();
        metrics.record("get", "/api/nexus/status", 200, 10.0);
        metrics.record("GET", "/api/nexus/status", 200, 30.0);
        metrics.record("GET", "/api/nexus/status", 500, 20.0);
        let snapshot = metrics.snapshot();
        let stats = &snapshot["endpoints"]["GET /api/nexus/status"];
        assert_eq!(stats["count"], 3);
        assert_eq!(stats["errors"], 1);
        assert_eq!(stats["avg_ms"], 20.0);
        assert_eq!(stats["min_ms"], 10.0);
        assert_eq!(stats["max_ms"], 30.0);
    }

    #[test]
    fn endpoints_are_tracked_separately() {
        let metrics = RequestMetrics::new();
        metrics.record("GET", "/a", 200, 1.0);
        metrics.record("POST", "/a", 200, 2.0);
        let snapshot = metrics.snapshot();
        assert!(snapshot["endpoints"]["GET /a"].is_object());
        assert!(snapshot["endpoints"]["POST /a"].is_object());
    }
}
