use serde_json::Value;

/// Seam between the action fabric and the knowledge plane.
///
/// The executor never depends on the memory crate directly; the orchestrator
/// wires a store-backed implementation in, and tests inject stubs.
pub trait KnowledgeBridge: Send + Sync {
    /// Stores a knowledge item and returns its id.
    fn learn(
        &self,
        source: &str,
        kind: &str,
        title: &str,
        content: &str,
        url: Option<String>,
        relevance: f64,
    ) -> anyhow::Result<String>;

    /// Searches knowledge, returning serialized hits.
    fn query(&self, query: &str, limit: usize) -> Vec<Value>;
}
