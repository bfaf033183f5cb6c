#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! API substrate for the NEXUS control plane.
//!
//! The HTTP server itself is a thin external adapter; this crate carries the
//! parts it leans on: per-client rate limiting, per-endpoint metrics, typed
//! request validation, and safety/trust snapshots over recent actions.

/// Per-endpoint latency and error counters.
pub mod metrics;
/// Per-client token-bucket rate limiting.
pub mod rate_limiter;
/// Typed request bodies with validation bounds.
pub mod requests;
/// Safety and trust snapshots over action history.
pub mod trust;

pub use metrics::RequestMetrics;
pub use rate_limiter::{ClientKey, RateLimitDecision, RateLimiter, RateLimiterConfig};
pub use requests::{
    ExecuteRequest, FeedbackRequest, LearnRequest, SearchRequest, TaskExecutionRequest,
    ValidationError,
};
pub use trust::{safety_snapshot, trust_metrics};
