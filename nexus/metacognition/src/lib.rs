#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Self-debugging for the NEXUS control plane.
//!
//! Tracks decisions, actions, errors, and metrics per session; detects
//! anomalies (slow actions, repeat loops, recurring errors, threshold
//! violations); maintains the open-issue store; produces the health report
//! every other subsystem keys verification decisions off; and periodically
//! re-reads principle files so guardrails do not drift out of mind.

/// Session buffers, anomaly detection, issue store, health reporting.
pub mod debugger;
/// Record types shared by the debugger surfaces.
pub mod records;
/// Periodic re-reading of principle/guardrail files.
pub mod reminder;

pub use debugger::{DebuggerConfig, SelfDebugger};
pub use records::{
    ActionEntry, DecisionEntry, ErrorEntry, HealthReport, HealthStatus, Issue, IssueKind,
    MetricEntry, SessionStats, Severity,
};
pub use reminder::{default_principle_sources, PrincipleSource, ReminderEvent, SelfReminder};
