#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Persistent memory for the NEXUS control plane.
//!
//! Every store in this crate owns its records exclusively; other subsystems
//! hold only record IDs. All JSON writes are atomic (write-temp-then-rename)
//! and all JSONL readers tolerate malformed lines by skipping them.

/// Backup and restore of the brain data directory.
pub mod backup;
/// Deduplication and TTL governance for long-running memory.
pub mod governor;
/// Advisory cross-process file locks for long critical sections.
pub mod lockfile;
/// Data-directory layout shared by all subsystems.
pub mod paths;
/// Knowledge/pattern/feedback JSONL stores with weighted search.
pub mod store;
/// Typed stores for the self-learning v2 pipeline.
pub mod storage_v2;

pub use backup::{BackupEntry, BackupError, BackupInfo, BackupManager, RestoreInfo};
pub use governor::{MemoryGovernor, RetentionCategory};
pub use lockfile::{LockError, LockInfo, OperationGuard, OperationLock};
pub use paths::NexusPaths;
pub use store::{
    content_id, tail_jsonl, KnowledgeItem, MemoryError, MemoryStore, PatternRecord, SearchHit,
};
pub use storage_v2::{
    is_non_production_source, load_json_or_default, save_json_atomic, EventStream,
    ExecutionProfile, ExecutionStatus, ExecutionSummary, ExperimentRun, LearningEvent,
    MetricsDelta, OutcomeEvidence, ProposalStatus, ProposalV2, ProposalsFile, RiskLevel,
    RunArtifacts, RunVerification, RunsFile, StorageV2, ThroughputSnapshot, Verdict,
    VerdictSignals,
};
