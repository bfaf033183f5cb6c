#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! The NEXUS self-learning pipeline.
//!
//! Learning events flow through confidence-aware scoring into proposals,
//! experiments, and outcome verification; verdicts feed a Thompson-sampling
//! policy tuner and periodic confidence calibration. The [`scheduler`]
//! module drives the whole cycle.

/// Advisor seam: heuristic always, LLM optional.
pub mod advisor;
/// Thompson-sampling policy tuner.
pub mod bandit;
/// Confidence-Aware Feedback Ensemble scoring.
pub mod cafe;
/// Periodic model-family confidence calibration.
pub mod calibrator;
/// Proposal execution engine.
pub mod experiment;
/// Event-to-proposal generation.
pub mod proposals;
/// The top-level learning loop.
pub mod scheduler;
/// Skill progression tracking.
pub mod skills;
/// Post-run outcome verification.
pub mod verifier;

pub use advisor::{Advisor, HeuristicAdvisor, LlmAdvisor, Reflection};
pub use bandit::{DriftGuardSummary, PolicyBandit, PolicyState};
pub use cafe::{CafeConfig, CafeScore, CafeScorer};
pub use calibrator::{CafeCalibrator, CalibrationSummary, CalibratorConfig};
pub use experiment::{
    ExecuteError, ExecutionOutcome, ExperimentConfig, ExperimentExecutor, ImprovementCycle,
    ImprovementHook,
};
pub use proposals::{ProposalConfig, ProposalEngineV2};
pub use scheduler::{
    FocusArea, ImprovementSummary, IterationReport, LearningLoop, LoopConfig, LoopDeps,
    ScanSummary, SelfCheck, TopItem, V2Summary,
};
pub use skills::{Recommendation, RecommendationKind, SkillRecord, SkillTracker};
pub use verifier::{OutcomeVerifier, VerifierConfig, VerifyError, VerifyOutcome};
