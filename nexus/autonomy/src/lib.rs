#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Autonomous task loop for the NEXUS control plane.
//!
//! Tasks enter a priority queue and flow through Execute → Verify → Analyse
//! → Learn. Failures re-queue until retries are exhausted; every outcome
//! feeds the learning store and the feedback log.

/// Result analysis and learnings extraction.
pub mod analyzer;
/// The loop runner.
pub mod loop_runner;
/// Shell command validation for `run_command` tasks.
pub mod shellcheck;
/// Task records and priorities.
pub mod task;
/// URL/file verification.
pub mod verifier;

pub use analyzer::{Analysis, FeedbackRecorder, FeedbackSink, Learning, LearningAnalyzer};
pub use loop_runner::{AutonomousLoop, CycleResult};
pub use shellcheck::{split_args, validate_command, CommandError};
pub use task::{LoopTask, TaskAction, TaskPriority, TaskStatus};
pub use verifier::{TargetVerifier, VerificationOutcome};
