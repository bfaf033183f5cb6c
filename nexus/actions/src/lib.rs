#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Action execution fabric for the NEXUS control plane.
//!
//! Side-effectful operations (files, shell, HTTP, processes, knowledge) are
//! dispatched through a single typed executor. Every action passes the
//! path/command safety policy first, runs under a hard timeout, and leaves a
//! persisted [`ActionResult`] behind regardless of outcome.

/// Seam through which knowledge actions reach the memory store.
pub mod bridge;
/// The typed dispatcher.
pub mod executor;
/// Action handler implementations by category.
pub mod handlers;
/// The closed set of registered action kinds.
pub mod kind;
/// Pure path/command safety policy.
pub mod policy;
/// Result and error types.
pub mod result;

pub use bridge::KnowledgeBridge;
pub use executor::{ActionExecutor, ExecutorConfig, HandlerContext};
pub use kind::{ActionCategory, ActionKind};
pub use policy::{ExecutionMode, PolicyGate, PolicyViolation};
pub use result::{ActionError, ActionResult, ActionStatus};
