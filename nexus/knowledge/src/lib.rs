#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Knowledge acquisition for the NEXUS control plane.
//!
//! A registry of external sources is scanned on per-source intervals; parsed
//! findings are scored, persisted, and forwarded into the memory store as
//! knowledge items. Fetch failures degrade to a single `unavailable` finding
//! rather than an error.

/// Title extraction for HTML and RSS bodies.
pub mod parser;
/// The scanning engine.
pub mod scout;
/// Source records and the default catalogue.
pub mod sources;

pub use parser::{parse_html_titles, parse_rss_titles};
pub use scout::{
    Finding, HttpFetcher, KnowledgeScout, QualityAdvisor, ScoutConfig, SourceFetcher, SourceQuality,
};
pub use sources::{default_sources, ParserKind, Source, SourceCategory};
