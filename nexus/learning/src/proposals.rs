use std::{env, sync::Arc};

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use nexus_memory::{
    EventStream, LearningEvent, ProposalStatus, ProposalV2, RiskLevel, StorageV2,
};

use crate::cafe::CafeScorer;

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name).map_or(default, |raw| {
        matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on")
    })
}

/// Proposal-generation thresholds, ENV-backed.
#[derive(Debug, Clone, Copy)]
pub struct ProposalConfig {
    /// Priority floor below which no proposal is created.
    pub create_threshold: f64,
    /// Priority at or above which safe proposals auto-approve.
    pub auto_approve_threshold: f64,
    /// Whether CAFE scoring participates.
    pub enable_cafe: bool,
    /// Whether CAFE-blocked events may still produce proposals.
    pub allow_blocked: bool,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            create_threshold: 0.62,
            auto_approve_threshold: 0.82,
            enable_cafe: true,
            allow_blocked: false,
        }
    }
}

impl ProposalConfig {
    /// Reads configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            create_threshold: env_f64("PROPOSAL_V2_CREATE_THRESHOLD", defaults.create_threshold),
            auto_approve_threshold: env_f64(
                "PROPOSAL_V2_AUTO_APPROVE_THRESHOLD",
                defaults.auto_approve_threshold,
            ),
            enable_cafe: env_bool("ENABLE_CAFE_LOOP", defaults.enable_cafe),
            allow_blocked: env_bool("CAFE_ALLOW_BLOCKED_PROPOSALS", defaults.allow_blocked),
        }
    }
}

/// Priority formula: `0.40·value + 0.25·novelty + 0.20·confidence − 0.15·risk`,
/// clamped to `[0, 1]` and rounded to 4 places.
#[must_use]
pub fn priority(value: f64, novelty: f64, confidence: f64, risk: f64) -> f64 {
    let raw = 0.40f64.mul_add(value, 0.25 * novelty) + 0.20f64.mul_add(confidence, -(0.15 * risk));
    (raw.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

/// Converts learning events into proposals with dedup, CAFE gating, and safe
/// auto-approval.
pub struct ProposalEngineV2 {
    storage: Arc<StorageV2>,
    scorer: Arc<CafeScorer>,
    config: ProposalConfig,
    auto_approve_threshold: RwLock<f64>,
}

impl std::fmt::Debug for ProposalEngineV2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProposalEngineV2")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProposalEngineV2 {
    /// Creates the engine.
    #[must_use]
    pub fn new(storage: Arc<StorageV2>, scorer: Arc<CafeScorer>, config: ProposalConfig) -> Self {
        Self {
            storage,
            scorer,
            config,
            auto_approve_threshold: RwLock::new(config.auto_approve_threshold),
        }
    }

    /// Effective auto-approval threshold (the bandit may retune it).
    #[must_use]
    pub fn auto_approve_threshold(&self) -> f64 {
        *self.auto_approve_threshold.read()
    }

    /// Retunes the auto-approval threshold.
    pub fn set_auto_approve_threshold(&self, threshold: f64) {
        *self.auto_approve_threshold.write() = threshold.clamp(0.0, 1.0);
    }

    /// Dedup signature over an event's identifying fields.
    #[must_use]
    pub fn signature(event: &LearningEvent) -> String {
        let head: String = event.content.chars().take(160).collect();
        let base = format!("{}|{}|{head}", event.event_type, event.source).to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(base.as_bytes());
        let digest = hasher.finalize();
        digest.iter().take(7).map(|b| format!("{b:02x}")).collect()
    }

    /// Generates proposals from events, newest state on disk.
    ///
    /// Non-production events are skipped unless included; CAFE-blocked
    /// events are skipped unless allowed; events whose signature matches an
    /// active proposal are skipped; priority below the create threshold is
    /// skipped. At most `limit` proposals are created.
    pub fn generate_from_events(
        &self,
        events: &[LearningEvent],
        limit: usize,
        include_non_production: bool,
    ) -> Vec<ProposalV2> {
        let mut data = self.storage.proposals();
        let mut active_signatures: Vec<String> = data
            .proposals
            .iter()
            .filter(|p| {
                matches!(
                    p.status,
                    ProposalStatus::PendingApproval
                        | ProposalStatus::Approved
                        | ProposalStatus::Executed
                        | ProposalStatus::Verified
                )
            })
            .map(|p| p.signature.clone())
            .collect();

        let auto_threshold = self.auto_approve_threshold();
        let mut created = Vec::new();

        for event in events {
            if created.len() >= limit.max(1) {
                break;
            }
            if event.resolved_stream() == EventStream::NonProduction && !include_non_production {
                continue;
            }

            let mut value = clamp01(event.value);
            let novelty = clamp01(event.novelty);
            let mut confidence = if event.confidence > 0.0 {
                clamp01(event.confidence)
            } else {
                value
            };
            let mut risk = clamp01(event.risk);

            let cafe = self.config.enable_cafe.then(|| self.scorer.score_event(event));
            if let Some(cafe) = &cafe {
                if cafe.enabled {
                    if cafe.blocked && !self.config.allow_blocked {
                        continue;
                    }
                    value = clamp01(value.mul_add(0.7, cafe.helpful * 0.3));
                    risk = clamp01(risk.max(1.0 - cafe.harmless));
                    confidence = clamp01((confidence + cafe.confidence) / 2.0);
                }
            }

            let priority = priority(value, novelty, confidence, risk);
            if priority < self.config.create_threshold {
                continue;
            }

            let signature = Self::signature(event);
            if active_signatures.contains(&signature) {
                continue;
            }

            let risk_level = RiskLevel::from_score(risk);
            let auto_approve = priority >= auto_threshold
                && matches!(risk_level, RiskLevel::Low | RiskLevel::Medium);
            let now = Utc::now();

            let title = event
                .title
                .clone()
                .unwrap_or_else(|| event.event_type.clone());
            let title: String = title.chars().take(180).collect();
            let hypothesis = event.hypothesis.clone().unwrap_or_else(|| {
                format!("Applying insight from {} improves outcomes.", event.source)
            });
            let expected_impact = event
                .expected_impact
                .clone()
                .unwrap_or_else(|| "Incremental reliability/learning throughput improvement".into());

            let mut metadata = IndexMap::new();
            metadata.insert("source".to_string(), json!(event.source));
            metadata.insert("event_type".to_string(), json!(event.event_type));
            metadata.insert("event_stream".to_string(), json!(event.resolved_stream()));
            metadata.insert("model".to_string(), json!(event.model));
            metadata.insert("auto_approved".to_string(), json!(auto_approve));
            if let Some(cafe) = &cafe {
                metadata.insert("cafe".to_string(), json!(cafe));
            }

            let proposal = ProposalV2 {
                id: format!("pv2_{}_{}", now.format("%Y%m%d_%H%M%S_%f"), &signature[..6]),
                created_at: now,
                approved_at: auto_approve.then_some(now),
                origin_event_ids: vec![event.id.clone()],
                title,
                hypothesis,
                plan_steps: vec![
                    "Collect baseline metrics".into(),
                    "Apply isolated safe change".into(),
                    "Run verification checks".into(),
                    "Keep or rollback based on evidence".into(),
                ],
                expected_impact,
                risk_level,
                status: if auto_approve {
                    ProposalStatus::Approved
                } else {
                    ProposalStatus::PendingApproval
                },
                confidence: (confidence * 10_000.0).round() / 10_000.0,
                priority,
                signature: signature.clone(),
                metadata,
            };

            if proposal.status == ProposalStatus::PendingApproval {
                data.pending.push(proposal.id.clone());
            }
            active_signatures.push(signature);
            data.proposals.push(proposal.clone());
            created.push(proposal);
        }

        data.pending.dedup();
        let _ = self.storage.save_proposals(data);
        created
    }

    /// Proposals still awaiting approval or execution.
    #[must_use]
    pub fn list_pending(&self) -> Vec<ProposalV2> {
        self.storage
            .proposals()
            .proposals
            .into_iter()
            .filter(|p| {
                matches!(
                    p.status,
                    ProposalStatus::PendingApproval | ProposalStatus::Approved
                )
            })
            .collect()
    }

    /// Finds a proposal by id.
    #[must_use]
    pub fn get(&self, proposal_id: &str) -> Option<ProposalV2> {
        self.storage
            .proposals()
            .proposals
            .into_iter()
            .find(|p| p.id == proposal_id)
    }

    /// Second-pass approval of pending safe proposals at or above the
    /// threshold (a boundary hit approves). Returns how many were approved.
    pub fn auto_approve_safe(&self, limit: usize, min_priority: Option<f64>) -> usize {
        let threshold = min_priority.unwrap_or_else(|| self.auto_approve_threshold());
        let mut data = self.storage.proposals();
        let mut approved = 0;
        for proposal in &mut data.proposals {
            if approved >= limit.max(1) {
                break;
            }
            if proposal.status != ProposalStatus::PendingApproval {
                continue;
            }
            if proposal.priority >= threshold
                && matches!(proposal.risk_level, RiskLevel::Low | RiskLevel::Medium)
            {
                proposal.status = ProposalStatus::Approved;
                proposal.approved_at = Some(Utc::now());
                approved += 1;
            }
        }
        if approved > 0 {
            data.pending = data
                .proposals
                .iter()
                .filter(|p| p.status == ProposalStatus::PendingApproval)
                .map(|p| p.id.clone())
                .collect();
            let _ = self.storage.save_proposals(data);
        }
        approved
    }

    /// Advances a proposal's status (forward-only) and merges annotations.
    /// Returns false when the proposal is unknown or the transition would be
    /// a back-edge.
    pub fn mark_status(
        &self,
        proposal_id: &str,
        status: ProposalStatus,
        annotations: IndexMap<String, Value>,
    ) -> bool {
        let mut data = self.storage.proposals();
        let Some(proposal) = data.proposals.iter_mut().find(|p| p.id == proposal_id) else {
            return false;
        };
        if !proposal.status.allows(status) {
            return false;
        }
        proposal.status = status;
        if status == ProposalStatus::Approved && proposal.approved_at.is_none() {
            proposal.approved_at = Some(Utc::now());
        }
        for (key, value) in annotations {
            proposal.metadata.insert(key, value);
        }
        if !matches!(
            status,
            ProposalStatus::PendingApproval | ProposalStatus::Approved
        ) {
            data.pending.retain(|id| id != proposal_id);
        }
        let _ = self.storage.save_proposals(data);
        true
    }
}
