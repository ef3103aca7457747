use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::AgentProfile;

pub const RANKING_VERSION: &str = "v1";

const WEIGHT_TRUST: f64 = 0.45;
const WEIGHT_VERIFIED: f64 = 0.20;
const WEIGHT_CAPABILITY: f64 = 0.20;
const WEIGHT_FRESHNESS: f64 = 0.15;
const FRESHNESS_HORIZON_DAYS: f64 = 30.0;

/// Profile plus its discovery score, as returned from `/marketplace/discover`.
#[derive(Debug, Clone, Serialize)]
pub struct RankedProfile {
    #[serde(flatten)]
    pub agent: AgentProfile,
    pub discovery_score: f64,
    pub ranking_version: &'static str,
}

/// Score one candidate for the requested capability.
#[must_use]
pub fn discovery_score(
    profile: &AgentProfile,
    capability: Option<&str>,
    now: DateTime<Utc>,
) -> f64 {
    let trust = f64::from(profile.trust_score) / f64::from(crate::registry::MAX_TRUST_SCORE);
    let verified = if profile.verified { 1.0 } else { 0.0 };
    let capability_match = match capability {
        Some(capability) => {
            let needle = capability.trim().to_lowercase();
            if profile.capabilities.iter().any(|have| *have == needle) {
                1.0
            } else {
                0.0
            }
        }
        None => 0.0,
    };
    let freshness = freshness_decay(profile.last_indexed_at, now);

    WEIGHT_TRUST * trust
        + WEIGHT_VERIFIED * verified
        + WEIGHT_CAPABILITY * capability_match
        + WEIGHT_FRESHNESS * freshness
}

/// Linear decay from 1.0 at zero age to 0.0 at thirty days.
#[must_use]
pub fn freshness_decay(last_indexed_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_seconds = (now - last_indexed_at).num_seconds().max(0) as f64;
    let age_days = age_seconds / 86_400.0;
    (1.0 - age_days / FRESHNESS_HORIZON_DAYS).max(0.0)
}

/// Rank candidates: score descending, ties broken by trust score descending,
/// then agent id ascending.
#[must_use]
pub fn rank_profiles(
    candidates: Vec<AgentProfile>,
    capability: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<RankedProfile> {
    let mut ranked: Vec<RankedProfile> = candidates
        .into_iter()
        .map(|agent| {
            let score = discovery_score(&agent, capability, now);
            RankedProfile {
                agent,
                discovery_score: score,
                ranking_version: RANKING_VERSION,
            }
        })
        .collect();

    ranked.sort_by(|left, right| {
        right
            .discovery_score
            .partial_cmp(&left.discovery_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| right.agent.trust_score.cmp(&left.agent.trust_score))
            .then_with(|| left.agent.agent_id.cmp(&right.agent.agent_id))
    });

    ranked
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{discovery_score, freshness_decay, rank_profiles};
    use crate::registry::{
        AgentPricing, AgentProfile, AgentType, PricingMode, ProfileStatus,
    };

    fn profile(agent_id: &str, trust_score: u8, verified: bool) -> AgentProfile {
        let now = Utc::now();
        AgentProfile {
            agent_id: agent_id.to_string(),
            display_name: agent_id.to_string(),
            description: None,
            image_url: None,
            agent_type: AgentType::SwapRunner,
            capabilities: vec!["swap".to_string()],
            endpoints: vec!["https://agent.example/api".to_string()],
            endpoint_proofs: Vec::new(),
            pricing: AgentPricing {
                mode: PricingMode::PerRun,
                amount: "100".to_string(),
                token: "STRK".to_string(),
                cadence: None,
                tongo_recipient: None,
            },
            operator_wallet: "0xoperatorwallet".to_string(),
            service_wallet: "0xservicewallet".to_string(),
            verified,
            trust_score,
            status: ProfileStatus::Active,
            metadata_uri: None,
            onchain_status: None,
            onchain_owner: None,
            onchain_checked_at: None,
            onchain_write_status: None,
            onchain_write_tx_hash: None,
            created_at: now,
            updated_at: now,
            last_indexed_at: now,
        }
    }

    #[test]
    fn fresh_verified_matching_profile_scores_the_formula_maximum() {
        let now = Utc::now();
        let candidate = profile("swap-1", 100, true);

        let score = discovery_score(&candidate, Some("swap"), now);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn capability_mismatch_drops_the_capability_weight() {
        let now = Utc::now();
        let candidate = profile("swap-1", 100, true);

        let with_match = discovery_score(&candidate, Some("swap"), now);
        let without = discovery_score(&candidate, Some("stake"), now);
        assert!((with_match - without - 0.20).abs() < 1e-9);
    }

    #[test]
    fn freshness_decays_linearly_and_floors_at_zero() {
        let now = Utc::now();

        assert!((freshness_decay(now, now) - 1.0).abs() < 1e-9);
        let half = freshness_decay(now - Duration::days(15), now);
        assert!((half - 0.5).abs() < 1e-3);
        assert_eq!(freshness_decay(now - Duration::days(45), now), 0.0);
    }

    #[test]
    fn ranking_orders_by_score_then_trust_then_agent_id() {
        let now = Utc::now();
        let mut stale = profile("stale", 90, true);
        stale.last_indexed_at = now - Duration::days(29);

        let ranked = rank_profiles(
            vec![
                profile("b-agent", 80, true),
                stale,
                profile("a-agent", 80, true),
            ],
            Some("swap"),
            now,
        );

        let order: Vec<&str> = ranked
            .iter()
            .map(|entry| entry.agent.agent_id.as_str())
            .collect();
        assert_eq!(order, vec!["a-agent", "b-agent", "stale"]);
        assert!(ranked.iter().all(|entry| entry.ranking_version == "v1"));
        assert!(ranked[0].discovery_score >= ranked[1].discovery_score);
    }
}
