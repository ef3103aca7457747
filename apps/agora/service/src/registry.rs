use std::collections::HashMap;
use std::sync::Arc;

use agora_x402::is_decimal_amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::onchain::{IdentityCheck, IdentityStatus, OnchainWriteStatus};
use crate::proofs::{EndpointOwnershipProof, verify_proof_set};

pub const MAX_TRUST_SCORE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    StakingSteward,
    TreasuryDispatcher,
    SwapRunner,
}

impl AgentType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StakingSteward => "staking_steward",
            Self::TreasuryDispatcher => "treasury_dispatcher",
            Self::SwapRunner => "swap_runner",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Active,
    Paused,
    Retired,
}

impl ProfileStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Retired => "retired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    PerRun,
    Subscription,
    SuccessFee,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPricing {
    pub mode: PricingMode,
    /// Token-smallest-unit amount as a decimal string.
    pub amount: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tongo_recipient: Option<String>,
}

/// Published agent service profile.
#[derive(Debug, Clone, Serialize)]
pub struct AgentProfile {
    pub agent_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub agent_type: AgentType,
    pub capabilities: Vec<String>,
    pub endpoints: Vec<String>,
    pub endpoint_proofs: Vec<EndpointOwnershipProof>,
    pub pricing: AgentPricing,
    pub operator_wallet: String,
    pub service_wallet: String,
    pub verified: bool,
    pub trust_score: u8,
    pub status: ProfileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onchain_status: Option<IdentityStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onchain_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onchain_checked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onchain_write_status: Option<OnchainWriteStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onchain_write_tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_indexed_at: DateTime<Utc>,
}

/// Register/upsert request body.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterProfileInput {
    pub agent_id: String,
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    pub agent_type: AgentType,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub endpoint_proofs: Vec<EndpointOwnershipProof>,
    pub pricing: AgentPricing,
    pub operator_wallet: String,
    #[serde(default)]
    pub service_wallet: Option<String>,
    #[serde(default)]
    pub metadata_uri: Option<String>,
}

/// Operator patch; every field optional, an all-empty patch is rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfilePatch {
    #[serde(default)]
    pub status: Option<ProfileStatus>,
    #[serde(default)]
    pub verified: Option<bool>,
    #[serde(default)]
    pub trust_score: Option<u8>,
    #[serde(default)]
    pub metadata_uri: Option<String>,
}

impl ProfilePatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.verified.is_none()
            && self.trust_score.is_none()
            && self.metadata_uri.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProfileFilter {
    pub agent_type: Option<AgentType>,
    pub capability: Option<String>,
    pub verified_only: bool,
    pub status: Option<ProfileStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{message}")]
    Validation { message: String },
    #[error("{message}")]
    Forbidden { message: String },
    #[error("Agent profile not found.")]
    NotFound,
}

/// Normalized profile draft, produced by validation before any store write.
#[derive(Debug, Clone)]
pub struct ProfileDraft {
    pub agent_id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub agent_type: AgentType,
    pub capabilities: Vec<String>,
    pub endpoints: Vec<String>,
    pub endpoint_proofs: Vec<EndpointOwnershipProof>,
    pub pricing: AgentPricing,
    pub operator_wallet: String,
    pub service_wallet: String,
    pub metadata_uri: Option<String>,
}

/// Validate and normalize a register/upsert request.
///
/// The caller wallet must be the profile's operator; endpoints must be
/// non-empty HTTPS URLs with exactly one valid ownership proof each; pricing
/// amounts must be non-negative integers in smallest units.
pub fn validate_register_input(
    caller_wallet: &str,
    input: RegisterProfileInput,
    fallback_service_wallet: &str,
) -> Result<ProfileDraft, RegistryError> {
    let agent_id = input.agent_id.trim().to_string();
    if agent_id.is_empty() {
        return Err(RegistryError::Validation {
            message: "agent_id is required".to_string(),
        });
    }

    let operator_wallet = input.operator_wallet.trim().to_lowercase();
    if operator_wallet.is_empty() {
        return Err(RegistryError::Validation {
            message: "operator_wallet is required".to_string(),
        });
    }
    if operator_wallet != caller_wallet.trim().to_lowercase() {
        return Err(RegistryError::Forbidden {
            message: "operator_wallet must match the authenticated wallet".to_string(),
        });
    }

    if input.endpoints.is_empty() {
        return Err(RegistryError::Validation {
            message: "at least one endpoint is required".to_string(),
        });
    }
    for endpoint in &input.endpoints {
        if !endpoint.trim().to_lowercase().starts_with("https://") {
            return Err(RegistryError::Validation {
                message: format!("endpoint '{endpoint}' must be an https URL"),
            });
        }
    }

    verify_proof_set(&operator_wallet, &input.endpoints, &input.endpoint_proofs).map_err(
        |error| RegistryError::Validation {
            message: error.to_string(),
        },
    )?;

    if !is_decimal_amount(&input.pricing.amount) {
        return Err(RegistryError::Validation {
            message: "pricing.amount must be a non-negative integer string".to_string(),
        });
    }
    if input.pricing.token.trim().is_empty() {
        return Err(RegistryError::Validation {
            message: "pricing.token is required".to_string(),
        });
    }

    let mut capabilities: Vec<String> = Vec::new();
    for capability in &input.capabilities {
        let normalized = capability.trim().to_lowercase();
        if !normalized.is_empty() && !capabilities.contains(&normalized) {
            capabilities.push(normalized);
        }
    }

    let service_wallet = input
        .service_wallet
        .as_deref()
        .map(|wallet| wallet.trim().to_lowercase())
        .filter(|wallet| !wallet.is_empty())
        .unwrap_or_else(|| {
            if fallback_service_wallet.is_empty() {
                operator_wallet.clone()
            } else {
                fallback_service_wallet.to_lowercase()
            }
        });

    let display_name = input
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(&agent_id)
        .to_string();

    Ok(ProfileDraft {
        agent_id,
        display_name,
        description: input.description.filter(|text| !text.trim().is_empty()),
        image_url: input.image_url.filter(|url| !url.trim().is_empty()),
        agent_type: input.agent_type,
        capabilities,
        endpoints: input.endpoints,
        endpoint_proofs: input.endpoint_proofs,
        pricing: input.pricing,
        operator_wallet,
        service_wallet,
        metadata_uri: input.metadata_uri.filter(|uri| !uri.trim().is_empty()),
    })
}

/// In-memory profile repository plus registry operations.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    profiles: Arc<RwLock<HashMap<String, AgentProfile>>>,
}

impl AgentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the profile for `draft.agent_id`.
    ///
    /// Returns the stored profile and whether it was newly created. An upsert
    /// by a wallet other than the existing profile's operator is forbidden.
    pub async fn upsert(
        &self,
        draft: ProfileDraft,
        now: DateTime<Utc>,
    ) -> Result<(AgentProfile, bool), RegistryError> {
        let mut profiles = self.profiles.write().await;

        match profiles.get_mut(&draft.agent_id) {
            Some(existing) => {
                if existing.operator_wallet != draft.operator_wallet {
                    return Err(RegistryError::Forbidden {
                        message: "profile is owned by another operator".to_string(),
                    });
                }

                existing.display_name = draft.display_name;
                existing.description = draft.description;
                existing.image_url = draft.image_url;
                existing.agent_type = draft.agent_type;
                existing.capabilities = draft.capabilities;
                existing.endpoints = draft.endpoints;
                existing.endpoint_proofs = draft.endpoint_proofs;
                existing.pricing = draft.pricing;
                existing.service_wallet = draft.service_wallet;
                existing.metadata_uri = draft.metadata_uri;
                existing.updated_at = now;
                existing.last_indexed_at = now;

                Ok((existing.clone(), false))
            }
            None => {
                let profile = AgentProfile {
                    agent_id: draft.agent_id.clone(),
                    display_name: draft.display_name,
                    description: draft.description,
                    image_url: draft.image_url,
                    agent_type: draft.agent_type,
                    capabilities: draft.capabilities,
                    endpoints: draft.endpoints,
                    endpoint_proofs: draft.endpoint_proofs,
                    pricing: draft.pricing,
                    operator_wallet: draft.operator_wallet,
                    service_wallet: draft.service_wallet,
                    verified: false,
                    trust_score: 50,
                    status: ProfileStatus::Active,
                    metadata_uri: draft.metadata_uri,
                    onchain_status: None,
                    onchain_owner: None,
                    onchain_checked_at: None,
                    onchain_write_status: None,
                    onchain_write_tx_hash: None,
                    created_at: now,
                    updated_at: now,
                    last_indexed_at: now,
                };
                profiles.insert(draft.agent_id, profile.clone());
                Ok((profile, true))
            }
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentProfile> {
        let profiles = self.profiles.read().await;
        profiles.get(agent_id).cloned()
    }

    pub async fn list(&self, filter: &ProfileFilter) -> Vec<AgentProfile> {
        let profiles = self.profiles.read().await;
        let mut matching: Vec<AgentProfile> = profiles
            .values()
            .filter(|profile| {
                filter
                    .agent_type
                    .is_none_or(|agent_type| profile.agent_type == agent_type)
            })
            .filter(|profile| {
                filter.capability.as_deref().is_none_or(|capability| {
                    let needle = capability.trim().to_lowercase();
                    profile.capabilities.iter().any(|have| *have == needle)
                })
            })
            .filter(|profile| !filter.verified_only || profile.verified)
            .filter(|profile| filter.status.is_none_or(|status| profile.status == status))
            .cloned()
            .collect();

        matching.sort_by(|left, right| left.agent_id.cmp(&right.agent_id));

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        matching.into_iter().skip(offset).take(limit).collect()
    }

    /// Operator-only patch of `{status, verified, trust_score, metadata_uri}`.
    pub async fn apply_patch(
        &self,
        agent_id: &str,
        caller_wallet: &str,
        patch: ProfilePatch,
        now: DateTime<Utc>,
    ) -> Result<AgentProfile, RegistryError> {
        if patch.is_empty() {
            return Err(RegistryError::Validation {
                message: "patch must include at least one field".to_string(),
            });
        }
        if let Some(trust_score) = patch.trust_score {
            if trust_score > MAX_TRUST_SCORE {
                return Err(RegistryError::Validation {
                    message: "trust_score must be between 0 and 100".to_string(),
                });
            }
        }

        let mut profiles = self.profiles.write().await;
        let profile = profiles.get_mut(agent_id).ok_or(RegistryError::NotFound)?;

        if profile.operator_wallet != caller_wallet.trim().to_lowercase() {
            return Err(RegistryError::Forbidden {
                message: "only the profile operator may update it".to_string(),
            });
        }

        if let Some(status) = patch.status {
            profile.status = status;
        }
        if let Some(verified) = patch.verified {
            profile.verified = verified;
        }
        if let Some(trust_score) = patch.trust_score {
            profile.trust_score = trust_score;
        }
        if let Some(metadata_uri) = patch.metadata_uri {
            profile.metadata_uri = if metadata_uri.trim().is_empty() {
                None
            } else {
                Some(metadata_uri)
            };
        }
        profile.updated_at = now;

        Ok(profile.clone())
    }

    /// Record the outcome of an identity check onto the stored profile.
    pub async fn record_identity(&self, agent_id: &str, check: &IdentityCheck) {
        let mut profiles = self.profiles.write().await;
        if let Some(profile) = profiles.get_mut(agent_id) {
            profile.onchain_status = Some(check.status);
            profile.onchain_owner = check.owner.clone();
            profile.onchain_checked_at = Some(check.checked_at);
        }
    }

    pub async fn record_write_submitted(&self, agent_id: &str, tx_hash: &str) {
        let mut profiles = self.profiles.write().await;
        if let Some(profile) = profiles.get_mut(agent_id) {
            profile.onchain_write_status = Some(OnchainWriteStatus::Pending);
            profile.onchain_write_tx_hash = Some(tx_hash.to_string());
        }
    }

    /// Resolve a pending on-chain write to its polled status.
    pub async fn record_write_status(
        &self,
        agent_id: &str,
        status: OnchainWriteStatus,
        now: DateTime<Utc>,
    ) {
        let mut profiles = self.profiles.write().await;
        if let Some(profile) = profiles.get_mut(agent_id) {
            profile.onchain_write_status = Some(status);
            profile.updated_at = now;
            profile.last_indexed_at = now;
        }
    }

    /// Freshness bounds over `last_indexed_at`, plus active count.
    pub async fn freshness(&self) -> (usize, usize, Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let profiles = self.profiles.read().await;
        let total = profiles.len();
        let active = profiles
            .values()
            .filter(|profile| profile.status == ProfileStatus::Active)
            .count();
        let stalest = profiles.values().map(|p| p.last_indexed_at).min();
        let freshest = profiles.values().map(|p| p.last_indexed_at).max();
        (total, active, stalest, freshest)
    }
}
