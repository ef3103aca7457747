use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Skipped,
    Verified,
    Mismatch,
    Unknown,
}

impl IdentityStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Verified => "verified",
            Self::Mismatch => "mismatch",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnchainWriteStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Result of one identity check. Transient registry trouble surfaces as
/// `unknown` and never blocks a request; only an explicit `mismatch` rejects.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityCheck {
    pub enforced: bool,
    pub status: IdentityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum OwnerLookup {
    Owner(String),
    NoRecord,
}

/// On-chain agent identity registry capability.
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    /// Resolve the registered owner of an agent id. `Err` means the registry
    /// could not be consulted (transient), not that the agent is unowned.
    async fn resolve_owner(&self, agent_id: &str) -> Result<OwnerLookup, String>;

    /// Submit an ownership registration; returns the tx hash when accepted.
    async fn submit_registration(
        &self,
        agent_id: &str,
        operator_wallet: &str,
    ) -> Result<String, String>;

    /// Poll the status of a previously submitted registration write.
    async fn write_status(&self, tx_hash: &str) -> OnchainWriteStatus;

    fn name(&self) -> &'static str;
}

/// Policy wrapper that turns raw registry lookups into an [`IdentityCheck`].
#[derive(Clone)]
pub struct IdentityService {
    registry: Arc<dyn IdentityRegistry>,
}

impl IdentityService {
    #[must_use]
    pub fn new(registry: Arc<dyn IdentityRegistry>) -> Self {
        Self { registry }
    }

    pub fn from_config(config: &Config) -> Self {
        let registry: Arc<dyn IdentityRegistry> = match config.onchain_rpc_url.as_ref() {
            Some(url) => Arc::new(RpcIdentityRegistry::new(url, config.rpc_timeout_ms)),
            None => Arc::new(StaticIdentityRegistry::default()),
        };
        Self { registry }
    }

    pub fn provider_name(&self) -> &'static str {
        self.registry.name()
    }

    pub async fn check(
        &self,
        enforced: bool,
        agent_id: &str,
        operator_wallet: &str,
    ) -> IdentityCheck {
        let checked_at = Utc::now();
        if !enforced {
            return IdentityCheck {
                enforced,
                status: IdentityStatus::Skipped,
                owner: None,
                reason: None,
                checked_at,
            };
        }

        match self.registry.resolve_owner(agent_id).await {
            Ok(OwnerLookup::Owner(owner)) => {
                let normalized = owner.trim().to_lowercase();
                let status = if normalized == operator_wallet.trim().to_lowercase() {
                    IdentityStatus::Verified
                } else {
                    IdentityStatus::Mismatch
                };
                IdentityCheck {
                    enforced,
                    status,
                    owner: Some(normalized),
                    reason: None,
                    checked_at,
                }
            }
            Ok(OwnerLookup::NoRecord) => IdentityCheck {
                enforced,
                status: IdentityStatus::Unknown,
                owner: None,
                reason: Some("no on-chain record".to_string()),
                checked_at,
            },
            Err(error) => {
                tracing::warn!(
                    target: "agora.onchain",
                    agent_id = %agent_id,
                    error = %error,
                    "identity registry unavailable; treating as unknown",
                );
                IdentityCheck {
                    enforced,
                    status: IdentityStatus::Unknown,
                    owner: None,
                    reason: Some(error),
                    checked_at,
                }
            }
        }
    }

    pub async fn submit_registration(
        &self,
        agent_id: &str,
        operator_wallet: &str,
    ) -> Result<String, String> {
        self.registry
            .submit_registration(agent_id, operator_wallet)
            .await
    }

    pub async fn write_status(&self, tx_hash: &str) -> OnchainWriteStatus {
        self.registry.write_status(tx_hash).await
    }
}

/// In-process registry used when no RPC endpoint is configured. Ownership
/// rows are seeded programmatically; write submissions confirm immediately
/// unless a status override is installed.
#[derive(Clone, Default)]
pub struct StaticIdentityRegistry {
    owners: Arc<RwLock<HashMap<String, String>>>,
    write_statuses: Arc<RwLock<HashMap<String, OnchainWriteStatus>>>,
}

impl StaticIdentityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_owner(&self, agent_id: &str, owner: &str) {
        let mut owners = self.owners.write().await;
        owners.insert(agent_id.to_string(), owner.trim().to_lowercase());
    }

    pub async fn set_write_status(&self, tx_hash: &str, status: OnchainWriteStatus) {
        let mut statuses = self.write_statuses.write().await;
        statuses.insert(tx_hash.to_string(), status);
    }
}

#[async_trait]
impl IdentityRegistry for StaticIdentityRegistry {
    async fn resolve_owner(&self, agent_id: &str) -> Result<OwnerLookup, String> {
        let owners = self.owners.read().await;
        Ok(owners
            .get(agent_id)
            .map_or(OwnerLookup::NoRecord, |owner| {
                OwnerLookup::Owner(owner.clone())
            }))
    }

    async fn submit_registration(
        &self,
        agent_id: &str,
        operator_wallet: &str,
    ) -> Result<String, String> {
        let tx_hash = format!("0xidw{}", Uuid::new_v4().simple());
        {
            let mut owners = self.owners.write().await;
            owners
                .entry(agent_id.to_string())
                .or_insert_with(|| operator_wallet.trim().to_lowercase());
        }
        Ok(tx_hash)
    }

    async fn write_status(&self, tx_hash: &str) -> OnchainWriteStatus {
        let statuses = self.write_statuses.read().await;
        statuses
            .get(tx_hash)
            .copied()
            .unwrap_or(OnchainWriteStatus::Confirmed)
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// JSON-RPC registry client for the configured on-chain endpoint.
#[derive(Clone)]
pub struct RpcIdentityRegistry {
    endpoint_url: String,
    http: reqwest::Client,
    timeout: StdDuration,
}

#[derive(Debug, Serialize)]
struct RegistryRpcRequest<'a> {
    method: &'static str,
    params: RegistryRpcParams<'a>,
}

#[derive(Debug, Serialize)]
struct RegistryRpcParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    operator_wallet: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tx_hash: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RegistryOwnerResponse {
    owner: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrySubmitResponse {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct RegistryWriteStatusResponse {
    status: OnchainWriteStatus,
}

impl RpcIdentityRegistry {
    #[must_use]
    pub fn new(endpoint_url: &str, timeout_ms: u64) -> Self {
        Self {
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            timeout: StdDuration::from_millis(timeout_ms),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        request: &RegistryRpcRequest<'_>,
    ) -> Result<T, String> {
        let response = self
            .http
            .post(&self.endpoint_url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|error| format!("identity registry request failed: {error}"))?;

        if !response.status().is_success() {
            return Err(format!(
                "identity registry rejected ({})",
                response.status()
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| format!("identity registry returned malformed body: {error}"))
    }
}

#[async_trait]
impl IdentityRegistry for RpcIdentityRegistry {
    async fn resolve_owner(&self, agent_id: &str) -> Result<OwnerLookup, String> {
        let response: RegistryOwnerResponse = self
            .call(&RegistryRpcRequest {
                method: "agent_identity.owner_of",
                params: RegistryRpcParams {
                    agent_id: Some(agent_id),
                    operator_wallet: None,
                    tx_hash: None,
                },
            })
            .await?;

        Ok(response
            .owner
            .filter(|owner| !owner.trim().is_empty())
            .map_or(OwnerLookup::NoRecord, OwnerLookup::Owner))
    }

    async fn submit_registration(
        &self,
        agent_id: &str,
        operator_wallet: &str,
    ) -> Result<String, String> {
        let response: RegistrySubmitResponse = self
            .call(&RegistryRpcRequest {
                method: "agent_identity.register",
                params: RegistryRpcParams {
                    agent_id: Some(agent_id),
                    operator_wallet: Some(operator_wallet),
                    tx_hash: None,
                },
            })
            .await?;
        Ok(response.tx_hash)
    }

    async fn write_status(&self, tx_hash: &str) -> OnchainWriteStatus {
        let response: Result<RegistryWriteStatusResponse, String> = self
            .call(&RegistryRpcRequest {
                method: "agent_identity.write_status",
                params: RegistryRpcParams {
                    agent_id: None,
                    operator_wallet: None,
                    tx_hash: Some(tx_hash),
                },
            })
            .await;

        match response {
            Ok(body) => body.status,
            Err(error) => {
                tracing::warn!(
                    target: "agora.onchain",
                    tx_hash = %tx_hash,
                    error = %error,
                    "write status poll failed; leaving registration pending",
                );
                OnchainWriteStatus::Pending
            }
        }
    }

    fn name(&self) -> &'static str {
        "rpc"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        IdentityService, IdentityStatus, OnchainWriteStatus, StaticIdentityRegistry,
    };

    #[tokio::test]
    async fn disabled_enforcement_short_circuits_to_skipped() {
        let registry = StaticIdentityRegistry::new();
        registry.set_owner("agent-1", "0xsomeoneelse").await;
        let service = IdentityService::new(Arc::new(registry));

        let check = service.check(false, "agent-1", "0xoperator").await;
        assert_eq!(check.status, IdentityStatus::Skipped);
        assert!(!check.enforced);
    }

    #[tokio::test]
    async fn owner_match_verifies_case_insensitively() {
        let registry = StaticIdentityRegistry::new();
        registry.set_owner("agent-1", "0xOperatorWallet").await;
        let service = IdentityService::new(Arc::new(registry));

        let check = service.check(true, "agent-1", "0XOPERATORWALLET").await;
        assert_eq!(check.status, IdentityStatus::Verified);
        assert_eq!(check.owner.as_deref(), Some("0xoperatorwallet"));
    }

    #[tokio::test]
    async fn differing_owner_is_a_mismatch_and_missing_record_is_unknown() {
        let registry = StaticIdentityRegistry::new();
        registry.set_owner("agent-1", "0xsomeoneelse").await;
        let service = IdentityService::new(Arc::new(registry));

        let mismatch = service.check(true, "agent-1", "0xoperator").await;
        assert_eq!(mismatch.status, IdentityStatus::Mismatch);

        let unknown = service.check(true, "agent-2", "0xoperator").await;
        assert_eq!(unknown.status, IdentityStatus::Unknown);
    }

    #[tokio::test]
    async fn registration_writes_confirm_unless_overridden() {
        let registry = StaticIdentityRegistry::new();
        let service = IdentityService::new(Arc::new(registry.clone()));

        let tx_hash = service
            .submit_registration("agent-1", "0xoperator")
            .await
            .unwrap_or_default();
        assert!(tx_hash.starts_with("0xidw"));
        assert_eq!(
            service.write_status(&tx_hash).await,
            OnchainWriteStatus::Confirmed
        );

        registry
            .set_write_status(&tx_hash, OnchainWriteStatus::Failed)
            .await;
        assert_eq!(
            service.write_status(&tx_hash).await,
            OnchainWriteStatus::Failed
        );
    }
}
