use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::registry::PricingMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HireStatus {
    Active,
    Paused,
    Revoked,
}

impl HireStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Revoked => "revoked",
        }
    }
}

/// Engagement between an operator wallet and an agent profile.
///
/// The policy snapshot is captured verbatim at hire time and never mutated;
/// runs read it for policy context long after the operator may have changed
/// their live policy.
#[derive(Debug, Clone, Serialize)]
pub struct AgentHire {
    pub id: String,
    pub agent_id: String,
    pub operator_wallet: String,
    pub policy_snapshot: Value,
    pub billing_mode: PricingMode,
    pub status: HireStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateHireInput {
    pub agent_id: String,
    pub operator_wallet: String,
    #[serde(default)]
    pub policy_snapshot: Option<Value>,
    #[serde(default)]
    pub billing_mode: Option<PricingMode>,
}

#[derive(Debug, Error)]
pub enum HireError {
    #[error("Hire not found.")]
    NotFound,
    #[error("{message}")]
    Forbidden { message: String },
    #[error("Hire is revoked; revoked is terminal.")]
    Terminal,
}

/// In-memory hire ledger.
#[derive(Clone, Default)]
pub struct HireLedger {
    hires: Arc<RwLock<HashMap<String, AgentHire>>>,
}

impl HireLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        agent_id: &str,
        operator_wallet: &str,
        policy_snapshot: Value,
        billing_mode: PricingMode,
        now: DateTime<Utc>,
    ) -> AgentHire {
        let hire = AgentHire {
            id: format!("hire_{}", Uuid::new_v4().simple()),
            agent_id: agent_id.to_string(),
            operator_wallet: operator_wallet.to_lowercase(),
            policy_snapshot,
            billing_mode,
            status: HireStatus::Active,
            created_at: now,
            updated_at: now,
        };

        let mut hires = self.hires.write().await;
        hires.insert(hire.id.clone(), hire.clone());
        hire
    }

    pub async fn get(&self, hire_id: &str) -> Option<AgentHire> {
        let hires = self.hires.read().await;
        hires.get(hire_id).cloned()
    }

    /// Hires owned by the wallet, newest first.
    pub async fn list(&self, operator_wallet: &str, agent_id: Option<&str>) -> Vec<AgentHire> {
        let wallet = operator_wallet.to_lowercase();
        let hires = self.hires.read().await;
        let mut matching: Vec<AgentHire> = hires
            .values()
            .filter(|hire| hire.operator_wallet == wallet)
            .filter(|hire| agent_id.is_none_or(|agent_id| hire.agent_id == agent_id))
            .cloned()
            .collect();
        matching.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        matching
    }

    /// Owner-only status transition. `active <-> paused -> revoked`; revoked
    /// is terminal.
    pub async fn update_status(
        &self,
        hire_id: &str,
        caller_wallet: &str,
        status: HireStatus,
        now: DateTime<Utc>,
    ) -> Result<AgentHire, HireError> {
        let mut hires = self.hires.write().await;
        let hire = hires.get_mut(hire_id).ok_or(HireError::NotFound)?;

        if hire.operator_wallet != caller_wallet.to_lowercase() {
            return Err(HireError::Forbidden {
                message: "only the hiring operator may change this hire".to_string(),
            });
        }

        if hire.status == HireStatus::Revoked && status != HireStatus::Revoked {
            return Err(HireError::Terminal);
        }

        hire.status = status;
        hire.updated_at = now;
        Ok(hire.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{HireError, HireLedger, HireStatus};
    use crate::registry::PricingMode;

    const OPERATOR: &str = "0xoperatorwallet";

    #[tokio::test]
    async fn policy_snapshot_is_stored_verbatim() {
        let ledger = HireLedger::new();
        let snapshot = json!({"max_spend": "1000", "allowed_actions": ["swap"]});

        let hire = ledger
            .create(
                "swap-1",
                OPERATOR,
                snapshot.clone(),
                PricingMode::PerRun,
                Utc::now(),
            )
            .await;

        assert_eq!(hire.status, HireStatus::Active);
        assert_eq!(hire.policy_snapshot, snapshot);
        assert!(hire.id.starts_with("hire_"));
    }

    #[tokio::test]
    async fn listing_scopes_to_the_owner_wallet() {
        let ledger = HireLedger::new();
        let now = Utc::now();
        ledger
            .create("swap-1", OPERATOR, json!({}), PricingMode::PerRun, now)
            .await;
        ledger
            .create("swap-1", "0xrivalwallet", json!({}), PricingMode::PerRun, now)
            .await;

        let mine = ledger.list(OPERATOR, None).await;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].operator_wallet, OPERATOR);

        let filtered = ledger.list(OPERATOR, Some("other-agent")).await;
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn transitions_follow_the_dag_and_revoked_is_terminal() {
        let ledger = HireLedger::new();
        let now = Utc::now();
        let hire = ledger
            .create("swap-1", OPERATOR, json!({}), PricingMode::PerRun, now)
            .await;

        let paused = ledger
            .update_status(&hire.id, OPERATOR, HireStatus::Paused, now)
            .await;
        assert!(matches!(paused, Ok(hire) if hire.status == HireStatus::Paused));

        let reactivated = ledger
            .update_status(&hire.id, OPERATOR, HireStatus::Active, now)
            .await;
        assert!(matches!(reactivated, Ok(hire) if hire.status == HireStatus::Active));

        let revoked = ledger
            .update_status(&hire.id, OPERATOR, HireStatus::Revoked, now)
            .await;
        assert!(matches!(revoked, Ok(hire) if hire.status == HireStatus::Revoked));

        let resurrect = ledger
            .update_status(&hire.id, OPERATOR, HireStatus::Active, now)
            .await;
        assert!(matches!(resurrect, Err(HireError::Terminal)));
    }

    #[tokio::test]
    async fn only_the_owner_may_transition() {
        let ledger = HireLedger::new();
        let now = Utc::now();
        let hire = ledger
            .create("swap-1", OPERATOR, json!({}), PricingMode::PerRun, now)
            .await;

        let denied = ledger
            .update_status(&hire.id, "0xrivalwallet", HireStatus::Paused, now)
            .await;
        assert!(matches!(denied, Err(HireError::Forbidden { .. })));
    }
}
