use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use agora_x402::SHIELDED_X402_SCHEME;

use crate::paywall::PaymentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    PendingPayment,
    Queued,
    Running,
    Completed,
    Failed,
    BlockedPolicy,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::BlockedPolicy => "blocked_policy",
        }
    }
}

/// Payment trail for one billable run.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentEvidence {
    pub scheme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_tx_hash: Option<String>,
    pub state: PaymentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_context: Option<Value>,
}

impl PaymentEvidence {
    #[must_use]
    pub fn shielded(state: PaymentState, identity_context: Option<Value>) -> Self {
        Self {
            scheme: SHIELDED_X402_SCHEME.to_string(),
            payment_ref: None,
            settlement_tx_hash: None,
            state,
            identity_context,
        }
    }
}

/// Trust summary captured when the run was accepted.
#[derive(Debug, Clone, Serialize)]
pub struct TrustSnapshot {
    pub trust_score: u8,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onchain_status: Option<String>,
}

/// One billable (or free) execution of an agent action under a hire.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRun {
    pub id: String,
    pub hire_id: String,
    pub agent_id: String,
    pub hire_operator_wallet: String,
    pub action: String,
    pub params: Value,
    pub billable: bool,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_evidence: Option<PaymentEvidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_trust_snapshot: Option<TrustSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegation_evidence: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_tx_hashes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRun {
    #[must_use]
    pub fn new(
        hire_id: &str,
        agent_id: &str,
        hire_operator_wallet: &str,
        action: &str,
        params: Value,
        billable: bool,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("run_{}", Uuid::new_v4().simple()),
            hire_id: hire_id.to_string(),
            agent_id: agent_id.to_string(),
            hire_operator_wallet: hire_operator_wallet.to_lowercase(),
            action: action.to_string(),
            params,
            billable,
            status,
            payment_ref: None,
            settlement_tx_hash: None,
            payment_evidence: None,
            agent_trust_snapshot: None,
            delegation_evidence: None,
            execution_tx_hashes: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub hire_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// In-memory run repository.
#[derive(Clone, Default)]
pub struct RunStore {
    runs: Arc<RwLock<HashMap<String, AgentRun>>>,
}

impl RunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run: AgentRun) {
        let mut runs = self.runs.write().await;
        runs.insert(run.id.clone(), run);
    }

    pub async fn update(&self, run: &AgentRun) {
        let mut runs = self.runs.write().await;
        runs.insert(run.id.clone(), run.clone());
    }

    pub async fn get(&self, run_id: &str) -> Option<AgentRun> {
        let runs = self.runs.read().await;
        runs.get(run_id).cloned()
    }

    /// Runs owned by the wallet, newest first.
    pub async fn list(&self, operator_wallet: &str, filter: &RunFilter) -> Vec<AgentRun> {
        let wallet = operator_wallet.to_lowercase();
        let runs = self.runs.read().await;
        let mut matching: Vec<AgentRun> = runs
            .values()
            .filter(|run| run.hire_operator_wallet == wallet)
            .filter(|run| {
                filter
                    .hire_id
                    .as_deref()
                    .is_none_or(|hire_id| run.hire_id == hire_id)
            })
            .filter(|run| {
                filter
                    .agent_id
                    .as_deref()
                    .is_none_or(|agent_id| run.agent_id == agent_id)
            })
            .filter(|run| filter.status.is_none_or(|status| run.status == status))
            .cloned()
            .collect();

        matching.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        matching.into_iter().skip(offset).take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{AgentRun, RunFilter, RunStatus, RunStore};

    fn run(hire_id: &str, status: RunStatus) -> AgentRun {
        AgentRun::new(
            hire_id,
            "swap_integrated",
            "0xOperatorWallet",
            "swap",
            json!({}),
            true,
            status,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn listing_scopes_to_owner_and_applies_filters() {
        let store = RunStore::new();
        store.insert(run("hire_1", RunStatus::Completed)).await;
        store.insert(run("hire_1", RunStatus::Failed)).await;
        store.insert(run("hire_2", RunStatus::Completed)).await;

        let mut foreign = run("hire_3", RunStatus::Completed);
        foreign.hire_operator_wallet = "0xrivalwallet".to_string();
        store.insert(foreign).await;

        let all = store
            .list("0xoperatorwallet", &RunFilter::default())
            .await;
        assert_eq!(all.len(), 3);

        let by_hire = store
            .list(
                "0xoperatorwallet",
                &RunFilter {
                    hire_id: Some("hire_1".to_string()),
                    ..RunFilter::default()
                },
            )
            .await;
        assert_eq!(by_hire.len(), 2);

        let completed = store
            .list(
                "0xoperatorwallet",
                &RunFilter {
                    status: Some(RunStatus::Completed),
                    ..RunFilter::default()
                },
            )
            .await;
        assert_eq!(completed.len(), 2);
    }

    #[test]
    fn run_serialization_omits_unset_evidence() {
        let value = serde_json::to_value(run("hire_1", RunStatus::Queued)).unwrap_or_default();

        assert_eq!(value["status"], "queued");
        assert!(value.get("payment_evidence").is_none());
        assert!(value.get("result").is_none());
        assert_eq!(value["hire_operator_wallet"], "0xoperatorwallet");
    }
}
