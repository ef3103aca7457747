use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Active,
    Revoked,
}

/// Pre-signed spend allowance an operator granted to an agent.
#[derive(Debug, Clone)]
pub struct Delegation {
    pub delegation_id: String,
    pub operator_wallet: String,
    pub allowed_actions: Vec<String>,
    pub token: String,
    pub max_per_run: u128,
    pub total_allowance: u128,
    pub remaining_allowance: u128,
    pub consumed_amount: u128,
    pub nonce: u64,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: DelegationStatus,
}

/// Spend-authorization reference carried in a run request.
#[derive(Debug, Clone, Deserialize)]
pub struct SpendAuthorizationInput {
    pub delegation_id: String,
    pub amount: String,
    pub token: String,
}

/// Evidence of one consumed authorization, attached to the run.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationEvidence {
    pub delegation_id: String,
    pub authorized_amount: String,
    pub consumed_amount: String,
    pub remaining_allowance_snapshot: String,
    pub delegation_consume_tx_hash: String,
    pub escrow_transfer_tx_hash: String,
}

#[derive(Debug, Clone, Error)]
pub enum SpendAuthError {
    #[error("Spend authorization is required for billable runs.")]
    Required,
    #[error("Delegation not found for this operator.")]
    NotFound,
    #[error("Delegation is not active.")]
    Inactive,
    #[error("Delegation is outside its validity window.")]
    Window,
    #[error("Action '{action}' is not covered by this delegation.")]
    ActionNotAllowed { action: String },
    #[error("Amount exceeds the delegation's per-run maximum.")]
    ExceedsMaxPerRun,
    #[error("Delegation allowance is insufficient for this amount.")]
    InsufficientAllowance,
    #[error("Delegation token does not match the requested token.")]
    TokenMismatch,
    #[error("spend authorization amount must be a non-negative integer string")]
    InvalidAmount,
    #[error("Delegation consume failed: {message}")]
    Settlement { message: String },
}

impl SpendAuthError {
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Required => "SPEND_AUTH_REQUIRED",
            Self::NotFound => "DELEGATION_NOT_FOUND",
            Self::Inactive => "DELEGATION_INACTIVE",
            Self::Window => "DELEGATION_WINDOW",
            Self::ActionNotAllowed { .. } => "ACTION_NOT_ALLOWED",
            Self::ExceedsMaxPerRun => "AMOUNT_EXCEEDS_MAX_PER_RUN",
            Self::InsufficientAllowance => "INSUFFICIENT_ALLOWANCE",
            Self::TokenMismatch => "TOKEN_MISMATCH",
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::Settlement { .. } => "DELEGATION_CONSUME_FAILED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpendAuthTxHashes {
    pub delegation_consume_tx_hash: String,
    pub escrow_transfer_tx_hash: String,
}

/// On-chain delegation-consume capability; produces the settlement tx hashes
/// backing one consumed authorization.
#[async_trait]
pub trait SpendAuthSettlement: Send + Sync {
    async fn consume(
        &self,
        delegation_id: &str,
        recipient: &str,
        amount: u128,
        nonce: u64,
    ) -> Result<SpendAuthTxHashes, String>;

    fn name(&self) -> &'static str;
}

/// Deterministic in-process consume used when no chain backend is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedSpendAuthSettlement;

#[async_trait]
impl SpendAuthSettlement for SimulatedSpendAuthSettlement {
    async fn consume(
        &self,
        _delegation_id: &str,
        _recipient: &str,
        _amount: u128,
        _nonce: u64,
    ) -> Result<SpendAuthTxHashes, String> {
        Ok(SpendAuthTxHashes {
            delegation_consume_tx_hash: format!("0xdel{}", Uuid::new_v4().simple()),
            escrow_transfer_tx_hash: format!("0xesc{}", Uuid::new_v4().simple()),
        })
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

/// Delegation ledger with atomic validate-and-consume.
#[derive(Clone)]
pub struct SpendAuthLedger {
    delegations: Arc<Mutex<HashMap<String, Delegation>>>,
    settlement: Arc<dyn SpendAuthSettlement>,
}

impl Default for SpendAuthLedger {
    fn default() -> Self {
        Self {
            delegations: Arc::new(Mutex::new(HashMap::new())),
            settlement: Arc::new(SimulatedSpendAuthSettlement),
        }
    }
}

impl SpendAuthLedger {
    #[must_use]
    pub fn new(settlement: Arc<dyn SpendAuthSettlement>) -> Self {
        Self {
            delegations: Arc::new(Mutex::new(HashMap::new())),
            settlement,
        }
    }

    pub async fn register(&self, delegation: Delegation) {
        let mut delegations = self.delegations.lock().await;
        delegations.insert(delegation.delegation_id.clone(), delegation);
    }

    pub async fn get(&self, delegation_id: &str) -> Option<Delegation> {
        let delegations = self.delegations.lock().await;
        delegations.get(delegation_id).cloned()
    }

    /// Validate the authorization and consume `amount` from it.
    ///
    /// The allowance arithmetic happens under the ledger lock so concurrent
    /// retries cannot double-spend; the chain consume runs after the reserve
    /// and is rolled back if it fails.
    pub async fn validate_and_consume(
        &self,
        input: &SpendAuthorizationInput,
        action: &str,
        operator_wallet: &str,
        recipient: &str,
        now: DateTime<Utc>,
    ) -> Result<DelegationEvidence, SpendAuthError> {
        let amount = input
            .amount
            .trim()
            .parse::<u128>()
            .map_err(|_| SpendAuthError::InvalidAmount)?;

        let (consumed_amount, remaining_allowance, nonce) = {
            let mut delegations = self.delegations.lock().await;
            let delegation = delegations
                .get_mut(&input.delegation_id)
                .filter(|delegation| {
                    delegation.operator_wallet == operator_wallet.to_lowercase()
                })
                .ok_or(SpendAuthError::NotFound)?;

            if delegation.status != DelegationStatus::Active {
                return Err(SpendAuthError::Inactive);
            }
            if now < delegation.valid_from || now > delegation.valid_until {
                return Err(SpendAuthError::Window);
            }
            let normalized_action = action.trim().to_lowercase();
            if !delegation
                .allowed_actions
                .iter()
                .any(|allowed| *allowed == normalized_action)
            {
                return Err(SpendAuthError::ActionNotAllowed {
                    action: normalized_action,
                });
            }
            if amount > delegation.max_per_run {
                return Err(SpendAuthError::ExceedsMaxPerRun);
            }
            if delegation.remaining_allowance < amount {
                return Err(SpendAuthError::InsufficientAllowance);
            }
            if delegation.token != input.token.trim() {
                return Err(SpendAuthError::TokenMismatch);
            }

            delegation.remaining_allowance -= amount;
            delegation.consumed_amount += amount;
            delegation.nonce += 1;

            (
                delegation.consumed_amount,
                delegation.remaining_allowance,
                delegation.nonce,
            )
        };

        match self
            .settlement
            .consume(&input.delegation_id, recipient, amount, nonce)
            .await
        {
            Ok(tx_hashes) => Ok(DelegationEvidence {
                delegation_id: input.delegation_id.clone(),
                authorized_amount: amount.to_string(),
                consumed_amount: consumed_amount.to_string(),
                remaining_allowance_snapshot: remaining_allowance.to_string(),
                delegation_consume_tx_hash: tx_hashes.delegation_consume_tx_hash,
                escrow_transfer_tx_hash: tx_hashes.escrow_transfer_tx_hash,
            }),
            Err(message) => {
                let mut delegations = self.delegations.lock().await;
                if let Some(delegation) = delegations.get_mut(&input.delegation_id) {
                    delegation.remaining_allowance += amount;
                    delegation.consumed_amount =
                        delegation.consumed_amount.saturating_sub(amount);
                }
                Err(SpendAuthError::Settlement { message })
            }
        }
    }
}
