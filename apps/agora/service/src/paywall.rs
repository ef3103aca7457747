use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use agora_x402::{
    PaymentContext, SHIELDED_X402_SCHEME, SHIELDED_X402_VERSION, ShieldedChallenge,
    ShieldedPaymentPayload,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::Config;

/// Settlement state carried in run payment evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Required,
    PendingPayment,
    Settled,
    Failed,
}

impl PaymentState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::PendingPayment => "pending_payment",
            Self::Settled => "settled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayState {
    Settling,
    Settled,
    Failed,
}

/// Successful paywall outcome handed to the run pipeline.
#[derive(Debug, Clone)]
pub struct PaywallReceipt {
    pub payment_ref: String,
    pub settlement_tx_hash: Option<String>,
    pub state: PaymentState,
}

#[derive(Debug, Clone, Error)]
pub enum PaywallError {
    #[error("{message}")]
    InvalidPayload { message: String },
    #[error("Payment context does not match this request.")]
    ContextMismatch,
    #[error("Challenge was bound to a different identity context; request a new challenge.")]
    IdentityContextMismatch,
    #[error("Payment or challenge has expired.")]
    ExpiredPayment,
    #[error("Replay key was already used for a settlement.")]
    ReplayDetected,
    #[error("Payment proof attestation does not bind this payment intent.")]
    InvalidTongoProof,
    #[error("{message}")]
    PolicyDenied { message: String },
    #[error("Settlement failed: {reason}")]
    SettlementFailed { reason: String },
    #[error("Timed out waiting for settlement.")]
    Timeout,
    #[error("Settlement facilitator unavailable: {message}")]
    RpcFailure { message: String },
}

/// Facilitator-reported settlement state for one payment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacilitatorStatus {
    Settled { tx_hash: String },
    Pending,
    Failed { reason: String },
    Rejected { reason: String },
}

/// External settlement facilitator capability.
#[async_trait]
pub trait SettlementFacilitator: Send + Sync {
    async fn settlement_status(
        &self,
        challenge_id: &str,
        replay_key: &str,
    ) -> Result<FacilitatorStatus, String>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
enum SettlementWait {
    Settled { tx_hash: String },
    StillPending,
}

#[derive(Debug, Clone)]
struct PaywallSettings {
    challenge_ttl: Duration,
    network: String,
    facilitator_label: String,
    poll_interval_ms: u64,
    timeout_ms: u64,
    max_attempts: u32,
}

/// Authoritative payment gate for billable runs.
///
/// Owns the open-challenge registry and the replay-key registry. Within one
/// replay key the paywall is a single-writer lane: the first reservation
/// wins, every later attempt sees `REPLAY_DETECTED`. Locks are held only for
/// map bookkeeping, never across facilitator I/O.
#[derive(Clone)]
pub struct ShieldedPaywall {
    challenges: Arc<Mutex<HashMap<String, ShieldedChallenge>>>,
    replay_keys: Arc<Mutex<HashMap<String, ReplayState>>>,
    facilitator: Arc<dyn SettlementFacilitator>,
    settings: Arc<PaywallSettings>,
}

impl ShieldedPaywall {
    #[must_use]
    pub fn new(facilitator: Arc<dyn SettlementFacilitator>, config: &Config) -> Self {
        Self {
            challenges: Arc::new(Mutex::new(HashMap::new())),
            replay_keys: Arc::new(Mutex::new(HashMap::new())),
            facilitator,
            settings: Arc::new(PaywallSettings {
                challenge_ttl: Duration::seconds(config.challenge_ttl_seconds as i64),
                network: config.network.clone(),
                facilitator_label: config
                    .facilitator_url
                    .clone()
                    .unwrap_or_else(|| "static-attestation".to_string()),
                poll_interval_ms: config.settlement_poll_interval_ms,
                timeout_ms: config.settlement_timeout_ms,
                max_attempts: config.settlement_max_attempts,
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let facilitator: Arc<dyn SettlementFacilitator> = match config.facilitator_url.as_ref() {
            Some(url) => Arc::new(RpcFacilitator::new(url, config.rpc_timeout_ms)),
            None => Arc::new(StaticFacilitator::default()),
        };
        Self::new(facilitator, config)
    }

    pub fn facilitator_name(&self) -> &'static str {
        self.facilitator.name()
    }

    /// Issue and record an open challenge bound to the request context.
    pub async fn issue_challenge(
        &self,
        context: &PaymentContext,
        min_amount: &str,
        token: &str,
        recipient: &str,
        tongo_recipient: Option<String>,
        now: DateTime<Utc>,
    ) -> ShieldedChallenge {
        let challenge = ShieldedChallenge {
            version: SHIELDED_X402_VERSION,
            scheme: SHIELDED_X402_SCHEME.to_string(),
            challenge_id: format!("chal_{}", Uuid::new_v4().simple()),
            network: self.settings.network.clone(),
            token: token.to_string(),
            min_amount: min_amount.to_string(),
            recipient: recipient.to_string(),
            tongo_recipient,
            context_hash: context.context_hash(),
            expires_at: now + self.settings.challenge_ttl,
            facilitator: self.settings.facilitator_label.clone(),
            signature: None,
        };

        let mut challenges = self.challenges.lock().await;
        challenges.insert(challenge.challenge_id.clone(), challenge.clone());
        challenge
    }

    /// Verify a presented payment and drive it to settlement.
    ///
    /// Check order, each with its own failure mode: payload shape, context
    /// binding, expiry, replay, proof intent, amount/token policy. On
    /// success the replay key is reserved before any settlement I/O.
    pub async fn verify_and_settle(
        &self,
        context: &PaymentContext,
        payload: &ShieldedPaymentPayload,
        now: DateTime<Utc>,
    ) -> Result<PaywallReceipt, PaywallError> {
        if !payload.has_well_formed_fields() {
            return Err(PaywallError::InvalidPayload {
                message: "payment payload is missing or malformed".to_string(),
            });
        }

        let challenge = {
            let challenges = self.challenges.lock().await;
            challenges.get(&payload.challenge_id).cloned()
        };
        let Some(challenge) = challenge else {
            return Err(PaywallError::InvalidPayload {
                message: "payment references an unknown or already settled challenge".to_string(),
            });
        };

        let expected_context_hash = context.context_hash();
        if payload.context_hash != expected_context_hash {
            // The recorded challenge tells apart a client that hashed the
            // wrong fields from a context that drifted after issuance.
            if payload.context_hash == challenge.context_hash {
                return Err(PaywallError::IdentityContextMismatch);
            }
            return Err(PaywallError::ContextMismatch);
        }
        if challenge.context_hash != expected_context_hash {
            return Err(PaywallError::IdentityContextMismatch);
        }

        if payload.is_expired(now) || challenge.is_expired(now) {
            return Err(PaywallError::ExpiredPayment);
        }

        {
            let replay_keys = self.replay_keys.lock().await;
            if matches!(
                replay_keys.get(&payload.replay_key),
                Some(ReplayState::Settling | ReplayState::Settled)
            ) {
                return Err(PaywallError::ReplayDetected);
            }
        }

        let attestation = payload.attestation();
        if let Some(attestation) = &attestation {
            if attestation.intent_hash != payload.expected_intent_hash(&challenge.recipient) {
                return Err(PaywallError::InvalidTongoProof);
            }
        }

        let amount = payload
            .amount
            .trim()
            .parse::<u128>()
            .map_err(|_| PaywallError::InvalidPayload {
                message: "payment amount is not a valid integer".to_string(),
            })?;
        let min_amount = challenge.min_amount.trim().parse::<u128>().unwrap_or(0);
        if amount < min_amount {
            return Err(PaywallError::PolicyDenied {
                message: format!(
                    "payment amount {amount} is below the challenge minimum {min_amount}"
                ),
            });
        }
        if payload.token != challenge.token {
            return Err(PaywallError::PolicyDenied {
                message: format!(
                    "payment token '{}' does not match challenge token '{}'",
                    payload.token, challenge.token
                ),
            });
        }

        // Reservation is the authoritative replay defense; the earlier check
        // only short-circuits. First writer wins under the registry lock.
        {
            let mut replay_keys = self.replay_keys.lock().await;
            match replay_keys.get(&payload.replay_key) {
                Some(ReplayState::Settling | ReplayState::Settled) => {
                    return Err(PaywallError::ReplayDetected);
                }
                _ => {
                    replay_keys.insert(payload.replay_key.clone(), ReplayState::Settling);
                }
            }
        }

        let payment_ref = format!("pay_{}", payload.replay_key);

        if let Some(attestation) = attestation {
            self.mark_replay(&payload.replay_key, ReplayState::Settled)
                .await;
            self.consume_challenge(&payload.challenge_id).await;
            return Ok(PaywallReceipt {
                payment_ref,
                settlement_tx_hash: Some(attestation.settlement_tx_hash),
                state: PaymentState::Settled,
            });
        }

        match self.wait_for_settlement(&challenge, payload).await {
            Ok(SettlementWait::Settled { tx_hash }) => {
                self.mark_replay(&payload.replay_key, ReplayState::Settled)
                    .await;
                self.consume_challenge(&payload.challenge_id).await;
                Ok(PaywallReceipt {
                    payment_ref,
                    settlement_tx_hash: Some(tx_hash),
                    state: PaymentState::Settled,
                })
            }
            Ok(SettlementWait::StillPending) => Ok(PaywallReceipt {
                payment_ref,
                settlement_tx_hash: None,
                state: PaymentState::PendingPayment,
            }),
            Err(error) => {
                self.mark_replay(&payload.replay_key, ReplayState::Failed)
                    .await;
                Err(error)
            }
        }
    }

    /// Poll the facilitator with jittered backoff until the payment reaches a
    /// terminal state or the deadline elapses.
    async fn wait_for_settlement(
        &self,
        challenge: &ShieldedChallenge,
        payload: &ShieldedPaymentPayload,
    ) -> Result<SettlementWait, PaywallError> {
        let deadline =
            tokio::time::Instant::now() + StdDuration::from_millis(self.settings.timeout_ms);
        let poll_interval = self.settings.poll_interval_ms;

        let mut attempts = 0u32;
        let mut saw_pending = false;
        let mut last_rpc_error: Option<String> = None;

        loop {
            attempts += 1;

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let call_budget = remaining.min(StdDuration::from_millis(poll_interval.max(100) * 4));
            let status = tokio::time::timeout(
                call_budget,
                self.facilitator
                    .settlement_status(&challenge.challenge_id, &payload.replay_key),
            )
            .await;

            match status {
                Ok(Ok(FacilitatorStatus::Settled { tx_hash })) => {
                    return Ok(SettlementWait::Settled { tx_hash });
                }
                Ok(Ok(FacilitatorStatus::Pending)) => saw_pending = true,
                Ok(Ok(FacilitatorStatus::Failed { reason }))
                | Ok(Ok(FacilitatorStatus::Rejected { reason })) => {
                    return Err(PaywallError::SettlementFailed { reason });
                }
                Ok(Err(message)) => last_rpc_error = Some(message),
                Err(_elapsed) => {}
            }

            if attempts >= self.settings.max_attempts
                || tokio::time::Instant::now() >= deadline
            {
                break;
            }

            let jitter = rand::rng().random_range(0..=poll_interval / 2);
            tokio::time::sleep(StdDuration::from_millis(poll_interval + jitter)).await;
        }

        if saw_pending {
            return Ok(SettlementWait::StillPending);
        }
        if let Some(message) = last_rpc_error {
            return Err(PaywallError::RpcFailure { message });
        }
        Err(PaywallError::Timeout)
    }

    async fn mark_replay(&self, replay_key: &str, state: ReplayState) {
        let mut replay_keys = self.replay_keys.lock().await;
        replay_keys.insert(replay_key.to_string(), state);
    }

    async fn consume_challenge(&self, challenge_id: &str) {
        let mut challenges = self.challenges.lock().await;
        challenges.remove(challenge_id);
    }

    /// Drop expired open challenges. Returns how many were removed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut challenges = self.challenges.lock().await;
        let before = challenges.len();
        challenges.retain(|_, challenge| !challenge.is_expired(now));
        before - challenges.len()
    }

    pub async fn open_challenges(&self) -> usize {
        self.challenges.lock().await.len()
    }

    /// Background sweeper running at the challenge TTL cadence.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let paywall = self.clone();
        let period = paywall
            .settings
            .challenge_ttl
            .to_std()
            .unwrap_or(StdDuration::from_secs(300));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = paywall.sweep_expired(Utc::now()).await;
                if removed > 0 {
                    tracing::debug!(
                        target: "agora.paywall",
                        removed,
                        "swept expired x402 challenges",
                    );
                }
            }
        })
    }
}

/// In-process facilitator used when no facilitator endpoint is configured.
/// Settlement states are installed programmatically; unknown payments report
/// pending.
#[derive(Clone, Default)]
pub struct StaticFacilitator {
    statuses: Arc<std::sync::Mutex<HashMap<String, FacilitatorStatus>>>,
    failures: Arc<std::sync::Mutex<Option<String>>>,
}

impl StaticFacilitator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, replay_key: &str, status: FacilitatorStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(replay_key.to_string(), status);
        }
    }

    /// Make every poll fail with the given transport error.
    pub fn fail_with(&self, message: &str) {
        if let Ok(mut failure) = self.failures.lock() {
            *failure = Some(message.to_string());
        }
    }
}

#[async_trait]
impl SettlementFacilitator for StaticFacilitator {
    async fn settlement_status(
        &self,
        _challenge_id: &str,
        replay_key: &str,
    ) -> Result<FacilitatorStatus, String> {
        if let Ok(failure) = self.failures.lock() {
            if let Some(message) = failure.as_ref() {
                return Err(message.clone());
            }
        }

        Ok(self
            .statuses
            .lock()
            .ok()
            .and_then(|statuses| statuses.get(replay_key).cloned())
            .unwrap_or(FacilitatorStatus::Pending))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// HTTP facilitator client for the configured settlement endpoint.
#[derive(Clone)]
pub struct RpcFacilitator {
    endpoint_url: String,
    http: reqwest::Client,
    timeout: StdDuration,
}

#[derive(Debug, Serialize)]
struct FacilitatorStatusRequest<'a> {
    challenge_id: &'a str,
    replay_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct FacilitatorStatusResponse {
    status: String,
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

impl RpcFacilitator {
    #[must_use]
    pub fn new(endpoint_url: &str, timeout_ms: u64) -> Self {
        Self {
            endpoint_url: format!("{}/settlements/status", endpoint_url.trim_end_matches('/')),
            http: reqwest::Client::new(),
            timeout: StdDuration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl SettlementFacilitator for RpcFacilitator {
    async fn settlement_status(
        &self,
        challenge_id: &str,
        replay_key: &str,
    ) -> Result<FacilitatorStatus, String> {
        let response = self
            .http
            .post(&self.endpoint_url)
            .timeout(self.timeout)
            .json(&FacilitatorStatusRequest {
                challenge_id,
                replay_key,
            })
            .send()
            .await
            .map_err(|error| format!("facilitator request failed: {error}"))?;

        if !response.status().is_success() {
            return Err(format!("facilitator rejected ({})", response.status()));
        }

        let body: FacilitatorStatusResponse = response
            .json()
            .await
            .map_err(|error| format!("facilitator returned malformed body: {error}"))?;

        match body.status.as_str() {
            "settled" => {
                let tx_hash = body
                    .tx_hash
                    .filter(|tx| !tx.trim().is_empty())
                    .ok_or_else(|| "facilitator settled without a tx hash".to_string())?;
                Ok(FacilitatorStatus::Settled { tx_hash })
            }
            "pending" | "settling" => Ok(FacilitatorStatus::Pending),
            "failed" => Ok(FacilitatorStatus::Failed {
                reason: body.reason.unwrap_or_else(|| "failed".to_string()),
            }),
            "rejected" => Ok(FacilitatorStatus::Rejected {
                reason: body.reason.unwrap_or_else(|| "rejected".to_string()),
            }),
            other => Err(format!("facilitator returned unknown status '{other}'")),
        }
    }

    fn name(&self) -> &'static str {
        "rpc"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agora_x402::{
        PaymentContext, SHIELDED_X402_SCHEME, SHIELDED_X402_VERSION, ShieldedChallenge,
        ShieldedPaymentPayload, TongoAttestation,
    };
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{
        FacilitatorStatus, PaymentState, PaywallError, ShieldedPaywall, StaticFacilitator,
    };
    use crate::config::Config;

    fn context() -> PaymentContext {
        PaymentContext {
            method: "POST".to_string(),
            path: "/marketplace/runs".to_string(),
            hire_id: "hire_1".to_string(),
            agent_id: "swap_integrated".to_string(),
            action: "swap".to_string(),
            operator_wallet: "0xoperatorwallet".to_string(),
            service_wallet: "0xservicewallet".to_string(),
            onchain_status: "skipped".to_string(),
        }
    }

    fn paywall_with(facilitator: StaticFacilitator) -> ShieldedPaywall {
        ShieldedPaywall::new(Arc::new(facilitator), &Config::for_tests())
    }

    fn payload_for(
        challenge: &ShieldedChallenge,
        replay_key: &str,
        attested: bool,
    ) -> ShieldedPaymentPayload {
        let mut payload = ShieldedPaymentPayload {
            version: SHIELDED_X402_VERSION,
            scheme: SHIELDED_X402_SCHEME.to_string(),
            challenge_id: challenge.challenge_id.clone(),
            tongo_address: "tongo1payer".to_string(),
            token: challenge.token.clone(),
            amount: challenge.min_amount.clone(),
            proof: json!({"blob": "opaque"}),
            replay_key: replay_key.to_string(),
            context_hash: challenge.context_hash.clone(),
            expires_at: challenge.expires_at,
            nonce: "n-1".to_string(),
            created_at: Utc::now(),
        };
        if attested {
            payload.proof = TongoAttestation {
                intent_hash: payload.expected_intent_hash(&challenge.recipient),
                settlement_tx_hash: "0xsettled1".to_string(),
                attestor: "facilitator.test".to_string(),
            }
            .into_proof();
        }
        payload
    }

    async fn issued(paywall: &ShieldedPaywall) -> ShieldedChallenge {
        paywall
            .issue_challenge(&context(), "100", "STRK", "0xservicewallet", None, Utc::now())
            .await
    }

    #[tokio::test]
    async fn attested_payment_settles_synchronously_and_consumes_the_challenge() {
        let paywall = paywall_with(StaticFacilitator::new());
        let challenge = issued(&paywall).await;
        let payload = payload_for(&challenge, "rk_1", true);

        let receipt = paywall
            .verify_and_settle(&context(), &payload, Utc::now())
            .await;

        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(error) => panic!("expected settled receipt, got {error}"),
        };
        assert_eq!(receipt.payment_ref, "pay_rk_1");
        assert_eq!(receipt.settlement_tx_hash.as_deref(), Some("0xsettled1"));
        assert_eq!(receipt.state, PaymentState::Settled);
        assert_eq!(paywall.open_challenges().await, 0);
    }

    #[tokio::test]
    async fn settled_replay_key_is_rejected_even_with_a_new_challenge() {
        let paywall = paywall_with(StaticFacilitator::new());
        let challenge = issued(&paywall).await;
        let payload = payload_for(&challenge, "rk_dup", true);
        let first = paywall
            .verify_and_settle(&context(), &payload, Utc::now())
            .await;
        assert!(first.is_ok());

        let second_challenge = issued(&paywall).await;
        let replayed = payload_for(&second_challenge, "rk_dup", true);
        let second = paywall
            .verify_and_settle(&context(), &replayed, Utc::now())
            .await;
        assert!(matches!(second, Err(PaywallError::ReplayDetected)));
    }

    #[tokio::test]
    async fn failed_replay_key_may_retry_with_a_new_challenge() {
        let facilitator = StaticFacilitator::new();
        facilitator.set_status(
            "rk_retry",
            FacilitatorStatus::Failed {
                reason: "insufficient balance".to_string(),
            },
        );
        let paywall = paywall_with(facilitator.clone());

        let challenge = issued(&paywall).await;
        let payload = payload_for(&challenge, "rk_retry", false);
        let first = paywall
            .verify_and_settle(&context(), &payload, Utc::now())
            .await;
        assert!(matches!(
            first,
            Err(PaywallError::SettlementFailed { .. })
        ));

        facilitator.set_status(
            "rk_retry",
            FacilitatorStatus::Settled {
                tx_hash: "0xsecondtry".to_string(),
            },
        );
        let challenge = issued(&paywall).await;
        let payload = payload_for(&challenge, "rk_retry", false);
        let second = paywall
            .verify_and_settle(&context(), &payload, Utc::now())
            .await;
        let receipt = match second {
            Ok(receipt) => receipt,
            Err(error) => panic!("expected retry to settle, got {error}"),
        };
        assert_eq!(receipt.settlement_tx_hash.as_deref(), Some("0xsecondtry"));
    }

    #[tokio::test]
    async fn context_drift_after_issuance_is_an_identity_context_mismatch() {
        let paywall = paywall_with(StaticFacilitator::new());
        let challenge = issued(&paywall).await;
        let payload = payload_for(&challenge, "rk_ctx", true);

        let mut drifted = context();
        drifted.service_wallet = "0xrotatedwallet".to_string();

        let result = paywall
            .verify_and_settle(&drifted, &payload, Utc::now())
            .await;
        assert!(matches!(
            result,
            Err(PaywallError::IdentityContextMismatch)
        ));
    }

    #[tokio::test]
    async fn client_side_hash_garbage_is_a_plain_context_mismatch() {
        let paywall = paywall_with(StaticFacilitator::new());
        let challenge = issued(&paywall).await;
        let mut payload = payload_for(&challenge, "rk_ctx2", true);
        payload.context_hash = "f".repeat(64);

        let result = paywall
            .verify_and_settle(&context(), &payload, Utc::now())
            .await;
        assert!(matches!(result, Err(PaywallError::ContextMismatch)));
    }

    #[tokio::test]
    async fn expired_payment_is_rejected() {
        let paywall = paywall_with(StaticFacilitator::new());
        let challenge = issued(&paywall).await;
        let payload = payload_for(&challenge, "rk_exp", true);

        let later = challenge.expires_at + Duration::seconds(1);
        let result = paywall.verify_and_settle(&context(), &payload, later).await;
        assert!(matches!(result, Err(PaywallError::ExpiredPayment)));
    }

    #[tokio::test]
    async fn rebound_attestation_fails_the_intent_check() {
        let paywall = paywall_with(StaticFacilitator::new());
        let challenge = issued(&paywall).await;
        let mut payload = payload_for(&challenge, "rk_proof", true);
        payload.proof = TongoAttestation {
            intent_hash: "a".repeat(64),
            settlement_tx_hash: "0xstolen".to_string(),
            attestor: "facilitator.test".to_string(),
        }
        .into_proof();

        let result = paywall
            .verify_and_settle(&context(), &payload, Utc::now())
            .await;
        assert!(matches!(result, Err(PaywallError::InvalidTongoProof)));
    }

    #[tokio::test]
    async fn underpayment_and_wrong_token_are_policy_denied() {
        let paywall = paywall_with(StaticFacilitator::new());

        let challenge = issued(&paywall).await;
        let mut payload = payload_for(&challenge, "rk_low", true);
        payload.amount = "99".to_string();
        payload.proof = TongoAttestation {
            intent_hash: payload.expected_intent_hash(&challenge.recipient),
            settlement_tx_hash: "0xsettled".to_string(),
            attestor: "facilitator.test".to_string(),
        }
        .into_proof();
        let result = paywall
            .verify_and_settle(&context(), &payload, Utc::now())
            .await;
        assert!(matches!(result, Err(PaywallError::PolicyDenied { .. })));

        let challenge = issued(&paywall).await;
        let mut payload = payload_for(&challenge, "rk_token", true);
        payload.token = "USDC".to_string();
        payload.proof = TongoAttestation {
            intent_hash: payload.expected_intent_hash(&challenge.recipient),
            settlement_tx_hash: "0xsettled".to_string(),
            attestor: "facilitator.test".to_string(),
        }
        .into_proof();
        let result = paywall
            .verify_and_settle(&context(), &payload, Utc::now())
            .await;
        assert!(matches!(result, Err(PaywallError::PolicyDenied { .. })));
    }

    #[tokio::test]
    async fn pending_facilitator_yields_a_pending_receipt() {
        let paywall = paywall_with(StaticFacilitator::new());
        let challenge = issued(&paywall).await;
        let payload = payload_for(&challenge, "rk_pending", false);

        let receipt = paywall
            .verify_and_settle(&context(), &payload, Utc::now())
            .await;
        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(error) => panic!("expected pending receipt, got {error}"),
        };
        assert_eq!(receipt.state, PaymentState::PendingPayment);
        assert_eq!(receipt.payment_ref, "pay_rk_pending");
        assert!(receipt.settlement_tx_hash.is_none());

        // Still-settling replay keys stay reserved.
        let challenge = issued(&paywall).await;
        let retry = payload_for(&challenge, "rk_pending", false);
        let result = paywall
            .verify_and_settle(&context(), &retry, Utc::now())
            .await;
        assert!(matches!(result, Err(PaywallError::ReplayDetected)));
    }

    #[tokio::test]
    async fn unreachable_facilitator_maps_to_rpc_failure() {
        let facilitator = StaticFacilitator::new();
        facilitator.fail_with("connection refused");
        let paywall = paywall_with(facilitator);

        let challenge = issued(&paywall).await;
        let payload = payload_for(&challenge, "rk_rpc", false);
        let result = paywall
            .verify_and_settle(&context(), &payload, Utc::now())
            .await;
        assert!(matches!(result, Err(PaywallError::RpcFailure { .. })));
    }

    #[tokio::test]
    async fn sweeper_drops_only_expired_challenges() {
        let paywall = paywall_with(StaticFacilitator::new());
        let challenge = issued(&paywall).await;
        assert_eq!(paywall.open_challenges().await, 1);

        assert_eq!(paywall.sweep_expired(Utc::now()).await, 0);
        assert_eq!(
            paywall
                .sweep_expired(challenge.expires_at + Duration::seconds(1))
                .await,
            1
        );
        assert_eq!(paywall.open_challenges().await, 0);
    }
}
