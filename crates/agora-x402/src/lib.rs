//! Rust-native shielded x402 primitives used by Agora payment workflows.
//!
//! The paywall in the control service treats a shielded payment proof as an
//! opaque blob with a stable intent hash. This crate owns the wire types for
//! the challenge/payment handshake plus the deterministic digests that bind a
//! payment to one exact request context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Wire scheme identifier carried by every challenge and payment payload.
pub const SHIELDED_X402_SCHEME: &str = "cloak-shielded-x402";

/// Protocol version for the shielded x402 handshake.
pub const SHIELDED_X402_VERSION: u32 = 1;

/// Tag a proof object must carry to be treated as a settlement attestation.
pub const TONGO_ATTESTATION_V1: &str = "tongo_attestation_v1";

/// Payment challenge returned with an HTTP 402.
///
/// A challenge is bound to a single request intent through `context_hash` and
/// is single-use: the issuing side records it keyed by `challenge_id` and
/// closes it once a payment referencing it settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShieldedChallenge {
    pub version: u32,
    pub scheme: String,
    pub challenge_id: String,
    pub network: String,
    pub token: String,
    /// Minimum amount in token-smallest-unit, as a decimal string.
    pub min_amount: String,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tongo_recipient: Option<String>,
    /// 64-hex digest of the canonical request context (see [`PaymentContext`]).
    pub context_hash: String,
    pub expires_at: DateTime<Utc>,
    pub facilitator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ShieldedChallenge {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Compact JSON encoding for the `x-x402-challenge` header.
    pub fn to_header_value(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Payment presented against a previously issued challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShieldedPaymentPayload {
    pub version: u32,
    pub scheme: String,
    pub challenge_id: String,
    pub tongo_address: String,
    pub token: String,
    /// Amount in token-smallest-unit, as a decimal string.
    pub amount: String,
    /// Opaque proof blob. May embed a [`TongoAttestation`] envelope.
    pub proof: Value,
    /// Caller-chosen unique key identifying one settlement attempt.
    pub replay_key: String,
    pub context_hash: String,
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
    pub created_at: DateTime<Utc>,
}

impl ShieldedPaymentPayload {
    /// Parse a payment payload from the `x-x402-payment` header value.
    pub fn from_header_value(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw.trim())
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Structural field check: every required field non-empty, scheme and
    /// version recognized. Context/expiry/amount semantics are checked by the
    /// paywall against the live challenge, not here.
    #[must_use]
    pub fn has_well_formed_fields(&self) -> bool {
        self.version == SHIELDED_X402_VERSION
            && self.scheme == SHIELDED_X402_SCHEME
            && !self.challenge_id.trim().is_empty()
            && !self.tongo_address.trim().is_empty()
            && !self.token.trim().is_empty()
            && is_decimal_amount(&self.amount)
            && !self.replay_key.trim().is_empty()
            && self.context_hash.len() == 64
            && !self.nonce.trim().is_empty()
    }

    /// Recompute the intent hash this payment must carry in its attestation.
    #[must_use]
    pub fn expected_intent_hash(&self, recipient: &str) -> String {
        intent_hash(&IntentBinding {
            challenge_id: &self.challenge_id,
            context_hash: &self.context_hash,
            recipient,
            token: &self.token,
            tongo_address: &self.tongo_address,
            amount: &self.amount,
            replay_key: &self.replay_key,
            nonce: &self.nonce,
            expires_at: self.expires_at,
        })
    }

    /// Decode the proof as an attestation envelope, if it is one.
    #[must_use]
    pub fn attestation(&self) -> Option<TongoAttestation> {
        TongoAttestation::from_proof(&self.proof)
    }
}

/// Settlement attestation embedded in a payment proof.
///
/// The attestor vouches that the shielded transfer behind `intent_hash`
/// settled in `settlement_tx_hash`. The cryptography of the proof itself is
/// outside this crate; the intent hash is what defeats envelope rebinding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TongoAttestation {
    pub intent_hash: String,
    pub settlement_tx_hash: String,
    pub attestor: String,
}

impl TongoAttestation {
    /// Read an attestation from an opaque proof value.
    ///
    /// Returns `None` when the proof is not an object tagged
    /// `tongo_attestation_v1` or is missing any envelope field.
    #[must_use]
    pub fn from_proof(proof: &Value) -> Option<Self> {
        let object = proof.as_object()?;
        let version = object.get("version")?.as_str()?;
        if version != TONGO_ATTESTATION_V1 {
            return None;
        }

        let intent_hash = non_empty_str(object.get("intentHash")?)?;
        let settlement_tx_hash = non_empty_str(object.get("settlementTxHash")?)?;
        let attestor = non_empty_str(object.get("attestor")?)?;

        Some(Self {
            intent_hash,
            settlement_tx_hash,
            attestor,
        })
    }

    /// Encode an attestation as a proof value.
    #[must_use]
    pub fn into_proof(self) -> Value {
        serde_json::json!({
            "version": TONGO_ATTESTATION_V1,
            "intentHash": self.intent_hash,
            "settlementTxHash": self.settlement_tx_hash,
            "attestor": self.attestor,
        })
    }
}

/// Canonical request context a challenge is bound to.
///
/// Any change to one of these fields between challenge issuance and payment
/// retry invalidates the retry. The hash is a function of the field values
/// only; serialization order of the surrounding JSON never affects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentContext {
    pub method: String,
    pub path: String,
    pub hire_id: String,
    pub agent_id: String,
    pub action: String,
    pub operator_wallet: String,
    pub service_wallet: String,
    pub onchain_status: String,
}

impl PaymentContext {
    /// Deterministic 64-hex digest over the canonical context tuple.
    #[must_use]
    pub fn context_hash(&self) -> String {
        let canonical = [
            self.method.as_str(),
            self.path.as_str(),
            self.hire_id.as_str(),
            self.agent_id.as_str(),
            self.action.as_str(),
            self.operator_wallet.as_str(),
            self.service_wallet.as_str(),
            self.onchain_status.as_str(),
        ]
        .join("\n");
        sha256_hex(canonical.as_bytes())
    }
}

/// Canonical tuple hashed into a payment's intent hash.
#[derive(Debug, Clone, Copy)]
pub struct IntentBinding<'a> {
    pub challenge_id: &'a str,
    pub context_hash: &'a str,
    pub recipient: &'a str,
    pub token: &'a str,
    pub tongo_address: &'a str,
    pub amount: &'a str,
    pub replay_key: &'a str,
    pub nonce: &'a str,
    pub expires_at: DateTime<Utc>,
}

/// Deterministic hash binding a payment envelope to one settlement intent.
#[must_use]
pub fn intent_hash(binding: &IntentBinding<'_>) -> String {
    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
        binding.challenge_id,
        binding.context_hash,
        binding.recipient,
        binding.token,
        binding.tongo_address,
        binding.amount,
        binding.replay_key,
        binding.nonce,
        binding.expires_at.timestamp(),
    );
    sha256_hex(canonical.as_bytes())
}

/// Lowercase hex SHA-256 of the input bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Non-negative integer amount check for token-smallest-unit strings.
#[must_use]
pub fn is_decimal_amount(raw: &str) -> bool {
    let trimmed = raw.trim();
    !trimmed.is_empty() && trimmed.bytes().all(|byte| byte.is_ascii_digit())
}

fn non_empty_str(value: &Value) -> Option<String> {
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::{
        IntentBinding, PaymentContext, SHIELDED_X402_SCHEME, SHIELDED_X402_VERSION,
        ShieldedChallenge, ShieldedPaymentPayload, TongoAttestation, intent_hash,
        is_decimal_amount,
    };

    fn sample_context() -> PaymentContext {
        PaymentContext {
            method: "POST".to_string(),
            path: "/marketplace/runs".to_string(),
            hire_id: "hire_1".to_string(),
            agent_id: "swap_integrated".to_string(),
            action: "swap".to_string(),
            operator_wallet: "0xabc".to_string(),
            service_wallet: "0xdef".to_string(),
            onchain_status: "verified".to_string(),
        }
    }

    fn sample_payload() -> ShieldedPaymentPayload {
        let expires_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single();
        ShieldedPaymentPayload {
            version: SHIELDED_X402_VERSION,
            scheme: SHIELDED_X402_SCHEME.to_string(),
            challenge_id: "chal_abc123".to_string(),
            tongo_address: "tongo1sender".to_string(),
            token: "STRK".to_string(),
            amount: "100".to_string(),
            proof: json!({"blob": "opaque"}),
            replay_key: "rk_swap_1".to_string(),
            context_hash: sample_context().context_hash(),
            expires_at: expires_at.unwrap_or_else(Utc::now),
            nonce: "n-1".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn context_hash_is_deterministic_and_64_hex() {
        let first = sample_context().context_hash();
        let second = sample_context().context_hash();

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.bytes().all(|byte| byte.is_ascii_hexdigit()));
    }

    #[test]
    fn context_hash_changes_when_any_field_changes() {
        let base = sample_context().context_hash();

        let mut mutated = sample_context();
        mutated.service_wallet = "0x999".to_string();
        assert_ne!(base, mutated.context_hash());

        let mut mutated = sample_context();
        mutated.onchain_status = "unknown".to_string();
        assert_ne!(base, mutated.context_hash());
    }

    #[test]
    fn context_hash_does_not_collide_across_field_boundaries() {
        let mut left = sample_context();
        left.hire_id = "hire".to_string();
        left.agent_id = "1x".to_string();

        let mut right = sample_context();
        right.hire_id = "hire1".to_string();
        right.agent_id = "x".to_string();

        assert_ne!(left.context_hash(), right.context_hash());
    }

    #[test]
    fn intent_hash_binds_every_tuple_field() {
        let payload = sample_payload();
        let base = payload.expected_intent_hash("0xrecipient");

        let mut other = sample_payload();
        other.replay_key = "rk_swap_2".to_string();
        assert_ne!(base, other.expected_intent_hash("0xrecipient"));

        let mut other = sample_payload();
        other.amount = "101".to_string();
        assert_ne!(base, other.expected_intent_hash("0xrecipient"));

        assert_ne!(base, payload.expected_intent_hash("0xother"));
    }

    #[test]
    fn intent_hash_matches_direct_binding() {
        let payload = sample_payload();
        let direct = intent_hash(&IntentBinding {
            challenge_id: &payload.challenge_id,
            context_hash: &payload.context_hash,
            recipient: "0xrecipient",
            token: &payload.token,
            tongo_address: &payload.tongo_address,
            amount: &payload.amount,
            replay_key: &payload.replay_key,
            nonce: &payload.nonce,
            expires_at: payload.expires_at,
        });

        assert_eq!(direct, payload.expected_intent_hash("0xrecipient"));
    }

    #[test]
    fn attestation_round_trips_through_proof_value() {
        let attestation = TongoAttestation {
            intent_hash: "a".repeat(64),
            settlement_tx_hash: "0xsettled".to_string(),
            attestor: "facilitator.test".to_string(),
        };

        let decoded = TongoAttestation::from_proof(&attestation.clone().into_proof());
        assert_eq!(decoded, Some(attestation));
    }

    #[test]
    fn attestation_rejects_untagged_or_incomplete_proofs() {
        assert!(TongoAttestation::from_proof(&json!({"blob": "opaque"})).is_none());
        assert!(TongoAttestation::from_proof(&json!("bare string")).is_none());
        assert!(
            TongoAttestation::from_proof(&json!({
                "version": "tongo_attestation_v1",
                "intentHash": "abc",
                "attestor": "facilitator.test",
            }))
            .is_none()
        );
        assert!(
            TongoAttestation::from_proof(&json!({
                "version": "tongo_attestation_v2",
                "intentHash": "abc",
                "settlementTxHash": "0x1",
                "attestor": "facilitator.test",
            }))
            .is_none()
        );
    }

    #[test]
    fn payload_field_check_rejects_missing_and_malformed_fields() {
        assert!(sample_payload().has_well_formed_fields());

        let mut payload = sample_payload();
        payload.scheme = "l402".to_string();
        assert!(!payload.has_well_formed_fields());

        let mut payload = sample_payload();
        payload.amount = "-3".to_string();
        assert!(!payload.has_well_formed_fields());

        let mut payload = sample_payload();
        payload.replay_key = "  ".to_string();
        assert!(!payload.has_well_formed_fields());

        let mut payload = sample_payload();
        payload.context_hash = "deadbeef".to_string();
        assert!(!payload.has_well_formed_fields());
    }

    #[test]
    fn payload_header_round_trip_preserves_camel_case_wire_shape() {
        let payload = sample_payload();
        let raw = serde_json::to_string(&payload).unwrap_or_default();

        assert!(raw.contains("\"challengeId\""));
        assert!(raw.contains("\"replayKey\""));
        assert!(raw.contains("\"tongoAddress\""));

        let parsed = ShieldedPaymentPayload::from_header_value(&raw);
        assert_eq!(parsed.ok(), Some(payload));
    }

    #[test]
    fn challenge_expiry_is_exclusive_of_the_deadline() {
        let now = Utc::now();
        let challenge = ShieldedChallenge {
            version: SHIELDED_X402_VERSION,
            scheme: SHIELDED_X402_SCHEME.to_string(),
            challenge_id: "chal_1".to_string(),
            network: "starknet-sepolia".to_string(),
            token: "STRK".to_string(),
            min_amount: "100".to_string(),
            recipient: "0xdef".to_string(),
            tongo_recipient: None,
            context_hash: sample_context().context_hash(),
            expires_at: now,
            facilitator: "https://facilitator.test".to_string(),
            signature: None,
        };

        assert!(!challenge.is_expired(now));
        assert!(challenge.is_expired(now + Duration::seconds(1)));
    }

    #[test]
    fn decimal_amount_accepts_only_unsigned_integers() {
        assert!(is_decimal_amount("0"));
        assert!(is_decimal_amount("100"));
        assert!(is_decimal_amount(" 42 "));
        assert!(!is_decimal_amount(""));
        assert!(!is_decimal_amount("1.5"));
        assert!(!is_decimal_amount("-1"));
        assert!(!is_decimal_amount("1e3"));
    }
}
