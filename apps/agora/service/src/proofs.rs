use agora_x402::sha256_hex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ownership proof binding one endpoint to the operator wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointOwnershipProof {
    pub endpoint: String,
    pub nonce: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    #[error("Missing ownership proof for endpoint '{endpoint}'")]
    MissingProof { endpoint: String },
    #[error("Unmatched ownership proof for endpoint '{endpoint}'")]
    ExtraProof { endpoint: String },
    #[error("Invalid endpoint digest for '{endpoint}'")]
    InvalidEndpointDigest { endpoint: String },
}

impl ProofError {
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::MissingProof { .. } => "MISSING_PROOF",
            Self::ExtraProof { .. } => "EXTRA_PROOF",
            Self::InvalidEndpointDigest { .. } => "INVALID_ENDPOINT_DIGEST",
        }
    }
}

/// Lowercase the URL and strip a single trailing slash.
#[must_use]
pub fn normalize_endpoint(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    lowered
        .strip_suffix('/')
        .map_or(lowered.clone(), str::to_string)
}

/// Deterministic digest an operator must present for one endpoint:
/// hex SHA-256 of `normalize(endpoint) || "|" || lowercase(operator) || "|" || nonce`.
#[must_use]
pub fn expected_digest(endpoint: &str, operator_wallet: &str, nonce: &str) -> String {
    let preimage = format!(
        "{}|{}|{}",
        normalize_endpoint(endpoint),
        operator_wallet.trim().to_lowercase(),
        nonce,
    );
    sha256_hex(preimage.as_bytes())
}

/// Verify that every endpoint has exactly one proof whose digest recomputes.
///
/// Pure and side-effect-free; callers decide how failures map to responses.
pub fn verify_proof_set(
    operator_wallet: &str,
    endpoints: &[String],
    proofs: &[EndpointOwnershipProof],
) -> Result<(), ProofError> {
    let normalized_endpoints: Vec<String> = endpoints
        .iter()
        .map(|endpoint| normalize_endpoint(endpoint))
        .collect();

    let mut matched: Vec<bool> = vec![false; normalized_endpoints.len()];

    for proof in proofs {
        let normalized = normalize_endpoint(&proof.endpoint);
        let position = normalized_endpoints
            .iter()
            .position(|endpoint| *endpoint == normalized);

        let Some(position) = position else {
            return Err(ProofError::ExtraProof {
                endpoint: proof.endpoint.clone(),
            });
        };

        if matched[position] {
            return Err(ProofError::ExtraProof {
                endpoint: proof.endpoint.clone(),
            });
        }
        matched[position] = true;

        if expected_digest(&proof.endpoint, operator_wallet, &proof.nonce) != proof.digest {
            return Err(ProofError::InvalidEndpointDigest {
                endpoint: proof.endpoint.clone(),
            });
        }
    }

    if let Some(position) = matched.iter().position(|seen| !seen) {
        return Err(ProofError::MissingProof {
            endpoint: endpoints
                .get(position)
                .cloned()
                .unwrap_or_default(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        EndpointOwnershipProof, ProofError, expected_digest, normalize_endpoint, verify_proof_set,
    };

    const OPERATOR: &str = "0xOperatorWallet";

    fn proof_for(endpoint: &str, nonce: &str) -> EndpointOwnershipProof {
        EndpointOwnershipProof {
            endpoint: endpoint.to_string(),
            nonce: nonce.to_string(),
            digest: expected_digest(endpoint, OPERATOR, nonce),
        }
    }

    #[test]
    fn normalization_lowercases_and_strips_one_trailing_slash() {
        assert_eq!(
            normalize_endpoint("HTTPS://Agent.Example/api/"),
            "https://agent.example/api"
        );
        assert_eq!(
            normalize_endpoint("https://agent.example/api"),
            "https://agent.example/api"
        );
    }

    #[test]
    fn digest_is_stable_across_endpoint_and_operator_casing() {
        let upper = expected_digest("HTTPS://Agent.Example/api/", "0xABC", "n1");
        let lower = expected_digest("https://agent.example/api", "0xabc", "n1");
        assert_eq!(upper, lower);
        assert_eq!(upper.len(), 64);
    }

    #[test]
    fn complete_proof_set_verifies() {
        let endpoints = vec![
            "https://agent.example/api".to_string(),
            "https://agent.example/hooks".to_string(),
        ];
        let proofs = vec![
            proof_for("https://agent.example/api", "n1"),
            proof_for("https://agent.example/hooks", "n2"),
        ];

        assert_eq!(verify_proof_set(OPERATOR, &endpoints, &proofs), Ok(()));
    }

    #[test]
    fn missing_proof_is_reported_for_the_uncovered_endpoint() {
        let endpoints = vec![
            "https://agent.example/api".to_string(),
            "https://agent.example/hooks".to_string(),
        ];
        let proofs = vec![proof_for("https://agent.example/api", "n1")];

        let error = verify_proof_set(OPERATOR, &endpoints, &proofs);
        assert_eq!(
            error,
            Err(ProofError::MissingProof {
                endpoint: "https://agent.example/hooks".to_string()
            })
        );
        assert_eq!(error.map_err(|e| e.reason()), Err("MISSING_PROOF"));
    }

    #[test]
    fn unknown_and_duplicate_proofs_are_extra() {
        let endpoints = vec!["https://agent.example/api".to_string()];

        let unknown = vec![
            proof_for("https://agent.example/api", "n1"),
            proof_for("https://other.example", "n2"),
        ];
        assert!(matches!(
            verify_proof_set(OPERATOR, &endpoints, &unknown),
            Err(ProofError::ExtraProof { .. })
        ));

        let duplicate = vec![
            proof_for("https://agent.example/api", "n1"),
            proof_for("https://agent.example/api/", "n1"),
        ];
        assert!(matches!(
            verify_proof_set(OPERATOR, &endpoints, &duplicate),
            Err(ProofError::ExtraProof { .. })
        ));
    }

    #[test]
    fn zeroed_digest_is_invalid() {
        let endpoints = vec!["https://agent.example/api".to_string()];
        let proofs = vec![EndpointOwnershipProof {
            endpoint: "https://agent.example/api".to_string(),
            nonce: "n1".to_string(),
            digest: "0".repeat(64),
        }];

        let error = verify_proof_set(OPERATOR, &endpoints, &proofs);
        assert!(matches!(
            error,
            Err(ProofError::InvalidEndpointDigest { .. })
        ));
        assert_eq!(error.map_err(|e| e.reason()), Err("INVALID_ENDPOINT_DIGEST"));
    }

    #[test]
    fn proof_order_does_not_matter() {
        let endpoints = vec![
            "https://agent.example/api".to_string(),
            "https://agent.example/hooks".to_string(),
        ];
        let proofs = vec![
            proof_for("https://agent.example/hooks", "n2"),
            proof_for("https://agent.example/api", "n1"),
        ];

        assert_eq!(verify_proof_set(OPERATOR, &endpoints, &proofs), Ok(()));
    }
}
