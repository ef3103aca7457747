use axum::Json;
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;

pub type ApiErrorTuple = (StatusCode, Json<ApiErrorBody>);

/// Reason codes surfaced to clients. Every coded response uses one of these;
/// plain validation and auth failures carry a message only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    RateLimited,
    AgentUnavailable,
    OnchainIdentityMismatch,
    OnchainIdentityContextMismatch,
    IdempotencyKeyReused,
    SpendAuthRequired,
    PaymentRequired,
    InvalidPayload,
    ContextMismatch,
    ExpiredPayment,
    ReplayDetected,
    InvalidTongoProof,
    PolicyDenied,
    SettlementFailed,
    Timeout,
    RpcFailure,
}

impl ApiErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::AgentUnavailable => "AGENT_UNAVAILABLE",
            Self::OnchainIdentityMismatch => "ONCHAIN_IDENTITY_MISMATCH",
            Self::OnchainIdentityContextMismatch => "ONCHAIN_IDENTITY_CONTEXT_MISMATCH",
            Self::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            Self::SpendAuthRequired => "SPEND_AUTH_REQUIRED",
            Self::PaymentRequired => "PAYMENT_REQUIRED",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::ContextMismatch => "CONTEXT_MISMATCH",
            Self::ExpiredPayment => "EXPIRED_PAYMENT",
            Self::ReplayDetected => "REPLAY_DETECTED",
            Self::InvalidTongoProof => "INVALID_TONGO_PROOF",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::SettlementFailed => "SETTLEMENT_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::RpcFailure => "RPC_FAILURE",
        }
    }

    pub const fn default_status(self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::AgentUnavailable => StatusCode::CONFLICT,
            Self::OnchainIdentityMismatch => StatusCode::CONFLICT,
            Self::OnchainIdentityContextMismatch => StatusCode::CONFLICT,
            Self::IdempotencyKeyReused => StatusCode::CONFLICT,
            Self::SpendAuthRequired => StatusCode::BAD_REQUEST,
            Self::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            Self::InvalidPayload => StatusCode::BAD_REQUEST,
            Self::ContextMismatch => StatusCode::BAD_REQUEST,
            Self::ExpiredPayment => StatusCode::BAD_REQUEST,
            Self::ReplayDetected => StatusCode::CONFLICT,
            Self::InvalidTongoProof => StatusCode::BAD_REQUEST,
            Self::PolicyDenied => StatusCode::BAD_REQUEST,
            Self::SettlementFailed => StatusCode::CONFLICT,
            Self::Timeout => StatusCode::CONFLICT,
            Self::RpcFailure => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Wire shape for every non-2xx response: `{error, code?, details?}`.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn coded_error(code: ApiErrorCode, message: impl Into<String>) -> ApiErrorTuple {
    coded_error_with_details(code, message, None)
}

pub fn coded_error_with_details(
    code: ApiErrorCode,
    message: impl Into<String>,
    details: Option<Value>,
) -> ApiErrorTuple {
    (
        code.default_status(),
        Json(ApiErrorBody {
            error: message.into(),
            code: Some(code.as_str()),
            details,
        }),
    )
}

pub fn validation_error(message: impl Into<String>) -> ApiErrorTuple {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiErrorBody {
            error: message.into(),
            code: None,
            details: None,
        }),
    )
}

pub fn unauthorized_error(message: impl Into<String>) -> ApiErrorTuple {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiErrorBody {
            error: message.into(),
            code: None,
            details: None,
        }),
    )
}

pub fn forbidden_error(message: impl Into<String>) -> ApiErrorTuple {
    (
        StatusCode::FORBIDDEN,
        Json(ApiErrorBody {
            error: message.into(),
            code: None,
            details: None,
        }),
    )
}

pub fn conflict_error(message: impl Into<String>) -> ApiErrorTuple {
    (
        StatusCode::CONFLICT,
        Json(ApiErrorBody {
            error: message.into(),
            code: None,
            details: None,
        }),
    )
}

pub fn not_found_error(message: impl Into<String>) -> ApiErrorTuple {
    (
        StatusCode::NOT_FOUND,
        Json(ApiErrorBody {
            error: message.into(),
            code: None,
            details: None,
        }),
    )
}

/// Internal failures never leak details to the body; callers log them.
pub fn internal_error() -> ApiErrorTuple {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiErrorBody {
            error: "Internal server error.".to_string(),
            code: None,
            details: None,
        }),
    )
}

pub fn rate_limited_error(retry_after_seconds: i64) -> ApiErrorTuple {
    coded_error_with_details(
        ApiErrorCode::RateLimited,
        format!("Too many requests. Retry in {retry_after_seconds}s."),
        Some(serde_json::json!({ "retry_after": retry_after_seconds })),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiErrorMatrixEntry {
    pub code: &'static str,
    pub status: u16,
}

const API_ERROR_MATRIX: [ApiErrorMatrixEntry; 16] = [
    ApiErrorMatrixEntry {
        code: "RATE_LIMITED",
        status: 429,
    },
    ApiErrorMatrixEntry {
        code: "AGENT_UNAVAILABLE",
        status: 409,
    },
    ApiErrorMatrixEntry {
        code: "ONCHAIN_IDENTITY_MISMATCH",
        status: 409,
    },
    ApiErrorMatrixEntry {
        code: "ONCHAIN_IDENTITY_CONTEXT_MISMATCH",
        status: 409,
    },
    ApiErrorMatrixEntry {
        code: "IDEMPOTENCY_KEY_REUSED",
        status: 409,
    },
    ApiErrorMatrixEntry {
        code: "SPEND_AUTH_REQUIRED",
        status: 400,
    },
    ApiErrorMatrixEntry {
        code: "PAYMENT_REQUIRED",
        status: 402,
    },
    ApiErrorMatrixEntry {
        code: "INVALID_PAYLOAD",
        status: 400,
    },
    ApiErrorMatrixEntry {
        code: "CONTEXT_MISMATCH",
        status: 400,
    },
    ApiErrorMatrixEntry {
        code: "EXPIRED_PAYMENT",
        status: 400,
    },
    ApiErrorMatrixEntry {
        code: "REPLAY_DETECTED",
        status: 409,
    },
    ApiErrorMatrixEntry {
        code: "INVALID_TONGO_PROOF",
        status: 400,
    },
    ApiErrorMatrixEntry {
        code: "POLICY_DENIED",
        status: 400,
    },
    ApiErrorMatrixEntry {
        code: "SETTLEMENT_FAILED",
        status: 409,
    },
    ApiErrorMatrixEntry {
        code: "TIMEOUT",
        status: 409,
    },
    ApiErrorMatrixEntry {
        code: "RPC_FAILURE",
        status: 502,
    },
];

pub fn api_error_matrix() -> &'static [ApiErrorMatrixEntry] {
    &API_ERROR_MATRIX
}
