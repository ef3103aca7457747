use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8890";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_NETWORK: &str = "starknet-sepolia";
const DEFAULT_SERVICE_WALLET: &str = "";
const DEFAULT_ONCHAIN_ENFORCEMENT_ENABLED: bool = false;
const DEFAULT_SPEND_AUTH_REQUIRED: bool = false;
const DEFAULT_CHALLENGE_TTL_SECONDS: u64 = 300;
const DEFAULT_IDEMPOTENCY_TTL_SECONDS: u64 = 86_400;
const DEFAULT_SETTLEMENT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_SETTLEMENT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_SETTLEMENT_MAX_ATTEMPTS: u32 = 40;
const DEFAULT_RPC_TIMEOUT_MS: u64 = 5_000;

/// Fixed-window rate-limit rule for one route scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_ms: i64,
}

impl RateLimitRule {
    const fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window_ms: 60_000,
        }
    }
}

/// Per-route rate limits, keyed by the route scopes in the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitTable {
    pub agents_write: RateLimitRule,
    pub agents_read: RateLimitRule,
    pub discover_read: RateLimitRule,
    pub hires_write: RateLimitRule,
    pub hires_read: RateLimitRule,
    pub runs_write: RateLimitRule,
    pub runs_read: RateLimitRule,
    pub metrics_read: RateLimitRule,
}

impl Default for RateLimitTable {
    fn default() -> Self {
        Self {
            agents_write: RateLimitRule::per_minute(30),
            agents_read: RateLimitRule::per_minute(120),
            discover_read: RateLimitRule::per_minute(60),
            hires_write: RateLimitRule::per_minute(30),
            hires_read: RateLimitRule::per_minute(120),
            runs_write: RateLimitRule::per_minute(30),
            runs_read: RateLimitRule::per_minute(120),
            metrics_read: RateLimitRule::per_minute(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    /// API key -> operator wallet, both trimmed; wallets lowercase-normalized.
    pub api_keys: HashMap<String, String>,
    /// Fallback settlement recipient when a profile carries no service wallet.
    pub service_wallet: String,
    pub network: String,
    pub onchain_enforcement_enabled: bool,
    pub spend_auth_required: bool,
    pub challenge_ttl_seconds: u64,
    pub idempotency_ttl_seconds: u64,
    pub onchain_rpc_url: Option<String>,
    pub facilitator_url: Option<String>,
    pub rpc_timeout_ms: u64,
    pub settlement_poll_interval_ms: u64,
    pub settlement_timeout_ms: u64,
    pub settlement_max_attempts: u32,
    pub rate_limits: RateLimitTable,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid AGORA_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env::var("AGORA_BIND_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter = env::var("AGORA_LOG_FILTER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let api_keys = parse_api_keys(env::var("AGORA_API_KEYS").ok().unwrap_or_default());

        let service_wallet = env::var("AGORA_SERVICE_WALLET")
            .ok()
            .map(|value| value.trim().to_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_WALLET.to_string());

        let network = env::var("AGORA_NETWORK")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NETWORK.to_string());

        let onchain_enforcement_enabled = env::var("AGORA_ONCHAIN_ENFORCEMENT_ENABLED")
            .ok()
            .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(DEFAULT_ONCHAIN_ENFORCEMENT_ENABLED);

        let spend_auth_required = env::var("AGORA_SPEND_AUTH_REQUIRED")
            .ok()
            .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(DEFAULT_SPEND_AUTH_REQUIRED);

        let challenge_ttl_seconds = env::var("AGORA_CHALLENGE_TTL_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CHALLENGE_TTL_SECONDS)
            .max(1);

        let idempotency_ttl_seconds = env::var("AGORA_IDEMPOTENCY_TTL_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_IDEMPOTENCY_TTL_SECONDS)
            .max(1);

        let onchain_rpc_url = env::var("AGORA_ONCHAIN_RPC_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty());

        let facilitator_url = env::var("AGORA_FACILITATOR_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty());

        let rpc_timeout_ms = env::var("AGORA_RPC_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RPC_TIMEOUT_MS)
            .max(100);

        let settlement_poll_interval_ms = env::var("AGORA_SETTLEMENT_POLL_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SETTLEMENT_POLL_INTERVAL_MS)
            .max(10);

        let settlement_timeout_ms = env::var("AGORA_SETTLEMENT_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SETTLEMENT_TIMEOUT_MS)
            .max(settlement_poll_interval_ms);

        let settlement_max_attempts = env::var("AGORA_SETTLEMENT_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_SETTLEMENT_MAX_ATTEMPTS)
            .max(1);

        let rate_limits = rate_limit_table_from_env();

        Ok(Self {
            bind_addr,
            log_filter,
            api_keys,
            service_wallet,
            network,
            onchain_enforcement_enabled,
            spend_auth_required,
            challenge_ttl_seconds,
            idempotency_ttl_seconds,
            onchain_rpc_url,
            facilitator_url,
            rpc_timeout_ms,
            settlement_poll_interval_ms,
            settlement_timeout_ms,
            settlement_max_attempts,
            rate_limits,
        })
    }
}

#[cfg(test)]
impl Config {
    #[must_use]
    pub fn for_tests() -> Self {
        let mut api_keys = HashMap::new();
        api_keys.insert(
            "operator-key".to_string(),
            "0xoperatorwallet".to_string(),
        );
        api_keys.insert("rival-key".to_string(), "0xrivalwallet".to_string());

        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            api_keys,
            service_wallet: "0xtreasuryfallback".to_string(),
            network: DEFAULT_NETWORK.to_string(),
            onchain_enforcement_enabled: false,
            spend_auth_required: false,
            challenge_ttl_seconds: DEFAULT_CHALLENGE_TTL_SECONDS,
            idempotency_ttl_seconds: DEFAULT_IDEMPOTENCY_TTL_SECONDS,
            onchain_rpc_url: None,
            facilitator_url: None,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            settlement_poll_interval_ms: 10,
            settlement_timeout_ms: 60,
            settlement_max_attempts: 3,
            rate_limits: RateLimitTable::default(),
        }
    }
}

fn rate_limit_table_from_env() -> RateLimitTable {
    let defaults = RateLimitTable::default();
    RateLimitTable {
        agents_write: rate_limit_rule_from_env("AGENTS_WRITE", defaults.agents_write),
        agents_read: rate_limit_rule_from_env("AGENTS_READ", defaults.agents_read),
        discover_read: rate_limit_rule_from_env("DISCOVER_READ", defaults.discover_read),
        hires_write: rate_limit_rule_from_env("HIRES_WRITE", defaults.hires_write),
        hires_read: rate_limit_rule_from_env("HIRES_READ", defaults.hires_read),
        runs_write: rate_limit_rule_from_env("RUNS_WRITE", defaults.runs_write),
        runs_read: rate_limit_rule_from_env("RUNS_READ", defaults.runs_read),
        metrics_read: rate_limit_rule_from_env("METRICS_READ", defaults.metrics_read),
    }
}

fn rate_limit_rule_from_env(route: &str, default: RateLimitRule) -> RateLimitRule {
    let limit = env::var(format!("AGORA_RL_{route}_LIMIT"))
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default.limit)
        .max(1);
    let window_ms = env::var(format!("AGORA_RL_{route}_WINDOW_MS"))
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(default.window_ms)
        .max(1);
    RateLimitRule { limit, window_ms }
}

fn parse_api_keys(raw: String) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, wallet) = pair.split_once(':')?;
            let key = key.trim();
            let wallet = wallet.trim().to_lowercase();
            if key.is_empty() || wallet.is_empty() {
                None
            } else {
                Some((key.to_string(), wallet))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{Config, parse_api_keys};

    #[test]
    fn api_key_pairs_are_trimmed_and_wallets_lowercased() {
        let keys = parse_api_keys(" alpha : 0xABC , beta:0xdef ,, malformed ".to_string());

        assert_eq!(keys.len(), 2);
        assert_eq!(keys.get("alpha").map(String::as_str), Some("0xabc"));
        assert_eq!(keys.get("beta").map(String::as_str), Some("0xdef"));
    }

    #[test]
    fn test_fixture_keeps_settlement_waiter_fast() {
        let config = Config::for_tests();
        assert_eq!(config.bind_addr.port(), 0);
        assert!(config.settlement_timeout_ms < 1_000);
        assert!(!config.api_keys.is_empty());
    }
}
