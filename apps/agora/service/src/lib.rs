use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use agora_x402::{PaymentContext, ShieldedChallenge, ShieldedPaymentPayload};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub mod api_envelope;
pub mod config;
pub mod discovery;
pub mod executor;
pub mod hires;
pub mod idempotency;
pub mod metrics;
pub mod onchain;
pub mod paywall;
pub mod proofs;
pub mod rate_limit;
pub mod registry;
pub mod runs;
pub mod spend_auth;
pub mod telemetry;


use crate::api_envelope::{
    ApiErrorBody, ApiErrorCode, ApiErrorTuple, coded_error, conflict_error, forbidden_error,
    not_found_error, rate_limited_error, unauthorized_error, validation_error,
};
use crate::config::Config;
use crate::discovery::rank_profiles;
use crate::executor::{ExecutionRequest, ExecutionStatus, ExecutorRegistry};
use crate::hires::{CreateHireInput, HireError, HireLedger, HireStatus};
use crate::idempotency::{IdempotencyLookup, IdempotencyRecord, IdempotencyStore};
use crate::metrics::{
    FreshnessSnapshot, METRIC_CHALLENGES_ISSUED, METRIC_DISCOVERY_QUERIES, METRIC_HIRES_CREATED,
    METRIC_ONCHAIN_REFRESHES, METRIC_PAYMENTS_SETTLED, METRIC_PROFILES_REGISTERED,
    METRIC_PROFILES_UPDATED, METRIC_RUNS_COMPLETED, METRIC_RUNS_CREATED, METRIC_RUNS_FAILED,
    RegistryMetrics,
};
use crate::onchain::{IdentityService, IdentityStatus, OnchainWriteStatus};
use crate::paywall::{PaymentState, PaywallError, PaywallReceipt, ShieldedPaywall};
use crate::rate_limit::{
    RateLimiter, SCOPE_AGENTS_READ, SCOPE_AGENTS_WRITE, SCOPE_DISCOVER_READ, SCOPE_HIRES_READ,
    SCOPE_HIRES_WRITE, SCOPE_METRICS_READ, SCOPE_RUNS_READ, SCOPE_RUNS_WRITE,
};
use crate::registry::{
    AgentProfile, AgentRegistry, AgentType, ProfileFilter, ProfilePatch, ProfileStatus,
    RegisterProfileInput, RegistryError, validate_register_input,
};
use crate::runs::{AgentRun, PaymentEvidence, RunFilter, RunStatus, RunStore, TrustSnapshot};
use crate::spend_auth::{SpendAuthError, SpendAuthLedger, SpendAuthorizationInput};
use crate::telemetry::{
    EVENT_DISCOVER_LOADED, EVENT_HIRE_CREATED, EVENT_RUN_COMPLETED, EVENT_RUN_EXECUTING,
    EVENT_RUN_FAILED, EVENT_RUN_PENDING_PAYMENT, EVENT_RUN_REQUESTED, FunnelEvent, Telemetry,
    trace_id,
};

const SERVICE_NAME: &str = "agora-control-service";
const RUNS_IDEMPOTENCY_SCOPE: &str = "marketplace:runs:write";
const RUNS_PATH: &str = "/marketplace/runs";

pub const HEADER_API_KEY: &str = "x-api-key";
pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const HEADER_X402_CHALLENGE: &str = "x-x402-challenge";
pub const HEADER_X402_PAYMENT: &str = "x-x402-payment";
pub const HEADER_TRACE_ID: &str = "x-agentic-trace-id";
pub const HEADER_IDEMPOTENT_REPLAY: &str = "x-idempotent-replay";

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    flags: FeatureFlags,
    api_keys: ApiKeyDirectory,
    telemetry: Telemetry,
    registry: AgentRegistry,
    hires: HireLedger,
    runs: RunStore,
    paywall: ShieldedPaywall,
    identity: IdentityService,
    spend_auth: SpendAuthLedger,
    executors: ExecutorRegistry,
    rate_limiter: RateLimiter,
    idempotency: IdempotencyStore,
    metrics: RegistryMetrics,
    started_at: SystemTime,
}

/// Feature flags readable at handler entry and togglable without restart.
#[derive(Clone)]
struct FeatureFlags {
    onchain_enforcement: Arc<AtomicBool>,
    spend_auth_required: Arc<AtomicBool>,
}

impl FeatureFlags {
    fn from_config(config: &Config) -> Self {
        Self {
            onchain_enforcement: Arc::new(AtomicBool::new(config.onchain_enforcement_enabled)),
            spend_auth_required: Arc::new(AtomicBool::new(config.spend_auth_required)),
        }
    }

    fn onchain_enforcement_enabled(&self) -> bool {
        self.onchain_enforcement.load(Ordering::Relaxed)
    }

    fn spend_auth_required_enabled(&self) -> bool {
        self.spend_auth_required.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn set_onchain_enforcement(&self, enabled: bool) {
        self.onchain_enforcement.store(enabled, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn set_spend_auth_required(&self, enabled: bool) {
        self.spend_auth_required.store(enabled, Ordering::Relaxed);
    }
}

/// Static API-key directory mapping keys to operator wallets.
#[derive(Clone)]
struct ApiKeyDirectory {
    keys: Arc<HashMap<String, String>>,
}

impl ApiKeyDirectory {
    fn from_config(config: &Config) -> Self {
        Self {
            keys: Arc::new(config.api_keys.clone()),
        }
    }

    fn resolve(&self, api_key: &str) -> Option<String> {
        self.keys.get(api_key).cloned()
    }
}

pub fn build_router(config: Config) -> Router {
    build_router_with_telemetry(config, Telemetry::default())
}

pub fn build_router_with_telemetry(config: Config, telemetry: Telemetry) -> Router {
    let flags = FeatureFlags::from_config(&config);
    let api_keys = ApiKeyDirectory::from_config(&config);
    let identity = IdentityService::from_config(&config);
    let paywall = ShieldedPaywall::from_config(&config);
    let _sweeper = paywall.spawn_sweeper();

    let state = AppState {
        config: Arc::new(config),
        flags,
        api_keys,
        telemetry,
        registry: AgentRegistry::new(),
        hires: HireLedger::new(),
        runs: RunStore::new(),
        paywall,
        identity,
        spend_auth: SpendAuthLedger::default(),
        executors: ExecutorRegistry::with_simulated_runtimes(),
        rate_limiter: RateLimiter::new(),
        idempotency: IdempotencyStore::new(),
        metrics: RegistryMetrics::new(),
        started_at: SystemTime::now(),
    };

    router(state)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route(
            "/marketplace/agents",
            axum::routing::post(register_agent).get(list_agents),
        )
        .route(
            "/marketplace/agents/:agent_id",
            get(get_agent).patch(patch_agent),
        )
        .route("/marketplace/discover", get(discover))
        .route(
            "/marketplace/hires",
            axum::routing::post(create_hire).get(list_hires),
        )
        .route("/marketplace/hires/:hire_id", axum::routing::patch(patch_hire))
        .route(
            "/marketplace/runs",
            axum::routing::post(create_run).get(list_runs),
        )
        .route("/marketplace/metrics", get(metrics_snapshot))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    identity_provider: &'static str,
    settlement_facilitator: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = state
        .started_at
        .elapsed()
        .map(|duration| duration.as_secs())
        .unwrap_or(0);

    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds,
        identity_provider: state.identity.provider_name(),
        settlement_facilitator: state.paywall.facilitator_name(),
    })
}

async fn register_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace = trace_id("agents-register");
    let result = register_agent_inner(&state, &headers, &body).await;
    finish(result, &trace)
}

async fn register_agent_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ApiErrorTuple> {
    let wallet = authenticate(state, headers)?;
    enforce_rate_limit(
        state,
        SCOPE_AGENTS_WRITE,
        &wallet,
        state.config.rate_limits.agents_write,
    )
    .await?;

    let input: RegisterProfileInput = parse_json_body(body)?;
    let draft = validate_register_input(&wallet, input, &state.config.service_wallet)
        .map_err(map_registry_error)?;
    let agent_id = draft.agent_id.clone();

    let enforced = state.flags.onchain_enforcement_enabled();
    let check = state
        .identity
        .check(enforced, &agent_id, &draft.operator_wallet)
        .await;
    if check.status == IdentityStatus::Mismatch {
        return Err(coded_error(
            ApiErrorCode::OnchainIdentityMismatch,
            "On-chain identity owner does not match the operator wallet.",
        ));
    }

    let now = Utc::now();
    let (profile, created) = state
        .registry
        .upsert(draft, now)
        .await
        .map_err(map_registry_error)?;

    if enforced {
        state.registry.record_identity(&agent_id, &check).await;
        if profile.onchain_write_status.is_none() {
            match state
                .identity
                .submit_registration(&agent_id, &profile.operator_wallet)
                .await
            {
                Ok(tx_hash) => {
                    state
                        .registry
                        .record_write_submitted(&agent_id, &tx_hash)
                        .await;
                }
                Err(error) => {
                    tracing::warn!(
                        target: "agora.registry",
                        agent_id = %agent_id,
                        error = %error,
                        "on-chain registration submit failed; profile stays unwritten",
                    );
                }
            }
        }
    }

    state
        .metrics
        .increment(if created {
            METRIC_PROFILES_REGISTERED
        } else {
            METRIC_PROFILES_UPDATED
        })
        .await;

    let profile = state.registry.get(&agent_id).await.unwrap_or(profile);
    Ok(json_response(
        StatusCode::CREATED,
        &json!({ "agent": profile }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListAgentsQuery {
    agent_type: Option<AgentType>,
    capability: Option<String>,
    verified_only: Option<bool>,
    status: Option<ProfileStatus>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
    headers: HeaderMap,
) -> Response {
    let trace = trace_id("agents-list");
    let result = list_agents_inner(&state, &headers, &query).await;
    finish(result, &trace)
}

async fn list_agents_inner(
    state: &AppState,
    headers: &HeaderMap,
    query: &ListAgentsQuery,
) -> Result<Response, ApiErrorTuple> {
    let wallet = authenticate(state, headers)?;
    enforce_rate_limit(
        state,
        SCOPE_AGENTS_READ,
        &wallet,
        state.config.rate_limits.agents_read,
    )
    .await?;

    let filter = ProfileFilter {
        agent_type: query.agent_type,
        capability: query.capability.clone(),
        verified_only: query.verified_only.unwrap_or(false),
        status: query.status,
        limit: query.limit,
        offset: query.offset,
    };
    let agents = state.registry.list(&filter).await;
    let count = agents.len();

    Ok(json_response(
        StatusCode::OK,
        &json!({ "agents": agents, "count": count }),
    ))
}

#[derive(Debug, Deserialize)]
struct GetAgentQuery {
    refresh_onchain: Option<bool>,
}

async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<GetAgentQuery>,
    headers: HeaderMap,
) -> Response {
    let trace = trace_id("agents-get");
    let result = get_agent_inner(&state, &headers, &agent_id, &query).await;
    finish(result, &trace)
}

async fn get_agent_inner(
    state: &AppState,
    headers: &HeaderMap,
    agent_id: &str,
    query: &GetAgentQuery,
) -> Result<Response, ApiErrorTuple> {
    let wallet = authenticate(state, headers)?;
    enforce_rate_limit(
        state,
        SCOPE_AGENTS_READ,
        &wallet,
        state.config.rate_limits.agents_read,
    )
    .await?;

    let profile = state
        .registry
        .get(agent_id)
        .await
        .ok_or_else(|| not_found_error("Agent profile not found."))?;

    if query.refresh_onchain.unwrap_or(false) {
        reconcile_onchain_write(state, &profile).await;

        let enforced = state.flags.onchain_enforcement_enabled();
        let check = state
            .identity
            .check(enforced, agent_id, &profile.operator_wallet)
            .await;
        state.registry.record_identity(agent_id, &check).await;
        state.metrics.increment(METRIC_ONCHAIN_REFRESHES).await;
    }

    let profile = state.registry.get(agent_id).await.unwrap_or(profile);
    Ok(json_response(StatusCode::OK, &json!({ "agent": profile })))
}

async fn patch_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace = trace_id("agents-update");
    let result = patch_agent_inner(&state, &headers, &agent_id, &body).await;
    finish(result, &trace)
}

async fn patch_agent_inner(
    state: &AppState,
    headers: &HeaderMap,
    agent_id: &str,
    body: &Bytes,
) -> Result<Response, ApiErrorTuple> {
    let wallet = authenticate(state, headers)?;
    enforce_rate_limit(
        state,
        SCOPE_AGENTS_WRITE,
        &wallet,
        state.config.rate_limits.agents_write,
    )
    .await?;

    let patch: ProfilePatch = parse_json_body(body)?;
    let profile = state
        .registry
        .apply_patch(agent_id, &wallet, patch, Utc::now())
        .await
        .map_err(map_registry_error)?;

    state.metrics.increment(METRIC_PROFILES_UPDATED).await;
    Ok(json_response(StatusCode::OK, &json!({ "agent": profile })))
}

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    capability: Option<String>,
    agent_type: Option<AgentType>,
    verified_only: Option<bool>,
    refresh_onchain: Option<bool>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn discover(
    State(state): State<AppState>,
    Query(query): Query<DiscoverQuery>,
    headers: HeaderMap,
) -> Response {
    let trace = trace_id("discover");
    let result = discover_inner(&state, &headers, &query, &trace).await;
    finish(result, &trace)
}

async fn discover_inner(
    state: &AppState,
    headers: &HeaderMap,
    query: &DiscoverQuery,
    trace: &str,
) -> Result<Response, ApiErrorTuple> {
    let wallet = authenticate(state, headers)?;
    enforce_rate_limit(
        state,
        SCOPE_DISCOVER_READ,
        &wallet,
        state.config.rate_limits.discover_read,
    )
    .await?;

    // Denied requests never reach this point, so the funnel counter only
    // counts queries that actually loaded candidates.
    state.metrics.increment(METRIC_DISCOVERY_QUERIES).await;

    let filter = ProfileFilter {
        agent_type: query.agent_type,
        capability: query.capability.clone(),
        verified_only: query.verified_only.unwrap_or(false),
        status: Some(ProfileStatus::Active),
        limit: None,
        offset: None,
    };
    let mut candidates = state.registry.list(&filter).await;

    if query.refresh_onchain.unwrap_or(false) {
        for profile in &candidates {
            reconcile_onchain_write(state, profile).await;
        }
        state.metrics.increment(METRIC_ONCHAIN_REFRESHES).await;
        candidates = state.registry.list(&filter).await;
    }

    let now = Utc::now();
    let ranked = rank_profiles(candidates, query.capability.as_deref(), now);
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(50);
    let page: Vec<_> = ranked.into_iter().skip(offset).take(limit).collect();

    let count = page.len();
    state.telemetry.emit(
        FunnelEvent::new(EVENT_DISCOVER_LOADED, trace, &wallet)
            .with_metadata("count", count)
            .with_metadata(
                "capability",
                query.capability.clone().unwrap_or_default(),
            ),
    );

    Ok(json_response(
        StatusCode::OK,
        &json!({ "agents": page, "count": count }),
    ))
}

async fn create_hire(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let trace = trace_id("hires-create");
    let result = create_hire_inner(&state, &headers, &body, &trace).await;
    finish(result, &trace)
}

async fn create_hire_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
    trace: &str,
) -> Result<Response, ApiErrorTuple> {
    let wallet = authenticate(state, headers)?;
    enforce_rate_limit(
        state,
        SCOPE_HIRES_WRITE,
        &wallet,
        state.config.rate_limits.hires_write,
    )
    .await?;

    let input: CreateHireInput = parse_json_body(body)?;
    if input.agent_id.trim().is_empty() {
        return Err(validation_error("agent_id is required"));
    }
    if input.operator_wallet.trim().to_lowercase() != wallet {
        return Err(forbidden_error(
            "operator_wallet must match the authenticated wallet",
        ));
    }

    let profile = state.registry.get(input.agent_id.trim()).await;
    let profile = match profile {
        Some(profile) if profile.status == ProfileStatus::Active => profile,
        _ => {
            return Err(coded_error(
                ApiErrorCode::AgentUnavailable,
                "Agent is not available for hire.",
            ));
        }
    };

    let enforced = state.flags.onchain_enforcement_enabled();
    if enforced {
        let check = state
            .identity
            .check(enforced, &profile.agent_id, &profile.operator_wallet)
            .await;
        if check.status == IdentityStatus::Mismatch {
            return Err(coded_error(
                ApiErrorCode::OnchainIdentityMismatch,
                "On-chain identity owner does not match the agent operator.",
            ));
        }
    }

    let billing_mode = input.billing_mode.unwrap_or(profile.pricing.mode);
    let policy_snapshot = input.policy_snapshot.unwrap_or_else(|| json!({}));
    let hire = state
        .hires
        .create(
            &profile.agent_id,
            &wallet,
            policy_snapshot,
            billing_mode,
            Utc::now(),
        )
        .await;

    state.metrics.increment(METRIC_HIRES_CREATED).await;
    state.telemetry.emit(
        FunnelEvent::new(EVENT_HIRE_CREATED, trace, &wallet)
            .with_metadata("hire_id", hire.id.clone())
            .with_metadata("agent_id", hire.agent_id.clone()),
    );

    Ok(json_response(StatusCode::CREATED, &json!({ "hire": hire })))
}

#[derive(Debug, Deserialize)]
struct ListHiresQuery {
    agent_id: Option<String>,
}

async fn list_hires(
    State(state): State<AppState>,
    Query(query): Query<ListHiresQuery>,
    headers: HeaderMap,
) -> Response {
    let trace = trace_id("hires-list");
    let result = list_hires_inner(&state, &headers, &query).await;
    finish(result, &trace)
}

async fn list_hires_inner(
    state: &AppState,
    headers: &HeaderMap,
    query: &ListHiresQuery,
) -> Result<Response, ApiErrorTuple> {
    let wallet = authenticate(state, headers)?;
    enforce_rate_limit(
        state,
        SCOPE_HIRES_READ,
        &wallet,
        state.config.rate_limits.hires_read,
    )
    .await?;

    let hires = state.hires.list(&wallet, query.agent_id.as_deref()).await;
    let count = hires.len();
    Ok(json_response(
        StatusCode::OK,
        &json!({ "hires": hires, "count": count }),
    ))
}

#[derive(Debug, Deserialize)]
struct HireStatusPatch {
    status: HireStatus,
}

async fn patch_hire(
    State(state): State<AppState>,
    Path(hire_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace = trace_id("hires-update");
    let result = patch_hire_inner(&state, &headers, &hire_id, &body).await;
    finish(result, &trace)
}

async fn patch_hire_inner(
    state: &AppState,
    headers: &HeaderMap,
    hire_id: &str,
    body: &Bytes,
) -> Result<Response, ApiErrorTuple> {
    let wallet = authenticate(state, headers)?;
    enforce_rate_limit(
        state,
        SCOPE_HIRES_WRITE,
        &wallet,
        state.config.rate_limits.hires_write,
    )
    .await?;

    let patch: HireStatusPatch = parse_json_body(body)?;
    let hire = state
        .hires
        .update_status(hire_id, &wallet, patch.status, Utc::now())
        .await
        .map_err(map_hire_error)?;

    Ok(json_response(StatusCode::OK, &json!({ "hire": hire })))
}

#[derive(Debug, Deserialize)]
struct CreateRunInput {
    hire_id: Option<String>,
    agent_id: Option<String>,
    action: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    billable: Option<bool>,
    execute: Option<bool>,
    payment: Option<Value>,
    spend_authorization: Option<SpendAuthorizationInput>,
}

async fn create_run(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let trace = trace_id("runs-create");
    let result = create_run_inner(&state, &headers, &body, &trace).await;
    finish(result, &trace)
}

async fn create_run_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
    trace: &str,
) -> Result<Response, ApiErrorTuple> {
    let wallet = authenticate(state, headers)?;
    enforce_rate_limit(
        state,
        SCOPE_RUNS_WRITE,
        &wallet,
        state.config.rate_limits.runs_write,
    )
    .await?;

    let input: CreateRunInput = parse_json_body(body)?;
    let hire_id = input
        .hire_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| validation_error("hire_id is required"))?
        .to_string();
    let action = input
        .action
        .as_deref()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| validation_error("action is required"))?;

    let idempotency_key = header_string(headers, HEADER_IDEMPOTENCY_KEY);
    let body_hash = idempotency::request_hash(body);
    if let Some(key) = idempotency_key.as_deref() {
        let ttl = Duration::seconds(state.config.idempotency_ttl_seconds as i64);
        match state
            .idempotency
            .lookup(
                RUNS_IDEMPOTENCY_SCOPE,
                &wallet,
                key,
                &body_hash,
                ttl,
                Utc::now(),
            )
            .await
        {
            IdempotencyLookup::Miss => {}
            IdempotencyLookup::Replay(record) => return Ok(replay_response(&record, key)),
            IdempotencyLookup::Conflict => {
                return Err(coded_error(
                    ApiErrorCode::IdempotencyKeyReused,
                    "Idempotency key was already used with a different request body.",
                ));
            }
        }
    }

    let hire = state
        .hires
        .get(&hire_id)
        .await
        .ok_or_else(|| not_found_error("Hire not found."))?;
    if hire.operator_wallet != wallet {
        return Err(forbidden_error("Hire belongs to another operator."));
    }
    if hire.status != HireStatus::Active {
        return Err(conflict_error("Hire is not active."));
    }
    if let Some(agent_id) = input
        .agent_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        if agent_id != hire.agent_id {
            return Err(validation_error("agent_id does not match hire"));
        }
    }
    let agent_id = hire.agent_id.clone();

    let enforced = state.flags.onchain_enforcement_enabled();
    let profile = state.registry.get(&agent_id).await;
    if profile.is_none() && enforced {
        return Err(validation_error(
            "Agent profile not found for on-chain verification.",
        ));
    }

    let identity_check = match profile.as_ref() {
        Some(profile) => {
            state
                .identity
                .check(enforced, &agent_id, &profile.operator_wallet)
                .await
        }
        None => state.identity.check(false, &agent_id, &wallet).await,
    };
    if identity_check.status == IdentityStatus::Mismatch {
        return Err(coded_error(
            ApiErrorCode::OnchainIdentityMismatch,
            "On-chain identity owner does not match the agent operator.",
        ));
    }

    let execute = input.execute.unwrap_or(true);
    let agent_type = profile.as_ref().map(|profile| profile.agent_type);
    if execute {
        let Some(agent_type) = agent_type else {
            return Err(validation_error(
                "Agent profile is required to execute a run.",
            ));
        };
        if !state.executors.supports(agent_type, &action) {
            return Err(validation_error(format!(
                "Action '{action}' is not supported for agent type '{}'",
                agent_type.as_str()
            )));
        }
    }

    let billable = input.billable.unwrap_or(true);
    state.telemetry.emit(
        FunnelEvent::new(EVENT_RUN_REQUESTED, trace, &wallet)
            .with_metadata("hire_id", hire.id.clone())
            .with_metadata("agent_id", agent_id.clone())
            .with_metadata("action", action.clone())
            .with_metadata("billable", billable),
    );

    let service_wallet = profile
        .as_ref()
        .map(|profile| profile.service_wallet.clone())
        .filter(|wallet| !wallet.is_empty())
        .unwrap_or_else(|| state.config.service_wallet.clone());
    let context = PaymentContext {
        method: "POST".to_string(),
        path: RUNS_PATH.to_string(),
        hire_id: hire.id.clone(),
        agent_id: agent_id.clone(),
        action: action.clone(),
        operator_wallet: wallet.clone(),
        service_wallet: service_wallet.clone(),
        onchain_status: identity_check.status.as_str().to_string(),
    };
    let identity_context = serde_json::to_value(&identity_check).ok();
    let params = input.params.clone().unwrap_or_else(|| json!({}));
    let trust_snapshot = profile.as_ref().map(|profile| TrustSnapshot {
        trust_score: profile.trust_score,
        verified: profile.verified,
        onchain_status: profile
            .onchain_status
            .map(|status| status.as_str().to_string()),
    });

    let mut settled_receipt: Option<PaywallReceipt> = None;
    if billable {
        let Some(profile) = profile.as_ref() else {
            return Err(validation_error(
                "Agent profile is required for billable runs.",
            ));
        };

        match payment_from_request(headers, &input)? {
            None => {
                let challenge = state
                    .paywall
                    .issue_challenge(
                        &context,
                        &profile.pricing.amount,
                        &profile.pricing.token,
                        &service_wallet,
                        profile.pricing.tongo_recipient.clone(),
                        Utc::now(),
                    )
                    .await;
                state.metrics.increment(METRIC_CHALLENGES_ISSUED).await;
                return Ok(payment_required_response(&challenge));
            }
            Some(payload) => {
                let receipt = state
                    .paywall
                    .verify_and_settle(&context, &payload, Utc::now())
                    .await
                    .map_err(map_paywall_error)?;

                if receipt.state == PaymentState::PendingPayment {
                    let mut run = AgentRun::new(
                        &hire.id,
                        &agent_id,
                        &wallet,
                        &action,
                        params,
                        billable,
                        RunStatus::PendingPayment,
                        Utc::now(),
                    );
                    run.payment_ref = Some(receipt.payment_ref.clone());
                    run.agent_trust_snapshot = trust_snapshot;
                    run.payment_evidence = Some(PaymentEvidence {
                        payment_ref: Some(receipt.payment_ref),
                        ..PaymentEvidence::shielded(
                            PaymentState::PendingPayment,
                            identity_context,
                        )
                    });
                    state.runs.insert(run.clone()).await;
                    state.metrics.increment(METRIC_RUNS_CREATED).await;
                    state.telemetry.emit(
                        FunnelEvent::new(EVENT_RUN_PENDING_PAYMENT, trace, &wallet)
                            .with_metadata("run_id", run.id.clone())
                            .with_metadata("payment_ref", run.payment_ref.clone().unwrap_or_default()),
                    );

                    return Ok(run_response(
                        state,
                        StatusCode::ACCEPTED,
                        &run,
                        idempotency_key.as_deref(),
                        &wallet,
                        &body_hash,
                    )
                    .await);
                }

                state.metrics.increment(METRIC_PAYMENTS_SETTLED).await;
                settled_receipt = Some(receipt);
            }
        }
    }

    let mut delegation_evidence: Option<Value> = None;
    match input.spend_authorization.as_ref() {
        Some(authorization) => {
            let evidence = state
                .spend_auth
                .validate_and_consume(
                    authorization,
                    &action,
                    &wallet,
                    &service_wallet,
                    Utc::now(),
                )
                .await
                .map_err(map_spend_auth_error)?;
            delegation_evidence = serde_json::to_value(&evidence).ok();
        }
        None => {
            if state.flags.spend_auth_required_enabled() {
                return Err(coded_error(
                    ApiErrorCode::SpendAuthRequired,
                    "Spend authorization is required for this deployment.",
                ));
            }
        }
    }

    let initial_status = if billable {
        RunStatus::PendingPayment
    } else {
        RunStatus::Queued
    };
    let mut run = AgentRun::new(
        &hire.id,
        &agent_id,
        &wallet,
        &action,
        params.clone(),
        billable,
        initial_status,
        Utc::now(),
    );
    run.agent_trust_snapshot = trust_snapshot;
    run.delegation_evidence = delegation_evidence.clone();

    if let Some(receipt) = settled_receipt {
        run.payment_ref = Some(receipt.payment_ref.clone());
        run.settlement_tx_hash = receipt.settlement_tx_hash.clone();
        run.payment_evidence = Some(PaymentEvidence {
            payment_ref: Some(receipt.payment_ref),
            settlement_tx_hash: receipt.settlement_tx_hash,
            ..PaymentEvidence::shielded(PaymentState::Settled, identity_context)
        });
    } else {
        run.payment_evidence = Some(PaymentEvidence::shielded(
            PaymentState::Required,
            identity_context,
        ));
    }

    state.runs.insert(run.clone()).await;
    state.metrics.increment(METRIC_RUNS_CREATED).await;

    // Paywall already succeeded for billable runs; promote immediately.
    run.status = RunStatus::Queued;
    run.updated_at = Utc::now();
    state.runs.update(&run).await;

    if execute {
        run.status = RunStatus::Running;
        run.updated_at = Utc::now();
        state.runs.update(&run).await;
        state.telemetry.emit(
            FunnelEvent::new(EVENT_RUN_EXECUTING, trace, &wallet)
                .with_metadata("run_id", run.id.clone())
                .with_metadata("action", action.clone()),
        );

        let outcome = match agent_type.and_then(|agent_type| {
            state
                .executors
                .executor_for(agent_type)
                .map(|executor| (agent_type, executor))
        }) {
            Some((agent_type, executor)) => {
                executor
                    .execute(ExecutionRequest {
                        agent_type,
                        action: action.clone(),
                        params,
                        operator_wallet: wallet.clone(),
                        service_wallet: service_wallet.clone(),
                        delegation_context: delegation_evidence.clone(),
                    })
                    .await
            }
            None => Err("no runtime registered for this agent type".to_string()),
        };

        match outcome {
            Ok(outcome) => {
                run.status = match outcome.status {
                    ExecutionStatus::Completed => RunStatus::Completed,
                    ExecutionStatus::Failed => RunStatus::Failed,
                };
                run.execution_tx_hashes = if outcome.execution_tx_hashes.is_empty() {
                    None
                } else {
                    Some(outcome.execution_tx_hashes)
                };
                run.result = Some(outcome.result);
                if let Some(evidence) = outcome.delegation_evidence {
                    run.delegation_evidence = Some(evidence);
                }
            }
            Err(message) => {
                run.status = RunStatus::Failed;
                run.result = Some(json!({ "error": message }));
            }
        }
        run.updated_at = Utc::now();
        state.runs.update(&run).await;

        match run.status {
            RunStatus::Completed => {
                state.metrics.increment(METRIC_RUNS_COMPLETED).await;
                state.telemetry.emit(
                    FunnelEvent::new(EVENT_RUN_COMPLETED, trace, &wallet)
                        .with_metadata("run_id", run.id.clone()),
                );
            }
            RunStatus::Failed => {
                state.metrics.increment(METRIC_RUNS_FAILED).await;
                state.telemetry.emit(
                    FunnelEvent::new(EVENT_RUN_FAILED, trace, &wallet)
                        .with_metadata("run_id", run.id.clone())
                        .with_level("warn"),
                );
            }
            _ => {}
        }
    }

    Ok(run_response(
        state,
        StatusCode::CREATED,
        &run,
        idempotency_key.as_deref(),
        &wallet,
        &body_hash,
    )
    .await)
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    hire_id: Option<String>,
    agent_id: Option<String>,
    status: Option<RunStatus>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
    headers: HeaderMap,
) -> Response {
    let trace = trace_id("runs-list");
    let result = list_runs_inner(&state, &headers, &query).await;
    finish(result, &trace)
}

async fn list_runs_inner(
    state: &AppState,
    headers: &HeaderMap,
    query: &ListRunsQuery,
) -> Result<Response, ApiErrorTuple> {
    let wallet = authenticate(state, headers)?;
    enforce_rate_limit(
        state,
        SCOPE_RUNS_READ,
        &wallet,
        state.config.rate_limits.runs_read,
    )
    .await?;

    let filter = RunFilter {
        hire_id: query.hire_id.clone(),
        agent_id: query.agent_id.clone(),
        status: query.status,
        limit: query.limit,
        offset: query.offset,
    };
    let runs = state.runs.list(&wallet, &filter).await;
    let count = runs.len();

    Ok(json_response(
        StatusCode::OK,
        &json!({ "runs": runs, "count": count }),
    ))
}

async fn metrics_snapshot(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let trace = trace_id("metrics");
    let result = metrics_snapshot_inner(&state, &headers).await;
    finish(result, &trace)
}

async fn metrics_snapshot_inner(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Response, ApiErrorTuple> {
    let wallet = authenticate(state, headers)?;
    enforce_rate_limit(
        state,
        SCOPE_METRICS_READ,
        &wallet,
        state.config.rate_limits.metrics_read,
    )
    .await?;

    let counters = state.metrics.snapshot().await;
    let (profiles_total, profiles_active, stalest, freshest) = state.registry.freshness().await;
    let freshness = FreshnessSnapshot {
        profiles_total,
        profiles_active,
        stalest_indexed_at: stalest,
        freshest_indexed_at: freshest,
        generated_at: Utc::now(),
    };

    Ok(json_response(
        StatusCode::OK,
        &json!({ "counters": counters, "freshness": freshness }),
    ))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiErrorTuple> {
    let api_key = header_string(headers, HEADER_API_KEY)
        .ok_or_else(|| unauthorized_error("Missing API key."))?;
    state
        .api_keys
        .resolve(&api_key)
        .ok_or_else(|| unauthorized_error("Invalid API key."))
}

async fn enforce_rate_limit(
    state: &AppState,
    scope: &str,
    actor: &str,
    rule: crate::config::RateLimitRule,
) -> Result<(), ApiErrorTuple> {
    let decision = state
        .rate_limiter
        .consume(scope, actor, rule, Utc::now())
        .await;
    if decision.allowed {
        Ok(())
    } else {
        Err(rate_limited_error(decision.retry_after_seconds))
    }
}

/// Resolve a pending on-chain registration write against the registry.
async fn reconcile_onchain_write(state: &AppState, profile: &AgentProfile) {
    if profile.onchain_write_status != Some(OnchainWriteStatus::Pending) {
        return;
    }
    let Some(tx_hash) = profile.onchain_write_tx_hash.as_deref() else {
        return;
    };

    let status = state.identity.write_status(tx_hash).await;
    if status != OnchainWriteStatus::Pending {
        state
            .registry
            .record_write_status(&profile.agent_id, status, Utc::now())
            .await;
    }
}

fn payment_from_request(
    headers: &HeaderMap,
    input: &CreateRunInput,
) -> Result<Option<ShieldedPaymentPayload>, ApiErrorTuple> {
    if let Some(raw) = header_string(headers, HEADER_X402_PAYMENT) {
        return ShieldedPaymentPayload::from_header_value(&raw)
            .map(Some)
            .map_err(|_| {
                coded_error(
                    ApiErrorCode::InvalidPayload,
                    "x-x402-payment header is not a valid payment payload",
                )
            });
    }

    match input.payment.as_ref() {
        Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|_| {
            coded_error(
                ApiErrorCode::InvalidPayload,
                "payment field is not a valid payment payload",
            )
        }),
        None => Ok(None),
    }
}

fn payment_required_response(challenge: &ShieldedChallenge) -> Response {
    let mut response = (
        StatusCode::PAYMENT_REQUIRED,
        Json(json!({
            "error": "Payment required.",
            "code": ApiErrorCode::PaymentRequired.as_str(),
            "challenge": challenge,
        })),
    )
        .into_response();

    if let Ok(raw) = challenge.to_header_value() {
        if let Ok(value) = HeaderValue::from_str(&raw) {
            response.headers_mut().insert(HEADER_X402_CHALLENGE, value);
        }
    }
    response
}

/// Serialize the run, persist the response under the idempotency key when one
/// was supplied, and shape the HTTP response.
async fn run_response(
    state: &AppState,
    status: StatusCode,
    run: &AgentRun,
    idempotency_key: Option<&str>,
    wallet: &str,
    request_hash: &str,
) -> Response {
    let body = serde_json::to_vec(&json!({ "run": run })).unwrap_or_default();

    if let Some(key) = idempotency_key {
        let record = IdempotencyRecord {
            request_hash: request_hash.to_string(),
            status: status.as_u16(),
            body: body.clone(),
            headers: vec![(
                "content-type".to_string(),
                "application/json".to_string(),
            )],
            created_at: Utc::now(),
        };
        state
            .idempotency
            .save(RUNS_IDEMPOTENCY_SCOPE, wallet, key, record)
            .await;
    }

    let mut response = (status, body).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(key) = idempotency_key {
        if let Ok(value) = HeaderValue::from_str(key) {
            response.headers_mut().insert(HEADER_IDEMPOTENCY_KEY, value);
        }
    }
    response
}

fn replay_response(record: &IdempotencyRecord, key: &str) -> Response {
    let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::OK);
    let mut response = (status, record.body.clone()).into_response();

    for (name, value) in &record.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
        .headers_mut()
        .insert(HEADER_IDEMPOTENT_REPLAY, HeaderValue::from_static("true"));
    if let Ok(value) = HeaderValue::from_str(key) {
        response.headers_mut().insert(HEADER_IDEMPOTENCY_KEY, value);
    }
    response
}

fn json_response(status: StatusCode, body: &Value) -> Response {
    (status, Json(body.clone())).into_response()
}

fn finish(result: Result<Response, ApiErrorTuple>, trace: &str) -> Response {
    let mut response = match result {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(trace) {
        response.headers_mut().insert(HEADER_TRACE_ID, value);
    }
    response
}

fn parse_json_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiErrorTuple> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| validation_error("request body must be valid JSON"))?;
    serde_json::from_value(value)
        .map_err(|error| validation_error(format!("invalid request body: {error}")))
}

fn header_string(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn map_registry_error(error: RegistryError) -> ApiErrorTuple {
    match error {
        RegistryError::Validation { message } => validation_error(message),
        RegistryError::Forbidden { message } => forbidden_error(message),
        RegistryError::NotFound => not_found_error("Agent profile not found."),
    }
}

fn map_hire_error(error: HireError) -> ApiErrorTuple {
    match error {
        HireError::NotFound => not_found_error("Hire not found."),
        HireError::Forbidden { message } => forbidden_error(message),
        HireError::Terminal => conflict_error("Hire is revoked; revoked is terminal."),
    }
}

fn map_paywall_error(error: PaywallError) -> ApiErrorTuple {
    let message = error.to_string();
    let code = match error {
        PaywallError::InvalidPayload { .. } => ApiErrorCode::InvalidPayload,
        PaywallError::ContextMismatch => ApiErrorCode::ContextMismatch,
        PaywallError::IdentityContextMismatch => ApiErrorCode::OnchainIdentityContextMismatch,
        PaywallError::ExpiredPayment => ApiErrorCode::ExpiredPayment,
        PaywallError::ReplayDetected => ApiErrorCode::ReplayDetected,
        PaywallError::InvalidTongoProof => ApiErrorCode::InvalidTongoProof,
        PaywallError::PolicyDenied { .. } => ApiErrorCode::PolicyDenied,
        PaywallError::SettlementFailed { .. } => ApiErrorCode::SettlementFailed,
        PaywallError::Timeout => ApiErrorCode::Timeout,
        PaywallError::RpcFailure { .. } => ApiErrorCode::RpcFailure,
    };
    coded_error(code, message)
}

fn map_spend_auth_error(error: SpendAuthError) -> ApiErrorTuple {
    let status = match error {
        SpendAuthError::Settlement { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ApiErrorBody {
            error: error.to_string(),
            code: Some(error.reason()),
            details: None,
        }),
    )
}
