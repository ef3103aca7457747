use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::registry::AgentType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub agent_type: AgentType,
    pub action: String,
    pub params: Value,
    pub operator_wallet: String,
    pub service_wallet: String,
    pub delegation_context: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub execution_tx_hashes: Vec<String>,
    pub result: Value,
    /// Delegation evidence surfaced by the runtime itself; promoted onto the
    /// run record when present.
    pub delegation_evidence: Option<Value>,
}

/// External agent runtime capability. The core dispatches by agent type and
/// maps every runtime error to a failed run; nothing here may surface a 500.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    fn supported_actions(&self) -> &'static [&'static str];

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, String>;

    fn name(&self) -> &'static str;
}

/// Registered runtimes, one per agent type.
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: Arc<HashMap<AgentType, Arc<dyn AgentExecutor>>>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn with_simulated_runtimes() -> Self {
        let mut executors: HashMap<AgentType, Arc<dyn AgentExecutor>> = HashMap::new();
        executors.insert(
            AgentType::StakingSteward,
            Arc::new(SimulatedRuntime::staking_steward()),
        );
        executors.insert(
            AgentType::TreasuryDispatcher,
            Arc::new(SimulatedRuntime::treasury_dispatcher()),
        );
        executors.insert(
            AgentType::SwapRunner,
            Arc::new(SimulatedRuntime::swap_runner()),
        );
        Self {
            executors: Arc::new(executors),
        }
    }

    #[must_use]
    pub fn executor_for(&self, agent_type: AgentType) -> Option<Arc<dyn AgentExecutor>> {
        self.executors.get(&agent_type).cloned()
    }

    #[must_use]
    pub fn supports(&self, agent_type: AgentType, action: &str) -> bool {
        self.executors
            .get(&agent_type)
            .is_some_and(|executor| executor.supported_actions().contains(&action))
    }
}

/// Deterministic runtime standing in for real agent backends.
///
/// Completes every supported action with a synthetic tx hash; params may set
/// `simulate_failure` to exercise the failed-run path.
pub struct SimulatedRuntime {
    name: &'static str,
    actions: &'static [&'static str],
}

impl SimulatedRuntime {
    #[must_use]
    pub const fn staking_steward() -> Self {
        Self {
            name: "simulated-staking-steward",
            actions: &["stake", "unstake", "claim_rewards"],
        }
    }

    #[must_use]
    pub const fn treasury_dispatcher() -> Self {
        Self {
            name: "simulated-treasury-dispatcher",
            actions: &["transfer", "disburse", "sweep"],
        }
    }

    #[must_use]
    pub const fn swap_runner() -> Self {
        Self {
            name: "simulated-swap-runner",
            actions: &["swap", "quote"],
        }
    }
}

#[async_trait]
impl AgentExecutor for SimulatedRuntime {
    fn supported_actions(&self) -> &'static [&'static str] {
        self.actions
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, String> {
        if request
            .params
            .get("simulate_failure")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(format!(
                "{} refused action '{}'",
                self.name, request.action
            ));
        }

        let tx_hash = format!("0xexec{}", Uuid::new_v4().simple());
        Ok(ExecutionOutcome {
            status: ExecutionStatus::Completed,
            execution_tx_hashes: vec![tx_hash.clone()],
            result: json!({
                "agent_type": request.agent_type.as_str(),
                "action": request.action,
                "service_wallet": request.service_wallet,
                "tx_hash": tx_hash,
                "simulated": true,
            }),
            delegation_evidence: request.delegation_context,
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ExecutionRequest, ExecutionStatus, ExecutorRegistry};
    use crate::registry::AgentType;

    fn request(agent_type: AgentType, action: &str, params: serde_json::Value) -> ExecutionRequest {
        ExecutionRequest {
            agent_type,
            action: action.to_string(),
            params,
            operator_wallet: "0xoperatorwallet".to_string(),
            service_wallet: "0xservicewallet".to_string(),
            delegation_context: None,
        }
    }

    #[test]
    fn every_agent_type_has_a_runtime_with_actions() {
        let registry = ExecutorRegistry::with_simulated_runtimes();

        assert!(registry.supports(AgentType::SwapRunner, "swap"));
        assert!(registry.supports(AgentType::StakingSteward, "stake"));
        assert!(registry.supports(AgentType::TreasuryDispatcher, "transfer"));
        assert!(!registry.supports(AgentType::SwapRunner, "stake"));
    }

    #[tokio::test]
    async fn simulated_runtime_completes_with_tx_hashes() {
        let registry = ExecutorRegistry::with_simulated_runtimes();
        let executor = registry
            .executor_for(AgentType::SwapRunner)
            .unwrap_or_else(|| panic!("swap runner registered"));

        let outcome = executor
            .execute(request(AgentType::SwapRunner, "swap", json!({"pair": "STRK/USDC"})))
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => panic!("expected completion, got {error}"),
        };
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.execution_tx_hashes.len(), 1);
        assert_eq!(outcome.result["action"], "swap");
    }

    #[tokio::test]
    async fn simulate_failure_param_errors_out() {
        let registry = ExecutorRegistry::with_simulated_runtimes();
        let executor = registry
            .executor_for(AgentType::SwapRunner)
            .unwrap_or_else(|| panic!("swap runner registered"));

        let outcome = executor
            .execute(request(
                AgentType::SwapRunner,
                "swap",
                json!({"simulate_failure": true}),
            ))
            .await;
        assert!(outcome.is_err());
    }
}
