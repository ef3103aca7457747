use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

pub const EVENT_DISCOVER_LOADED: &str = "marketplace.funnel.discover_loaded";
pub const EVENT_HIRE_CREATED: &str = "marketplace.funnel.hire_created";
pub const EVENT_RUN_REQUESTED: &str = "marketplace.funnel.run_requested";
pub const EVENT_RUN_PENDING_PAYMENT: &str = "marketplace.funnel.run_pending_payment";
pub const EVENT_RUN_EXECUTING: &str = "marketplace.funnel.run_executing";
pub const EVENT_RUN_COMPLETED: &str = "marketplace.funnel.run_completed";
pub const EVENT_RUN_FAILED: &str = "marketplace.funnel.run_failed";

/// Structured funnel event emitted as one JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct FunnelEvent {
    pub event: String,
    pub level: &'static str,
    pub trace_id: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl FunnelEvent {
    #[must_use]
    pub fn new(event: &str, trace_id: &str, actor: &str) -> Self {
        Self {
            event: event.to_string(),
            level: "info",
            trace_id: trace_id.to_string(),
            actor: actor.to_string(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: &'static str) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &FunnelEvent);
}

/// Default sink: JSON lines through `tracing` under the funnel target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &FunnelEvent) {
        let payload = serde_json::to_string(event).unwrap_or_else(|_| event.event.clone());
        match event.level {
            "warn" => tracing::warn!(target: "agora.funnel", event = %event.event, trace_id = %event.trace_id, %payload),
            "error" => tracing::error!(target: "agora.funnel", event = %event.event, trace_id = %event.trace_id, %payload),
            _ => tracing::info!(target: "agora.funnel", event = %event.event, trace_id = %event.trace_id, %payload),
        }
    }
}

/// Capturing sink for tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<std::sync::Mutex<Vec<FunnelEvent>>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<FunnelEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: &FunnelEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            sink: Arc::new(TracingSink),
        }
    }
}

impl Telemetry {
    #[must_use]
    pub fn with_sink(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, event: FunnelEvent) {
        self.sink.emit(&event);
    }
}

/// Fresh trace id for one request, propagated via `x-agentic-trace-id`.
#[must_use]
pub fn trace_id(route_tag: &str) -> String {
    format!("{route_tag}-{}", Uuid::new_v4().simple())
}
