use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::clock::{Clock, ManualClock};
use crate::config::{BusConfig, EngineConfig};
use crate::events::{EventBus, EventBusBuilder, InMemoryDeliveryStore};
use crate::pipeline::{IdempotencyGuard, IdempotencyLedger, InMemoryLedger};
use crate::workflows::{
    ActionCapability, ActionError, ActionRegistry, ActionRequest, InMemoryExecutionRepository,
    InMemoryWorkflowRepository, InMemoryWorkflowStore, WorkflowEngine,
};

/// Capability that remembers every request; fails when the configuration says `"fail": true`.
#[derive(Default)]
pub struct RecordingCapability {
    requests: Mutex<Vec<ActionRequest>>,
}

impl RecordingCapability {
    pub fn requests(&self) -> Vec<ActionRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ActionCapability for RecordingCapability {
    async fn invoke(&self, request: ActionRequest) -> Result<Value, ActionError> {
        let fail = request.configuration.get("fail") == Some(&json!(true));
        self.requests.lock().push(request.clone());
        if fail {
            return Err(ActionError::Failed("remote endpoint returned 500".to_string()));
        }
        Ok(json!({ "action": request.action_type.as_str(), "ok": true }))
    }
}

/// In-memory stores, a manual clock and a recording capability behind one engine.
pub struct TestHarness {
    pub workflows: Arc<InMemoryWorkflowRepository>,
    pub executions: Arc<InMemoryExecutionRepository>,
    pub ledger: Arc<InMemoryLedger>,
    pub guard: Arc<IdempotencyGuard>,
    pub clock: Arc<ManualClock>,
    pub capability: Arc<RecordingCapability>,
    pub deliveries: Arc<InMemoryDeliveryStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        Self {
            workflows: Arc::new(InMemoryWorkflowRepository::new()),
            executions: Arc::new(InMemoryExecutionRepository::new()),
            guard: Arc::new(IdempotencyGuard::new(ledger.clone())),
            ledger,
            clock: Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap())),
            capability: Arc::new(RecordingCapability::default()),
            deliveries: Arc::new(InMemoryDeliveryStore::new()),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// A fresh engine over the harness stores, as after a process restart.
    pub fn engine(&self) -> Arc<WorkflowEngine> {
        self.engine_with_ledger(self.ledger.clone(), self.guard.clone())
    }

    /// Engine whose guard and unit of work record into `ledger`.
    pub fn engine_with_ledger(
        &self,
        ledger: Arc<dyn IdempotencyLedger>,
        guard: Arc<IdempotencyGuard>,
    ) -> Arc<WorkflowEngine> {
        let actions = ActionRegistry::new().with_fallback(self.capability.clone());
        let store = InMemoryWorkflowStore::new(self.workflows.clone(), self.executions.clone(), ledger);
        Arc::new(WorkflowEngine::new(
            self.workflows.clone(),
            self.executions.clone(),
            Arc::new(store),
            actions,
            guard,
            self.clock(),
            EngineConfig::default(),
        ))
    }

    pub fn bus(&self, builder: EventBusBuilder) -> EventBus {
        builder.build(self.deliveries.clone(), self.clock(), bus_config())
    }
}

pub fn bus_config() -> BusConfig {
    BusConfig {
        max_attempts: 3,
        backoff_base_seconds: 2,
        backoff_max_seconds: 60,
        ..BusConfig::default()
    }
}
