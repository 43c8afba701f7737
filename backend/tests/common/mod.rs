// Shared setup for the integration tests
use std::sync::Arc;
use std::sync::Once;

use stocker_automation::clock::{Clock, SystemClock};
use stocker_automation::config::{BusConfig, EngineConfig};
use stocker_automation::consumers::{register_module_consumers, LoggingGateway};
use stocker_automation::events::{EventBus, InMemoryDeliveryStore};
use stocker_automation::pipeline::{IdempotencyGuard, InMemoryLedger};
use stocker_automation::workflows::{
    ActionCapability, ActionRegistry, InMemoryExecutionRepository, InMemoryWorkflowRepository, InMemoryWorkflowStore,
    WorkflowEngine,
};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("stocker_automation=debug")
            .try_init()
            .ok();
    });
}

pub struct Stack {
    pub engine: Arc<WorkflowEngine>,
    pub bus: Arc<EventBus>,
    pub executions: Arc<InMemoryExecutionRepository>,
    pub deliveries: Arc<InMemoryDeliveryStore>,
}

/// Engine and bus wired the way the binary wires them, over in-memory stores.
pub fn stack(capability: Arc<dyn ActionCapability>) -> Stack {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = Arc::new(InMemoryLedger::new());
    let guard = Arc::new(IdempotencyGuard::new(ledger.clone()));
    let workflows = Arc::new(InMemoryWorkflowRepository::new());
    let executions = Arc::new(InMemoryExecutionRepository::new());
    let deliveries = Arc::new(InMemoryDeliveryStore::new());

    let engine = Arc::new(WorkflowEngine::new(
        workflows.clone(),
        executions.clone(),
        Arc::new(InMemoryWorkflowStore::new(workflows, executions.clone(), ledger)),
        ActionRegistry::new().with_fallback(capability),
        guard.clone(),
        clock.clone(),
        EngineConfig::default(),
    ));
    let bus = Arc::new(
        register_module_consumers(EventBus::builder(), Arc::new(LoggingGateway), guard, engine.clone())
            .expect("consumers register")
            .build(deliveries.clone(), clock, BusConfig::default()),
    );

    Stack {
        engine,
        bus,
        executions,
        deliveries,
    }
}
