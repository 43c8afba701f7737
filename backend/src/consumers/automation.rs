// Automation consumer - hands every fact to the workflow engine

use async_trait::async_trait;
use std::sync::Arc;
use stocker_shared::{EventPayload, IntegrationEvent};

use crate::events::{ConsumeError, EventConsumer};
use crate::workflows::WorkflowEngine;

pub struct AutomationConsumer {
    engine: Arc<WorkflowEngine>,
}

impl AutomationConsumer {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

/// Executions are unique per (workflow, fact), so redelivery starts nothing twice.
#[async_trait]
impl<E: EventPayload> EventConsumer<E> for AutomationConsumer {
    async fn consume(&self, envelope: &IntegrationEvent, _event: E) -> Result<(), ConsumeError> {
        self.engine.process_event(envelope).await?;
        Ok(())
    }
}
