// HR consumer

use async_trait::async_trait;
use std::sync::Arc;
use stocker_shared::{DealWonEvent, IntegrationEvent};
use tracing::debug;

use super::{once, ModuleGateway};
use crate::error::AppError;
use crate::events::{ConsumeError, EventConsumer};
use crate::pipeline::IdempotencyGuard;

/// Accrues sales commission for the deal owner.
pub struct HrCommissionConsumer {
    gateway: Arc<dyn ModuleGateway>,
    guard: Arc<IdempotencyGuard>,
}

impl HrCommissionConsumer {
    pub fn new(gateway: Arc<dyn ModuleGateway>, guard: Arc<IdempotencyGuard>) -> Self {
        Self { gateway, guard }
    }
}

#[async_trait]
impl EventConsumer<DealWonEvent> for HrCommissionConsumer {
    async fn consume(&self, envelope: &IntegrationEvent, event: DealWonEvent) -> Result<(), ConsumeError> {
        let Some(owner_id) = event.owner_id else {
            debug!(deal_id = %event.deal_id, "Won deal has no owner; no commission");
            return Ok(());
        };

        once(
            &self.guard,
            format!("hr:commission:{}", envelope.event_id),
            "Hr.AccrueCommission",
            || async {
                self.gateway
                    .accrue_commission(envelope.tenant_id, owner_id, event.deal_id, event.amount, event.currency)
                    .await
                    .map_err(AppError::from)
            },
        )
        .await
    }
}
