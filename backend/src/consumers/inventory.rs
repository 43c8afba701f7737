// Inventory consumer

use async_trait::async_trait;
use std::sync::Arc;
use stocker_shared::{DealWonEvent, IntegrationEvent};

use super::{once, ModuleGateway};
use crate::error::AppError;
use crate::events::{ConsumeError, EventConsumer};
use crate::pipeline::IdempotencyGuard;

/// Reserves stock for every product line of a won deal.
///
/// Each line is guarded on its own, so a retry after a partial failure only
/// reserves the lines that are still missing.
pub struct InventoryReservationConsumer {
    gateway: Arc<dyn ModuleGateway>,
    guard: Arc<IdempotencyGuard>,
}

impl InventoryReservationConsumer {
    pub fn new(gateway: Arc<dyn ModuleGateway>, guard: Arc<IdempotencyGuard>) -> Self {
        Self { gateway, guard }
    }
}

#[async_trait]
impl EventConsumer<DealWonEvent> for InventoryReservationConsumer {
    async fn consume(&self, envelope: &IntegrationEvent, event: DealWonEvent) -> Result<(), ConsumeError> {
        for (line, product) in event.products.iter().enumerate() {
            if product.quantity.is_sign_negative() || product.quantity.is_zero() {
                continue;
            }
            once(
                &self.guard,
                format!("inventory:reserve:{}:{}", envelope.event_id, line),
                "Inventory.ReserveStock",
                || async {
                    self.gateway
                        .reserve_stock(envelope.tenant_id, event.deal_id, product.product_id, product.quantity)
                        .await
                        .map_err(AppError::from)
                },
            )
            .await?;
        }
        Ok(())
    }
}
