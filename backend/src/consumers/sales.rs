// Sales consumers

use async_trait::async_trait;
use std::sync::Arc;
use stocker_shared::{CustomerCreatedEvent, CustomerUpdatedEvent, DealWonEvent, IntegrationEvent};
use tracing::info;
use uuid::Uuid;

use super::{once, ModuleGateway};
use crate::error::AppError;
use crate::events::{ConsumeError, EventConsumer};
use crate::pipeline::IdempotencyGuard;

/// Keeps the sales-side customer projection in step with CRM.
///
/// A redelivered fact is skipped by event id, so it cannot overwrite a newer
/// name; the fact time travels along for out-of-order deliveries.
pub struct SalesCustomerConsumer {
    gateway: Arc<dyn ModuleGateway>,
    guard: Arc<IdempotencyGuard>,
}

impl SalesCustomerConsumer {
    pub fn new(gateway: Arc<dyn ModuleGateway>, guard: Arc<IdempotencyGuard>) -> Self {
        Self { gateway, guard }
    }

    async fn upsert(
        &self,
        envelope: &IntegrationEvent,
        customer_id: Uuid,
        company_name: String,
    ) -> Result<(), ConsumeError> {
        once(
            &self.guard,
            format!("sales:customer:{}", envelope.event_id),
            "Sales.UpsertCustomer",
            || async {
                self.gateway
                    .upsert_sales_customer(envelope.tenant_id, customer_id, company_name, envelope.occurred_at)
                    .await?;
                Ok::<(), AppError>(())
            },
        )
        .await
    }
}

#[async_trait]
impl EventConsumer<CustomerCreatedEvent> for SalesCustomerConsumer {
    async fn consume(&self, envelope: &IntegrationEvent, event: CustomerCreatedEvent) -> Result<(), ConsumeError> {
        self.upsert(envelope, event.customer_id, event.company_name).await
    }
}

#[async_trait]
impl EventConsumer<CustomerUpdatedEvent> for SalesCustomerConsumer {
    async fn consume(&self, envelope: &IntegrationEvent, event: CustomerUpdatedEvent) -> Result<(), ConsumeError> {
        self.upsert(envelope, event.customer_id, event.company_name).await
    }
}

/// Turns a won deal into a sales order.
pub struct SalesOrderConsumer {
    gateway: Arc<dyn ModuleGateway>,
    guard: Arc<IdempotencyGuard>,
}

impl SalesOrderConsumer {
    pub fn new(gateway: Arc<dyn ModuleGateway>, guard: Arc<IdempotencyGuard>) -> Self {
        Self { gateway, guard }
    }
}

#[async_trait]
impl EventConsumer<DealWonEvent> for SalesOrderConsumer {
    async fn consume(&self, envelope: &IntegrationEvent, event: DealWonEvent) -> Result<(), ConsumeError> {
        let deal_id = event.deal_id;
        once(
            &self.guard,
            format!("sales:order:{}", envelope.event_id),
            "Sales.CreateOrderFromDeal",
            || async {
                let order_id = self.gateway.create_sales_order(envelope.tenant_id, event).await?;
                info!(tenant_id = %envelope.tenant_id, %deal_id, %order_id, "Sales order created from won deal");
                Ok::<(), AppError>(())
            },
        )
        .await
    }
}
