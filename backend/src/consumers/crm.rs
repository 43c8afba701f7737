// CRM consumers

use async_trait::async_trait;
use std::sync::Arc;
use stocker_shared::{DealWonEvent, IntegrationEvent, LeadConvertedEvent};

use super::{once, ModuleGateway};
use crate::error::AppError;
use crate::events::{ConsumeError, EventConsumer};
use crate::pipeline::IdempotencyGuard;

/// Records a "deal won" activity on the customer, once per event.
pub struct CrmDealWonConsumer {
    gateway: Arc<dyn ModuleGateway>,
    guard: Arc<IdempotencyGuard>,
}

impl CrmDealWonConsumer {
    pub fn new(gateway: Arc<dyn ModuleGateway>, guard: Arc<IdempotencyGuard>) -> Self {
        Self { gateway, guard }
    }
}

#[async_trait]
impl EventConsumer<DealWonEvent> for CrmDealWonConsumer {
    async fn consume(&self, envelope: &IntegrationEvent, event: DealWonEvent) -> Result<(), ConsumeError> {
        let summary = format!("Deal won: {} {}", event.amount, event.currency);
        once(
            &self.guard,
            format!("crm:deal-won:{}", envelope.event_id),
            "Crm.RecordDealActivity",
            || async {
                self.gateway
                    .record_deal_activity(envelope.tenant_id, event.customer_id, event.deal_id, summary)
                    .await
                    .map_err(AppError::from)
            },
        )
        .await
    }
}

/// Links a converted lead to its customer. Linking is an upsert, so no guard.
pub struct CrmLeadConvertedConsumer {
    gateway: Arc<dyn ModuleGateway>,
}

impl CrmLeadConvertedConsumer {
    pub fn new(gateway: Arc<dyn ModuleGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl EventConsumer<LeadConvertedEvent> for CrmLeadConvertedConsumer {
    async fn consume(&self, envelope: &IntegrationEvent, event: LeadConvertedEvent) -> Result<(), ConsumeError> {
        self.gateway
            .link_lead_to_customer(envelope.tenant_id, event.lead_id, event.customer_id)
            .await?;
        Ok(())
    }
}
