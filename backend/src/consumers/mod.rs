// Module Event Consumers
//
// Each module reacts to cross-module facts through the `ModuleGateway`
// capability. Consumers with side effects are guarded by the event id so a
// redelivered fact is not applied twice; the lead link is a natural upsert.

pub mod automation;
pub mod crm;
pub mod hr;
pub mod inventory;
pub mod sales;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use stocker_shared::{
    CustomerCreatedEvent, CustomerUpdatedEvent, DealCreatedEvent, DealStageChangedEvent, DealWonEvent,
    LeadConvertedEvent,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ApiResult, AppError};
use crate::events::{ConsumeError, EventBusBuilder, Module};
use crate::pipeline::IdempotencyGuard;
use crate::workflows::WorkflowEngine;

pub use automation::AutomationConsumer;
pub use crm::{CrmDealWonConsumer, CrmLeadConvertedConsumer};
pub use hr::HrCommissionConsumer;
pub use inventory::InventoryReservationConsumer;
pub use sales::{SalesCustomerConsumer, SalesOrderConsumer};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The module could not be reached; try again later
    #[error("module unavailable: {0}")]
    Unavailable(String),
    /// The module refused the command; retrying will not help
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(message) => AppError::ExternalServiceError {
                service: "module-gateway".to_string(),
                message,
            },
            GatewayError::Rejected(message) => AppError::BadRequest(message),
        }
    }
}

impl From<GatewayError> for ConsumeError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(message) => ConsumeError::Retryable(message),
            GatewayError::Rejected(message) => ConsumeError::Fatal(message),
        }
    }
}

/// Commands the consumers issue into the owning modules
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModuleGateway: Send + Sync {
    async fn record_deal_activity(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        deal_id: Uuid,
        summary: String,
    ) -> Result<(), GatewayError>;

    /// Upsert: linking an already linked lead is a no-op.
    async fn link_lead_to_customer(&self, tenant_id: Uuid, lead_id: Uuid, customer_id: Uuid) -> Result<(), GatewayError>;

    /// Upsert of the sales-side customer projection as of `as_of`, the
    /// time the change happened in CRM. Writes older than the projection are
    /// ignored.
    async fn upsert_sales_customer(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        company_name: String,
        as_of: DateTime<Utc>,
    ) -> Result<(), GatewayError>;

    async fn create_sales_order(&self, tenant_id: Uuid, deal: DealWonEvent) -> Result<Uuid, GatewayError>;

    async fn reserve_stock(
        &self,
        tenant_id: Uuid,
        deal_id: Uuid,
        product_id: Uuid,
        quantity: Decimal,
    ) -> Result<(), GatewayError>;

    async fn accrue_commission(
        &self,
        tenant_id: Uuid,
        employee_id: Uuid,
        deal_id: Uuid,
        amount: Decimal,
        currency: String,
    ) -> Result<(), GatewayError>;
}

/// Gateway that logs every command; used when the modules run elsewhere.
#[derive(Debug, Default)]
pub struct LoggingGateway;

#[async_trait]
impl ModuleGateway for LoggingGateway {
    async fn record_deal_activity(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        deal_id: Uuid,
        summary: String,
    ) -> Result<(), GatewayError> {
        info!(%tenant_id, %customer_id, %deal_id, %summary, "CRM activity recorded");
        Ok(())
    }

    async fn link_lead_to_customer(&self, tenant_id: Uuid, lead_id: Uuid, customer_id: Uuid) -> Result<(), GatewayError> {
        info!(%tenant_id, %lead_id, %customer_id, "Lead linked to customer");
        Ok(())
    }

    async fn upsert_sales_customer(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        company_name: String,
        as_of: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        info!(%tenant_id, %customer_id, %company_name, %as_of, "Sales customer upserted");
        Ok(())
    }

    async fn create_sales_order(&self, tenant_id: Uuid, deal: DealWonEvent) -> Result<Uuid, GatewayError> {
        let order_id = Uuid::new_v4();
        info!(%tenant_id, deal_id = %deal.deal_id, %order_id, amount = %deal.amount, "Sales order created");
        Ok(order_id)
    }

    async fn reserve_stock(
        &self,
        tenant_id: Uuid,
        deal_id: Uuid,
        product_id: Uuid,
        quantity: Decimal,
    ) -> Result<(), GatewayError> {
        info!(%tenant_id, %deal_id, %product_id, %quantity, "Stock reserved");
        Ok(())
    }

    async fn accrue_commission(
        &self,
        tenant_id: Uuid,
        employee_id: Uuid,
        deal_id: Uuid,
        amount: Decimal,
        currency: String,
    ) -> Result<(), GatewayError> {
        info!(%tenant_id, %employee_id, %deal_id, %amount, %currency, "Commission accrued");
        Ok(())
    }
}

/// Run a consumer side effect at most once per key.
///
/// An effect that already happened counts as success.
pub(crate) async fn once<F, Fut>(
    guard: &IdempotencyGuard,
    key: String,
    command_name: &str,
    effect: F,
) -> Result<(), ConsumeError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ApiResult<()>>,
{
    match guard.run(Some(&key), command_name, effect).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_duplicate_request() => {
            debug!(key = %key, command_name, "Effect already applied");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Register every module consumer with the bus.
pub fn register_module_consumers(
    builder: EventBusBuilder,
    gateway: Arc<dyn ModuleGateway>,
    guard: Arc<IdempotencyGuard>,
    engine: Arc<WorkflowEngine>,
) -> ApiResult<EventBusBuilder> {
    let automation = Arc::new(AutomationConsumer::new(engine));

    builder
        .subscribe::<DealWonEvent, _>(
            Module::Crm,
            Arc::new(CrmDealWonConsumer::new(gateway.clone(), guard.clone())),
        )?
        .subscribe::<LeadConvertedEvent, _>(Module::Crm, Arc::new(CrmLeadConvertedConsumer::new(gateway.clone())))?
        .subscribe::<CustomerCreatedEvent, _>(
            Module::Sales,
            Arc::new(SalesCustomerConsumer::new(gateway.clone(), guard.clone())),
        )?
        .subscribe::<CustomerUpdatedEvent, _>(
            Module::Sales,
            Arc::new(SalesCustomerConsumer::new(gateway.clone(), guard.clone())),
        )?
        .subscribe::<DealWonEvent, _>(
            Module::Sales,
            Arc::new(SalesOrderConsumer::new(gateway.clone(), guard.clone())),
        )?
        .subscribe::<DealWonEvent, _>(
            Module::Inventory,
            Arc::new(InventoryReservationConsumer::new(gateway.clone(), guard.clone())),
        )?
        .subscribe::<DealWonEvent, _>(Module::Hr, Arc::new(HrCommissionConsumer::new(gateway, guard)))?
        .subscribe::<CustomerCreatedEvent, _>(Module::Automation, automation.clone())?
        .subscribe::<CustomerUpdatedEvent, _>(Module::Automation, automation.clone())?
        .subscribe::<LeadConvertedEvent, _>(Module::Automation, automation.clone())?
        .subscribe::<DealCreatedEvent, _>(Module::Automation, automation.clone())?
        .subscribe::<DealStageChangedEvent, _>(Module::Automation, automation.clone())?
        .subscribe::<DealWonEvent, _>(Module::Automation, automation)
}
