use chrono::{DateTime, Duration, Utc};
use mockall::predicate::{always, eq};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stocker_shared::{CustomerCreatedEvent, CustomerUpdatedEvent, DealWonEvent, IntegrationEvent};
use uuid::Uuid;

use crate::consumers::{
    register_module_consumers, GatewayError, HrCommissionConsumer, InventoryReservationConsumer, MockModuleGateway,
    SalesCustomerConsumer, SalesOrderConsumer,
};
use crate::events::{ConsumeError, DeliveryStatus, EventBus, EventConsumer};
use crate::tests::fixtures::{deal_won, step};
use crate::tests::helpers::TestHarness;
use crate::workflows::{ActionType, CreateWorkflow, ExecutionStatus, TriggerType};

fn won_fact(tenant_id: Uuid, event: &DealWonEvent) -> IntegrationEvent {
    IntegrationEvent::new(tenant_id, event).unwrap()
}

#[tokio::test]
async fn test_sales_order_created_once_per_event() {
    let harness = TestHarness::new();
    let mut gateway = MockModuleGateway::new();
    gateway
        .expect_create_sales_order()
        .times(1)
        .returning(|_, _| Ok(Uuid::new_v4()));
    let consumer = SalesOrderConsumer::new(Arc::new(gateway), harness.guard.clone());

    let event = deal_won(vec![(1, 500)], None);
    let fact = won_fact(Uuid::new_v4(), &event);

    consumer.consume(&fact, event.clone()).await.unwrap();
    consumer.consume(&fact, event).await.unwrap();
    assert!(harness.ledger.get(&format!("sales:order:{}", fact.event_id)).await.is_some());
}

#[tokio::test]
async fn test_inventory_retry_only_reserves_missing_lines() {
    let harness = TestHarness::new();
    let event = deal_won(vec![(2, 10), (0, 5), (3, 7)], None);
    let last_product = event.products[2].product_id;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut gateway = MockModuleGateway::new();
    gateway
        .expect_reserve_stock()
        .times(3)
        .returning(move |_, _, product_id, _| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            if product_id == last_product && call == 1 {
                return Err(GatewayError::Unavailable("warehouse offline".to_string()));
            }
            Ok(())
        });
    let consumer = InventoryReservationConsumer::new(Arc::new(gateway), harness.guard.clone());
    let fact = won_fact(Uuid::new_v4(), &event);

    let first = consumer.consume(&fact, event.clone()).await;
    assert!(matches!(first, Err(ConsumeError::Retryable(_))));

    consumer.consume(&fact, event.clone()).await.unwrap();
    consumer.consume(&fact, event).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_commission_skipped_without_owner() {
    let harness = TestHarness::new();
    let owner = Uuid::new_v4();
    let mut gateway = MockModuleGateway::new();
    gateway
        .expect_accrue_commission()
        .withf(move |_, employee, _, amount, currency| {
            *employee == owner && *amount == Decimal::from(1500) && currency == "EUR"
        })
        .times(1)
        .returning(|_, _, _, _, _| Ok(()));
    let consumer = HrCommissionConsumer::new(Arc::new(gateway), harness.guard.clone());

    let unowned = deal_won(vec![(3, 500)], None);
    consumer.consume(&won_fact(Uuid::new_v4(), &unowned), unowned).await.unwrap();

    let owned = deal_won(vec![(3, 500)], Some(owner));
    consumer.consume(&won_fact(Uuid::new_v4(), &owned), owned).await.unwrap();
}

#[tokio::test]
async fn test_rejected_command_is_fatal() {
    let tenant_id = Uuid::new_v4();
    let customer_id = Uuid::new_v4();
    let mut gateway = MockModuleGateway::new();
    gateway
        .expect_upsert_sales_customer()
        .with(eq(tenant_id), eq(customer_id), eq("Acme GmbH".to_string()), always())
        .returning(|_, _, _, _| Err(GatewayError::Rejected("customer is archived".to_string())));
    let harness = TestHarness::new();
    let consumer = SalesCustomerConsumer::new(Arc::new(gateway), harness.guard.clone());

    let event = CustomerCreatedEvent {
        customer_id,
        company_name: "Acme GmbH".to_string(),
    };
    let fact = IntegrationEvent::new(tenant_id, &event).unwrap();

    let result = consumer.consume(&fact, event).await;
    assert!(matches!(result, Err(ConsumeError::Fatal(_))));
}

#[tokio::test]
async fn test_redelivered_customer_fact_keeps_newer_name() {
    let harness = TestHarness::new();
    let tenant_id = Uuid::new_v4();
    let customer_id = Uuid::new_v4();

    // Projection that keeps the newest write, like the sales module does.
    let projection: Arc<Mutex<Option<(String, DateTime<Utc>)>>> = Arc::new(Mutex::new(None));
    let writes = projection.clone();
    let mut gateway = MockModuleGateway::new();
    gateway
        .expect_upsert_sales_customer()
        .times(2)
        .returning(move |_, _, name, as_of| {
            let mut current = writes.lock();
            if current.as_ref().map_or(true, |(_, seen)| *seen <= as_of) {
                *current = Some((name, as_of));
            }
            Ok(())
        });
    let consumer = SalesCustomerConsumer::new(Arc::new(gateway), harness.guard.clone());

    let created = CustomerCreatedEvent {
        customer_id,
        company_name: "Acme".to_string(),
    };
    let updated = CustomerUpdatedEvent {
        customer_id,
        company_name: "Acme Holdings".to_string(),
    };
    let created_fact = IntegrationEvent::new(tenant_id, &created).unwrap();
    let mut updated_fact = IntegrationEvent::new(tenant_id, &updated).unwrap();
    updated_fact.occurred_at = created_fact.occurred_at + Duration::seconds(5);

    EventConsumer::<CustomerCreatedEvent>::consume(&consumer, &created_fact, created.clone()).await.unwrap();
    EventConsumer::<CustomerUpdatedEvent>::consume(&consumer, &updated_fact, updated).await.unwrap();
    EventConsumer::<CustomerCreatedEvent>::consume(&consumer, &created_fact, created).await.unwrap();

    let (name, as_of) = projection.lock().clone().unwrap();
    assert_eq!(name, "Acme Holdings");
    assert_eq!(as_of, updated_fact.occurred_at);
}

#[tokio::test]
async fn test_deal_won_fans_out_to_every_module() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();

    engine
        .create_workflow(CreateWorkflow {
            tenant_id,
            created_by: None,
            request_id: None,
            name: "Thank-you call".to_string(),
            description: None,
            trigger_type: TriggerType::StatusChanged,
            entity_type: "Deal".to_string(),
            trigger_conditions: String::new(),
            steps: vec![step("Call", ActionType::CreateActivity)],
            is_active: true,
        })
        .await
        .unwrap();

    let mut gateway = MockModuleGateway::new();
    gateway.expect_record_deal_activity().times(1).returning(|_, _, _, _| Ok(()));
    gateway.expect_create_sales_order().times(1).returning(|_, _| Ok(Uuid::new_v4()));
    gateway.expect_reserve_stock().times(2).returning(|_, _, _, _| Ok(()));
    gateway.expect_accrue_commission().times(1).returning(|_, _, _, _, _| Ok(()));

    let builder = register_module_consumers(EventBus::builder(), Arc::new(gateway), harness.guard.clone(), engine.clone())
        .unwrap();
    let bus = harness.bus(builder);

    let event = deal_won(vec![(1, 900), (4, 25)], Some(Uuid::new_v4()));
    let published = bus.publish_typed(tenant_id, &event).await.unwrap();
    assert_eq!(bus.dispatch_due().await.unwrap(), 5);

    let deliveries = harness.deliveries.all().await;
    assert_eq!(deliveries.len(), 5);
    assert!(deliveries.iter().all(|d| d.status == DeliveryStatus::Delivered));

    let executions = harness.executions.all().await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].triggering_fact_id, published.event_id);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
}
