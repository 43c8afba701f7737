use async_trait::async_trait;
use chrono::Duration;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stocker_shared::{DealCreatedEvent, IntegrationEvent};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::codes;
use crate::events::{ConsumeError, DeliveryStatus, EventBus, EventConsumer, Module};
use crate::tests::fixtures::deal_created_fact;
use crate::tests::helpers::TestHarness;

/// Fails with `error` for the first `failures` deliveries, then succeeds.
struct FlakyConsumer {
    failures: usize,
    error: fn() -> ConsumeError,
    seen: AtomicUsize,
}

impl FlakyConsumer {
    fn retryable(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            error: || ConsumeError::Retryable("inventory service timed out".to_string()),
            seen: AtomicUsize::new(0),
        })
    }

    fn fatal() -> Arc<Self> {
        Arc::new(Self {
            failures: usize::MAX,
            error: || ConsumeError::Fatal("unknown warehouse".to_string()),
            seen: AtomicUsize::new(0),
        })
    }

    fn seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventConsumer<DealCreatedEvent> for FlakyConsumer {
    async fn consume(&self, _envelope: &IntegrationEvent, _event: DealCreatedEvent) -> Result<(), ConsumeError> {
        let attempt = self.seen.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err((self.error)());
        }
        Ok(())
    }
}

struct PanickingConsumer;

#[async_trait]
impl EventConsumer<DealCreatedEvent> for PanickingConsumer {
    async fn consume(&self, _envelope: &IntegrationEvent, event: DealCreatedEvent) -> Result<(), ConsumeError> {
        panic!("consumer bug on deal {}", event.deal_id);
    }
}

/// First delivery blocks until released and then fails fatally; later ones succeed.
#[derive(Default)]
struct StalledConsumer {
    started: Notify,
    release: Notify,
    seen: AtomicUsize,
}

#[async_trait]
impl EventConsumer<DealCreatedEvent> for StalledConsumer {
    async fn consume(&self, _envelope: &IntegrationEvent, _event: DealCreatedEvent) -> Result<(), ConsumeError> {
        if self.seen.fetch_add(1, Ordering::SeqCst) == 0 {
            self.started.notify_one();
            self.release.notified().await;
            return Err(ConsumeError::Fatal("stale attempt".to_string()));
        }
        Ok(())
    }
}

fn bus_with(harness: &TestHarness, module: Module, consumer: Arc<FlakyConsumer>) -> EventBus {
    harness.bus(EventBus::builder().subscribe::<DealCreatedEvent, _>(module, consumer).unwrap())
}

#[tokio::test]
async fn test_retry_with_backoff_then_dead_letter_and_replay() {
    let harness = TestHarness::new();
    let consumer = FlakyConsumer::retryable(3);
    let bus = bus_with(&harness, Module::Inventory, consumer.clone());
    let tenant_id = Uuid::new_v4();

    assert_eq!(bus.publish(deal_created_fact(tenant_id, 100)).await.unwrap(), 1);

    assert_eq!(bus.dispatch_due().await.unwrap(), 1);
    // first retry waits the base backoff
    assert_eq!(bus.dispatch_due().await.unwrap(), 0);
    harness.clock.advance(Duration::seconds(2));
    assert_eq!(bus.dispatch_due().await.unwrap(), 1);

    harness.clock.advance(Duration::seconds(3));
    assert_eq!(bus.dispatch_due().await.unwrap(), 0);
    harness.clock.advance(Duration::seconds(1));
    assert_eq!(bus.dispatch_due().await.unwrap(), 1);
    assert_eq!(consumer.seen(), 3);

    let dead = bus.dead_letters(tenant_id).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].status, DeliveryStatus::DeadLettered);
    assert_eq!(dead[0].attempts, 3);
    assert!(dead[0].last_error.as_deref().unwrap().contains("timed out"));
    assert!(bus.dead_letters(Uuid::new_v4()).await.unwrap().is_empty());

    harness.clock.advance(Duration::hours(1));
    assert_eq!(bus.dispatch_due().await.unwrap(), 0);

    bus.replay_dead_letter(tenant_id, dead[0].id).await.unwrap();
    assert_eq!(bus.dispatch_due().await.unwrap(), 1);
    assert_eq!(consumer.seen(), 4);
    assert_eq!(harness.deliveries.get(dead[0].id).await.unwrap().status, DeliveryStatus::Delivered);

    let err = bus.replay_dead_letter(tenant_id, dead[0].id).await.unwrap_err();
    assert_eq!(err.error_code(), codes::DEAD_LETTER_NOT_REPLAYABLE);
}

#[tokio::test]
async fn test_fatal_failure_dead_letters_immediately() {
    let harness = TestHarness::new();
    let consumer = FlakyConsumer::fatal();
    let bus = bus_with(&harness, Module::Inventory, consumer.clone());
    let tenant_id = Uuid::new_v4();

    bus.publish(deal_created_fact(tenant_id, 100)).await.unwrap();
    bus.dispatch_due().await.unwrap();

    let dead = bus.dead_letters(tenant_id).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(dead[0].last_error.as_deref(), Some("unknown warehouse"));
}

#[tokio::test]
async fn test_panicking_consumer_does_not_affect_other_subscribers() {
    let harness = TestHarness::new();
    let healthy = FlakyConsumer::retryable(0);
    let bus = harness.bus(
        EventBus::builder()
            .subscribe::<DealCreatedEvent, _>(Module::Crm, Arc::new(PanickingConsumer))
            .unwrap()
            .subscribe::<DealCreatedEvent, _>(Module::Sales, healthy.clone())
            .unwrap(),
    );

    bus.publish(deal_created_fact(Uuid::new_v4(), 100)).await.unwrap();
    assert_eq!(bus.dispatch_due().await.unwrap(), 2);
    assert_eq!(healthy.seen(), 1);

    let deliveries = harness.deliveries.all().await;
    let by_module = |module: Module| {
        deliveries
            .iter()
            .find(|d| d.subscription.module == module)
            .map(|d| d.status)
    };
    assert_eq!(by_module(Module::Sales), Some(DeliveryStatus::Delivered));
    assert_eq!(by_module(Module::Crm), Some(DeliveryStatus::Pending));
}

#[tokio::test]
async fn test_republishing_an_event_is_deduplicated() {
    let harness = TestHarness::new();
    let consumer = FlakyConsumer::retryable(0);
    let bus = bus_with(&harness, Module::Hr, consumer.clone());

    let fact = deal_created_fact(Uuid::new_v4(), 100);
    bus.publish(fact.clone()).await.unwrap();
    bus.publish(fact).await.unwrap();
    bus.dispatch_due().await.unwrap();

    assert_eq!(harness.deliveries.all().await.len(), 1);
    assert_eq!(consumer.seen(), 1);
}

#[tokio::test]
async fn test_module_subscribes_once_per_event_type() {
    let err = EventBus::builder()
        .subscribe::<DealCreatedEvent, _>(Module::Crm, FlakyConsumer::retryable(0))
        .unwrap()
        .subscribe::<DealCreatedEvent, _>(Module::Crm, FlakyConsumer::retryable(0))
        .err()
        .unwrap();

    assert_eq!(err.error_code(), codes::SUBSCRIPTION_DUPLICATE);
}

#[tokio::test]
async fn test_unsubscribed_event_has_no_deliveries() {
    let harness = TestHarness::new();
    let bus = harness.bus(EventBus::builder());

    assert_eq!(bus.publish(deal_created_fact(Uuid::new_v4(), 1)).await.unwrap(), 0);
    assert!(harness.deliveries.all().await.is_empty());
}

#[tokio::test]
async fn test_stale_attempt_cannot_overwrite_newer_outcome() {
    let harness = TestHarness::new();
    let consumer = Arc::new(StalledConsumer::default());
    let bus = Arc::new(harness.bus(
        EventBus::builder()
            .subscribe::<DealCreatedEvent, _>(Module::Inventory, consumer.clone())
            .unwrap(),
    ));
    bus.publish(deal_created_fact(Uuid::new_v4(), 100)).await.unwrap();

    let first = tokio::spawn({
        let bus = bus.clone();
        async move { bus.dispatch_due().await }
    });
    consumer.started.notified().await;

    // lease of the first attempt runs out while it is still working
    harness.clock.advance(Duration::seconds(120));
    assert_eq!(bus.dispatch_due().await.unwrap(), 1);

    consumer.release.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), 1);

    let deliveries = harness.deliveries.all().await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Delivered);
    assert_eq!(deliveries[0].attempts, 2);
    assert_eq!(deliveries[0].last_error, None);
    assert_eq!(consumer.seen.load(Ordering::SeqCst), 2);
}
