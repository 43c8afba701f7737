// Integration Event Bus - durable at-least-once delivery to module consumers

use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use stocker_shared::{EventPayload, IntegrationEvent};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::store::{Delivery, DeliveryStore, Module, Subscription};
use crate::clock::Clock;
use crate::config::BusConfig;
use crate::error::{codes, ApiResult, AppError};

/// How a consumer failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConsumeError {
    /// Try again later with backoff
    #[error("retryable: {0}")]
    Retryable(String),
    /// Retrying cannot help; dead-letter right away
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<AppError> for ConsumeError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::ValidationError { .. } | AppError::BadRequest(_) | AppError::NotFound(_) => {
                ConsumeError::Fatal(err.to_string())
            }
            other => ConsumeError::Retryable(other.to_string()),
        }
    }
}

/// Typed consumer of one event payload type.
///
/// Deliveries are at-least-once, so implementations must tolerate seeing the
/// same `event_id` again.
#[async_trait]
pub trait EventConsumer<E: EventPayload>: Send + Sync {
    async fn consume(&self, envelope: &IntegrationEvent, event: E) -> Result<(), ConsumeError>;
}

#[async_trait]
trait DeliveryHandler: Send + Sync {
    async fn handle(&self, envelope: &IntegrationEvent) -> Result<(), ConsumeError>;
}

struct TypedHandler<E, C> {
    consumer: Arc<C>,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, C> DeliveryHandler for TypedHandler<E, C>
where
    E: EventPayload,
    C: EventConsumer<E> + 'static,
{
    async fn handle(&self, envelope: &IntegrationEvent) -> Result<(), ConsumeError> {
        let event = envelope
            .decode::<E>()
            .map_err(|e| ConsumeError::Fatal(format!("undecodable {} payload: {}", E::EVENT_TYPE, e)))?;
        self.consumer.consume(envelope, event).await
    }
}

/// Collects subscriptions at startup
#[derive(Default)]
pub struct EventBusBuilder {
    handlers: HashMap<Subscription, Arc<dyn DeliveryHandler>>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer` for payload type `E` on behalf of `module`.
    /// A module can subscribe to an event type only once.
    pub fn subscribe<E, C>(mut self, module: Module, consumer: Arc<C>) -> ApiResult<Self>
    where
        E: EventPayload,
        C: EventConsumer<E> + 'static,
    {
        let subscription = Subscription {
            event_type: E::EVENT_TYPE.to_string(),
            module,
        };
        if self.handlers.contains_key(&subscription) {
            return Err(AppError::conflict(
                codes::SUBSCRIPTION_DUPLICATE,
                format!("{} is already subscribed to {}", module, E::EVENT_TYPE),
            ));
        }
        let handler = TypedHandler::<E, C> {
            consumer,
            _event: PhantomData,
        };
        self.handlers.insert(subscription, Arc::new(handler));
        Ok(self)
    }

    pub fn build(self, store: Arc<dyn DeliveryStore>, clock: Arc<dyn Clock>, config: BusConfig) -> EventBus {
        EventBus {
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            handlers: Arc::new(self.handlers),
            store,
            clock,
            config,
            wake: Notify::new(),
        }
    }
}

pub struct EventBus {
    store: Arc<dyn DeliveryStore>,
    handlers: Arc<HashMap<Subscription, Arc<dyn DeliveryHandler>>>,
    clock: Arc<dyn Clock>,
    config: BusConfig,
    wake: Notify,
    permits: Arc<Semaphore>,
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self.handlers.keys().cloned().collect();
        subs.sort_by(|a, b| (&a.event_type, a.module.as_str()).cmp(&(&b.event_type, b.module.as_str())));
        subs
    }

    /// Persist one delivery per subscriber and wake the dispatcher.
    /// Consumer failures never reach the publisher.
    pub async fn publish(&self, event: IntegrationEvent) -> ApiResult<usize> {
        let now = self.clock.now();
        let deliveries: Vec<Delivery> = self
            .handlers
            .keys()
            .filter(|s| s.event_type == event.event_type)
            .map(|s| Delivery::new(event.clone(), s.clone(), now))
            .collect();

        if deliveries.is_empty() {
            debug!(event_id = %event.event_id, event_type = %event.event_type, "No subscribers for event");
            return Ok(0);
        }

        let count = deliveries.len();
        self.store.enqueue(deliveries).await?;
        self.wake.notify_one();
        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
            deliveries = count,
            "Event published"
        );
        Ok(count)
    }

    pub async fn publish_typed<E: EventPayload>(&self, tenant_id: Uuid, payload: &E) -> ApiResult<IntegrationEvent> {
        let event = IntegrationEvent::new(tenant_id, payload)?;
        self.publish(event.clone()).await?;
        Ok(event)
    }

    /// Hand due deliveries to their consumers and settle the outcomes.
    /// Returns the number of deliveries attempted.
    pub async fn dispatch_due(&self) -> ApiResult<usize> {
        let now = self.clock.now();
        let lease_until = now + seconds(self.config.lease_seconds);
        let claimed = self
            .store
            .claim_due(now, lease_until, self.config.batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        let mut tasks = JoinSet::new();
        for delivery in claimed {
            let Some(handler) = self.handlers.get(&delivery.subscription).cloned() else {
                warn!(delivery_id = %delivery.id, subscription = %delivery.subscription, "No consumer registered");
                self.store
                    .dead_letter(delivery.id, delivery.attempts, "no consumer registered", self.clock.now())
                    .await?;
                continue;
            };
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| AppError::InternalError("event bus closed".to_string()))?;

            tasks.spawn(async move {
                let _permit = permit;
                let event = delivery.event.clone();
                // run the consumer on its own task so a panic is contained
                let outcome = match tokio::spawn(async move { handler.handle(&event).await }).await {
                    Ok(result) => result,
                    Err(join) if join.is_panic() => Err(ConsumeError::Retryable("consumer panicked".to_string())),
                    Err(join) => Err(ConsumeError::Retryable(join.to_string())),
                };
                (delivery, outcome)
            });
        }

        let mut attempted = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((delivery, outcome)) => {
                    attempted += 1;
                    if let Err(err) = self.settle(&delivery, outcome).await {
                        // lease expiry hands the delivery out again
                        error!(delivery_id = %delivery.id, error = %err, "Failed to record delivery outcome");
                    }
                }
                Err(err) => error!(error = %err, "Delivery task failed"),
            }
        }
        Ok(attempted)
    }

    async fn settle(&self, delivery: &Delivery, outcome: Result<(), ConsumeError>) -> ApiResult<()> {
        let now = self.clock.now();
        let attempt = delivery.attempts;
        let settled = match outcome {
            Ok(()) => {
                let settled = self.store.mark_delivered(delivery.id, attempt, now).await?;
                if settled {
                    debug!(delivery_id = %delivery.id, subscription = %delivery.subscription, "Delivered");
                }
                settled
            }
            Err(ConsumeError::Retryable(message)) if attempt < self.config.max_attempts => {
                let delay = backoff_delay(attempt, &self.config);
                let settled = self
                    .store
                    .reschedule(delivery.id, attempt, now + delay, &message, now)
                    .await?;
                if settled {
                    warn!(
                        delivery_id = %delivery.id,
                        event_id = %delivery.event.event_id,
                        subscription = %delivery.subscription,
                        attempt,
                        retry_in_seconds = delay.num_seconds(),
                        error = %message,
                        "Delivery failed; will retry"
                    );
                }
                settled
            }
            Err(ConsumeError::Retryable(message)) => {
                let reason = format!("gave up after {} attempts: {}", attempt, message);
                let settled = self.store.dead_letter(delivery.id, attempt, &reason, now).await?;
                if settled {
                    error!(
                        delivery_id = %delivery.id,
                        event_id = %delivery.event.event_id,
                        subscription = %delivery.subscription,
                        error = %reason,
                        "Delivery dead-lettered"
                    );
                }
                settled
            }
            Err(ConsumeError::Fatal(message)) => {
                let settled = self.store.dead_letter(delivery.id, attempt, &message, now).await?;
                if settled {
                    error!(
                        delivery_id = %delivery.id,
                        event_id = %delivery.event.event_id,
                        subscription = %delivery.subscription,
                        error = %message,
                        "Delivery rejected; dead-lettered"
                    );
                }
                settled
            }
        };

        if !settled {
            debug!(delivery_id = %delivery.id, attempt, "Stale delivery attempt ignored");
        }
        Ok(())
    }

    pub async fn dead_letters(&self, tenant_id: Uuid) -> ApiResult<Vec<Delivery>> {
        Ok(self.store.dead_letters(tenant_id).await?)
    }

    pub async fn replay_dead_letter(&self, tenant_id: Uuid, delivery_id: Uuid) -> ApiResult<()> {
        if !self.store.replay(tenant_id, delivery_id, self.clock.now()).await? {
            return Err(AppError::conflict(
                codes::DEAD_LETTER_NOT_REPLAYABLE,
                format!("Delivery {} is not dead-lettered", delivery_id),
            ));
        }
        info!(delivery_id = %delivery_id, "Dead letter queued for replay");
        self.wake.notify_one();
        Ok(())
    }

    /// Dispatcher loop: runs on publish notifications and on an idle timer until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(subscriptions = self.handlers.len(), "Event bus dispatcher started");
        let idle = std::time::Duration::from_secs(self.config.poll_seconds.max(1));

        loop {
            match self.dispatch_due().await {
                Ok(n) if n >= self.config.batch_size => continue,
                Ok(_) => {}
                Err(err) => error!(error = %err, "Event dispatch failed"),
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Event bus dispatcher stopped");
    }
}

/// `base * 2^(attempt-1)`, capped at the configured maximum.
pub fn backoff_delay(attempt: u32, config: &BusConfig) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let secs = config
        .backoff_base_seconds
        .saturating_mul(factor)
        .min(config.backoff_max_seconds);
    seconds(secs)
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000).min(i64::MAX / 1000))
}
