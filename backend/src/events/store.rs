// Delivery store - durable per-subscription delivery state of published events

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use stocker_shared::IntegrationEvent;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::workflows::StoreError;

/// Module owning a consumer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Crm,
    Sales,
    Inventory,
    Hr,
    Automation,
}

impl Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crm => "crm",
            Self::Sales => "sales",
            Self::Inventory => "inventory",
            Self::Hr => "hr",
            Self::Automation => "automation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [Self::Crm, Self::Sales, Self::Inventory, Self::Hr, Self::Automation]
            .into_iter()
            .find(|m| m.as_str() == raw)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One consumer's interest in one event type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub event_type: String,
    pub module: Module,
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.event_type)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Delivered,
    DeadLettered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [Self::Pending, Self::InFlight, Self::Delivered, Self::DeadLettered]
            .into_iter()
            .find(|s| s.as_str() == raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delivery {
    pub id: Uuid,
    pub event: IntegrationEvent,
    pub subscription: Subscription,
    pub status: DeliveryStatus,
    pub attempts: u32,
    /// Next attempt for Pending; lease expiry for InFlight
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(event: IntegrationEvent, subscription: Subscription, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            subscription,
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            updated_at: now,
        }
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, DeliveryStatus::Pending | DeliveryStatus::InFlight)
            && self.next_attempt_at <= now
    }
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Persist all deliveries of one published event together. A delivery for
    /// an (event, subscription) pair that is already stored is ignored.
    async fn enqueue(&self, deliveries: Vec<Delivery>) -> Result<(), StoreError>;

    /// Lease up to `limit` due deliveries: they become InFlight until `lease_until`
    /// and their attempt counter is incremented.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError>;

    // Settling is fenced on the claimed attempt: each call returns false and
    // changes nothing unless the delivery is still InFlight under `attempt`.
    // A lease that expired and was claimed again belongs to the newer attempt.

    async fn mark_delivered(&self, id: Uuid, attempt: u32, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn reschedule(
        &self,
        id: Uuid,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn dead_letter(&self, id: Uuid, attempt: u32, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn dead_letters(&self, tenant_id: Uuid) -> Result<Vec<Delivery>, StoreError>;

    /// Move a dead-lettered delivery back to Pending with a fresh attempt budget.
    /// Returns false when the delivery is not dead-lettered (or belongs to another tenant).
    async fn replay(&self, tenant_id: Uuid, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct InMemoryDeliveryStore {
    rows: Mutex<HashMap<Uuid, Delivery>>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Delivery> {
        let mut all: Vec<Delivery> = self.rows.lock().await.values().cloned().collect();
        all.sort_by_key(|d| d.updated_at);
        all
    }

    pub async fn get(&self, id: Uuid) -> Option<Delivery> {
        self.rows.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn enqueue(&self, deliveries: Vec<Delivery>) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        for delivery in deliveries {
            // republishing an event does not duplicate its deliveries
            let known = rows.values().any(|d| {
                d.event.event_id == delivery.event.event_id && d.subscription == delivery.subscription
            });
            if !known {
                rows.insert(delivery.id, delivery);
            }
        }
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut due: Vec<&mut Delivery> = rows.values_mut().filter(|d| d.is_due(now)).collect();
        due.sort_by_key(|d| d.next_attempt_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|delivery| {
                delivery.status = DeliveryStatus::InFlight;
                delivery.attempts += 1;
                delivery.next_attempt_at = lease_until;
                delivery.updated_at = now;
                delivery.clone()
            })
            .collect())
    }

    async fn mark_delivered(&self, id: Uuid, attempt: u32, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(delivery) = claimed(&mut rows, id, attempt)? else {
            return Ok(false);
        };
        delivery.status = DeliveryStatus::Delivered;
        delivery.last_error = None;
        delivery.updated_at = now;
        Ok(true)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(delivery) = claimed(&mut rows, id, attempt)? else {
            return Ok(false);
        };
        delivery.status = DeliveryStatus::Pending;
        delivery.next_attempt_at = next_attempt_at;
        delivery.last_error = Some(error.to_string());
        delivery.updated_at = now;
        Ok(true)
    }

    async fn dead_letter(&self, id: Uuid, attempt: u32, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(delivery) = claimed(&mut rows, id, attempt)? else {
            return Ok(false);
        };
        delivery.status = DeliveryStatus::DeadLettered;
        delivery.last_error = Some(error.to_string());
        delivery.updated_at = now;
        Ok(true)
    }

    async fn dead_letters(&self, tenant_id: Uuid) -> Result<Vec<Delivery>, StoreError> {
        let rows = self.rows.lock().await;
        let mut found: Vec<Delivery> = rows
            .values()
            .filter(|d| d.status == DeliveryStatus::DeadLettered && d.event.tenant_id == tenant_id)
            .cloned()
            .collect();
        found.sort_by_key(|d| d.updated_at);
        Ok(found)
    }

    async fn replay(&self, tenant_id: Uuid, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&id) {
            Some(delivery)
                if delivery.status == DeliveryStatus::DeadLettered
                    && delivery.event.tenant_id == tenant_id =>
            {
                delivery.status = DeliveryStatus::Pending;
                delivery.attempts = 0;
                delivery.next_attempt_at = now;
                delivery.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// The delivery if `attempt` still holds its lease.
fn claimed(rows: &mut HashMap<Uuid, Delivery>, id: Uuid, attempt: u32) -> Result<Option<&mut Delivery>, StoreError> {
    let delivery = rows
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(format!("delivery {}", id)))?;
    Ok((delivery.status == DeliveryStatus::InFlight && delivery.attempts == attempt).then_some(delivery))
}
