//! Integration events exchanged between Stocker modules.
//!
//! An [`IntegrationEvent`] is the immutable envelope that travels over the bus.
//! The payload is kept as JSON so the bus, the outbox tables and the workflow
//! trigger evaluator can handle every event type uniformly; consumers decode it
//! back into the typed payload they subscribed to.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// The kind of change a domain fact describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    StatusChanged,
    DueDateReached,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::StatusChanged => "status_changed",
            Self::DueDateReached => "due_date_reached",
        }
    }
}

/// A typed integration event payload.
///
/// Every payload names its wire event type, the entity tag workflows watch
/// (e.g. `"Deal"`) and the kind of change it reports.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
    const ENTITY_TYPE: &'static str;
    const CHANGE: ChangeKind;
}

/// Immutable fact envelope published once by the originating module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrationEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub tenant_id: Uuid,
    pub entity_type: String,
    pub change: ChangeKind,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl IntegrationEvent {
    /// Wrap a typed payload in a fresh envelope.
    pub fn new<E: EventPayload>(tenant_id: Uuid, payload: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: E::EVENT_TYPE.to_string(),
            tenant_id,
            entity_type: E::ENTITY_TYPE.to_string(),
            change: E::CHANGE,
            occurred_at: Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Decode the payload as `E`. Fails if the envelope carries another type.
    pub fn decode<E: EventPayload>(&self) -> Result<E, serde_json::Error> {
        if self.event_type != E::EVENT_TYPE {
            return Err(serde::de::Error::custom(format!(
                "event type mismatch: expected {}, got {}",
                E::EVENT_TYPE,
                self.event_type
            )));
        }
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomerCreatedEvent {
    pub customer_id: Uuid,
    pub company_name: String,
}

impl EventPayload for CustomerCreatedEvent {
    const EVENT_TYPE: &'static str = "CustomerCreated";
    const ENTITY_TYPE: &'static str = "Customer";
    const CHANGE: ChangeKind = ChangeKind::Created;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomerUpdatedEvent {
    pub customer_id: Uuid,
    pub company_name: String,
}

impl EventPayload for CustomerUpdatedEvent {
    const EVENT_TYPE: &'static str = "CustomerUpdated";
    const ENTITY_TYPE: &'static str = "Customer";
    const CHANGE: ChangeKind = ChangeKind::Updated;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeadConvertedEvent {
    pub lead_id: Uuid,
    pub customer_id: Uuid,
}

impl EventPayload for LeadConvertedEvent {
    const EVENT_TYPE: &'static str = "LeadConverted";
    const ENTITY_TYPE: &'static str = "Lead";
    const CHANGE: ChangeKind = ChangeKind::StatusChanged;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DealCreatedEvent {
    pub deal_id: Uuid,
    pub customer_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub amount: Option<Decimal>,
}

impl EventPayload for DealCreatedEvent {
    const EVENT_TYPE: &'static str = "DealCreated";
    const ENTITY_TYPE: &'static str = "Deal";
    const CHANGE: ChangeKind = ChangeKind::Created;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DealStageChangedEvent {
    pub deal_id: Uuid,
    pub old_stage: String,
    pub new_stage: String,
}

impl EventPayload for DealStageChangedEvent {
    const EVENT_TYPE: &'static str = "DealStageChanged";
    const ENTITY_TYPE: &'static str = "Deal";
    const CHANGE: ChangeKind = ChangeKind::StatusChanged;
}

/// One product line of a won deal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DealProduct {
    pub product_id: Uuid,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DealWonEvent {
    pub deal_id: Uuid,
    pub customer_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub products: Vec<DealProduct>,
    /// Sales representative credited with the deal, when known.
    #[serde(default)]
    pub owner_id: Option<Uuid>,
}

impl EventPayload for DealWonEvent {
    const EVENT_TYPE: &'static str = "DealWon";
    const ENTITY_TYPE: &'static str = "Deal";
    const CHANGE: ChangeKind = ChangeKind::StatusChanged;
}
