//! Types shared by every Stocker module: the integration event contracts and
//! the records the automation backend persists for them.

pub mod events;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use events::{
    ChangeKind, CustomerCreatedEvent, CustomerUpdatedEvent, DealCreatedEvent, DealProduct,
    DealStageChangedEvent, DealWonEvent, EventPayload, IntegrationEvent, LeadConvertedEvent,
};

/// Idempotency ledger row: one per successfully processed logical operation.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedRequest {
    pub request_id: String,
    pub command_name: String,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedRequest {
    pub fn new(request_id: impl Into<String>, command_name: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            command_name: command_name.into(),
            processed_at: Utc::now(),
        }
    }
}
