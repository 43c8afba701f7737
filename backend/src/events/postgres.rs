// Postgres delivery store (`integration_event_deliveries`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::store::{Delivery, DeliveryStatus, DeliveryStore, Module, Subscription};
use crate::workflows::StoreError;

#[derive(Debug, FromRow)]
struct DeliveryRow {
    id: Uuid,
    event: serde_json::Value,
    event_type: String,
    module: String,
    status: String,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let module = Module::parse(&row.module)
            .ok_or_else(|| StoreError::Storage(format!("unknown module '{}'", row.module)))?;
        let status = DeliveryStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Storage(format!("unknown delivery status '{}'", row.status)))?;

        Ok(Delivery {
            id: row.id,
            event: serde_json::from_value(row.event)?,
            subscription: Subscription {
                event_type: row.event_type,
                module,
            },
            status,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

const DELIVERY_COLUMNS: &str =
    "id, event, event_type, module, status, attempts, next_attempt_at, last_error, updated_at";

#[derive(Clone)]
pub struct PgDeliveryStore {
    pool: PgPool,
}

impl PgDeliveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Settle an attempt. Only the attempt holding the lease updates the row.
    async fn settle(
        &self,
        id: Uuid,
        attempt: u32,
        status: DeliveryStatus,
        next_attempt_at: Option<DateTime<Utc>>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_event_deliveries
            SET status = $2, next_attempt_at = COALESCE($3, next_attempt_at),
                last_error = $4, updated_at = $5
            WHERE id = $1 AND status = 'in_flight' AND attempts = $6
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(next_attempt_at)
        .bind(error)
        .bind(now)
        .bind(i32::try_from(attempt).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        let known = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM integration_event_deliveries WHERE id = $1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        if !known {
            return Err(StoreError::NotFound(format!("delivery {}", id)));
        }
        Ok(false)
    }
}

#[async_trait]
impl DeliveryStore for PgDeliveryStore {
    async fn enqueue(&self, deliveries: Vec<Delivery>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for delivery in &deliveries {
            sqlx::query(
                r#"
                INSERT INTO integration_event_deliveries
                (id, event_id, tenant_id, event, event_type, module, status, attempts,
                 next_attempt_at, last_error, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (event_id, event_type, module) DO NOTHING
                "#,
            )
            .bind(delivery.id)
            .bind(delivery.event.event_id)
            .bind(delivery.event.tenant_id)
            .bind(serde_json::to_value(&delivery.event)?)
            .bind(&delivery.subscription.event_type)
            .bind(delivery.subscription.module.as_str())
            .bind(delivery.status.as_str())
            .bind(i32::try_from(delivery.attempts).unwrap_or(i32::MAX))
            .bind(delivery.next_attempt_at)
            .bind(&delivery.last_error)
            .bind(delivery.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError> {
        // SKIP LOCKED lets several dispatchers share the table
        let rows = sqlx::query_as::<_, DeliveryRow>(&format!(
            r#"
            UPDATE integration_event_deliveries
            SET status = 'in_flight', attempts = attempts + 1,
                next_attempt_at = $2, updated_at = $1
            WHERE id IN (
                SELECT id FROM integration_event_deliveries
                WHERE status IN ('pending', 'in_flight') AND next_attempt_at <= $1
                ORDER BY next_attempt_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(now)
        .bind(lease_until)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Delivery::try_from).collect()
    }

    async fn mark_delivered(&self, id: Uuid, attempt: u32, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.settle(id, attempt, DeliveryStatus::Delivered, None, None, now).await
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.settle(id, attempt, DeliveryStatus::Pending, Some(next_attempt_at), Some(error), now)
            .await
    }

    async fn dead_letter(&self, id: Uuid, attempt: u32, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.settle(id, attempt, DeliveryStatus::DeadLettered, None, Some(error), now)
            .await
    }

    async fn dead_letters(&self, tenant_id: Uuid) -> Result<Vec<Delivery>, StoreError> {
        let rows = sqlx::query_as::<_, DeliveryRow>(&format!(
            r#"
            SELECT {} FROM integration_event_deliveries
            WHERE tenant_id = $1 AND status = 'dead_lettered'
            ORDER BY updated_at DESC
            LIMIT 500
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Delivery::try_from).collect()
    }

    async fn replay(&self, tenant_id: Uuid, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_event_deliveries
            SET status = 'pending', attempts = 0, next_attempt_at = $3, updated_at = $3
            WHERE id = $1 AND tenant_id = $2 AND status = 'dead_lettered'
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
