// Idempotency Ledger - persisted set of processed request ids

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use stocker_shared::ProcessedRequest;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Unique-constraint backstop: another attempt recorded this id first.
    #[error("request '{0}' has already been recorded")]
    Duplicate(String),
    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Rows are never deleted here; retention is a housekeeping concern.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn exists(&self, request_id: &str) -> Result<bool, LedgerError>;

    /// Insert the row. Returns `LedgerError::Duplicate` if the id is already present.
    async fn record(&self, request: ProcessedRequest) -> Result<(), LedgerError>;
}

/// Process-local ledger used by tests and single-node setups
#[derive(Default)]
pub struct InMemoryLedger {
    entries: RwLock<HashMap<String, ProcessedRequest>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn get(&self, request_id: &str) -> Option<ProcessedRequest> {
        self.entries.read().await.get(request_id).cloned()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn exists(&self, request_id: &str) -> Result<bool, LedgerError> {
        Ok(self.entries.read().await.contains_key(request_id))
    }

    async fn record(&self, request: ProcessedRequest) -> Result<(), LedgerError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&request.request_id) {
            return Err(LedgerError::Duplicate(request.request_id));
        }
        entries.insert(request.request_id.clone(), request);
        Ok(())
    }
}

/// Ledger backed by the `processed_requests` table (primary key on `request_id`)
#[derive(Clone)]
pub struct PgIdempotencyLedger {
    pool: PgPool,
}

impl PgIdempotencyLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert on the given connection. Inside a transaction the row commits
    /// together with the guarded operation's own writes.
    pub async fn record_in(conn: &mut PgConnection, request: &ProcessedRequest) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_requests (request_id, command_name, processed_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&request.request_id)
        .bind(&request.command_name)
        .bind(request.processed_at)
        .execute(conn)
        .await;

        map_insert(result, &request.request_id)
    }
}

fn map_insert(
    result: Result<sqlx::postgres::PgQueryResult, sqlx::Error>,
    request_id: &str,
) -> Result<(), LedgerError> {
    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(LedgerError::Duplicate(request_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl IdempotencyLedger for PgIdempotencyLedger {
    async fn exists(&self, request_id: &str) -> Result<bool, LedgerError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM processed_requests WHERE request_id = $1)",
        )
        .bind(request_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record(&self, request: ProcessedRequest) -> Result<(), LedgerError> {
        let mut conn = self.pool.acquire().await?;
        Self::record_in(&mut conn, &request).await
    }
}
