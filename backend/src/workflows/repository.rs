// Workflow persistence - repository traits and in-memory implementations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use stocker_shared::ProcessedRequest;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::definition::Workflow;
use super::execution::WorkflowExecution;
use crate::error::{codes, AppError};
use crate::pipeline::{IdempotencyLedger, LedgerError, UnitOfWork};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    /// Optimistic concurrency check failed: someone saved a newer version.
    #[error("stale version for {0}")]
    Conflict(String),
    /// A unique key is already taken.
    #[error("{0} already exists")]
    Duplicate(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Duplicate(db.constraint().unwrap_or("row").to_string())
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("corrupt row: {}", err))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AppError::NotFound(what),
            StoreError::Conflict(what) => AppError::conflict(
                codes::WORKFLOW_CONCURRENCY,
                format!("{} was modified concurrently; reload and retry", what),
            ),
            StoreError::Duplicate(what) => AppError::conflict(
                codes::WORKFLOW_CONCURRENCY,
                format!("{} already exists", what),
            ),
            StoreError::Storage(message) => AppError::DatabaseError(message),
        }
    }
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    /// Insert when `version == 0`, otherwise update if the stored version
    /// still matches. Returns the new version.
    async fn save(&self, workflow: &Workflow) -> Result<i64, StoreError>;

    /// Active, non-deleted workflows of the tenant watching `entity_type`
    /// (ASCII case-insensitive).
    async fn list_active(&self, tenant_id: Uuid, entity_type: &str) -> Result<Vec<Workflow>, StoreError>;

    /// Bump execution statistics without touching the version.
    async fn record_execution(&self, workflow_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Fails with `Duplicate` when the workflow already has an execution for
    /// the fact. Returns the stored version.
    async fn insert(&self, execution: &WorkflowExecution) -> Result<i64, StoreError>;

    async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Version-checked update. Returns the new version.
    async fn save(&self, execution: &WorkflowExecution) -> Result<i64, StoreError>;

    /// Non-terminal executions whose `resume_at` has passed, oldest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkflowExecution>, StoreError>;

    async fn list_for_workflow(
        &self,
        tenant_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;
}

/// Writes of a guarded workflow command, committed with its ledger row.
#[async_trait]
pub trait WorkflowUnitOfWork: UnitOfWork {
    /// Same contract as `WorkflowRepository::save`.
    async fn save_workflow(&mut self, workflow: &Workflow) -> Result<i64, StoreError>;

    /// Same contract as `ExecutionRepository::insert`.
    async fn insert_execution(&mut self, execution: &WorkflowExecution) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn WorkflowUnitOfWork>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    rows: RwLock<HashMap<Uuid, Workflow>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.rows.read().await.len()
    }

    async fn snapshot(&self, id: Uuid) -> Option<Workflow> {
        self.rows.read().await.get(&id).cloned()
    }

    async fn restore(&self, id: Uuid, previous: Option<Workflow>) {
        let mut rows = self.rows.write().await;
        match previous {
            Some(row) => rows.insert(id, row),
            None => rows.remove(&id),
        };
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(&id)
            .filter(|w| w.tenant_id == tenant_id && !w.is_deleted)
            .cloned())
    }

    async fn save(&self, workflow: &Workflow) -> Result<i64, StoreError> {
        let mut rows = self.rows.write().await;
        let stored_version = rows.get(&workflow.id).map(|w| w.version);
        match (workflow.version, stored_version) {
            (0, Some(_)) => return Err(StoreError::Duplicate(format!("workflow {}", workflow.id))),
            (0, None) => {}
            (_, None) => return Err(StoreError::NotFound(format!("workflow {}", workflow.id))),
            (expected, Some(current)) if expected != current => {
                return Err(StoreError::Conflict(format!("workflow {}", workflow.id)));
            }
            _ => {}
        }

        let mut row = workflow.clone();
        // statistics are owned by record_execution
        if let Some(existing) = rows.get(&workflow.id) {
            row.execution_count = existing.execution_count;
            row.last_executed_at = existing.last_executed_at;
        }
        row.version = workflow.version + 1;
        let version = row.version;
        rows.insert(row.id, row);
        Ok(version)
    }

    async fn list_active(&self, tenant_id: Uuid, entity_type: &str) -> Result<Vec<Workflow>, StoreError> {
        let rows = self.rows.read().await;
        let mut found: Vec<Workflow> = rows
            .values()
            .filter(|w| {
                w.tenant_id == tenant_id
                    && w.is_active
                    && !w.is_deleted
                    && w.entity_type.eq_ignore_ascii_case(entity_type)
            })
            .cloned()
            .collect();
        found.sort_by_key(|w| w.created_at);
        Ok(found)
    }

    async fn record_execution(&self, workflow_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        if let Some(workflow) = rows.get_mut(&workflow_id) {
            workflow.record_execution(at);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryExecutionRepository {
    rows: RwLock<HashMap<Uuid, WorkflowExecution>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<WorkflowExecution> {
        let mut all: Vec<WorkflowExecution> = self.rows.read().await.values().cloned().collect();
        all.sort_by_key(|e| e.started_at);
        all
    }

    async fn remove(&self, id: Uuid) {
        self.rows.write().await.remove(&id);
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn insert(&self, execution: &WorkflowExecution) -> Result<i64, StoreError> {
        let mut rows = self.rows.write().await;
        let taken = rows.values().any(|e| {
            e.workflow_id == execution.workflow_id
                && e.triggering_fact_id == execution.triggering_fact_id
        });
        if taken || rows.contains_key(&execution.id) {
            return Err(StoreError::Duplicate(format!(
                "execution of workflow {} for fact {}",
                execution.workflow_id, execution.triggering_fact_id
            )));
        }
        let mut row = execution.clone();
        row.version = 1;
        rows.insert(row.id, row);
        Ok(1)
    }

    async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows.get(&id).filter(|e| e.tenant_id == tenant_id).cloned())
    }

    async fn save(&self, execution: &WorkflowExecution) -> Result<i64, StoreError> {
        let mut rows = self.rows.write().await;
        let current = rows
            .get(&execution.id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", execution.id)))?;
        if current.version != execution.version || current.status.is_terminal() {
            return Err(StoreError::Conflict(format!("execution {}", execution.id)));
        }
        let mut row = execution.clone();
        row.version += 1;
        let version = row.version;
        rows.insert(row.id, row);
        Ok(version)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = self.rows.read().await;
        let mut due: Vec<WorkflowExecution> = rows
            .values()
            .filter(|e| {
                !e.status.is_terminal() && e.resume_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|e| e.resume_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn list_for_workflow(
        &self,
        tenant_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = self.rows.read().await;
        let mut found: Vec<WorkflowExecution> = rows
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.workflow_id == workflow_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.started_at);
        Ok(found)
    }
}

/// In-memory unit of work: writes apply right away and are undone on rollback.
pub struct InMemoryWorkflowStore {
    workflows: Arc<InMemoryWorkflowRepository>,
    executions: Arc<InMemoryExecutionRepository>,
    ledger: Arc<dyn IdempotencyLedger>,
}

impl InMemoryWorkflowStore {
    pub fn new(
        workflows: Arc<InMemoryWorkflowRepository>,
        executions: Arc<InMemoryExecutionRepository>,
        ledger: Arc<dyn IdempotencyLedger>,
    ) -> Self {
        Self {
            workflows,
            executions,
            ledger,
        }
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn begin(&self) -> Result<Box<dyn WorkflowUnitOfWork>, StoreError> {
        Ok(Box::new(InMemoryUnit {
            workflows: self.workflows.clone(),
            executions: self.executions.clone(),
            ledger: self.ledger.clone(),
            undo: Vec::new(),
        }))
    }
}

enum Undo {
    Workflow { id: Uuid, previous: Option<Workflow> },
    Execution(Uuid),
}

struct InMemoryUnit {
    workflows: Arc<InMemoryWorkflowRepository>,
    executions: Arc<InMemoryExecutionRepository>,
    ledger: Arc<dyn IdempotencyLedger>,
    undo: Vec<Undo>,
}

#[async_trait]
impl UnitOfWork for InMemoryUnit {
    async fn record_request(&mut self, request: &ProcessedRequest) -> Result<(), LedgerError> {
        self.ledger.record(request.clone()).await
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        let unit = *self;
        for undo in unit.undo.into_iter().rev() {
            match undo {
                Undo::Workflow { id, previous } => unit.workflows.restore(id, previous).await,
                Undo::Execution(id) => unit.executions.remove(id).await,
            }
        }
    }
}

#[async_trait]
impl WorkflowUnitOfWork for InMemoryUnit {
    async fn save_workflow(&mut self, workflow: &Workflow) -> Result<i64, StoreError> {
        let previous = self.workflows.snapshot(workflow.id).await;
        let version = self.workflows.save(workflow).await?;
        self.undo.push(Undo::Workflow {
            id: workflow.id,
            previous,
        });
        Ok(version)
    }

    async fn insert_execution(&mut self, execution: &WorkflowExecution) -> Result<i64, StoreError> {
        let version = self.executions.insert(execution).await?;
        self.undo.push(Undo::Execution(execution.id));
        Ok(version)
    }
}
