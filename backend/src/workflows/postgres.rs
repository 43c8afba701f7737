// Postgres-backed workflow and execution repositories

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Transaction};
use stocker_shared::ProcessedRequest;
use tracing::warn;
use uuid::Uuid;

use super::conditions::ConditionSet;
use super::definition::{Workflow, WorkflowStep};
use super::execution::{ExecutionStatus, StepResult, WorkflowExecution};
use super::repository::{ExecutionRepository, StoreError, WorkflowRepository, WorkflowStore, WorkflowUnitOfWork};
use super::triggers::TriggerType;
use crate::pipeline::{LedgerError, PgIdempotencyLedger, UnitOfWork};

#[derive(Debug, FromRow)]
struct WorkflowRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    description: Option<String>,
    trigger_type: String,
    entity_type: String,
    trigger_conditions: String,
    is_active: bool,
    is_deleted: bool,
    steps: serde_json::Value,
    execution_count: i64,
    last_executed_at: Option<DateTime<Utc>>,
    created_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = StoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let trigger_type = TriggerType::parse(&row.trigger_type).ok_or_else(|| {
            StoreError::Storage(format!("unknown trigger type '{}'", row.trigger_type))
        })?;
        let steps: Vec<WorkflowStep> = serde_json::from_value(row.steps)?;

        Ok(Workflow::restore(
            row.id,
            row.tenant_id,
            row.name,
            row.description,
            trigger_type,
            row.entity_type,
            // conditions that no longer parse are kept and fail closed
            ConditionSet::load(&row.trigger_conditions),
            row.is_active,
            row.is_deleted,
            steps,
            row.execution_count,
            row.last_executed_at,
            row.created_by,
            row.created_at,
            row.updated_at,
            row.version,
        ))
    }
}

const WORKFLOW_COLUMNS: &str = r#"
    id, tenant_id, name, description, trigger_type, entity_type, trigger_conditions,
    is_active, is_deleted, steps, execution_count, last_executed_at,
    created_by, created_at, updated_at, version
"#;

#[derive(Clone)]
pub struct PgWorkflowRepository {
    pool: PgPool,
}

impl PgWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepository for PgWorkflowRepository {
    async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {} FROM workflows WHERE id = $1 AND tenant_id = $2 AND is_deleted = false",
            WORKFLOW_COLUMNS
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Workflow::try_from).transpose()
    }

    async fn save(&self, workflow: &Workflow) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        write_workflow(&mut conn, workflow).await
    }

    async fn list_active(&self, tenant_id: Uuid, entity_type: &str) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            r#"
            SELECT {} FROM workflows
            WHERE tenant_id = $1 AND is_active = true AND is_deleted = false
              AND lower(entity_type) = lower($2)
            ORDER BY created_at ASC
            "#,
            WORKFLOW_COLUMNS
        ))
        .bind(tenant_id)
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Workflow::try_from).collect()
    }

    async fn record_execution(&self, workflow_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflows SET execution_count = execution_count + 1, last_executed_at = $2 WHERE id = $1",
        )
        .bind(workflow_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Insert when `version == 0`, otherwise a version-checked update.
async fn write_workflow(conn: &mut PgConnection, workflow: &Workflow) -> Result<i64, StoreError> {
    let steps = serde_json::to_value(workflow.steps())?;

    if workflow.version == 0 {
        sqlx::query(
            r#"
            INSERT INTO workflows
            (id, tenant_id, name, description, trigger_type, entity_type, trigger_conditions,
             is_active, is_deleted, steps, execution_count, last_executed_at,
             created_by, created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, NULL, $11, $12, $13, 1)
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.tenant_id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.trigger_type.as_str())
        .bind(&workflow.entity_type)
        .bind(workflow.trigger_conditions.to_storage())
        .bind(workflow.is_active)
        .bind(workflow.is_deleted)
        .bind(steps)
        .bind(workflow.created_by)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *conn)
        .await?;
        return Ok(1);
    }

    let version = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE workflows
        SET name = $3, description = $4, trigger_type = $5, entity_type = $6,
            trigger_conditions = $7, is_active = $8, is_deleted = $9, steps = $10,
            updated_at = $11, version = version + 1
        WHERE id = $1 AND version = $2
        RETURNING version
        "#,
    )
    .bind(workflow.id)
    .bind(workflow.version)
    .bind(&workflow.name)
    .bind(&workflow.description)
    .bind(workflow.trigger_type.as_str())
    .bind(&workflow.entity_type)
    .bind(workflow.trigger_conditions.to_storage())
    .bind(workflow.is_active)
    .bind(workflow.is_deleted)
    .bind(steps)
    .bind(workflow.updated_at)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(version) = version {
        return Ok(version);
    }

    let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM workflows WHERE id = $1)")
        .bind(workflow.id)
        .fetch_one(&mut *conn)
        .await?;
    if exists {
        Err(StoreError::Conflict(format!("workflow {}", workflow.id)))
    } else {
        Err(StoreError::NotFound(format!("workflow {}", workflow.id)))
    }
}

#[derive(Debug, FromRow)]
struct ExecutionRow {
    id: Uuid,
    workflow_id: Uuid,
    tenant_id: Uuid,
    triggering_fact_id: Uuid,
    status: String,
    current_step_index: i32,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    step_results: serde_json::Value,
    resume_at: Option<DateTime<Utc>>,
    delay_elapsed: bool,
    context: serde_json::Value,
    steps: serde_json::Value,
    error_message: Option<String>,
    version: i64,
}

impl TryFrom<ExecutionRow> for WorkflowExecution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let status = ExecutionStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Storage(format!("unknown execution status '{}'", row.status)))?;
        let step_results: Vec<StepResult> = serde_json::from_value(row.step_results)?;
        let steps: Vec<WorkflowStep> = serde_json::from_value(row.steps)?;

        Ok(WorkflowExecution {
            id: row.id,
            workflow_id: row.workflow_id,
            tenant_id: row.tenant_id,
            triggering_fact_id: row.triggering_fact_id,
            status,
            current_step_index: row.current_step_index,
            started_at: row.started_at,
            completed_at: row.completed_at,
            step_results,
            resume_at: row.resume_at,
            delay_elapsed: row.delay_elapsed,
            context: row.context,
            steps,
            error_message: row.error_message,
            version: row.version,
        })
    }
}

const EXECUTION_COLUMNS: &str = r#"
    id, workflow_id, tenant_id, triggering_fact_id, status, current_step_index,
    started_at, completed_at, step_results, resume_at, delay_elapsed, context, steps,
    error_message, version
"#;

/// Unique (workflow_id, triggering_fact_id) turns redelivery into `Duplicate`.
async fn write_new_execution(conn: &mut PgConnection, execution: &WorkflowExecution) -> Result<i64, StoreError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_executions
        (id, workflow_id, tenant_id, triggering_fact_id, status, current_step_index,
         started_at, completed_at, step_results, resume_at, delay_elapsed, context, steps,
         error_message, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 1)
        "#,
    )
    .bind(execution.id)
    .bind(execution.workflow_id)
    .bind(execution.tenant_id)
    .bind(execution.triggering_fact_id)
    .bind(execution.status.as_str())
    .bind(execution.current_step_index)
    .bind(execution.started_at)
    .bind(execution.completed_at)
    .bind(serde_json::to_value(&execution.step_results)?)
    .bind(execution.resume_at)
    .bind(execution.delay_elapsed)
    .bind(&execution.context)
    .bind(serde_json::to_value(&execution.steps)?)
    .bind(&execution.error_message)
    .execute(conn)
    .await?;
    Ok(1)
}

#[derive(Clone)]
pub struct PgExecutionRepository {
    pool: PgPool,
}

impl PgExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionRepository for PgExecutionRepository {
    async fn insert(&self, execution: &WorkflowExecution) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        write_new_execution(&mut conn, execution).await
    }

    async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {} FROM workflow_executions WHERE id = $1 AND tenant_id = $2",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn save(&self, execution: &WorkflowExecution) -> Result<i64, StoreError> {
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE workflow_executions
            SET status = $3, current_step_index = $4, completed_at = $5, step_results = $6,
                resume_at = $7, delay_elapsed = $8, context = $9, error_message = $10,
                version = version + 1
            WHERE id = $1 AND version = $2
              AND status NOT IN ('completed', 'failed', 'aborted')
            RETURNING version
            "#,
        )
        .bind(execution.id)
        .bind(execution.version)
        .bind(execution.status.as_str())
        .bind(execution.current_step_index)
        .bind(execution.completed_at)
        .bind(serde_json::to_value(&execution.step_results)?)
        .bind(execution.resume_at)
        .bind(execution.delay_elapsed)
        .bind(&execution.context)
        .bind(&execution.error_message)
        .fetch_optional(&self.pool)
        .await?;

        version.ok_or_else(|| StoreError::Conflict(format!("execution {}", execution.id)))
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {} FROM workflow_executions
            WHERE status IN ('pending', 'running', 'waiting_delay') AND resume_at <= $1
            ORDER BY resume_at ASC
            LIMIT $2
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkflowExecution::try_from).collect()
    }

    async fn list_for_workflow(
        &self,
        tenant_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {} FROM workflow_executions
            WHERE tenant_id = $1 AND workflow_id = $2
            ORDER BY started_at DESC
            LIMIT 200
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkflowExecution::try_from).collect()
    }
}

/// Guarded workflow commands run in one Postgres transaction together with
/// their `processed_requests` row.
#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn begin(&self) -> Result<Box<dyn WorkflowUnitOfWork>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnit { tx }))
    }
}

struct PgUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn record_request(&mut self, request: &ProcessedRequest) -> Result<(), LedgerError> {
        PgIdempotencyLedger::record_in(&mut self.tx, request).await
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        if let Err(err) = self.tx.rollback().await {
            warn!(error = %err, "Failed to roll back workflow transaction");
        }
    }
}

#[async_trait]
impl WorkflowUnitOfWork for PgUnit {
    async fn save_workflow(&mut self, workflow: &Workflow) -> Result<i64, StoreError> {
        write_workflow(&mut self.tx, workflow).await
    }

    async fn insert_execution(&mut self, execution: &WorkflowExecution) -> Result<i64, StoreError> {
        write_new_execution(&mut self.tx, execution).await
    }
}
