// Workflow Engine - turns facts and commands into workflow executions

use async_trait::async_trait;
use chrono::Duration;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use stocker_shared::IntegrationEvent;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::ActionRegistry;
use super::commands::{CreateWorkflow, ExecuteWorkflow, UpdateWorkflow};
use super::definition::Workflow;
use super::execution::WorkflowExecution;
use super::executor::WorkflowExecutor;
use super::repository::{ExecutionRepository, StoreError, WorkflowRepository, WorkflowStore, WorkflowUnitOfWork};
use super::triggers::TriggerEvaluator;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{codes, ApiResult, AppError};
use crate::pipeline::{CommandHandler, IdempotencyGuard};

pub struct WorkflowEngine {
    workflows: Arc<dyn WorkflowRepository>,
    executions: Arc<dyn ExecutionRepository>,
    store: Arc<dyn WorkflowStore>,
    evaluator: TriggerEvaluator,
    executor: WorkflowExecutor,
    guard: Arc<IdempotencyGuard>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
}

impl WorkflowEngine {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        executions: Arc<dyn ExecutionRepository>,
        store: Arc<dyn WorkflowStore>,
        actions: ActionRegistry,
        guard: Arc<IdempotencyGuard>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let executor = WorkflowExecutor::new(
            actions,
            guard.clone(),
            executions.clone(),
            clock.clone(),
            Duration::seconds(config.execution_lease_seconds),
        );
        Self {
            evaluator: TriggerEvaluator::new(workflows.clone()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
            workflows,
            executions,
            store,
            executor,
            guard,
            clock,
            config,
        }
    }

    pub fn guard(&self) -> &Arc<IdempotencyGuard> {
        &self.guard
    }

    // ===== Facts =====

    /// Start one execution per matching workflow. Redelivered facts start nothing new.
    ///
    /// Returns the ids of the executions this call started. Errors only when
    /// matching or recording failed, so the bus retries the fact.
    pub async fn process_event(&self, event: &IntegrationEvent) -> ApiResult<Vec<Uuid>> {
        let matched = self.evaluator.evaluate(event).await?;
        if matched.is_empty() {
            return Ok(Vec::new());
        }

        let context = fact_context(event);
        let results = join_all(
            matched
                .into_iter()
                .map(|m| self.launch(m.workflow, event.event_id, context.clone())),
        )
        .await;

        let mut started = Vec::new();
        let mut failure = None;
        for result in results {
            match result {
                Ok(Some(id)) => started.push(id),
                Ok(None) => {}
                Err(err) => {
                    error!(event_id = %event.event_id, error = %err, "Failed to start workflow execution");
                    failure.get_or_insert(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(started),
        }
    }

    /// Resume executions whose delay has elapsed or whose runner vanished.
    pub async fn resume_due(&self) -> ApiResult<usize> {
        let due = self
            .executions
            .due(self.clock.now(), self.config.resume_batch_size)
            .await?;
        let count = due.len();
        if count > 0 {
            info!(count, "Resuming due workflow executions");
            join_all(due.into_iter().map(|execution| self.drive(execution))).await;
        }
        Ok(count)
    }

    // ===== Commands =====

    pub async fn create_workflow(&self, command: CreateWorkflow) -> ApiResult<Uuid> {
        self.guard.execute(command, self).await
    }

    pub async fn update_workflow(&self, command: UpdateWorkflow) -> ApiResult<()> {
        self.guard.execute(command, self).await
    }

    /// Start an active workflow by hand. The execution row commits with the
    /// request id; running it happens afterwards.
    pub async fn execute_manual(&self, command: ExecuteWorkflow) -> ApiResult<Uuid> {
        let tenant_id = command.tenant_id;
        let execution_id = self.guard.execute(command, self).await?;
        let execution = self.load_execution(tenant_id, execution_id).await?;
        self.started(execution).await;
        Ok(execution_id)
    }

    /// Abort an execution that is not in the middle of a step.
    pub async fn abort_execution(&self, tenant_id: Uuid, execution_id: Uuid, reason: &str) -> ApiResult<()> {
        let mut execution = self.load_execution(tenant_id, execution_id).await?;
        execution.abort(reason, self.clock.now())?;
        self.save_execution(&execution).await?;
        info!(execution_id = %execution_id, reason, "Workflow execution aborted");
        Ok(())
    }

    /// Skip the step a pending or delayed execution is waiting on and carry on.
    pub async fn skip_waiting_step(&self, tenant_id: Uuid, execution_id: Uuid) -> ApiResult<()> {
        let mut execution = self.load_execution(tenant_id, execution_id).await?;
        execution.skip_current(self.clock.now())?;
        execution.version = self.save_execution(&execution).await?;
        info!(execution_id = %execution_id, "Waiting step skipped by operator");
        self.drive(execution).await;
        Ok(())
    }

    // ===== Queries =====

    pub async fn get_workflow(&self, tenant_id: Uuid, workflow_id: Uuid) -> ApiResult<Workflow> {
        self.workflows
            .get(tenant_id, workflow_id)
            .await?
            .ok_or_else(|| AppError::not_found("Workflow"))
    }

    pub async fn get_execution(&self, tenant_id: Uuid, execution_id: Uuid) -> ApiResult<WorkflowExecution> {
        self.load_execution(tenant_id, execution_id).await
    }

    pub async fn list_executions(&self, tenant_id: Uuid, workflow_id: Uuid) -> ApiResult<Vec<WorkflowExecution>> {
        self.get_workflow(tenant_id, workflow_id).await?;
        Ok(self.executions.list_for_workflow(tenant_id, workflow_id).await?)
    }

    // ===== Internals =====

    fn new_execution(&self, workflow: &Workflow, fact_id: Uuid, context: Value) -> WorkflowExecution {
        let now = self.clock.now();
        let lease_until = now + Duration::seconds(self.config.execution_lease_seconds);
        WorkflowExecution::start(workflow, fact_id, context, now, lease_until)
    }

    async fn launch(&self, workflow: Workflow, fact_id: Uuid, context: Value) -> ApiResult<Option<Uuid>> {
        let mut execution = self.new_execution(&workflow, fact_id, context);

        match self.executions.insert(&execution).await {
            Ok(version) => execution.version = version,
            Err(StoreError::Duplicate(_)) => {
                debug!(workflow_id = %workflow.id, fact_id = %fact_id, "Execution already exists for fact");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }

        let id = execution.id;
        self.started(execution).await;
        Ok(Some(id))
    }

    /// Bookkeeping for a stored execution, then run it.
    async fn started(&self, execution: WorkflowExecution) {
        if let Err(err) = self
            .workflows
            .record_execution(execution.workflow_id, execution.started_at)
            .await
        {
            warn!(workflow_id = %execution.workflow_id, error = %err, "Failed to update execution statistics");
        }

        info!(
            tenant_id = %execution.tenant_id,
            workflow_id = %execution.workflow_id,
            execution_id = %execution.id,
            fact_id = %execution.triggering_fact_id,
            "Workflow execution started"
        );
        self.drive(execution).await;
    }

    /// Run an execution as far as it goes. Failures leave it for the resume poller.
    async fn drive(&self, execution: WorkflowExecution) {
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };
        let execution_id = execution.id;
        match self.executor.run(execution).await {
            Ok(_) => {}
            Err(err) if err.error_code() == codes::EXECUTION_CONCURRENCY => {}
            Err(err) => {
                warn!(execution_id = %execution_id, error = %err, "Execution run interrupted; will resume later");
            }
        }
    }

    async fn load_execution(&self, tenant_id: Uuid, execution_id: Uuid) -> ApiResult<WorkflowExecution> {
        self.executions
            .get(tenant_id, execution_id)
            .await?
            .ok_or_else(|| AppError::not_found("Execution"))
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> ApiResult<i64> {
        self.executions.save(execution).await.map_err(|err| match err {
            StoreError::Conflict(_) => AppError::conflict(
                codes::EXECUTION_CONCURRENCY,
                format!("Execution {} changed concurrently; reload and retry", execution.id),
            ),
            other => other.into(),
        })
    }
}

#[async_trait]
impl CommandHandler<CreateWorkflow> for WorkflowEngine {
    type Work = dyn WorkflowUnitOfWork;

    async fn begin(&self) -> ApiResult<Box<Self::Work>> {
        Ok(self.store.begin().await?)
    }

    async fn handle(&self, work: &mut Self::Work, command: CreateWorkflow) -> ApiResult<Uuid> {
        let mut workflow = Workflow::create(
            &command.name,
            command.description.as_deref(),
            command.trigger_type,
            &command.entity_type,
            &command.trigger_conditions,
            command.tenant_id,
            command.created_by,
        )?;
        if !command.steps.is_empty() {
            workflow.replace_steps(command.steps)?;
        }
        if command.is_active {
            workflow.activate()?;
        }

        work.save_workflow(&workflow).await?;
        info!(
            tenant_id = %workflow.tenant_id,
            workflow_id = %workflow.id,
            steps = workflow.steps().len(),
            "Workflow created"
        );
        Ok(workflow.id)
    }
}

#[async_trait]
impl CommandHandler<UpdateWorkflow> for WorkflowEngine {
    type Work = dyn WorkflowUnitOfWork;

    async fn begin(&self) -> ApiResult<Box<Self::Work>> {
        Ok(self.store.begin().await?)
    }

    async fn handle(&self, work: &mut Self::Work, command: UpdateWorkflow) -> ApiResult<()> {
        let mut workflow = self.get_workflow(command.tenant_id, command.workflow_id).await?;

        // steps can only be reshaped while inactive
        workflow.deactivate();
        workflow.update_details(
            &command.name,
            command.description.as_deref(),
            command.trigger_type,
            &command.entity_type,
            &command.trigger_conditions,
        )?;
        workflow.replace_steps(command.steps)?;
        if command.is_active {
            workflow.activate()?;
        }

        work.save_workflow(&workflow).await?;
        info!(workflow_id = %workflow.id, is_active = workflow.is_active, "Workflow updated");
        Ok(())
    }
}

#[async_trait]
impl CommandHandler<ExecuteWorkflow> for WorkflowEngine {
    type Work = dyn WorkflowUnitOfWork;

    async fn begin(&self) -> ApiResult<Box<Self::Work>> {
        Ok(self.store.begin().await?)
    }

    /// Stores the pending execution; `execute_manual` runs it after commit.
    async fn handle(&self, work: &mut Self::Work, command: ExecuteWorkflow) -> ApiResult<Uuid> {
        let workflow = self.get_workflow(command.tenant_id, command.workflow_id).await?;
        if !workflow.is_active {
            return Err(AppError::validation(
                codes::WORKFLOW_INACTIVE,
                "workflow_id",
                "Only active workflows can be executed",
            ));
        }

        let context = manual_context(&workflow, command.entity_id, command.parameters);
        let execution = self.new_execution(&workflow, Uuid::new_v4(), context);
        work.insert_execution(&execution).await?;
        Ok(execution.id)
    }
}

/// Execution context for a fact: the payload fields plus an `event` envelope.
pub fn fact_context(event: &IntegrationEvent) -> Value {
    let mut context = match &event.payload {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("payload".to_string(), other.clone());
            map
        }
    };
    context.insert(
        "event".to_string(),
        json!({
            "event_id": event.event_id,
            "event_type": event.event_type,
            "entity_type": event.entity_type,
            "change": event.change,
            "tenant_id": event.tenant_id,
            "occurred_at": event.occurred_at,
        }),
    );
    Value::Object(context)
}

fn manual_context(workflow: &Workflow, entity_id: Option<Uuid>, parameters: Option<Value>) -> Value {
    let mut context = Map::new();
    if let Some(Value::Object(params)) = &parameters {
        context.extend(params.clone());
    }
    context.insert("entity_id".to_string(), json!(entity_id));
    context.insert("parameters".to_string(), parameters.unwrap_or(Value::Null));
    context.insert(
        "event".to_string(),
        json!({
            "event_type": "Manual",
            "entity_type": workflow.entity_type,
            "tenant_id": workflow.tenant_id,
        }),
    );
    Value::Object(context)
}
