// Workflow Executor - advances one execution through its steps

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::actions::{render_configuration, ActionRegistry, ActionRequest};
use super::definition::WorkflowStep;
use super::execution::{StepResult, WorkflowExecution};
use super::repository::{ExecutionRepository, StoreError};
use crate::clock::Clock;
use crate::error::{codes, ApiResult, AppError};
use crate::pipeline::IdempotencyGuard;

/// How a step attempt ended
enum Dispatch {
    Skip(&'static str),
    Wait,
    Done(StepResult),
    Abort(StepResult),
}

/// Runs steps strictly in order and persists progress after every step.
///
/// A run stops when the execution reaches a terminal state or parks in
/// `WaitingDelay`; the resume poller picks it up again later.
#[derive(Clone)]
pub struct WorkflowExecutor {
    actions: ActionRegistry,
    guard: Arc<IdempotencyGuard>,
    executions: Arc<dyn ExecutionRepository>,
    clock: Arc<dyn Clock>,
    lease: Duration,
}

impl WorkflowExecutor {
    pub fn new(
        actions: ActionRegistry,
        guard: Arc<IdempotencyGuard>,
        executions: Arc<dyn ExecutionRepository>,
        clock: Arc<dyn Clock>,
        lease: Duration,
    ) -> Self {
        Self {
            actions,
            guard,
            executions,
            clock,
            lease,
        }
    }

    pub async fn run(&self, mut execution: WorkflowExecution) -> ApiResult<WorkflowExecution> {
        if !execution.begin_running(self.clock.now() + self.lease) {
            return Ok(execution);
        }
        self.persist(&mut execution).await?;

        loop {
            let Some(step) = execution.current_step().cloned() else {
                execution.complete(self.clock.now());
                self.persist(&mut execution).await?;
                info!(
                    execution_id = %execution.id,
                    workflow_id = %execution.workflow_id,
                    steps = execution.step_results.len(),
                    "Workflow execution completed"
                );
                return Ok(execution);
            };

            match self.attempt(&execution, &step).await {
                Dispatch::Skip(reason) => {
                    debug!(execution_id = %execution.id, step = step.step_order, reason, "Step skipped");
                    execution.record(StepResult::skipped(&step, reason, self.clock.now()));
                }
                Dispatch::Wait => {
                    let resume_at = self.clock.now() + Duration::minutes(i64::from(step.delay_minutes));
                    execution.wait_until(resume_at);
                    self.persist(&mut execution).await?;
                    info!(
                        execution_id = %execution.id,
                        step = step.step_order,
                        resume_at = %resume_at,
                        "Step delayed"
                    );
                    return Ok(execution);
                }
                Dispatch::Done(result) => execution.record(result),
                Dispatch::Abort(result) => {
                    let error = result.detail.clone().unwrap_or_default();
                    execution.record(result);
                    execution.fail(&format!("step {} failed: {}", step.step_order, error), self.clock.now());
                    self.persist(&mut execution).await?;
                    warn!(
                        execution_id = %execution.id,
                        workflow_id = %execution.workflow_id,
                        step = step.step_order,
                        error = %error,
                        "Workflow execution failed"
                    );
                    return Ok(execution);
                }
            }

            execution.renew_lease(self.clock.now() + self.lease);
            self.persist(&mut execution).await?;
        }
    }

    async fn attempt(&self, execution: &WorkflowExecution, step: &WorkflowStep) -> Dispatch {
        if !step.is_enabled {
            return Dispatch::Skip("step disabled");
        }

        match step.conditions.predicate() {
            Ok(predicate) if !predicate.evaluate(&execution.context) => {
                return Dispatch::Skip("conditions not met");
            }
            Ok(_) => {}
            Err(reason) => {
                warn!(
                    execution_id = %execution.id,
                    step_id = %step.id,
                    reason,
                    "Step conditions are malformed; skipping step"
                );
                return Dispatch::Skip("conditions malformed");
            }
        }

        if step.delay_minutes > 0 && !execution.delay_elapsed {
            return Dispatch::Wait;
        }

        let now = self.clock.now();
        match self.dispatch(execution, step).await {
            Ok(output) => Dispatch::Done(StepResult::succeeded(step, output, now)),
            Err(error) if step.continue_on_error => {
                warn!(
                    execution_id = %execution.id,
                    step = step.step_order,
                    error = %error,
                    "Step failed; continuing"
                );
                Dispatch::Done(StepResult::failed(step, &error, now))
            }
            Err(error) => Dispatch::Abort(StepResult::failed(step, &error, now)),
        }
    }

    /// Invoke the step's action at most once per execution and step.
    async fn dispatch(
        &self,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
    ) -> Result<Option<serde_json::Value>, String> {
        let request = ActionRequest {
            tenant_id: execution.tenant_id,
            workflow_id: execution.workflow_id,
            execution_id: execution.id,
            step_id: step.id,
            action_type: step.action_type,
            configuration: render_configuration(&step.action_configuration, &execution.context),
            context: execution.context.clone(),
        };
        let request_id = format!("step:{}:{}", execution.id, step.id);
        let command_name = format!("WorkflowStep.{}", step.action_type);

        let outcome = self
            .guard
            .run(Some(&request_id), &command_name, || async {
                self.actions.invoke(request).await.map_err(AppError::from)
            })
            .await;

        match outcome {
            Ok(output) => Ok(Some(output)),
            // an earlier attempt already performed the action
            Err(err) if err.is_duplicate_request() => Ok(None),
            Err(AppError::ExternalServiceError { message, .. }) => Err(message),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn persist(&self, execution: &mut WorkflowExecution) -> ApiResult<()> {
        match self.executions.save(execution).await {
            Ok(version) => {
                execution.version = version;
                Ok(())
            }
            Err(StoreError::Conflict(_)) => {
                debug!(execution_id = %execution.id, "Execution advanced elsewhere; stopping");
                Err(AppError::conflict(
                    codes::EXECUTION_CONCURRENCY,
                    format!("Execution {} was advanced concurrently", execution.id),
                ))
            }
            Err(err) => Err(err.into()),
        }
    }
}
