// Workflow Execution - one run of a workflow for one triggering fact
//
// Pending -> Running -> (WaitingDelay <-> Running)* -> Completed | Failed | Aborted
//
// Terminal executions are never changed again; every transition below checks it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::definition::{Workflow, WorkflowStep};
use crate::error::{codes, ApiResult, AppError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    WaitingDelay,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingDelay => "waiting_delay",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::Pending,
            Self::Running,
            Self::WaitingDelay,
            Self::Completed,
            Self::Failed,
            Self::Aborted,
        ]
        .into_iter()
        .find(|s| s.as_str() == raw)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Skipped,
    Succeeded,
    Failed,
}

/// Outcome of one step within an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: Uuid,
    pub step_order: i32,
    pub outcome: StepOutcome,
    /// Why the step was skipped or how it failed
    pub detail: Option<String>,
    pub output: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl StepResult {
    pub fn skipped(step: &WorkflowStep, reason: &str, at: DateTime<Utc>) -> Self {
        Self {
            step_id: step.id,
            step_order: step.step_order,
            outcome: StepOutcome::Skipped,
            detail: Some(reason.to_string()),
            output: None,
            recorded_at: at,
        }
    }

    pub fn succeeded(step: &WorkflowStep, output: Option<serde_json::Value>, at: DateTime<Utc>) -> Self {
        Self {
            step_id: step.id,
            step_order: step.step_order,
            outcome: StepOutcome::Succeeded,
            detail: None,
            output,
            recorded_at: at,
        }
    }

    pub fn failed(step: &WorkflowStep, error: &str, at: DateTime<Utc>) -> Self {
        Self {
            step_id: step.id,
            step_order: step.step_order,
            outcome: StepOutcome::Failed,
            detail: Some(error.to_string()),
            output: None,
            recorded_at: at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: Uuid,
    pub triggering_fact_id: Uuid,
    pub status: ExecutionStatus,
    /// Index into `steps` of the next step to run
    pub current_step_index: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub step_results: Vec<StepResult>,
    /// When the resume poller should pick this execution up. For
    /// `WaitingDelay` this is the end of the delay; for `Pending`/`Running`
    /// it is a lease after which a crashed runner's work is recovered.
    pub resume_at: Option<DateTime<Utc>>,
    /// The current step's delay has already been waited out
    pub delay_elapsed: bool,
    /// Fact payload plus step outputs under `steps.<step_order>`
    pub context: serde_json::Value,
    /// Steps as they were when the execution started
    pub steps: Vec<WorkflowStep>,
    pub error_message: Option<String>,
    pub version: i64,
}

impl WorkflowExecution {
    pub fn start(
        workflow: &Workflow,
        triggering_fact_id: Uuid,
        context: serde_json::Value,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Self {
        let mut context = if context.is_object() {
            context
        } else {
            serde_json::json!({ "payload": context })
        };
        if let Some(map) = context.as_object_mut() {
            map.entry("steps").or_insert_with(|| serde_json::json!({}));
        }

        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            tenant_id: workflow.tenant_id,
            triggering_fact_id,
            status: ExecutionStatus::Pending,
            current_step_index: 0,
            started_at: now,
            completed_at: None,
            step_results: Vec::new(),
            resume_at: Some(lease_until),
            delay_elapsed: false,
            context,
            steps: workflow.steps().to_vec(),
            error_message: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn current_step(&self) -> Option<&WorkflowStep> {
        usize::try_from(self.current_step_index)
            .ok()
            .and_then(|index| self.steps.get(index))
    }

    /// Pending or WaitingDelay (after its delay) -> Running.
    pub fn begin_running(&mut self, lease_until: DateTime<Utc>) -> bool {
        match self.status {
            ExecutionStatus::Pending | ExecutionStatus::Running => {}
            ExecutionStatus::WaitingDelay => self.delay_elapsed = true,
            _ => return false,
        }
        self.status = ExecutionStatus::Running;
        self.resume_at = Some(lease_until);
        true
    }

    /// Extend the running lease.
    pub fn renew_lease(&mut self, lease_until: DateTime<Utc>) {
        if self.status == ExecutionStatus::Running {
            self.resume_at = Some(lease_until);
        }
    }

    /// Record the current step's outcome and move to the next step.
    pub fn record(&mut self, result: StepResult) {
        if self.is_terminal() {
            return;
        }
        if result.outcome == StepOutcome::Succeeded {
            if let (Some(output), Some(steps)) = (
                result.output.clone(),
                self.context.get_mut("steps").and_then(|s| s.as_object_mut()),
            ) {
                steps.insert(result.step_order.to_string(), output);
            }
        }
        self.step_results.push(result);
        self.current_step_index += 1;
        self.delay_elapsed = false;
    }

    pub fn wait_until(&mut self, resume_at: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::WaitingDelay;
        self.resume_at = Some(resume_at);
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.finish(ExecutionStatus::Completed, None, now);
    }

    pub fn fail(&mut self, error: &str, now: DateTime<Utc>) {
        self.finish(ExecutionStatus::Failed, Some(error.to_string()), now);
    }

    /// Operator abort. Only executions that are not mid-step can be aborted.
    pub fn abort(&mut self, reason: &str, now: DateTime<Utc>) -> ApiResult<()> {
        if !matches!(self.status, ExecutionStatus::Pending | ExecutionStatus::WaitingDelay) {
            return Err(AppError::conflict(
                codes::EXECUTION_CANNOT_ABORT,
                format!("Execution is {} and cannot be aborted", self.status.as_str()),
            ));
        }
        self.finish(ExecutionStatus::Aborted, Some(reason.to_string()), now);
        Ok(())
    }

    /// Operator skip of the step the execution is waiting on.
    pub fn skip_current(&mut self, now: DateTime<Utc>) -> ApiResult<()> {
        if !matches!(self.status, ExecutionStatus::Pending | ExecutionStatus::WaitingDelay) {
            return Err(AppError::conflict(
                codes::STEP_CANNOT_SKIP,
                format!("Execution is {}; only waiting steps can be skipped", self.status.as_str()),
            ));
        }
        let step = self.current_step().cloned().ok_or_else(|| {
            AppError::conflict(codes::STEP_CANNOT_SKIP, "Execution has no remaining steps")
        })?;
        self.record(StepResult::skipped(&step, "skipped by operator", now));
        self.status = ExecutionStatus::Pending;
        self.resume_at = Some(now);
        Ok(())
    }

    fn finish(&mut self, status: ExecutionStatus, error: Option<String>, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        self.status = status;
        self.error_message = error;
        self.completed_at = Some(now);
        self.resume_at = None;
    }
}
