// Workflow Automation Engine
//
// Tenant-defined workflows: a trigger watching one entity type, a predicate
// over the fact payload, and ordered steps dispatched to action capabilities.

pub mod actions;
pub mod commands;
pub mod conditions;
pub mod definition;
pub mod engine;
pub mod execution;
pub mod executor;
pub mod postgres;
pub mod repository;
pub mod triggers;

pub use actions::{ActionCapability, ActionError, ActionRegistry, ActionRequest, ActionType, LoggingActionCapability};
pub use commands::{CreateWorkflow, ExecuteWorkflow, UpdateWorkflow};
pub use conditions::{ConditionOperator, ConditionSet, FieldCondition, Predicate};
pub use definition::{StepDraft, Workflow, WorkflowStep};
pub use engine::{fact_context, WorkflowEngine};
pub use execution::{ExecutionStatus, StepOutcome, StepResult, WorkflowExecution};
pub use executor::WorkflowExecutor;
pub use postgres::{PgExecutionRepository, PgWorkflowRepository, PgWorkflowStore};
pub use repository::{
    ExecutionRepository, InMemoryExecutionRepository, InMemoryWorkflowRepository, InMemoryWorkflowStore,
    StoreError, WorkflowRepository, WorkflowStore, WorkflowUnitOfWork,
};
pub use triggers::{MatchedWorkflow, TriggerEvaluator, TriggerType};
