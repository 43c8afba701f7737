// Workflow Triggers - which facts start which workflows

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use stocker_shared::{ChangeKind, IntegrationEvent};
use tracing::{debug, warn};

use super::definition::Workflow;
use super::repository::{StoreError, WorkflowRepository};

/// Kinds of trigger a workflow can declare
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    EntityCreated,
    EntityUpdated,
    FieldChanged,
    StatusChanged,
    DealStageChanged,
    Scheduled,
    FieldCondition,
    AmountThreshold,
    DueDateEvent,
}

impl TriggerType {
    pub const ALL: [TriggerType; 10] = [
        TriggerType::Manual,
        TriggerType::EntityCreated,
        TriggerType::EntityUpdated,
        TriggerType::FieldChanged,
        TriggerType::StatusChanged,
        TriggerType::DealStageChanged,
        TriggerType::Scheduled,
        TriggerType::FieldCondition,
        TriggerType::AmountThreshold,
        TriggerType::DueDateEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::EntityCreated => "entity_created",
            Self::EntityUpdated => "entity_updated",
            Self::FieldChanged => "field_changed",
            Self::StatusChanged => "status_changed",
            Self::DealStageChanged => "deal_stage_changed",
            Self::Scheduled => "scheduled",
            Self::FieldCondition => "field_condition",
            Self::AmountThreshold => "amount_threshold",
            Self::DueDateEvent => "due_date_event",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }

    /// Whether a fact of this change kind on this entity can fire the trigger.
    /// Manual and scheduled workflows are only ever started explicitly.
    pub fn matches(&self, change: ChangeKind, entity_type: &str) -> bool {
        match self {
            Self::EntityCreated => change == ChangeKind::Created,
            Self::EntityUpdated | Self::FieldChanged => change == ChangeKind::Updated,
            Self::StatusChanged => change == ChangeKind::StatusChanged,
            Self::DealStageChanged => {
                change == ChangeKind::StatusChanged && entity_type.eq_ignore_ascii_case("Deal")
            }
            Self::FieldCondition | Self::AmountThreshold => matches!(
                change,
                ChangeKind::Created | ChangeKind::Updated | ChangeKind::StatusChanged
            ),
            Self::DueDateEvent => change == ChangeKind::DueDateReached,
            Self::Manual | Self::Scheduled => false,
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workflow whose trigger fired for a fact
#[derive(Debug, Clone)]
pub struct MatchedWorkflow {
    pub workflow: Workflow,
}

/// Decide whether one workflow fires for a fact. Pure.
///
/// Malformed trigger conditions never match; the caller logs them.
pub fn trigger_fires(workflow: &Workflow, event: &IntegrationEvent) -> Result<bool, String> {
    if !workflow.is_active
        || workflow.is_deleted
        || workflow.tenant_id != event.tenant_id
        || !workflow.entity_type.eq_ignore_ascii_case(&event.entity_type)
        || !workflow.trigger_type.matches(event.change, &event.entity_type)
    {
        return Ok(false);
    }

    let predicate = workflow
        .trigger_conditions
        .predicate()
        .map_err(str::to_string)?;
    Ok(predicate.evaluate(&event.payload))
}

/// Finds the workflows a fact should start
#[derive(Clone)]
pub struct TriggerEvaluator {
    workflows: Arc<dyn WorkflowRepository>,
}

impl TriggerEvaluator {
    pub fn new(workflows: Arc<dyn WorkflowRepository>) -> Self {
        Self { workflows }
    }

    pub async fn evaluate(&self, event: &IntegrationEvent) -> Result<Vec<MatchedWorkflow>, StoreError> {
        let candidates = self
            .workflows
            .list_active(event.tenant_id, &event.entity_type)
            .await?;

        let mut matched = Vec::new();
        for workflow in candidates {
            match trigger_fires(&workflow, event) {
                Ok(true) => matched.push(MatchedWorkflow { workflow }),
                Ok(false) => {}
                Err(reason) => warn!(
                    tenant_id = %workflow.tenant_id,
                    workflow_id = %workflow.id,
                    event_id = %event.event_id,
                    reason = %reason,
                    "Skipping workflow with malformed trigger conditions"
                ),
            }
        }

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            matched = matched.len(),
            "Evaluated triggers"
        );
        Ok(matched)
    }
}
