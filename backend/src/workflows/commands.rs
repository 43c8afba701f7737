// Workflow commands accepted by the engine

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::definition::StepDraft;
use super::triggers::TriggerType;
use crate::pipeline::Command;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkflow {
    #[serde(skip)]
    pub tenant_id: Uuid,
    #[serde(skip)]
    pub created_by: Option<Uuid>,
    #[serde(skip)]
    pub request_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    pub entity_type: String,
    #[serde(default)]
    pub trigger_conditions: String,
    #[serde(default)]
    pub steps: Vec<StepDraft>,
    /// Activate right away (requires at least one step)
    #[serde(default)]
    pub is_active: bool,
}

impl Command for CreateWorkflow {
    type Output = Uuid;

    fn command_name(&self) -> &str {
        "CreateWorkflow"
    }

    fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

/// Full replacement of a workflow's details and steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateWorkflow {
    #[serde(skip)]
    pub tenant_id: Uuid,
    #[serde(skip)]
    pub workflow_id: Uuid,
    #[serde(skip)]
    pub request_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    pub entity_type: String,
    #[serde(default)]
    pub trigger_conditions: String,
    pub is_active: bool,
    #[serde(default)]
    pub steps: Vec<StepDraft>,
}

impl Command for UpdateWorkflow {
    type Output = ();

    fn command_name(&self) -> &str {
        "UpdateWorkflow"
    }

    fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

/// Start an active workflow by hand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteWorkflow {
    #[serde(skip)]
    pub tenant_id: Uuid,
    #[serde(skip)]
    pub workflow_id: Uuid,
    #[serde(skip)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub entity_id: Option<Uuid>,
    /// Merged into the execution context
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

impl Command for ExecuteWorkflow {
    type Output = Uuid;

    fn command_name(&self) -> &str {
        "ExecuteWorkflow"
    }

    fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}
