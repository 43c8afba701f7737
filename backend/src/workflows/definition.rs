// Workflow Definition - the Workflow aggregate and its ordered steps
//
// All mutation goes through the operations below so the step ordering and
// activation invariants hold after every call:
//   * step_order values are exactly 1..=n
//   * a workflow cannot be active with zero steps
//   * steps can only be added/removed/replaced while the workflow is inactive

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::actions::ActionType;
use super::conditions::ConditionSet;
use super::triggers::TriggerType;
use crate::error::{codes, ApiResult, AppError, ValidationBuilder};

const MAX_NAME_LENGTH: usize = 200;

/// One unit of action within a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub action_type: ActionType,
    /// 1-based position in the execution sequence
    pub step_order: i32,
    /// Payload handed to the action capability
    pub action_configuration: serde_json::Value,
    pub conditions: ConditionSet,
    pub delay_minutes: i32,
    pub is_enabled: bool,
    pub continue_on_error: bool,
}

/// Input for a new step, as received from a command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub action_type: ActionType,
    /// Requested position; `None` appends
    #[serde(default)]
    pub step_order: Option<i32>,
    /// JSON object as text; blank means `{}`
    #[serde(default)]
    pub action_configuration: String,
    /// Predicate as text; blank means no conditions
    #[serde(default)]
    pub conditions: String,
    #[serde(default)]
    pub delay_minutes: i32,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_true() -> bool {
    true
}

impl StepDraft {
    pub fn new(name: &str, action_type: ActionType) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            action_type,
            step_order: None,
            action_configuration: String::new(),
            conditions: String::new(),
            delay_minutes: 0,
            is_enabled: true,
            continue_on_error: false,
        }
    }

    pub fn at(mut self, step_order: i32) -> Self {
        self.step_order = Some(step_order);
        self
    }

    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.action_configuration = configuration.to_string();
        self
    }

    pub fn with_conditions(mut self, conditions: &str) -> Self {
        self.conditions = conditions.to_string();
        self
    }

    pub fn with_delay(mut self, minutes: i32) -> Self {
        self.delay_minutes = minutes;
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }

    /// Validate and turn the draft into a step (order assigned by the caller).
    fn into_step(self, workflow_id: Uuid) -> ApiResult<WorkflowStep> {
        let mut errors = ValidationBuilder::new();

        let name = self.name.trim().to_string();
        if name.is_empty() {
            errors.push(codes::STEP_NAME_REQUIRED, "name", "Step name is required");
        } else if name.len() > MAX_NAME_LENGTH {
            errors.push(codes::STEP_NAME_REQUIRED, "name", "Step name is too long");
        }
        if self.delay_minutes < 0 {
            errors.push(codes::STEP_INVALID_DELAY, "delay_minutes", "Delay cannot be negative");
        }

        let configuration = parse_configuration(&self.action_configuration);
        if let Err(message) = &configuration {
            errors.push(codes::STEP_INVALID_CONFIGURATION, "action_configuration", message);
        }
        let conditions = ConditionSet::parse(&self.conditions);
        if let Err(e) = &conditions {
            errors.push(codes::STEP_INVALID_CONDITIONS, "conditions", &e.to_string());
        }
        errors.finish()?;

        Ok(WorkflowStep {
            id: Uuid::new_v4(),
            workflow_id,
            name,
            description: self.description.filter(|d| !d.trim().is_empty()),
            action_type: self.action_type,
            step_order: 0,
            action_configuration: configuration.unwrap_or_default(),
            conditions: conditions.unwrap_or_else(|_| ConditionSet::always()),
            delay_minutes: self.delay_minutes,
            is_enabled: self.is_enabled,
            continue_on_error: self.continue_on_error,
        })
    }
}

fn parse_configuration(raw: &str) -> Result<serde_json::Value, String> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) => Err("Action configuration must be a JSON object".to_string()),
        Err(e) => Err(format!("Action configuration is not valid JSON: {}", e)),
    }
}

/// Tenant-defined automation rule: a trigger plus ordered steps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    /// Tag of the domain object the trigger watches, e.g. "Deal"
    pub entity_type: String,
    pub trigger_conditions: ConditionSet,
    pub is_active: bool,
    pub is_deleted: bool,
    steps: Vec<WorkflowStep>,
    pub execution_count: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the repository on every save
    pub version: i64,
}

/// Validated trigger fields shared by `create`, `update_details` and `update_trigger`.
struct TriggerFields {
    trigger_type: TriggerType,
    entity_type: String,
    conditions: ConditionSet,
}

fn validate_name(name: &str, errors: &mut ValidationBuilder) -> String {
    let name = name.trim();
    if name.is_empty() {
        errors.push(codes::WORKFLOW_NAME_REQUIRED, "name", "Workflow name is required");
    } else if name.len() > MAX_NAME_LENGTH {
        errors.push(
            codes::WORKFLOW_NAME_REQUIRED,
            "name",
            "Workflow name must be 200 characters or less",
        );
    }
    name.to_string()
}

fn validate_trigger(
    trigger_type: TriggerType,
    entity_type: &str,
    trigger_conditions: &str,
    errors: &mut ValidationBuilder,
) -> Option<TriggerFields> {
    let entity_type = entity_type.trim();
    if entity_type.is_empty() {
        errors.push(
            codes::WORKFLOW_ENTITY_TYPE_REQUIRED,
            "entity_type",
            "Entity type is required",
        );
    }
    match ConditionSet::parse(trigger_conditions) {
        Ok(conditions) => Some(TriggerFields {
            trigger_type,
            entity_type: entity_type.to_string(),
            conditions,
        }),
        Err(e) => {
            errors.push(
                codes::WORKFLOW_INVALID_CONDITIONS,
                "trigger_conditions",
                &e.to_string(),
            );
            None
        }
    }
}

impl Workflow {
    /// Create an inactive workflow without steps.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        name: &str,
        description: Option<&str>,
        trigger_type: TriggerType,
        entity_type: &str,
        trigger_conditions: &str,
        tenant_id: Uuid,
        created_by: Option<Uuid>,
    ) -> ApiResult<Self> {
        let mut errors = ValidationBuilder::new();
        let name = validate_name(name, &mut errors);
        let trigger = validate_trigger(trigger_type, entity_type, trigger_conditions, &mut errors);
        errors.finish()?;
        let trigger = trigger.ok_or_else(|| AppError::InternalError("trigger validation".into()))?;

        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id,
            name,
            description: clean_description(description),
            trigger_type: trigger.trigger_type,
            entity_type: trigger.entity_type,
            trigger_conditions: trigger.conditions,
            is_active: false,
            is_deleted: false,
            steps: Vec::new(),
            execution_count: 0,
            last_executed_at: None,
            created_by,
            created_at: Utc::now(),
            updated_at: None,
            version: 0,
        })
    }

    /// Rebuild from storage. Steps are re-sorted; no validation is applied.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: Uuid,
        tenant_id: Uuid,
        name: String,
        description: Option<String>,
        trigger_type: TriggerType,
        entity_type: String,
        trigger_conditions: ConditionSet,
        is_active: bool,
        is_deleted: bool,
        mut steps: Vec<WorkflowStep>,
        execution_count: i64,
        last_executed_at: Option<DateTime<Utc>>,
        created_by: Option<Uuid>,
        created_at: DateTime<Utc>,
        updated_at: Option<DateTime<Utc>>,
        version: i64,
    ) -> Self {
        steps.sort_by_key(|s| s.step_order);
        Self {
            id,
            tenant_id,
            name,
            description,
            trigger_type,
            entity_type,
            trigger_conditions,
            is_active,
            is_deleted,
            steps,
            execution_count,
            last_executed_at,
            created_by,
            created_at,
            updated_at,
            version,
        }
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn step(&self, step_id: Uuid) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn update_details(
        &mut self,
        name: &str,
        description: Option<&str>,
        trigger_type: TriggerType,
        entity_type: &str,
        trigger_conditions: &str,
    ) -> ApiResult<()> {
        let mut errors = ValidationBuilder::new();
        let name = validate_name(name, &mut errors);
        let trigger = validate_trigger(trigger_type, entity_type, trigger_conditions, &mut errors);
        errors.finish()?;

        self.name = name;
        self.description = clean_description(description);
        if let Some(trigger) = trigger {
            self.apply_trigger(trigger);
        }
        self.touch();
        Ok(())
    }

    pub fn update_trigger(
        &mut self,
        trigger_type: TriggerType,
        entity_type: &str,
        trigger_conditions: &str,
    ) -> ApiResult<()> {
        let mut errors = ValidationBuilder::new();
        let trigger = validate_trigger(trigger_type, entity_type, trigger_conditions, &mut errors);
        errors.finish()?;

        if let Some(trigger) = trigger {
            self.apply_trigger(trigger);
        }
        self.touch();
        Ok(())
    }

    fn apply_trigger(&mut self, trigger: TriggerFields) {
        self.trigger_type = trigger.trigger_type;
        self.entity_type = trigger.entity_type;
        self.trigger_conditions = trigger.conditions;
    }

    /// Insert a step at its requested position (or append) and renumber.
    pub fn add_step(&mut self, draft: StepDraft) -> ApiResult<Uuid> {
        self.ensure_mutable_steps()?;

        let max_position = self.steps.len() as i32 + 1;
        let position = draft.step_order.unwrap_or(max_position);
        if position < 1 || position > max_position {
            return Err(AppError::validation(
                codes::STEP_INVALID_ORDER,
                "step_order",
                format!("Step order must be between 1 and {}", max_position),
            ));
        }

        let step = draft.into_step(self.id)?;
        let id = step.id;
        self.steps.insert((position - 1) as usize, step);
        self.renumber();
        self.touch();
        Ok(id)
    }

    pub fn remove_step(&mut self, step_id: Uuid) -> ApiResult<()> {
        self.ensure_mutable_steps()?;

        let index = self
            .steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| {
                AppError::validation(codes::STEP_NOT_FOUND, "step_id", "Step does not belong to this workflow")
            })?;
        self.steps.remove(index);
        self.renumber();
        self.touch();
        Ok(())
    }

    /// Replace the whole step list. Drafts are ordered by their requested
    /// `step_order` (stable for ties and missing orders), which must be
    /// unique when given.
    pub fn replace_steps(&mut self, drafts: Vec<StepDraft>) -> ApiResult<()> {
        self.ensure_mutable_steps()?;

        let mut seen = std::collections::HashSet::new();
        for order in drafts.iter().filter_map(|d| d.step_order) {
            if order < 1 || !seen.insert(order) {
                return Err(AppError::validation(
                    codes::STEP_INVALID_ORDER,
                    "step_order",
                    format!("Step order {} is duplicated or not positive", order),
                ));
            }
        }

        let mut indexed: Vec<(i32, StepDraft)> = drafts
            .into_iter()
            .map(|d| (d.step_order.unwrap_or(i32::MAX), d))
            .collect();
        indexed.sort_by_key(|(order, _)| *order);

        let mut steps = Vec::with_capacity(indexed.len());
        for (_, draft) in indexed {
            steps.push(draft.into_step(self.id)?);
        }

        self.steps = steps;
        self.renumber();
        self.touch();
        Ok(())
    }

    /// Activation requires at least one step.
    pub fn activate(&mut self) -> ApiResult<()> {
        if self.steps.is_empty() {
            return Err(AppError::validation(
                codes::WORKFLOW_NO_STEPS,
                "steps",
                "A workflow cannot be activated without steps",
            ));
        }
        if !self.is_active {
            self.is_active = true;
            self.touch();
        }
        Ok(())
    }

    /// Stops new matches; executions already started run to completion.
    pub fn deactivate(&mut self) {
        if self.is_active {
            self.is_active = false;
            self.touch();
        }
    }

    /// Soft delete. Deleted workflows are never matched again.
    pub fn delete(&mut self) {
        self.is_active = false;
        self.is_deleted = true;
        self.touch();
    }

    pub fn record_execution(&mut self, at: DateTime<Utc>) {
        self.execution_count += 1;
        self.last_executed_at = Some(at);
    }

    fn ensure_mutable_steps(&self) -> ApiResult<()> {
        if self.is_active {
            return Err(AppError::validation(
                codes::WORKFLOW_INVALID_ACTION,
                "is_active",
                "Deactivate the workflow before changing its steps",
            ));
        }
        Ok(())
    }

    fn renumber(&mut self) {
        for (index, step) in self.steps.iter_mut().enumerate() {
            step.step_order = index as i32 + 1;
        }
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

fn clean_description(description: Option<&str>) -> Option<String> {
    description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}
