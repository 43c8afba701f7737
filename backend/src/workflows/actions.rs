// Workflow Actions - action types and the capabilities that perform them

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::info;
use uuid::Uuid;

use super::conditions::lookup_path;
use crate::error::AppError;

/// Types of actions a workflow step can perform
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    // Communication
    SendEmail,
    SendSms,
    SendNotification,

    // Work items
    CreateTask,
    CreateActivity,
    AssignToUser,

    // Data
    UpdateField,

    // Integration
    CallWebhook,
}

impl ActionType {
    pub const ALL: [ActionType; 8] = [
        ActionType::SendEmail,
        ActionType::SendSms,
        ActionType::SendNotification,
        ActionType::CreateTask,
        ActionType::CreateActivity,
        ActionType::AssignToUser,
        ActionType::UpdateField,
        ActionType::CallWebhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendEmail => "send_email",
            Self::SendSms => "send_sms",
            Self::SendNotification => "send_notification",
            Self::CreateTask => "create_task",
            Self::CreateActivity => "create_activity",
            Self::AssignToUser => "assign_to_user",
            Self::UpdateField => "update_field",
            Self::CallWebhook => "call_webhook",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an action capability needs to perform one step
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: Uuid,
    pub action_type: ActionType,
    /// Step configuration with `{{path}}` templates already expanded
    pub configuration: serde_json::Value,
    pub context: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("no capability registered for action '{0}'")]
    Unsupported(ActionType),
    #[error("{0}")]
    Failed(String),
}

impl From<ActionError> for AppError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::Unsupported(action) => {
                AppError::BadRequest(format!("Action '{}' is not supported", action))
            }
            ActionError::Failed(message) => AppError::ExternalServiceError {
                service: "workflow-action".to_string(),
                message,
            },
        }
    }
}

/// External collaborator that carries out a step's action.
///
/// The returned value becomes the step output and is visible to later steps
/// under `steps.<step_order>` in the execution context.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionCapability: Send + Sync {
    async fn invoke(&self, request: ActionRequest) -> Result<serde_json::Value, ActionError>;
}

/// Maps action types to the capability that performs them
#[derive(Clone, Default)]
pub struct ActionRegistry {
    capabilities: HashMap<ActionType, Arc<dyn ActionCapability>>,
    fallback: Option<Arc<dyn ActionCapability>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, action_type: ActionType, capability: Arc<dyn ActionCapability>) -> Self {
        self.capabilities.insert(action_type, capability);
        self
    }

    /// Capability used for action types without a dedicated registration
    pub fn with_fallback(mut self, capability: Arc<dyn ActionCapability>) -> Self {
        self.fallback = Some(capability);
        self
    }

    pub async fn invoke(&self, request: ActionRequest) -> Result<serde_json::Value, ActionError> {
        let capability = self
            .capabilities
            .get(&request.action_type)
            .or(self.fallback.as_ref())
            .ok_or(ActionError::Unsupported(request.action_type))?;
        capability.invoke(request).await
    }
}

/// Capability that only logs the request; used when no real collaborator is wired.
#[derive(Debug, Default)]
pub struct LoggingActionCapability;

#[async_trait]
impl ActionCapability for LoggingActionCapability {
    async fn invoke(&self, request: ActionRequest) -> Result<serde_json::Value, ActionError> {
        info!(
            tenant_id = %request.tenant_id,
            workflow_id = %request.workflow_id,
            execution_id = %request.execution_id,
            action = %request.action_type,
            configuration = %request.configuration,
            "Workflow action dispatched"
        );
        Ok(serde_json::json!({ "action": request.action_type.as_str(), "status": "logged" }))
    }
}

static TEMPLATE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").ok());

/// Expand `{{path}}` templates in every string of the configuration.
///
/// A string that is exactly one template takes the referenced value as-is
/// (numbers stay numbers); otherwise values are spliced into the text.
/// Unknown paths are left untouched.
pub fn render_configuration(config: &serde_json::Value, context: &serde_json::Value) -> serde_json::Value {
    match config {
        serde_json::Value::String(s) => render_string(s, context),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_configuration(v, context)))
                .collect(),
        ),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|v| render_configuration(v, context)).collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(template: &str, context: &serde_json::Value) -> serde_json::Value {
    let Some(re) = TEMPLATE.as_ref() else {
        return serde_json::Value::String(template.to_string());
    };

    if let Some(cap) = re.captures(template) {
        if cap[0].len() == template.len() {
            if let Some(value) = lookup_path(context, &cap[1]) {
                return value.clone();
            }
        }
    }

    let rendered = re.replace_all(template, |cap: &regex::Captures<'_>| {
        match lookup_path(context, &cap[1]) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(value) => value.to_string(),
            None => cap[0].to_string(),
        }
    });
    serde_json::Value::String(rendered.into_owned())
}
