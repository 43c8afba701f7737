//! Standardized error handling for the automation engine
//!
//! Every command returns `ApiResult<T>`; the error carries a stable,
//! machine-readable code (`Workflow.NoSteps`, `Idempotency.DuplicateRequest`, ...)
//! and converts into a consistent JSON response for the HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Error codes surfaced to callers.
pub mod codes {
    pub const DUPLICATE_REQUEST: &str = "Idempotency.DuplicateRequest";
    pub const REQUEST_ID_TOO_LONG: &str = "Idempotency.RequestIdTooLong";

    pub const WORKFLOW_NAME_REQUIRED: &str = "Workflow.NameRequired";
    pub const WORKFLOW_ENTITY_TYPE_REQUIRED: &str = "Workflow.EntityTypeRequired";
    pub const WORKFLOW_INVALID_CONDITIONS: &str = "Workflow.InvalidConditions";
    pub const WORKFLOW_INVALID_ACTION: &str = "Workflow.InvalidAction";
    pub const WORKFLOW_NO_STEPS: &str = "Workflow.NoSteps";
    pub const WORKFLOW_INACTIVE: &str = "Workflow.Inactive";
    pub const WORKFLOW_CONCURRENCY: &str = "Workflow.ConcurrencyConflict";

    pub const STEP_NAME_REQUIRED: &str = "Step.NameRequired";
    pub const STEP_INVALID_ORDER: &str = "Step.InvalidOrder";
    pub const STEP_INVALID_DELAY: &str = "Step.InvalidDelay";
    pub const STEP_INVALID_CONFIGURATION: &str = "Step.InvalidConfiguration";
    pub const STEP_INVALID_CONDITIONS: &str = "Step.InvalidConditions";
    pub const STEP_NOT_FOUND: &str = "Step.NotFound";
    pub const STEP_CANNOT_SKIP: &str = "Step.CannotSkip";

    pub const EXECUTION_CANNOT_ABORT: &str = "Execution.CannotAbort";
    pub const EXECUTION_CONCURRENCY: &str = "Execution.ConcurrencyConflict";

    pub const SUBSCRIPTION_DUPLICATE: &str = "Bus.DuplicateSubscription";
    pub const DEAD_LETTER_NOT_REPLAYABLE: &str = "Bus.NotDeadLettered";
}

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "Workflow.NoSteps", "NOT_FOUND")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional field-level errors for validation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Vec<String>>>,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: HashMap<String, Vec<String>>) -> Self {
        self.details = Some(details);
        self
    }
}

/// Application error type shared by commands, the engine and the HTTP layer
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Resource errors
    #[error("{0} not found")]
    NotFound(String),
    #[error("{message}")]
    Conflict { code: &'static str, message: String },

    // Validation errors
    #[error("Validation failed ({code})")]
    ValidationError {
        code: &'static str,
        details: HashMap<String, Vec<String>>,
    },
    #[error("{0}")]
    BadRequest(String),

    // Server errors
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("External service error ({service}): {message}")]
    ExternalServiceError { service: String, message: String },
}

impl AppError {
    /// Duplicate idempotency key: the operation already completed.
    pub fn duplicate_request(request_id: &str) -> Self {
        Self::Conflict {
            code: codes::DUPLICATE_REQUEST,
            message: format!("Request '{}' has already been processed", request_id),
        }
    }

    /// Create a validation error with a single field error
    pub fn validation(code: &'static str, field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut details = HashMap::new();
        details.insert(field.into(), vec![message.into()]);
        Self::ValidationError { code, details }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn is_duplicate_request(&self) -> bool {
        matches!(self, Self::Conflict { code, .. } if *code == codes::DUPLICATE_REQUEST)
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InternalError(_) | Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ExternalServiceError { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict { code, .. } | Self::ValidationError { code, .. } => *code,
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::ExternalServiceError { .. } => "EXTERNAL_SERVICE_ERROR",
        }
    }

    /// Get the error message exposed to callers
    pub fn message(&self) -> String {
        match self {
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
            Self::ExternalServiceError { service, message } => {
                tracing::error!("External service error ({}): {}", service, message);
                format!("External service '{}' is unavailable", service)
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = ApiError::new(self.error_code(), self.message());

        if let Self::ValidationError { details, .. } = &self {
            error = error.with_details(details.clone());
        }

        (status, Json(error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            _ => Self::DatabaseError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::InternalError(format!("Serialization error: {}", err))
    }
}

/// Result type alias for commands and handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Collects several field errors into one validation failure.
///
/// The first recorded code becomes the error code of the whole failure.
pub struct ValidationBuilder {
    code: Option<&'static str>,
    details: HashMap<String, Vec<String>>,
}

impl ValidationBuilder {
    pub fn new() -> Self {
        Self {
            code: None,
            details: HashMap::new(),
        }
    }

    pub fn error(mut self, code: &'static str, field: &str, message: &str) -> Self {
        self.push(code, field, message);
        self
    }

    pub fn push(&mut self, code: &'static str, field: &str, message: &str) {
        self.code.get_or_insert(code);
        self.details
            .entry(field.to_string())
            .or_default()
            .push(message.to_string());
    }

    pub fn build(self) -> Option<AppError> {
        self.code.map(|code| AppError::ValidationError {
            code,
            details: self.details,
        })
    }

    /// `Ok(())` when nothing was recorded.
    pub fn finish(self) -> ApiResult<()> {
        match self.build() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for ValidationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
