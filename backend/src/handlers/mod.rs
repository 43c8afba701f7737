use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::Json,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppError;
use crate::pipeline::MAX_REQUEST_ID_LEN;
use crate::AppState;

pub mod dead_letters;
pub mod workflows;

pub use dead_letters::dead_letter_routes;
pub use workflows::{execution_routes, workflow_routes};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Tenant, caller and idempotency key taken from request headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub request_id: Option<String>,
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = header_str(parts, TENANT_HEADER)
            .ok_or_else(|| AppError::BadRequest("Missing X-Tenant-Id header".to_string()))?
            .parse::<Uuid>()
            .map_err(|_| AppError::BadRequest("X-Tenant-Id must be a UUID".to_string()))?;

        let user_id = header_str(parts, USER_HEADER).and_then(|v| v.parse().ok());
        let request_id = header_str(parts, IDEMPOTENCY_HEADER).map(str::to_string);
        if request_id.as_ref().is_some_and(|id| id.len() > MAX_REQUEST_ID_LEN) {
            return Err(AppError::BadRequest(format!(
                "Idempotency-Key must be at most {} characters",
                MAX_REQUEST_ID_LEN
            )));
        }

        Ok(Self {
            tenant_id,
            user_id,
            request_id,
        })
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let Some(pool) = &state.pool else {
        return (StatusCode::OK, Json(json!({"status": "healthy", "service": "stocker-automation"})));
    };

    if crate::database::health_check(pool).await {
        let stats = crate::database::pool_stats(pool);
        (
            StatusCode::OK,
            Json(json!({"status": "healthy", "service": "stocker-automation", "database": stats})),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unhealthy", "service": "stocker-automation"})),
        )
    }
}
