use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::RequestContext;
use crate::error::ApiResult;
use crate::workflows::{CreateWorkflow, ExecuteWorkflow, UpdateWorkflow, Workflow, WorkflowExecution};
use crate::AppState;

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_workflow))
        .route("/:id", get(get_workflow).put(update_workflow))
        .route("/:id/execute", post(execute_workflow))
        .route("/:id/executions", get(list_executions))
}

pub fn execution_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_execution))
        .route("/:id/abort", post(abort_execution))
        .route("/:id/skip", post(skip_waiting_step))
}

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Json(mut command): Json<CreateWorkflow>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    command.tenant_id = ctx.tenant_id;
    command.created_by = ctx.user_id;
    command.request_id = ctx.request_id;

    let id = state.engine.create_workflow(command).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn update_workflow(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
    Json(mut command): Json<UpdateWorkflow>,
) -> ApiResult<StatusCode> {
    command.tenant_id = ctx.tenant_id;
    command.workflow_id = id;
    command.request_id = ctx.request_id;

    state.engine.update_workflow(command).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.engine.get_workflow(ctx.tenant_id, id).await?))
}

async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
    Json(mut command): Json<ExecuteWorkflow>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    command.tenant_id = ctx.tenant_id;
    command.workflow_id = id;
    command.request_id = ctx.request_id;

    let execution_id = state.engine.execute_manual(command).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "execution_id": execution_id }))))
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<WorkflowExecution>>> {
    Ok(Json(state.engine.list_executions(ctx.tenant_id, id).await?))
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowExecution>> {
    Ok(Json(state.engine.get_execution(ctx.tenant_id, id).await?))
}

#[derive(Debug, Deserialize, Default)]
struct AbortRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn abort_execution(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
    payload: Option<Json<AbortRequest>>,
) -> ApiResult<StatusCode> {
    let reason = payload
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| "Aborted by operator".to_string());

    state.engine.abort_execution(ctx.tenant_id, id, &reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn skip_waiting_step(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.engine.skip_waiting_step(ctx.tenant_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
