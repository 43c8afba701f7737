use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

use super::RequestContext;
use crate::error::ApiResult;
use crate::events::Delivery;
use crate::AppState;

pub fn dead_letter_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_dead_letters))
        .route("/:id/replay", post(replay_dead_letter))
}

async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
) -> ApiResult<Json<Vec<Delivery>>> {
    Ok(Json(state.bus.dead_letters(ctx.tenant_id).await?))
}

async fn replay_dead_letter(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.bus.replay_dead_letter(ctx.tenant_id, id).await?;
    Ok(StatusCode::ACCEPTED)
}
