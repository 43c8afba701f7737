use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod clock;
pub mod config;
pub mod consumers;
pub mod database;
pub mod error;
pub mod events;
pub mod handlers;
pub mod jobs;
pub mod pipeline;
pub mod workflows;

pub use error::{ApiError, ApiResult, AppError};


pub struct AppState {
    pub engine: Arc<workflows::WorkflowEngine>,
    pub bus: Arc<events::EventBus>,
    /// Absent when running over in-memory stores
    pub pool: Option<sqlx::PgPool>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Stocker Automation API v1.0.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/workflows", handlers::workflow_routes())
        .nest("/api/v1/executions", handlers::execution_routes())
        .nest("/api/v1/dead-letters", handlers::dead_letter_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}
