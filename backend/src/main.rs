use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stocker_automation::{
    clock::{Clock, SystemClock},
    config::Config,
    consumers::{register_module_consumers, LoggingGateway},
    database,
    events::{EventBus, PgDeliveryStore},
    jobs::{JobConfig, JobScheduler},
    pipeline::{IdempotencyGuard, PgIdempotencyLedger},
    router,
    workflows::{
        ActionRegistry, LoggingActionCapability, PgExecutionRepository, PgWorkflowRepository, PgWorkflowStore,
        WorkflowEngine,
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let pool = database::create_pool(&config.database_url).await?;

    database::migrate(&pool).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let guard = Arc::new(IdempotencyGuard::new(Arc::new(PgIdempotencyLedger::new(pool.clone()))));

    // Module capabilities are wired by the hosting suite; until then steps are logged
    let actions = ActionRegistry::new().with_fallback(Arc::new(LoggingActionCapability));

    let engine = Arc::new(WorkflowEngine::new(
        Arc::new(PgWorkflowRepository::new(pool.clone())),
        Arc::new(PgExecutionRepository::new(pool.clone())),
        Arc::new(PgWorkflowStore::new(pool.clone())),
        actions,
        guard.clone(),
        clock.clone(),
        config.engine.clone(),
    ));

    let bus = Arc::new(
        register_module_consumers(EventBus::builder(), Arc::new(LoggingGateway), guard, engine.clone())?.build(
            Arc::new(PgDeliveryStore::new(pool.clone())),
            clock,
            config.bus.clone(),
        ),
    );
    tracing::info!("Event bus ready with {} subscriptions", bus.subscriptions().len());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = tokio::spawn(bus.clone().run(shutdown_rx));

    let mut scheduler = JobScheduler::new(engine.clone(), bus.clone(), JobConfig::new(&config.engine, &config.bus)).await?;
    scheduler.start().await?;

    let app = router(Arc::new(AppState {
        engine,
        bus,
        pool: Some(pool),
    }));

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await?;

    shutdown_tx.send(true).ok();
    dispatcher.await.ok();
    scheduler.shutdown().await?;

    Ok(())
}
