use sqlx::{migrate::MigrateDatabase, postgres::PgPoolOptions, PgPool, Postgres};
use std::time::Duration;

/// Connection pool settings for the automation store.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key).ok()?.parse().ok().map(Duration::from_secs)
}

impl PoolConfig {
    /// Overrides defaults from `DB_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = std::env::var("DB_MAX_CONNECTIONS").ok().and_then(|v| v.parse().ok()) {
            config.max_connections = n;
        }
        if let Some(n) = std::env::var("DB_MIN_CONNECTIONS").ok().and_then(|v| v.parse().ok()) {
            config.min_connections = n;
        }
        if let Some(d) = env_secs("DB_ACQUIRE_TIMEOUT") {
            config.acquire_timeout = d;
        }
        if let Some(d) = env_secs("DB_IDLE_TIMEOUT") {
            config.idle_timeout = d;
        }
        if let Some(d) = env_secs("DB_MAX_LIFETIME") {
            config.max_lifetime = d;
        }

        config
    }
}

pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::from_env()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> anyhow::Result<PgPool> {
    if !Postgres::database_exists(database_url).await? {
        Postgres::create_database(database_url).await?;
        tracing::info!("Database created");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    tracing::info!(
        "Database pool created: max={}, min={}, acquire_timeout={}s",
        config.max_connections,
        config.min_connections,
        config.acquire_timeout.as_secs()
    );

    Ok(pool)
}

/// Applies the workflow, execution, ledger and delivery tables.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

#[derive(Debug, serde::Serialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub in_use: u32,
}

pub fn pool_stats(pool: &PgPool) -> PoolStats {
    let size = pool.size();
    let idle = pool.num_idle() as u32;
    PoolStats {
        size,
        idle,
        in_use: size.saturating_sub(idle),
    }
}
