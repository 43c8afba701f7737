// Job Scheduler - durable timers for delayed workflow steps and bus redelivery

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{BusConfig, EngineConfig};
use crate::error::AppError;
use crate::events::EventBus;
use crate::workflows::WorkflowEngine;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Job execution error: {0}")]
    ExecutionError(String),
}

impl From<AppError> for JobError {
    fn from(err: AppError) -> Self {
        JobError::ExecutionError(err.to_string())
    }
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub resume_poll_seconds: u64,
    pub bus_sweep_seconds: u64,
}

impl JobConfig {
    pub fn new(engine: &EngineConfig, bus: &BusConfig) -> Self {
        Self {
            resume_poll_seconds: engine.resume_poll_seconds,
            bus_sweep_seconds: bus.poll_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: JobStatus,
    pub items_processed: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Completed,
    Failed,
}

const MAX_LOGS: usize = 100;

const CRON_STEPS: [u64; 11] = [1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30];

/// Largest cron step that divides 60 and is at most `n`.
fn cron_step(n: u64) -> u64 {
    CRON_STEPS.iter().copied().filter(|step| *step <= n).max().unwrap_or(1)
}

/// Cron expression firing every `seconds`.
///
/// A `*/n` field restarts at every minute (or hour), so only steps dividing 60
/// keep an even cadence. Other intervals are rounded down to such a step:
/// 45s runs every 30s, 90s every minute, 7 minutes every 6. Intervals of an
/// hour or more run hourly.
pub fn interval_cron(seconds: u64) -> String {
    let seconds = seconds.max(1);
    if seconds < 60 {
        format!("*/{} * * * * *", cron_step(seconds))
    } else if seconds < 3600 {
        format!("0 */{} * * * *", cron_step(seconds / 60))
    } else {
        "0 0 * * * *".to_string()
    }
}

/// Resume workflow executions whose delay has elapsed.
pub async fn run_resume_poll(engine: &WorkflowEngine) -> JobResult<usize> {
    Ok(engine.resume_due().await?)
}

/// Redeliver bus deliveries whose backoff or lease has expired.
pub async fn run_bus_sweep(bus: &EventBus) -> JobResult<usize> {
    Ok(bus.dispatch_due().await?)
}

async fn record(logs: &RwLock<Vec<JobExecutionLog>>, job_name: &str, started_at: DateTime<Utc>, result: JobResult<usize>) {
    let completed_at = Utc::now();
    let log = match result {
        Ok(items) => JobExecutionLog {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            started_at,
            completed_at,
            status: JobStatus::Completed,
            items_processed: items,
            error: None,
        },
        Err(e) => {
            error!("{} failed: {}", job_name, e);
            JobExecutionLog {
                id: Uuid::new_v4(),
                job_name: job_name.to_string(),
                started_at,
                completed_at,
                status: JobStatus::Failed,
                items_processed: 0,
                error: Some(e.to_string()),
            }
        }
    };

    let mut logs = logs.write().await;
    logs.push(log);
    if logs.len() > MAX_LOGS {
        logs.remove(0);
    }
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    engine: Arc<WorkflowEngine>,
    bus: Arc<EventBus>,
    config: JobConfig,
    execution_logs: Arc<RwLock<Vec<JobExecutionLog>>>,
}

impl JobScheduler {
    pub async fn new(engine: Arc<WorkflowEngine>, bus: Arc<EventBus>, config: JobConfig) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            engine,
            bus,
            config,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_resume_poll().await?;
        self.schedule_bus_sweep().await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    pub async fn recent_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    async fn schedule_resume_poll(&self) -> JobResult<()> {
        let cron_expr = interval_cron(self.config.resume_poll_seconds);
        let engine = self.engine.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let started_at = Utc::now();
                let result = run_resume_poll(&engine).await;
                record(&logs, "Workflow Resume Poll", started_at, result).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled workflow resume poll ({})", cron_expr);
        Ok(())
    }

    async fn schedule_bus_sweep(&self) -> JobResult<()> {
        let cron_expr = interval_cron(self.config.bus_sweep_seconds);
        let bus = self.bus.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let bus = bus.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let started_at = Utc::now();
                let result = run_bus_sweep(&bus).await;
                record(&logs, "Event Bus Sweep", started_at, result).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled event bus sweep ({})", cron_expr);
        Ok(())
    }
}
