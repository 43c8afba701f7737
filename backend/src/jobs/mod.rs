// Background Jobs
//
// Scheduled with tokio-cron-scheduler: the delayed-step resume poll and the
// event bus redelivery sweep.

pub mod scheduler;

pub use scheduler::{
    interval_cron, run_bus_sweep, run_resume_poll, JobConfig, JobError, JobExecutionLog, JobResult,
    JobScheduler, JobStatus,
};
