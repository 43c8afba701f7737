pub mod idempotency;
pub mod trigger_matching;
