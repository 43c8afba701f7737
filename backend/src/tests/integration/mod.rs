pub mod consumers;
pub mod engine_flow;
pub mod event_bus;
pub mod http_api;
