// Commands and their handlers
//
// Each command declares its output type, so a handler's result is an ordinary
// `ApiResult<C::Output>` and the pipeline never has to inspect response types.

use async_trait::async_trait;
use uuid::Uuid;

use super::unit_of_work::UnitOfWork;
use crate::error::ApiResult;

/// Longest caller-supplied request id accepted.
pub const MAX_REQUEST_ID_LEN: usize = 128;

pub trait Command: Send + Sync {
    type Output: Send;

    /// Name written to the idempotency ledger.
    fn command_name(&self) -> &str;

    /// Tenant the request id belongs to.
    fn tenant_id(&self) -> Uuid;

    /// Correlation key; `None` or blank bypasses the idempotency check.
    fn request_id(&self) -> Option<&str>;
}

/// Handles one command inside a unit of work.
///
/// The guard opens the unit with `begin`, lets `handle` write through it, then
/// adds the ledger row and commits. A failed handler rolls everything back.
#[async_trait]
pub trait CommandHandler<C: Command + 'static>: Send + Sync {
    type Work: UnitOfWork + ?Sized;

    async fn begin(&self) -> ApiResult<Box<Self::Work>>;

    async fn handle(&self, work: &mut Self::Work, command: C) -> ApiResult<C::Output>;
}

/// Normalizes a request id: blank strings count as absent.
pub(crate) fn effective_request_id(request_id: Option<&str>) -> Option<&str> {
    request_id.map(str::trim).filter(|id| !id.is_empty())
}

/// Ledger key of a caller-supplied request id.
///
/// Scoped by tenant and command, and kept apart from the internal
/// `step:` and module consumer keys.
pub fn command_request_key(tenant_id: Uuid, command_name: &str, request_id: &str) -> String {
    format!("cmd:{}:{}:{}", tenant_id, command_name, request_id)
}
