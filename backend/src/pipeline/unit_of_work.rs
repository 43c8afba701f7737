// Unit of work - the writes of one guarded command plus its ledger row

use async_trait::async_trait;
use stocker_shared::ProcessedRequest;

use super::ledger::LedgerError;

/// Storage transaction a guarded handler writes through.
///
/// Nothing written through the unit is kept unless `commit` succeeds, so a
/// ledger row is never stored without the state change it stands for and the
/// other way round.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Insert the ledger row inside this unit. `LedgerError::Duplicate` when
    /// another attempt recorded the id first.
    async fn record_request(&mut self, request: &ProcessedRequest) -> Result<(), LedgerError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;

    async fn rollback(self: Box<Self>);
}
