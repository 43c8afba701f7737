// Command Pipeline
//
// Typed commands, the idempotency ledger, the unit of work that commits a
// command together with its ledger row, and the guard that enforces
// at-most-once processing per request id.

pub mod command;
pub mod guard;
pub mod ledger;
pub mod unit_of_work;

pub use command::{command_request_key, Command, CommandHandler, MAX_REQUEST_ID_LEN};
pub use guard::IdempotencyGuard;
pub use ledger::{IdempotencyLedger, InMemoryLedger, LedgerError, PgIdempotencyLedger};
pub use unit_of_work::UnitOfWork;
