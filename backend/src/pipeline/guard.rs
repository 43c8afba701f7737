// Idempotency Guard - at-most-once wrapper around command execution

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use stocker_shared::ProcessedRequest;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::command::{command_request_key, effective_request_id, Command, CommandHandler, MAX_REQUEST_ID_LEN};
use super::ledger::{IdempotencyLedger, LedgerError};
use super::unit_of_work::UnitOfWork;
use crate::error::{codes, ApiResult, AppError};

/// Wraps handlers so a request id is applied at most once.
///
/// Attempts sharing a request id are serialized on a per-id lock; a later
/// attempt re-reads the ledger once the earlier one has finished, so it either
/// sees the recorded success (and returns `Idempotency.DuplicateRequest`) or
/// runs itself after a failed attempt. Across processes the ledger's unique
/// constraint decides the winner.
pub struct IdempotencyGuard {
    ledger: Arc<dyn IdempotencyLedger>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl IdempotencyGuard {
    pub fn new(ledger: Arc<dyn IdempotencyLedger>) -> Self {
        Self {
            ledger,
            in_flight: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn IdempotencyLedger> {
        &self.ledger
    }

    /// Run a typed command through its handler.
    ///
    /// The handler's writes and the ledger row commit in one unit of work.
    pub async fn execute<C, H>(&self, command: C, handler: &H) -> ApiResult<C::Output>
    where
        C: Command + 'static,
        H: CommandHandler<C> + ?Sized,
    {
        let Some(request_id) = effective_request_id(command.request_id()).map(str::to_string) else {
            return self.in_unit(handler, command, None).await;
        };
        if request_id.len() > MAX_REQUEST_ID_LEN {
            return Err(AppError::validation(
                codes::REQUEST_ID_TOO_LONG,
                "request_id",
                format!("Request id must be at most {} characters", MAX_REQUEST_ID_LEN),
            ));
        }

        let command_name = command.command_name().to_string();
        let key = command_request_key(command.tenant_id(), &command_name, &request_id);

        self.serialized(&key, async {
            if self.ledger.exists(&key).await.map_err(ledger_failure)? {
                debug!(request_id = %request_id, command_name = %command_name, "Duplicate request short-circuited");
                return Err(AppError::duplicate_request(&request_id));
            }
            let request = ProcessedRequest::new(key.as_str(), command_name.as_str());
            self.in_unit(handler, command, Some((&request_id, request))).await
        })
        .await
    }

    /// Run an arbitrary operation under a ledger key.
    ///
    /// For effects outside our storage (module commands, step actions): the key
    /// is recorded after the operation succeeded.
    pub async fn run<T, F, Fut>(
        &self,
        request_id: Option<&str>,
        command_name: &str,
        operation: F,
    ) -> ApiResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let Some(request_id) = effective_request_id(request_id) else {
            return operation().await;
        };

        self.serialized(request_id, self.run_locked(request_id, command_name, operation))
            .await
    }

    async fn serialized<T>(&self, key: &str, work: impl Future<Output = T>) -> T {
        let lock = Arc::clone(&*self.in_flight.entry(key.to_string()).or_default());
        let result = {
            let _serialized = lock.lock().await;
            work.await
        };
        drop(lock);
        self.in_flight
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn in_unit<C, H>(
        &self,
        handler: &H,
        command: C,
        request: Option<(&str, ProcessedRequest)>,
    ) -> ApiResult<C::Output>
    where
        C: Command + 'static,
        H: CommandHandler<C> + ?Sized,
    {
        let mut work = handler.begin().await?;
        let output = match handler.handle(&mut *work, command).await {
            Ok(output) => output,
            Err(err) => {
                work.rollback().await;
                return Err(err);
            }
        };

        if let Some((request_id, request)) = &request {
            if let Err(err) = work.record_request(request).await {
                work.rollback().await;
                return Err(match err {
                    LedgerError::Duplicate(_) => {
                        warn!(
                            request_id = %request_id,
                            command_name = %request.command_name,
                            "Concurrent attempt recorded the request first"
                        );
                        AppError::duplicate_request(request_id)
                    }
                    other => ledger_failure(other),
                });
            }
        }

        work.commit().await.map_err(ledger_failure)?;
        Ok(output)
    }

    async fn run_locked<T, F, Fut>(
        &self,
        request_id: &str,
        command_name: &str,
        operation: F,
    ) -> ApiResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        if self.ledger.exists(request_id).await.map_err(ledger_failure)? {
            debug!(request_id, command_name, "Duplicate request short-circuited");
            return Err(AppError::duplicate_request(request_id));
        }

        let output = operation().await?;

        match self
            .ledger
            .record(ProcessedRequest::new(request_id, command_name))
            .await
        {
            Ok(()) => Ok(output),
            Err(LedgerError::Duplicate(_)) => {
                warn!(
                    request_id,
                    command_name, "Concurrent attempt recorded the request first"
                );
                Err(AppError::duplicate_request(request_id))
            }
            Err(e) => Err(ledger_failure(e)),
        }
    }
}

fn ledger_failure(err: LedgerError) -> AppError {
    AppError::DatabaseError(err.to_string())
}
