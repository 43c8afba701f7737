use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stocker_shared::ProcessedRequest;
use uuid::Uuid;

use crate::error::{codes, AppError};
use crate::pipeline::{command_request_key, IdempotencyGuard, IdempotencyLedger, InMemoryLedger, LedgerError};
use crate::tests::fixtures::{deal_workflow, step};
use crate::tests::helpers::TestHarness;
use crate::workflows::{ActionType, ExecuteWorkflow, WorkflowRepository};

/// Ledger whose first `record` fails after the handler has written.
struct FlakyLedger {
    inner: InMemoryLedger,
    failed: AtomicBool,
}

impl FlakyLedger {
    fn new() -> Self {
        Self {
            inner: InMemoryLedger::new(),
            failed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl IdempotencyLedger for FlakyLedger {
    async fn exists(&self, request_id: &str) -> Result<bool, LedgerError> {
        self.inner.exists(request_id).await
    }

    async fn record(&self, request: ProcessedRequest) -> Result<(), LedgerError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(LedgerError::Storage("connection reset".to_string()));
        }
        self.inner.record(request).await
    }
}

#[tokio::test]
async fn test_concurrent_requests_with_same_id_run_once() {
    let harness = TestHarness::new();
    let guard = harness.guard.clone();
    let counter = AtomicUsize::new(0);
    let calls = &counter;

    let work = move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, AppError>("order-1")
    };
    let (first, second) = tokio::join!(
        guard.run(Some("req-42"), "CreateSalesOrder", work),
        guard.run(Some("req-42"), "CreateSalesOrder", work),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, Err(e) if e.is_duplicate_request()))
            .count(),
        1
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(harness.ledger.len().await, 1);
}

#[tokio::test]
async fn test_duplicate_create_workflow_creates_one_definition() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();

    let mut command = deal_workflow(tenant_id, "", vec![step("Email", ActionType::SendEmail)]);
    command.request_id = Some("create-1".to_string());

    let (first, second) = tokio::join!(
        engine.create_workflow(command.clone()),
        engine.create_workflow(command),
    );

    let created: Vec<_> = [&first, &second].into_iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(created.len(), 1);
    assert!([first.is_err(), second.is_err()].contains(&true));
    assert_eq!(harness.workflows.list_active(tenant_id, "Deal").await.unwrap().len(), 1);
    let key = command_request_key(tenant_id, "CreateWorkflow", "create-1");
    assert_eq!(harness.ledger.get(&key).await.unwrap().command_name, "CreateWorkflow");
}

#[tokio::test]
async fn test_failed_command_can_be_retried_with_same_id() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();

    let mut invalid = deal_workflow(tenant_id, "", Vec::new());
    invalid.request_id = Some("create-2".to_string());
    assert!(engine.create_workflow(invalid.clone()).await.is_err());
    assert_eq!(harness.ledger.len().await, 0);

    invalid.steps = vec![step("Email", ActionType::SendEmail)];
    assert!(engine.create_workflow(invalid).await.is_ok());
    assert_eq!(harness.ledger.len().await, 1);
}

#[tokio::test]
async fn test_failed_ledger_write_rolls_back_the_workflow() {
    let harness = TestHarness::new();
    let ledger: Arc<dyn IdempotencyLedger> = Arc::new(FlakyLedger::new());
    let engine = harness.engine_with_ledger(ledger.clone(), Arc::new(IdempotencyGuard::new(ledger)));
    let tenant_id = Uuid::new_v4();

    let mut command = deal_workflow(tenant_id, "", vec![step("Email", ActionType::SendEmail)]);
    command.request_id = Some("create-77".to_string());

    let failed = engine.create_workflow(command.clone()).await;
    assert!(matches!(failed, Err(AppError::DatabaseError(_))));
    assert_eq!(harness.workflows.count().await, 0);

    assert!(engine.create_workflow(command.clone()).await.is_ok());
    assert_eq!(harness.workflows.count().await, 1);

    let duplicate = engine.create_workflow(command).await;
    assert!(duplicate.unwrap_err().is_duplicate_request());
    assert_eq!(harness.workflows.count().await, 1);
}

#[tokio::test]
async fn test_request_ids_are_scoped_by_tenant() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let (tenant_a, tenant_b) = (Uuid::new_v4(), Uuid::new_v4());

    for tenant_id in [tenant_a, tenant_b] {
        let mut command = deal_workflow(tenant_id, "", vec![step("Email", ActionType::SendEmail)]);
        command.request_id = Some("req-1".to_string());
        assert!(engine.create_workflow(command).await.is_ok());
    }

    assert_eq!(harness.workflows.list_active(tenant_a, "Deal").await.unwrap().len(), 1);
    assert_eq!(harness.workflows.list_active(tenant_b, "Deal").await.unwrap().len(), 1);
    assert_eq!(harness.ledger.len().await, 2);
}

#[tokio::test]
async fn test_same_request_id_for_another_command_is_not_a_duplicate() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();

    let mut create = deal_workflow(tenant_id, "", vec![step("Email", ActionType::SendEmail)]);
    create.request_id = Some("req-5".to_string());
    let workflow_id = engine.create_workflow(create).await.unwrap();

    let execution_id = engine
        .execute_manual(ExecuteWorkflow {
            tenant_id,
            workflow_id,
            request_id: Some("req-5".to_string()),
            entity_id: None,
            parameters: None,
        })
        .await
        .unwrap();

    assert_eq!(engine.get_execution(tenant_id, execution_id).await.unwrap().workflow_id, workflow_id);
    for command_name in ["CreateWorkflow", "ExecuteWorkflow"] {
        let key = command_request_key(tenant_id, command_name, "req-5");
        assert_eq!(harness.ledger.get(&key).await.unwrap().command_name, command_name);
    }
}

#[tokio::test]
async fn test_oversized_request_id_is_rejected() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();

    let mut command = deal_workflow(tenant_id, "", vec![step("Email", ActionType::SendEmail)]);
    command.request_id = Some("x".repeat(129));

    let err = engine.create_workflow(command).await.unwrap_err();
    assert_eq!(err.error_code(), codes::REQUEST_ID_TOO_LONG);
    assert_eq!(harness.workflows.count().await, 0);
    assert_eq!(harness.ledger.len().await, 0);
}
