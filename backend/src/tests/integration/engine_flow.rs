use chrono::Duration;
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::codes;
use crate::tests::fixtures::{deal_created_fact, deal_workflow, failing_step, step};
use crate::tests::helpers::TestHarness;
use crate::workflows::{
    ActionType, ExecuteWorkflow, ExecutionStatus, StepOutcome, UpdateWorkflow, WorkflowRepository,
};

fn outcomes(results: &[crate::workflows::StepResult]) -> Vec<StepOutcome> {
    results.iter().map(|r| r.outcome).collect()
}

#[tokio::test]
async fn test_deal_created_runs_single_step_workflow() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();

    let workflow_id = engine
        .create_workflow(deal_workflow(tenant_id, "", vec![step("Welcome email", ActionType::SendEmail)]))
        .await
        .unwrap();

    let fact = deal_created_fact(tenant_id, 12_000);
    let started = engine.process_event(&fact).await.unwrap();
    assert_eq!(started.len(), 1);

    let execution = engine.get_execution(tenant_id, started[0]).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(outcomes(&execution.step_results), [StepOutcome::Succeeded]);
    assert_eq!(execution.triggering_fact_id, fact.event_id);

    let requests = harness.capability.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].workflow_id, workflow_id);
    let title = fact.payload["title"].as_str().unwrap();
    assert_eq!(requests[0].configuration["subject"], json!(format!("Welcome email for {}", title)));

    let workflow = harness.workflows.get(tenant_id, workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.execution_count, 1);
}

#[tokio::test]
async fn test_redelivered_fact_does_not_start_again() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();
    engine
        .create_workflow(deal_workflow(tenant_id, "", vec![step("Task", ActionType::CreateTask)]))
        .await
        .unwrap();

    let fact = deal_created_fact(tenant_id, 100);
    assert_eq!(engine.process_event(&fact).await.unwrap().len(), 1);
    assert!(engine.process_event(&fact).await.unwrap().is_empty());

    assert_eq!(harness.executions.all().await.len(), 1);
    assert_eq!(harness.capability.calls(), 1);
}

#[tokio::test]
async fn test_failing_step_stops_execution() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();
    engine
        .create_workflow(deal_workflow(
            tenant_id,
            "",
            vec![
                step("Task", ActionType::CreateTask),
                failing_step("Webhook"),
                step("Email", ActionType::SendEmail),
            ],
        ))
        .await
        .unwrap();

    let started = engine.process_event(&deal_created_fact(tenant_id, 100)).await.unwrap();
    let execution = engine.get_execution(tenant_id, started[0]).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(outcomes(&execution.step_results), [StepOutcome::Succeeded, StepOutcome::Failed]);
    assert!(execution.error_message.unwrap().contains("remote endpoint returned 500"));
    assert_eq!(harness.capability.calls(), 2);
}

#[tokio::test]
async fn test_continue_on_error_runs_remaining_steps() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();
    engine
        .create_workflow(deal_workflow(
            tenant_id,
            "",
            vec![
                step("Task", ActionType::CreateTask),
                failing_step("Webhook").continue_on_error(),
                step("Email", ActionType::SendEmail),
            ],
        ))
        .await
        .unwrap();

    let started = engine.process_event(&deal_created_fact(tenant_id, 100)).await.unwrap();
    let execution = engine.get_execution(tenant_id, started[0]).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        outcomes(&execution.step_results),
        [StepOutcome::Succeeded, StepOutcome::Failed, StepOutcome::Succeeded]
    );
}

#[tokio::test]
async fn test_step_conditions_skip_and_outputs_flow_forward() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();
    engine
        .create_workflow(deal_workflow(
            tenant_id,
            "",
            vec![
                step("Task", ActionType::CreateTask),
                step("Escalate", ActionType::AssignToUser)
                    .with_conditions(r#"{"field": "amount", "operator": ">", "value": 50000}"#),
                step("Email", ActionType::SendEmail)
                    .with_conditions(r#"{"field": "steps.1.ok", "operator": "is_true"}"#),
                step("Disabled", ActionType::SendSms).disabled(),
            ],
        ))
        .await
        .unwrap();

    let started = engine.process_event(&deal_created_fact(tenant_id, 1_000)).await.unwrap();
    let execution = engine.get_execution(tenant_id, started[0]).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        outcomes(&execution.step_results),
        [StepOutcome::Succeeded, StepOutcome::Skipped, StepOutcome::Succeeded, StepOutcome::Skipped]
    );
    assert_eq!(harness.capability.calls(), 2);
}

#[tokio::test]
async fn test_delay_survives_restart() {
    let harness = TestHarness::new();
    let tenant_id = Uuid::new_v4();
    let engine = harness.engine();
    engine
        .create_workflow(deal_workflow(
            tenant_id,
            "",
            vec![
                step("Task", ActionType::CreateTask),
                step("Follow-up", ActionType::SendEmail).with_delay(60),
            ],
        ))
        .await
        .unwrap();

    let started = engine.process_event(&deal_created_fact(tenant_id, 100)).await.unwrap();
    let waiting = engine.get_execution(tenant_id, started[0]).await.unwrap();
    assert_eq!(waiting.status, ExecutionStatus::WaitingDelay);
    assert_eq!(waiting.resume_at, Some(harness.clock.now() + Duration::minutes(60)));
    assert_eq!(harness.capability.calls(), 1);

    drop(engine);
    let restarted = harness.engine();

    harness.clock.advance(Duration::minutes(30));
    assert_eq!(restarted.resume_due().await.unwrap(), 0);

    harness.clock.advance(Duration::minutes(31));
    assert_eq!(restarted.resume_due().await.unwrap(), 1);

    let done = restarted.get_execution(tenant_id, started[0]).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(outcomes(&done.step_results), [StepOutcome::Succeeded, StepOutcome::Succeeded]);
    assert_eq!(harness.capability.calls(), 2);
    assert_eq!(restarted.resume_due().await.unwrap(), 0);
}

#[tokio::test]
async fn test_operator_skip_and_abort() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();
    engine
        .create_workflow(deal_workflow(
            tenant_id,
            "",
            vec![
                step("Reminder", ActionType::SendEmail).with_delay(1440),
                step("Task", ActionType::CreateTask),
            ],
        ))
        .await
        .unwrap();

    let skipped = engine.process_event(&deal_created_fact(tenant_id, 10)).await.unwrap()[0];
    let aborted = engine.process_event(&deal_created_fact(tenant_id, 20)).await.unwrap()[0];

    engine.skip_waiting_step(tenant_id, skipped).await.unwrap();
    let execution = engine.get_execution(tenant_id, skipped).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(outcomes(&execution.step_results), [StepOutcome::Skipped, StepOutcome::Succeeded]);

    engine.abort_execution(tenant_id, aborted, "customer churned").await.unwrap();
    let execution = engine.get_execution(tenant_id, aborted).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Aborted);
    assert_eq!(execution.error_message.as_deref(), Some("customer churned"));

    let err = engine.abort_execution(tenant_id, skipped, "too late").await.unwrap_err();
    assert_eq!(err.error_code(), codes::EXECUTION_CANNOT_ABORT);

    // another tenant cannot see the execution
    assert!(engine.get_execution(Uuid::new_v4(), aborted).await.is_err());
    assert_eq!(harness.capability.calls(), 1);
}

#[tokio::test]
async fn test_manual_execution_and_deactivation() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();
    let workflow_id = engine
        .create_workflow(deal_workflow(tenant_id, "", vec![step("Task", ActionType::CreateTask)]))
        .await
        .unwrap();

    let execution_id = engine
        .execute_manual(ExecuteWorkflow {
            tenant_id,
            workflow_id,
            request_id: None,
            entity_id: Some(Uuid::new_v4()),
            parameters: Some(json!({ "title": "Manual run" })),
        })
        .await
        .unwrap();
    let execution = engine.get_execution(tenant_id, execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(harness.capability.requests()[0].configuration["subject"], json!("Task for Manual run"));

    let workflow = engine.get_workflow(tenant_id, workflow_id).await.unwrap();
    engine
        .update_workflow(UpdateWorkflow {
            tenant_id,
            workflow_id,
            request_id: None,
            name: workflow.name,
            description: workflow.description,
            trigger_type: workflow.trigger_type,
            entity_type: workflow.entity_type,
            trigger_conditions: String::new(),
            is_active: false,
            steps: vec![step("Task", ActionType::CreateTask)],
        })
        .await
        .unwrap();

    let err = engine
        .execute_manual(ExecuteWorkflow {
            tenant_id,
            workflow_id,
            request_id: None,
            entity_id: None,
            parameters: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), codes::WORKFLOW_INACTIVE);
    assert!(engine.process_event(&deal_created_fact(tenant_id, 5)).await.unwrap().is_empty());
    assert_eq!(engine.list_executions(tenant_id, workflow_id).await.unwrap().len(), 1);
}
