use serde_json::json;
use stocker_shared::{DealStageChangedEvent, IntegrationEvent};
use uuid::Uuid;

use crate::tests::fixtures::{deal_created_fact, deal_workflow, step};
use crate::tests::helpers::TestHarness;
use crate::workflows::triggers::trigger_fires;
use crate::workflows::{ActionType, ConditionSet, TriggerEvaluator, TriggerType, Workflow, WorkflowRepository};

#[tokio::test]
async fn test_only_matching_active_workflows_of_the_tenant() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();

    let big_deals = engine
        .create_workflow(deal_workflow(
            tenant_id,
            r#"{"field": "amount", "operator": "greater_than", "value": 10000}"#,
            vec![step("Email", ActionType::SendEmail)],
        ))
        .await
        .unwrap();
    engine
        .create_workflow(deal_workflow(
            Uuid::new_v4(),
            "",
            vec![step("Email", ActionType::SendEmail)],
        ))
        .await
        .unwrap();
    let mut inactive = deal_workflow(tenant_id, "", vec![step("Task", ActionType::CreateTask)]);
    inactive.is_active = false;
    engine.create_workflow(inactive).await.unwrap();

    let evaluator = TriggerEvaluator::new(harness.workflows.clone());

    let matched = evaluator.evaluate(&deal_created_fact(tenant_id, 25_000)).await.unwrap();
    assert_eq!(matched.iter().map(|m| m.workflow.id).collect::<Vec<_>>(), [big_deals]);

    let small = evaluator.evaluate(&deal_created_fact(tenant_id, 500)).await.unwrap();
    assert!(small.is_empty());
}

#[tokio::test]
async fn test_malformed_conditions_fail_closed() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    let tenant_id = Uuid::new_v4();

    let id = engine
        .create_workflow(deal_workflow(tenant_id, "", vec![step("Email", ActionType::SendEmail)]))
        .await
        .unwrap();

    // a row written by hand that no longer parses
    let mut stored = harness.workflows.get(tenant_id, id).await.unwrap().unwrap();
    stored.trigger_conditions = ConditionSet::load(r#"{"field": "amount", "operator": "roughly", "value": 1}"#);
    harness.workflows.save(&stored).await.unwrap();

    let fact = deal_created_fact(tenant_id, 25_000);
    assert!(trigger_fires(&stored, &fact).is_err());

    let evaluator = TriggerEvaluator::new(harness.workflows.clone());
    assert!(evaluator.evaluate(&fact).await.unwrap().is_empty());
    assert!(engine.process_event(&fact).await.unwrap().is_empty());
}

#[test]
fn test_stage_change_trigger_only_for_deals() {
    let tenant_id = Uuid::new_v4();
    let mut workflow = Workflow::create(
        "Stage watcher",
        None,
        TriggerType::DealStageChanged,
        "Deal",
        r#"{"field": "new_stage", "operator": "equals", "value": "Negotiation"}"#,
        tenant_id,
        None,
    )
    .unwrap();
    workflow.add_step(step("Notify", ActionType::SendNotification)).unwrap();
    workflow.activate().unwrap();

    let fact = IntegrationEvent::new(
        tenant_id,
        &DealStageChangedEvent {
            deal_id: Uuid::new_v4(),
            old_stage: "Qualified".to_string(),
            new_stage: "Negotiation".to_string(),
        },
    )
    .unwrap();
    assert_eq!(trigger_fires(&workflow, &fact), Ok(true));

    let mut lead_fact = fact.clone();
    lead_fact.entity_type = "Lead".to_string();
    assert_eq!(trigger_fires(&workflow, &lead_fact), Ok(false));

    let mut other = fact;
    other.payload = json!({ "new_stage": "Won" });
    assert_eq!(trigger_fires(&workflow, &other), Ok(false));
}
