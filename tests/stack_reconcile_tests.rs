//! # Stack Reconciliation Tests
//!
//! Drives `reconcile_stack` against in-memory stores and a recording step runner.

mod common;

use astrolabe_operator::constants::STACK_FINALIZER;
use astrolabe_operator::controller::reconciler::{reconcile_backend_config, reconcile_stack};
use astrolabe_operator::controller::reconciler::stack::{Step, APPLIED_SUMMARY};
use astrolabe_operator::crd::*;
use common::*;
use kube_runtime::controller::Action;
use serde_json::json;
use std::time::Duration;

fn network_stack(h: &Harness) -> Stack {
    h.insert_ready_s3_backend();
    h.insert_populated_module("vpc", vec![input("region", true), input("cidr", false)]);
    h.stacks.insert(stack(
        "network",
        vec![stack_module("vpc", "vpc", json!({"region": "us-east-1"}), &[])],
    ))
}

async fn reconcile(h: &Harness, stack: &Stack) -> Action {
    reconcile_stack(std::sync::Arc::new(stack.clone()), h.reconciler.clone())
        .await
        .unwrap()
}

// ============================================================================
// Apply path
// ============================================================================

#[tokio::test]
async fn test_stack_applies_and_publishes_state() {
    let h = Harness::new();
    let stack = network_stack(&h);

    let action = reconcile(&h, &stack).await;
    assert_eq!(action, Action::await_change());
    assert_eq!(h.runner.steps(), vec![Step::Init, Step::Plan, Step::Apply]);

    let stored = h.stack("network").unwrap();
    assert!(stored
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == STACK_FINALIZER)));

    let status = stored.status.unwrap();
    assert_eq!(status.phase, Some(StackPhase::Applied));
    assert_eq!(status.status.as_deref(), Some(STATUS_SUCCESS));
    assert_eq!(status.summary.as_deref(), Some(APPLIED_SUMMARY));
    assert!(status.ready);
    assert_eq!(status.outputs, Some(json!({"vpc_id": "vpc-123"})));
    assert_eq!(
        status.resources.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
        ["data.aws_region.current", "module.vpc.aws_vpc.this"]
    );
    assert_eq!(status.observed_generation, stored.metadata.generation);
    assert_eq!(status.next_retry_time, None);
    let ready = status.conditions.find(CONDITION_READY).unwrap();
    assert_eq!(ready.status, CONDITION_TRUE);
    assert_eq!(ready.reason.as_deref(), Some("StackApplied"));

    assert_eq!(
        h.sink.reasons(),
        ["FinalizerAdded", "Reconciling", "Init", "Plan", "Apply", "StackApplied"]
    );
}

#[tokio::test]
async fn test_workspace_and_environment() {
    let h = Harness::new();
    let stack = network_stack(&h);
    reconcile(&h, &stack).await;

    let workspace = h.stack_workspace("network");
    let backend = std::fs::read_to_string(workspace.join("backend.tf")).unwrap();
    assert_eq!(
        backend,
        "terraform {\n  backend \"s3\" {\n    bucket = \"tf-state\"\n    key = \"astrolabe/team-a/network.tfstate\"\n    region = \"us-east-1\"\n  }\n}\n"
    );
    let main = std::fs::read_to_string(workspace.join("main.tf")).unwrap();
    assert!(main.contains("module \"vpc\" {\n"));
    assert!(main.contains("  source = \"git::https://example.com/modules/vpc.git?ref=v1.0.0\"\n"));
    assert!(main.contains("  region = \"us-east-1\"\n"));

    let envs = h.runner.envs.lock().unwrap().clone();
    assert_eq!(envs.len(), 3);
    assert_eq!(envs[0]["aws_access_key_id"], "AKIAEXAMPLE");
    assert_eq!(envs[0]["aws_secret_access_key"], "s3cr3t");
}

#[tokio::test]
async fn test_applied_stack_is_not_touched_again() {
    let h = Harness::new();
    let stack = network_stack(&h);
    reconcile(&h, &stack).await;

    let status_writes = h.stacks.status_writes();
    let finalizer_writes = h.stacks.finalizer_writes();
    h.runner.clear();

    let current = h.stack("network").unwrap();
    let action = reconcile(&h, &current).await;
    assert_eq!(action, Action::await_change());
    assert!(h.runner.steps().is_empty());
    assert_eq!(h.stacks.status_writes(), status_writes);
    assert_eq!(h.stacks.finalizer_writes(), finalizer_writes);
}

#[tokio::test]
async fn test_spec_edit_reapplies() {
    let h = Harness::new();
    let stack = network_stack(&h);
    reconcile(&h, &stack).await;
    h.runner.clear();

    let edited = h
        .stacks
        .update_spec(NAMESPACE, "network", |s| {
            s.spec.modules[0].variables = Some(json!({"region": "eu-west-1"}));
        })
        .unwrap();
    reconcile(&h, &edited).await;

    assert_eq!(h.runner.steps(), vec![Step::Init, Step::Plan, Step::Apply]);
    let status = h.stack_status("network");
    assert_eq!(status.phase, Some(StackPhase::Applied));
    assert_eq!(status.observed_generation, Some(2));
    let main = std::fs::read_to_string(h.stack_workspace("network").join("main.tf")).unwrap();
    assert!(main.contains("  region = \"eu-west-1\"\n"));
}

#[tokio::test]
async fn test_reapply_drops_outputs_no_longer_in_state() {
    let h = Harness::new();
    let stack = network_stack(&h);
    *h.runner.state.lock().unwrap() = json!({
        "outputs": {
            "vpc_id": {"value": "vpc-123"},
            "subnet_ids": {"value": ["subnet-a"]},
            "db_password": {"value": "hunter2", "sensitive": true}
        },
        "resources": []
    })
    .to_string()
    .into_bytes();
    reconcile(&h, &stack).await;
    assert_eq!(
        h.stack_status("network").outputs,
        Some(json!({"vpc_id": "vpc-123", "subnet_ids": ["subnet-a"], "db_password": "(sensitive)"}))
    );

    *h.runner.state.lock().unwrap() = json!({"outputs": {"vpc_id": {"value": "vpc-456"}}})
        .to_string()
        .into_bytes();
    let edited = h
        .stacks
        .update_spec(NAMESPACE, "network", |s| {
            s.spec.modules[0].variables = Some(json!({"region": "eu-west-1"}));
        })
        .unwrap();
    reconcile(&h, &edited).await;

    let status = h.stack_status("network");
    assert_eq!(status.outputs, Some(json!({"vpc_id": "vpc-456"})));
    assert!(status.resources.is_empty());
}

#[tokio::test]
async fn test_status_conflict_is_retried() {
    let h = Harness::new();
    let stack = network_stack(&h);
    h.stacks.inject_conflicts(1);

    reconcile(&h, &stack).await;
    assert_eq!(h.stack_status("network").phase, Some(StackPhase::Applied));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_missing_variables_never_runs_terraform() {
    let h = Harness::new();
    h.insert_ready_s3_backend();
    h.insert_populated_module("vpc", vec![input("region", true), input("azs", true)]);
    let stack = h.stacks.insert(stack(
        "network",
        vec![stack_module("vpc", "vpc", json!({}), &[])],
    ));

    let action = reconcile(&h, &stack).await;
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    assert!(h.runner.steps().is_empty());

    let status = h.stack_status("network");
    assert_eq!(status.phase, Some(StackPhase::Error));
    assert_eq!(status.status.as_deref(), Some("MissingVariables"));
    assert_eq!(
        status.summary.as_deref(),
        Some("Module vpc missing variables: region, azs")
    );
    assert!(!status.ready);
    assert!(status.next_retry_time.is_some());
    assert_eq!(h.sink.warnings(), ["MissingVariables"]);
}

#[tokio::test]
async fn test_missing_backend_config() {
    let h = Harness::new();
    h.insert_populated_module("vpc", vec![input("region", true)]);
    let stack = h.stacks.insert(stack(
        "network",
        vec![stack_module("vpc", "vpc", json!({"region": "us-east-1"}), &[])],
    ));

    reconcile(&h, &stack).await;
    let status = h.stack_status("network");
    assert_eq!(status.status.as_deref(), Some("MissingBackendConfig"));
    assert!(h.runner.steps().is_empty());
}

#[tokio::test]
async fn test_failed_stack_waits_for_retry_time() {
    let h = Harness::new();
    h.insert_ready_s3_backend();
    let stack = h.stacks.insert(stack(
        "network",
        vec![stack_module("db", "db", json!({"region": "us-east-1"}), &[])],
    ));
    reconcile(&h, &stack).await;
    let writes = h.stacks.status_writes();

    let current = h.stack("network").unwrap();
    let action = reconcile(&h, &current).await;
    // A timed requeue for the remainder of the failure delay
    assert_ne!(action, Action::await_change());
    assert_ne!(action, Action::requeue(Duration::from_secs(60)));
    assert_eq!(h.stacks.status_writes(), writes);
    assert!(h.runner.steps().is_empty());
}

#[tokio::test]
async fn test_missing_module_heals_once_module_appears() {
    let h = Harness::new();
    h.insert_ready_s3_backend();
    let stack = h.stacks.insert(stack(
        "network",
        vec![stack_module("db", "db", json!({"region": "us-east-1"}), &[])],
    ));

    reconcile(&h, &stack).await;
    let status = h.stack_status("network");
    assert_eq!(status.phase, Some(StackPhase::Error));
    assert_eq!(status.status.as_deref(), Some("MissingModule"));
    assert_eq!(
        status.summary.as_deref(),
        Some("Module db not found in namespace team-a")
    );

    h.insert_populated_module("db", vec![input("region", true)]);
    expire_stack_retry_gate(&h, "network").await;
    let current = h.stack("network").unwrap();
    reconcile(&h, &current).await;

    let status = h.stack_status("network");
    assert_eq!(status.phase, Some(StackPhase::Applied));
    assert!(status.ready);
    assert_eq!(status.next_retry_time, None);
}

#[tokio::test]
async fn test_module_without_interface_is_unpopulated() {
    let h = Harness::new();
    h.insert_ready_s3_backend();
    h.modules.insert(module("vpc", "git", "https://example.com/modules/vpc.git"));
    let stack = h.stacks.insert(stack(
        "network",
        vec![stack_module("vpc", "vpc", json!({"region": "us-east-1"}), &[])],
    ));

    let action = reconcile(&h, &stack).await;
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    assert!(h.runner.steps().is_empty());
    let status = h.stack_status("network");
    assert_eq!(status.phase, Some(StackPhase::Error));
    assert_eq!(status.status.as_deref(), Some("ModuleUnpopulated"));
    assert_eq!(
        status.summary.as_deref(),
        Some("Module vpc has not published its inputs yet")
    );
    assert!(!status.ready);
}

#[tokio::test]
async fn test_backend_created_before_its_credentials_heals() {
    let h = Harness::new();
    h.insert_populated_module("vpc", vec![input("region", true)]);
    h.backend_configs.insert(backend_config(
        "state",
        "s3",
        json!({"bucket": "tf-state", "region": "us-east-1"}),
        Some("aws"),
    ));
    let current = h.backend_config("state");
    reconcile_backend_config(std::sync::Arc::new(current), h.reconciler.clone())
        .await
        .unwrap();
    assert!(!h.backend_config("state").is_ready());

    let stack = h.stacks.insert(stack(
        "network",
        vec![stack_module("vpc", "vpc", json!({"region": "us-east-1"}), &[])],
    ));
    reconcile(&h, &stack).await;
    let status = h.stack_status("network");
    assert_eq!(status.phase, Some(StackPhase::Error));
    assert_eq!(status.status.as_deref(), Some("MissingCredential"));
    assert!(h.runner.steps().is_empty());

    // The BackendConfig keeps its stale Ready=False; the Stack resolves it again regardless
    h.secrets.insert(secret(
        "aws-creds",
        &[
            ("aws_access_key_id", "AKIAEXAMPLE"),
            ("aws_secret_access_key", "s3cr3t"),
        ],
    ));
    h.cloud_credentials.insert(cloud_credentials("aws", "aws-creds"));
    expire_stack_retry_gate(&h, "network").await;
    let current = h.stack("network").unwrap();
    reconcile(&h, &current).await;

    assert!(!h.backend_config("state").is_ready());
    assert_eq!(h.runner.steps(), vec![Step::Init, Step::Plan, Step::Apply]);
    let status = h.stack_status("network");
    assert_eq!(status.phase, Some(StackPhase::Applied));
    assert!(status.ready);
    let envs = h.runner.envs.lock().unwrap().clone();
    assert_eq!(envs[0]["aws_access_key_id"], "AKIAEXAMPLE");
}

#[tokio::test]
async fn test_backend_credentials_missing_keys_are_rejected() {
    let h = Harness::new();
    h.insert_ready_s3_backend();
    h.secrets.insert(secret("aws-creds", &[("aws_access_key_id", "AKIAEXAMPLE")]));
    h.insert_populated_module("vpc", vec![input("region", true)]);
    let stack = h.stacks.insert(stack(
        "network",
        vec![stack_module("vpc", "vpc", json!({"region": "us-east-1"}), &[])],
    ));

    reconcile(&h, &stack).await;
    let status = h.stack_status("network");
    assert_eq!(status.status.as_deref(), Some("MissingCredentialKeys"));
    assert!(h.runner.steps().is_empty());
}

#[tokio::test]
async fn test_backend_setting_names_must_be_identifiers() {
    let h = Harness::new();
    h.insert_populated_module("vpc", vec![input("region", true)]);
    h.backend_configs.insert(backend_config(
        "state",
        "local",
        json!({"path": "state.tfstate", "path\"\n}\nresource \"null_resource\" \"x\" {": 1}),
        None,
    ));
    let stack = h.stacks.insert(stack(
        "network",
        vec![stack_module("vpc", "vpc", json!({"region": "us-east-1"}), &[])],
    ));

    reconcile(&h, &stack).await;
    let status = h.stack_status("network");
    assert_eq!(status.phase, Some(StackPhase::Error));
    assert_eq!(status.status.as_deref(), Some("InvalidBackendConfig"));
    assert!(h.runner.steps().is_empty());
    assert!(!h.stack_workspace("network").join("backend.tf").exists());

    let inline = h
        .stacks
        .update_spec(NAMESPACE, "network", |s| {
            s.spec.backend_config = Some(InlineBackendConfig {
                r#type: "local".to_string(),
                settings: Some(json!({"bad key": "x"})),
            });
        })
        .unwrap();
    reconcile(&h, &inline).await;
    let status = h.stack_status("network");
    assert_eq!(status.status.as_deref(), Some("InvalidBackendConfig"));
    assert!(status
        .summary
        .as_deref()
        .is_some_and(|s| s.contains("\"bad key\" is not a valid identifier")));
    assert!(h.runner.steps().is_empty());
}

#[tokio::test]
async fn test_apply_failure_is_recorded_then_recovers() {
    let h = Harness::new();
    let stack = network_stack(&h);
    h.runner.fail_on(Some(Step::Apply));

    let action = reconcile(&h, &stack).await;
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    assert_eq!(h.runner.steps(), vec![Step::Init, Step::Plan, Step::Apply]);
    let status = h.stack_status("network");
    assert_eq!(status.phase, Some(StackPhase::Error));
    assert_eq!(status.status.as_deref(), Some("TerraformApplyError"));
    assert!(status
        .summary
        .as_deref()
        .is_some_and(|s| s.contains("terraform apply failed with exit code 1")));
    assert!(h.sink.warnings().contains(&"TerraformApplyError".to_string()));

    h.runner.fail_on(None);
    h.runner.clear();
    expire_stack_retry_gate(&h, "network").await;
    let current = h.stack("network").unwrap();
    reconcile(&h, &current).await;

    assert_eq!(h.runner.steps(), vec![Step::Init, Step::Plan, Step::Apply]);
    assert_eq!(h.stack_status("network").phase, Some(StackPhase::Applied));
}

#[tokio::test]
async fn test_unreadable_state_is_a_parse_failure() {
    let h = Harness::new();
    let stack = network_stack(&h);
    *h.runner.state.lock().unwrap() = b"not json".to_vec();

    reconcile(&h, &stack).await;
    let status = h.stack_status("network");
    assert_eq!(status.status.as_deref(), Some("TerraformStateParseError"));
    assert!(!status.ready);
}

#[tokio::test]
async fn test_dependency_cycle_is_rejected() {
    let h = Harness::new();
    h.insert_ready_s3_backend();
    h.insert_populated_module("vpc", vec![]);
    let stack = h.stacks.insert(stack(
        "network",
        vec![
            stack_module("a", "vpc", json!({}), &["b"]),
            stack_module("b", "vpc", json!({}), &["a"]),
        ],
    ));

    reconcile(&h, &stack).await;
    let status = h.stack_status("network");
    assert_eq!(status.status.as_deref(), Some("InvalidDependsOn"));
    assert!(h.runner.steps().is_empty());
}

#[tokio::test]
async fn test_vanished_stack_is_ignored() {
    let h = Harness::new();
    let stack = stack("ghost", vec![]);
    let action = reconcile(&h, &stack).await;
    assert_eq!(action, Action::await_change());
    assert_eq!(h.stacks.status_writes(), 0);
}
