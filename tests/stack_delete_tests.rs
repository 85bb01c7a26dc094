//! # Stack Deletion Tests
//!
//! The finalizer holds the Stack until `terraform destroy` succeeds.

mod common;

use astrolabe_operator::constants::STACK_FINALIZER;
use astrolabe_operator::controller::reconciler::reconcile_stack;
use astrolabe_operator::controller::reconciler::stack::Step;
use astrolabe_operator::crd::*;
use common::*;
use kube_runtime::controller::Action;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn applied_stack(h: &Harness) {
    h.insert_ready_s3_backend();
    h.insert_populated_module("vpc", vec![input("region", true)]);
    let stack = h.stacks.insert(stack(
        "network",
        vec![stack_module("vpc", "vpc", json!({"region": "us-east-1"}), &[])],
    ));
    reconcile_stack(Arc::new(stack), h.reconciler.clone())
        .await
        .unwrap();
    assert_eq!(h.stack_status("network").phase, Some(StackPhase::Applied));
    h.runner.clear();
}

async fn reconcile_current(h: &Harness) -> Action {
    let current = h.stack("network").unwrap();
    reconcile_stack(Arc::new(current), h.reconciler.clone())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_destroy_success_releases_the_stack() {
    let h = Harness::new();
    applied_stack(&h).await;
    let workspace = h.stack_workspace("network");
    assert!(workspace.exists());

    h.stacks.mark_for_deletion(NAMESPACE, "network").unwrap();
    let action = reconcile_current(&h).await;

    assert_eq!(action, Action::await_change());
    assert_eq!(h.runner.steps(), vec![Step::Init, Step::Destroy]);
    assert!(h.stack("network").is_none());
    assert!(!workspace.exists());

    let reasons = h.sink.reasons();
    assert!(reasons.contains(&"DestroyStarted".to_string()));
    assert!(reasons.contains(&"DestroySucceeded".to_string()));
    assert_eq!(*h.sink.forgotten.lock().unwrap(), ["Stack/network"]);
}

#[tokio::test]
async fn test_destroy_failure_keeps_the_finalizer() {
    let h = Harness::new();
    applied_stack(&h).await;
    h.runner.fail_on(Some(Step::Destroy));

    h.stacks.mark_for_deletion(NAMESPACE, "network").unwrap();
    let action = reconcile_current(&h).await;
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));

    let stored = h.stack("network").expect("finalizer must hold the stack");
    assert!(h.sink.forgotten.lock().unwrap().is_empty());
    assert!(stored
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == STACK_FINALIZER)));
    let status = stored.status.unwrap();
    assert_eq!(status.phase, Some(StackPhase::Error));
    assert_eq!(status.status.as_deref(), Some("TerraformDestroyError"));
    assert!(!status.ready);
    assert!(h.sink.warnings().contains(&"DestroyFailed".to_string()));

    // Gated until the retry time passes
    h.runner.clear();
    let gated = reconcile_current(&h).await;
    assert_ne!(gated, Action::await_change());
    assert!(h.runner.steps().is_empty());

    h.runner.fail_on(None);
    expire_stack_retry_gate(&h, "network").await;
    reconcile_current(&h).await;
    assert_eq!(h.runner.steps(), vec![Step::Init, Step::Destroy]);
    assert!(h.stack("network").is_none());
}

#[tokio::test]
async fn test_missing_workspace_is_rendered_before_destroy() {
    let h = Harness::new();
    applied_stack(&h).await;
    std::fs::remove_dir_all(h.stack_workspace("network")).unwrap();

    h.stacks.mark_for_deletion(NAMESPACE, "network").unwrap();
    reconcile_current(&h).await;

    assert_eq!(h.runner.steps(), vec![Step::Init, Step::Destroy]);
    assert!(h.stack("network").is_none());
}

#[tokio::test]
async fn test_destroy_with_missing_backend_is_retried() {
    let h = Harness::new();
    applied_stack(&h).await;
    h.backend_configs.remove(NAMESPACE, "state");

    h.stacks.mark_for_deletion(NAMESPACE, "network").unwrap();
    reconcile_current(&h).await;

    assert!(h.runner.steps().is_empty());
    let status = h.stack_status("network");
    assert_eq!(status.phase, Some(StackPhase::Error));
    assert_eq!(status.status.as_deref(), Some("MissingBackendConfig"));
    assert!(h.stack("network").is_some());
}
