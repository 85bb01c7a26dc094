//! # Stack Apply Path
//!
//! One reconciliation of a live Stack:
//!
//! 1. Re-read the Stack. Gone means forget it; a deletion timestamp hands over to the
//!    destroy path.
//! 2. Skip when the current generation is already applied, or when a recorded failure's
//!    retry time has not passed (a new generation bypasses the retry gate).
//! 3. Ensure the finalizer, then resolve dependencies and validate bindings. Nothing is
//!    rendered or run until both succeed.
//! 4. Render the workspace and run `init`, `plan` and `apply`, moving the phase before
//!    each step.
//! 5. Pull state and publish outputs and resources with phase Applied.
//!
//! Any [`Failure`] along the way is recorded as phase Error with a Warning event and
//! requeued after the fixed failure delay. Store and workspace errors are returned to the
//! controller, which applies the per-resource error backoff.

use super::delete::finalize_stack;
use super::phase::{mark_in_progress, record_failure, write_phase, PhaseWrite};
use super::render::render_workspace;
use super::resolve::resolve_stack;
use super::runner::Step;
use super::state::{parse_state, StateParseError, StateSummary};
use super::variables::validate_modules;
use super::StackError;
use crate::constants::STACK_FINALIZER;
use crate::controller::reconciler::finalizer::{ensure_finalizer, FinalizerUpdate};
use crate::controller::reconciler::notify::{notify, ObjectRef, Severity};
use crate::controller::reconciler::status::retry_gate;
use crate::controller::reconciler::types::{resource_key, Failure, Reconciler, ReconcilerError};
use crate::crd::{
    Stack, StackPhase, StackResource, CONDITION_READY, CONDITION_TRUE, STATUS_SUCCESS,
};
use crate::observability::metrics;
use crate::store::object_key;
use chrono::Utc;
use kube_runtime::controller::Action;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, Instrument};

const KIND: &str = "Stack";

pub const APPLIED_SUMMARY: &str = "Stack successfully applied and outputs/resources updated.";

/// Controller entry point for a Stack event.
///
/// Runs inside a `reconcile` span carrying the Stack's kind, namespace and name, counts the
/// reconciliation and its duration, and resets the error backoff on success.
pub async fn reconcile_stack(
    stack: Arc<Stack>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let (namespace, name) = object_key(stack.as_ref());
    let span = tracing::info_span!(
        "reconcile",
        resource.kind = KIND,
        resource.namespace = namespace.as_str(),
        resource.name = name.as_str()
    );

    async move {
        metrics::increment_reconciliations(KIND);
        let start = Instant::now();
        let result = sync_stack(&namespace, &name, &stack, &ctx).await;
        metrics::observe_reconciliation_duration(KIND, start.elapsed().as_secs_f64());
        if result.is_ok() {
            ctx.reset_error_backoff(&resource_key(KIND, &namespace, &name));
        }
        result
    }
    .instrument(span)
    .await
}

/// Re-read the Stack and drive it one step. `observed` is only used to identify a Stack
/// that is already gone.
async fn sync_stack(
    namespace: &str,
    name: &str,
    observed: &Stack,
    ctx: &Reconciler,
) -> Result<Action, ReconcilerError> {
    let stack = match ctx.stores.stacks.get(namespace, name).await {
        Ok(stack) => stack,
        Err(e) if e.is_not_found() => {
            ctx.notifier.forget(&ObjectRef::from_resource(observed)).await;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };

    if stack.metadata.deletion_timestamp.is_some() {
        return finalize_stack(ctx, &stack).await;
    }

    if stack.is_applied() {
        debug!("stack already applied for this generation");
        return Ok(Action::await_change());
    }

    let status = stack.status.clone().unwrap_or_default();
    if let Some(remaining) = retry_gate(
        stack.metadata.generation,
        status.observed_generation,
        status.next_retry_time.as_deref(),
        Utc::now(),
    ) {
        debug!(remaining_secs = remaining.as_secs(), "last attempt failed, waiting for retry time");
        return Ok(Action::requeue(remaining));
    }

    let stack = match ensure_finalizer(
        ctx.stores.stacks.as_ref(),
        &ctx.config,
        namespace,
        name,
        STACK_FINALIZER,
    )
    .await?
    {
        FinalizerUpdate::Gone => return Ok(Action::await_change()),
        FinalizerUpdate::Unchanged(stack) => stack,
        FinalizerUpdate::Updated(stack) => {
            info!(finalizer = STACK_FINALIZER, "finalizer added");
            notify(
                ctx.notifier.as_ref(),
                &ObjectRef::from_resource(&stack),
                Severity::Normal,
                "FinalizerAdded",
                "Deletion is held until terraform destroy succeeds",
            )
            .await;
            stack
        }
    };

    let started = write_phase(ctx, &stack, StackPhase::Reconciling, |status, _| {
        mark_in_progress(status, StackPhase::Reconciling, "Reconciling stack");
    })
    .await?;
    match started {
        PhaseWrite::Gone => return Ok(Action::await_change()),
        PhaseWrite::Rejected(_) => return Ok(Action::await_change()),
        PhaseWrite::Changed(_) | PhaseWrite::Unchanged => {}
    }

    match apply_stack(ctx, &stack).await {
        Ok(summary) => publish(ctx, &stack, summary).await,
        Err(StackError::Failed(failure)) => record_failure(ctx, &stack, &failure, None).await,
        Err(StackError::Reconciler(e)) => Err(e),
    }
}

/// Resolve, validate, render and run the pipeline; returns what state reports afterwards
async fn apply_stack(ctx: &Reconciler, stack: &Stack) -> Result<StateSummary, StackError> {
    let (namespace, name) = object_key(stack);
    let resolved = resolve_stack(ctx, stack).await?;
    let bindings = validate_modules(&resolved.modules)?;

    let workspace = ctx.config.stack_workspace(&namespace, &name);
    let rendered = render_workspace(
        &resolved.backend,
        &resolved.modules,
        &bindings,
        &namespace,
        &name,
        &ctx.config.state_key_prefix,
    )
    .map_err(|e| ReconcilerError::ReconciliationFailed(anyhow::anyhow!("failed to render workspace: {e}")))?;
    rendered
        .write_to(&workspace)
        .await
        .map_err(|source| ReconcilerError::Workspace {
            path: workspace.clone(),
            source,
        })?;
    debug!(workspace = %workspace.display(), "workspace rendered");

    for step in Step::PIPELINE {
        let message = format!("Running terraform {step}");
        let outcome = write_phase(ctx, stack, step.phase(), |status, _| {
            mark_in_progress(status, step.phase(), &message);
        })
        .await?;
        if let PhaseWrite::Rejected(from) = outcome {
            return Err(Failure::new(
                "InvalidPhaseTransition",
                format!(
                    "Cannot move from {} to {} while running terraform {step}",
                    from.map_or("None", StackPhase::as_str),
                    step.phase()
                ),
            )
            .into());
        }

        let output = ctx
            .runner
            .run_step(&workspace, step, &resolved.env)
            .await
            .map_err(|e| Failure::new(e.step().failure_reason(), e.to_string()))?;
        debug!(step = step.as_str(), output_bytes = output.len(), "terraform step finished");
    }

    let raw = ctx
        .runner
        .read_state(&workspace, &resolved.env)
        .await
        .map_err(|e| state_failure(&StateParseError::Read(e)))?;
    parse_state(&raw).map_err(|e| state_failure(&e).into())
}

/// `TerraformStateParseError` for both unreadable and malformed state
fn state_failure(error: &StateParseError) -> Failure {
    Failure::new("TerraformStateParseError", error.to_string())
}

/// Applied/Success/ready with outputs and resources from state; no write when nothing changed
async fn publish(
    ctx: &Reconciler,
    stack: &Stack,
    summary: StateSummary,
) -> Result<Action, ReconcilerError> {
    let outputs = Value::Object(summary.outputs);
    let resources: Vec<StackResource> = summary
        .resources
        .into_iter()
        .map(|name| StackResource { name })
        .collect();

    let outcome = write_phase(ctx, stack, StackPhase::Applied, |status, generation| {
        status.status = Some(STATUS_SUCCESS.to_string());
        status.summary = Some(APPLIED_SUMMARY.to_string());
        status.ready = true;
        if status.outputs.as_ref() != Some(&outputs) {
            status.outputs = Some(outputs.clone());
        }
        if status.resources != resources {
            status.resources.clone_from(&resources);
        }
        status
            .conditions
            .upsert(CONDITION_READY, CONDITION_TRUE, "StackApplied", APPLIED_SUMMARY);
        status.observed_generation = generation;
        status.next_retry_time = None;
    })
    .await?;

    if let PhaseWrite::Rejected(from) = outcome {
        let failure = Failure::new(
            "InvalidPhaseTransition",
            format!(
                "Cannot move from {} to Applied",
                from.map_or("None", StackPhase::as_str)
            ),
        );
        return record_failure(ctx, stack, &failure, None).await;
    }
    info!(resources = resources.len(), "stack applied");
    Ok(Action::await_change())
}
