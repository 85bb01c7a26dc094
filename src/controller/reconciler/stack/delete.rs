//! Stack destroy path.
//!
//! The finalizer stays until `terraform destroy` has succeeded. A failed destroy is recorded
//! as phase Error and retried after the failure delay, for as long as it takes.

use super::phase::{mark_in_progress, record_failure, write_phase, PhaseWrite};
use super::render::{render_workspace, BACKEND_FILE};
use super::resolve::{resolve_environment, resolve_modules};
use super::runner::Step;
use super::variables::validate_modules;
use super::StackError;
use crate::constants::STACK_FINALIZER;
use crate::controller::reconciler::finalizer::{has_finalizer, remove_finalizer, FinalizerUpdate};
use crate::controller::reconciler::notify::{notify, ObjectRef, Severity};
use crate::controller::reconciler::status::retry_gate;
use crate::controller::reconciler::types::{Failure, Reconciler, ReconcilerError};
use crate::crd::{Stack, StackPhase, CONDITION_FALSE, CONDITION_READY};
use crate::store::object_key;
use chrono::Utc;
use kube_runtime::controller::Action;
use tracing::{debug, info};

pub(crate) const DESTROYED_SUMMARY: &str = "Stack resources destroyed";

/// Destroy path for a Stack with a deletion timestamp.
///
/// A Stack without the finalizer is left alone. A Stack whose last destroy failed waits
/// for its retry time. Otherwise the phase moves to Destroying, `terraform destroy` runs,
/// and on success the phase moves to Destroyed and the finalizer is released.
pub(super) async fn finalize_stack(
    ctx: &Reconciler,
    stack: &Stack,
) -> Result<Action, ReconcilerError> {
    if !has_finalizer(stack, STACK_FINALIZER) {
        debug!("stack is being deleted and holds no finalizer");
        return Ok(Action::await_change());
    }

    if stack.phase() == Some(StackPhase::Error) {
        let status = stack.status.clone().unwrap_or_default();
        if let Some(remaining) = retry_gate(
            stack.metadata.generation,
            status.observed_generation,
            status.next_retry_time.as_deref(),
            Utc::now(),
        ) {
            debug!(remaining_secs = remaining.as_secs(), "waiting before retrying destroy");
            return Ok(Action::requeue(remaining));
        }
    }

    let outcome = write_phase(ctx, stack, StackPhase::Destroying, |status, _| {
        mark_in_progress(status, StackPhase::Destroying, "Destroying stack resources");
    })
    .await?;
    match outcome {
        PhaseWrite::Gone => return Ok(Action::await_change()),
        // Destroyed already; only the finalizer is left to remove
        PhaseWrite::Rejected(Some(StackPhase::Destroyed)) => {
            return release(ctx, stack).await;
        }
        PhaseWrite::Rejected(_) | PhaseWrite::Changed(_) | PhaseWrite::Unchanged => {}
    }

    match destroy(ctx, stack).await {
        Ok(()) => {}
        Err(StackError::Failed(failure)) => {
            return record_failure(ctx, stack, &failure, Some("DestroyFailed")).await;
        }
        Err(StackError::Reconciler(e)) => return Err(e),
    }

    let destroyed = write_phase(ctx, stack, StackPhase::Destroyed, |status, generation| {
        status.status = Some(StackPhase::Destroyed.as_str().to_string());
        status.summary = Some(DESTROYED_SUMMARY.to_string());
        status.ready = false;
        status.outputs = None;
        status.resources.clear();
        status.conditions.upsert(
            CONDITION_READY,
            CONDITION_FALSE,
            StackPhase::Destroyed.as_str(),
            DESTROYED_SUMMARY,
        );
        status.observed_generation = generation;
        status.next_retry_time = None;
    })
    .await?;
    if destroyed == PhaseWrite::Gone {
        return Ok(Action::await_change());
    }
    notify(
        ctx.notifier.as_ref(),
        &ObjectRef::from_resource(stack),
        Severity::Normal,
        "DestroySucceeded",
        DESTROYED_SUMMARY,
    )
    .await;

    release(ctx, stack).await
}

/// `init` then `destroy` in the stack workspace, rendering it first if it is gone
async fn destroy(ctx: &Reconciler, stack: &Stack) -> Result<(), StackError> {
    let (namespace, name) = object_key(stack);
    let (backend, env) = resolve_environment(ctx, stack).await?;

    let workspace = ctx.config.stack_workspace(&namespace, &name);
    if !tokio::fs::try_exists(workspace.join(BACKEND_FILE))
        .await
        .unwrap_or(false)
    {
        info!(workspace = %workspace.display(), "workspace missing, rendering it for destroy");
        let modules = resolve_modules(ctx, stack).await?;
        let bindings = validate_modules(&modules)?;
        render_workspace(
            &backend,
            &modules,
            &bindings,
            &namespace,
            &name,
            &ctx.config.state_key_prefix,
        )
        .map_err(|e| ReconcilerError::ReconciliationFailed(anyhow::anyhow!("failed to render workspace: {e}")))?
        .write_to(&workspace)
        .await
        .map_err(|source| ReconcilerError::Workspace {
            path: workspace.clone(),
            source,
        })?;
    }

    for step in [Step::Init, Step::Destroy] {
        ctx.runner
            .run_step(&workspace, step, &env)
            .await
            .map_err(|e| Failure::new(e.step().failure_reason(), e.to_string()))?;
    }
    info!("terraform destroy succeeded");
    Ok(())
}

/// Drop the finalizer, the workspace and any notification history for the Stack
async fn release(ctx: &Reconciler, stack: &Stack) -> Result<Action, ReconcilerError> {
    let (namespace, name) = object_key(stack);
    match remove_finalizer(
        ctx.stores.stacks.as_ref(),
        &ctx.config,
        &namespace,
        &name,
        STACK_FINALIZER,
    )
    .await?
    {
        FinalizerUpdate::Updated(_) => info!(finalizer = STACK_FINALIZER, "finalizer removed"),
        FinalizerUpdate::Unchanged(_) | FinalizerUpdate::Gone => {}
    }
    ctx.notifier.forget(&ObjectRef::from_resource(stack)).await;

    let workspace = ctx.config.stack_workspace(&namespace, &name);
    if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
        debug!(workspace = %workspace.display(), error = %e, "could not remove stack workspace");
    }
    Ok(Action::await_change())
}
