//! Phase writes checked against [`StackPhase::allows`], and failure recording.
//!
//! Every phase change goes through [`write_phase`], which re-reads the Stack inside the
//! conflict retry loop and refuses transitions the phase machine does not allow. Entering
//! a phase emits its event once, after the write lands.

use super::reconcile::APPLIED_SUMMARY;
use crate::controller::reconciler::notify::{notify, truncate_tail, ObjectRef, Severity};
use crate::controller::reconciler::status::{next_retry_time, update_status_with_retry};
use crate::controller::reconciler::types::{Failure, Reconciler, ReconcilerError};
use crate::crd::{Stack, StackPhase, StackStatus, CONDITION_FALSE, CONDITION_READY};
use crate::observability::metrics;
use crate::store::object_key;
use chrono::Utc;
use kube_runtime::controller::Action;
use tracing::{error, info, warn};

/// Longest summary kept in status; tool output beyond this keeps its tail
const MAX_SUMMARY_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PhaseWrite {
    /// Moved from the given phase
    Changed(Option<StackPhase>),
    /// Already in the phase
    Unchanged,
    /// Transition not allowed from the given phase; nothing written
    Rejected(Option<StackPhase>),
    /// The Stack no longer exists
    Gone,
}

/// Write `phase` plus whatever `extra` sets, if the transition from the stored phase is allowed.
/// `extra` also receives the object's generation.
pub(super) async fn write_phase<F>(
    ctx: &Reconciler,
    stack: &Stack,
    phase: StackPhase,
    mut extra: F,
) -> Result<PhaseWrite, ReconcilerError>
where
    F: FnMut(&mut StackStatus, Option<i64>) + Send,
{
    let (namespace, name) = object_key(stack);
    let mut outcome = PhaseWrite::Gone;
    let stored = update_status_with_retry(
        ctx.stores.stacks.as_ref(),
        &ctx.config,
        &namespace,
        &name,
        |stack: &mut Stack| {
            let current = stack.phase();
            if !StackPhase::allows(current, phase) {
                outcome = PhaseWrite::Rejected(current);
                return;
            }
            outcome = if current == Some(phase) {
                PhaseWrite::Unchanged
            } else {
                PhaseWrite::Changed(current)
            };
            let generation = stack.metadata.generation;
            let status = stack.status.get_or_insert_with(StackStatus::default);
            status.phase = Some(phase);
            extra(status, generation);
        },
    )
    .await?;

    if stored.is_none() {
        return Ok(PhaseWrite::Gone);
    }
    match outcome {
        PhaseWrite::Rejected(from) => {
            warn!(
                from = from.map_or("None", StackPhase::as_str),
                to = phase.as_str(),
                "rejected stack phase transition"
            );
        }
        PhaseWrite::Changed(from) => {
            info!(
                from = from.map_or("None", StackPhase::as_str),
                to = phase.as_str(),
                "stack phase changed"
            );
            if let Some((reason, message)) = phase_event(phase) {
                notify(
                    ctx.notifier.as_ref(),
                    &ObjectRef::from_resource(stack),
                    Severity::Normal,
                    reason,
                    &message,
                )
                .await;
            }
        }
        PhaseWrite::Unchanged | PhaseWrite::Gone => {}
    }
    Ok(outcome)
}

/// Event for entering `phase`; Error and Destroyed carry their own events
fn phase_event(phase: StackPhase) -> Option<(&'static str, String)> {
    match phase {
        StackPhase::Reconciling => Some(("Reconciling", "Reconciling stack".to_string())),
        StackPhase::Applied => Some(("StackApplied", APPLIED_SUMMARY.to_string())),
        StackPhase::Destroying => Some(("DestroyStarted", "Destroying stack resources".to_string())),
        StackPhase::Error | StackPhase::Destroyed => None,
        other => Some((other.as_str(), format!("Stack phase changed to {other}"))),
    }
}

/// Mark a pipeline phase in progress: not ready, Ready condition mirrors the phase
pub(super) fn mark_in_progress(status: &mut StackStatus, phase: StackPhase, message: &str) {
    status.status = Some(crate::crd::STATUS_IN_PROGRESS.to_string());
    status.summary = Some(message.to_string());
    status.ready = false;
    status
        .conditions
        .upsert(CONDITION_READY, CONDITION_FALSE, phase.as_str(), message);
}

/// Record `failure` as phase Error, arm the retry gate and requeue after the fixed delay.
///
/// `event_reason` overrides the failure reason for the Warning event (destroy failures are
/// reported as `DestroyFailed`).
pub(super) async fn record_failure(
    ctx: &Reconciler,
    stack: &Stack,
    failure: &Failure,
    event_reason: Option<&str>,
) -> Result<Action, ReconcilerError> {
    error!(
        reason = failure.reason.as_str(),
        message = failure.message.as_str(),
        "stack reconciliation failed"
    );

    let summary = truncate_tail(&failure.message, MAX_SUMMARY_LEN);
    let next_retry = next_retry_time(&ctx.config, Utc::now());
    let outcome = write_phase(ctx, stack, StackPhase::Error, |status, generation| {
        status.status = Some(failure.reason.clone());
        status.summary = Some(summary.clone());
        status.ready = false;
        status
            .conditions
            .upsert(CONDITION_READY, CONDITION_FALSE, &failure.reason, &summary);
        status.observed_generation = generation;
        status.next_retry_time = Some(next_retry.clone());
    })
    .await?;
    if outcome == PhaseWrite::Gone {
        return Ok(Action::await_change());
    }

    notify(
        ctx.notifier.as_ref(),
        &ObjectRef::from_resource(stack),
        Severity::Warning,
        event_reason.unwrap_or(&failure.reason),
        &failure.message,
    )
    .await;
    metrics::increment_requeues_total("stack-failure");
    Ok(Action::requeue(ctx.config.failure_requeue_duration()))
}
