//! # Error Policy
//!
//! Backoff for reconcile errors and classification of watch stream errors.

use crate::controller::reconciler::{resource_key, Reconciler, ReconcilerError};
use crate::observability::metrics;
use crate::store::object_key;
use kube::Resource;
use kube_runtime::controller::Action;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

/// Requeue a resource whose reconcile returned an error, with per-resource Fibonacci backoff.
///
/// Recorded failures never get here; this covers store and workspace errors.
pub fn handle_reconciliation_error<K>(
    obj: Arc<K>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let kind = K::kind(&());
    let (namespace, name) = object_key(obj.as_ref());

    let error_span = tracing::error_span!(
        "controller.watch.reconciliation_error",
        resource.kind = &*kind,
        resource.name = name.as_str(),
        resource.namespace = namespace.as_str(),
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {kind} {namespace}/{name}: {error:?}");
    metrics::increment_reconciliation_errors(&kind);

    let (delay, error_count) = ctx.next_error_backoff(&resource_key(&kind, &namespace, &name));
    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::minutes(1));
    info!(
        backoff_secs = delay.as_secs(),
        error_count,
        next_retry = next_trigger_time.to_rfc3339().as_str(),
        "retrying with Fibonacci backoff"
    );

    metrics::increment_requeues_total("error-backoff");
    Action::requeue(delay)
}

/// What the watch loop should do with a stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    /// 401: credentials or RBAC gone; wait, then restart the watch
    Unauthorized,
    /// 410: resource version expired; restart the watch
    Expired,
    /// 429: API server busy; exponential backoff, then restart
    Throttled,
    /// 404: object or CRD missing; keep going
    NotFound,
    /// Anything else; wait, then restart
    Other,
}

/// Classify a watch error by its debug rendering.
///
/// 404 is checked before 401: a plain-text 404 body surfaces as a serde error whose chain also
/// mentions `WatchFailed`.
pub fn classify_watch_error(error_string: &str) -> WatchErrorKind {
    let is_not_found = error_string.contains("ObjectNotFound")
        || error_string.contains("404")
        || error_string.contains("not found");
    if (error_string.contains("401") || error_string.contains("Unauthorized")) && !is_not_found {
        return WatchErrorKind::Unauthorized;
    }
    if error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone")
    {
        return WatchErrorKind::Expired;
    }
    if error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests")
    {
        return WatchErrorKind::Throttled;
    }
    if is_not_found {
        return WatchErrorKind::NotFound;
    }
    WatchErrorKind::Other
}

/// Handle one watch stream error.
///
/// Returns `None` to drop the error from the stream (the watch restarts) or `Some(())` to keep
/// going.
pub async fn handle_watch_stream_error(
    kind: &str,
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
    watch_restart_delay: Duration,
) -> Option<()> {
    let error_span =
        tracing::warn_span!("controller.watch.error", resource.kind = kind, error = %error_string);

    async move {
        match classify_watch_error(error_string) {
            WatchErrorKind::Unauthorized => {
                error!("Watch of {kind} failed with 401 Unauthorized; the service account token or RBAC binding may be gone");
                error!("  kubectl get clusterrolebinding astrolabe-operator -o yaml");
                error!("  kubectl auth can-i watch stacks.astrolabe.io --as=system:serviceaccount:astrolabe-system:astrolabe-operator --all-namespaces");
                warn!(
                    delay_secs = watch_restart_delay.as_secs(),
                    "waiting before retrying watch"
                );
                tokio::time::sleep(watch_restart_delay).await;
                None
            }
            WatchErrorKind::Expired => {
                warn!(error_type = "410", "watch resource version expired, restarting watch");
                None
            }
            WatchErrorKind::Throttled => {
                let current_backoff = backoff.load(Ordering::Relaxed);
                warn!(
                    backoff_ms = current_backoff,
                    "API server throttling or reinitializing storage (429), backing off"
                );
                tokio::time::sleep(Duration::from_millis(current_backoff)).await;
                backoff.store(
                    current_backoff.saturating_mul(2).min(max_backoff_ms),
                    Ordering::Relaxed,
                );
                None
            }
            WatchErrorKind::NotFound => {
                warn!(
                    "{kind} not found (404); normal after a deletion, otherwise check that the CRD is installed: {error_string}"
                );
                Some(())
            }
            WatchErrorKind::Other => {
                error!("Controller stream error for {kind}: {error_string}");
                tokio::time::sleep(watch_restart_delay).await;
                None
            }
        }
    }
    .instrument(error_span)
    .await
}
