//! # Status Updates
//!
//! Conflict-safe status writes and the retry gate shared by the reconcilers.
//!
//! Every status write is read-current-version → mutate → write-with-version. A version
//! conflict re-reads and re-applies the mutation, with exponential backoff between attempts.
//! A mutation that leaves the object unchanged is not written at all.

use crate::config::ControllerConfig;
use crate::constants::RETRY_GATE_TOLERANCE_SECS;
use crate::observability::metrics;
use crate::store::{ObjectStore, StoreError};
use chrono::{DateTime, Utc};
use kube::Resource;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Apply `mutate` to the latest stored version of `namespace/name` and write its status.
///
/// Returns `Ok(None)` when the object no longer exists, otherwise the object as stored after
/// the call (unchanged when the mutation was a no-op).
pub async fn update_status_with_retry<K, F>(
    store: &dyn ObjectStore<K>,
    config: &ControllerConfig,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<Option<K>, StoreError>
where
    K: Resource + Clone + Serialize + Send + Sync + 'static,
    F: FnMut(&mut K) + Send,
{
    let attempts = config.status_update_attempts.max(1);
    let mut attempt = 0;
    loop {
        let current = match store.get(namespace, name).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                debug!(namespace, name, "object vanished before status update");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut desired = current.clone();
        mutate(&mut desired);
        if serde_json::to_value(&desired)? == serde_json::to_value(&current)? {
            return Ok(Some(current));
        }

        match store.replace_status(&desired).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) if e.is_conflict() && attempt + 1 < attempts => {
                metrics::increment_status_conflicts();
                let delay = config.status_retry_delay(attempt);
                debug!(
                    namespace,
                    name,
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "status update conflicted, re-reading"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(namespace, name, attempts, "status update still conflicting after retries");
                }
                return Err(e);
            }
        }
    }
}

/// Time at which a failed attempt may be retried for the same generation
pub fn next_retry_time(config: &ControllerConfig, now: DateTime<Utc>) -> String {
    let requeue = chrono::Duration::from_std(config.failure_requeue_duration())
        .unwrap_or_else(|_| chrono::Duration::seconds(60));
    (now + requeue).to_rfc3339()
}

/// Remaining wait if the last attempt for this generation failed and its retry time is ahead.
///
/// A new generation (spec edit) always passes. A retry time within the tolerance of now
/// counts as reached.
pub fn retry_gate(
    generation: Option<i64>,
    observed_generation: Option<i64>,
    next_retry_time: Option<&str>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if generation != observed_generation {
        return None;
    }
    let next = DateTime::parse_from_rfc3339(next_retry_time?)
        .ok()?
        .with_timezone(&Utc);
    if now >= next - chrono::Duration::seconds(RETRY_GATE_TOLERANCE_SECS) {
        return None;
    }
    (next - now).to_std().ok()
}
