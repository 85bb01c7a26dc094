//! # Finalizers
//!
//! Race-safe add/remove of a deletion-guard finalizer: read the latest version, check,
//! write with that version, and re-read on conflict.

use crate::config::ControllerConfig;
use crate::store::{ObjectStore, StoreError};
use kube::Resource;
use tracing::debug;

/// Result of a finalizer add/remove
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizerUpdate<K> {
    /// Already in the desired state; nothing written
    Unchanged(K),
    /// Written; holds the object as returned by the store
    Updated(K),
    /// The object no longer exists
    Gone,
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

pub async fn ensure_finalizer<K>(
    store: &dyn ObjectStore<K>,
    config: &ControllerConfig,
    namespace: &str,
    name: &str,
    finalizer: &str,
) -> Result<FinalizerUpdate<K>, StoreError>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    update_finalizers(store, config, namespace, name, |obj| {
        if has_finalizer(obj, finalizer) {
            return false;
        }
        obj.meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        true
    })
    .await
}

pub async fn remove_finalizer<K>(
    store: &dyn ObjectStore<K>,
    config: &ControllerConfig,
    namespace: &str,
    name: &str,
    finalizer: &str,
) -> Result<FinalizerUpdate<K>, StoreError>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    update_finalizers(store, config, namespace, name, |obj| {
        if !has_finalizer(obj, finalizer) {
            return false;
        }
        if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
        }
        true
    })
    .await
}

async fn update_finalizers<K, F>(
    store: &dyn ObjectStore<K>,
    config: &ControllerConfig,
    namespace: &str,
    name: &str,
    edit: F,
) -> Result<FinalizerUpdate<K>, StoreError>
where
    K: Resource + Clone + Send + Sync + 'static,
    F: Fn(&mut K) -> bool + Send + Sync,
{
    let attempts = config.finalizer_update_attempts.max(1);
    let mut attempt = 0;
    loop {
        let mut obj = match store.get(namespace, name).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return Ok(FinalizerUpdate::Gone),
            Err(e) => return Err(e),
        };
        if !edit(&mut obj) {
            return Ok(FinalizerUpdate::Unchanged(obj));
        }
        match store.replace_finalizers(&obj).await {
            Ok(updated) => return Ok(FinalizerUpdate::Updated(updated)),
            Err(e) if e.is_not_found() => return Ok(FinalizerUpdate::Gone),
            Err(e) if e.is_conflict() && attempt + 1 < attempts => {
                debug!(namespace, name, attempt = attempt + 1, "finalizer update conflicted, re-reading");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
