//! Module reconcile loop.
//!
//! The content hash of `type|url|version` is stored in the `SourceHash` condition only after
//! a full sync succeeds. A matching hash on a Module that is still Ready means there is
//! nothing to do; a failed sync flips Ready off, so reverting to the last good source syncs
//! again.

use super::{ModuleInterface, ModuleState};
use crate::controller::reconciler::notify::{notify, ObjectRef, Severity};
use crate::controller::reconciler::status::{next_retry_time, retry_gate, update_status_with_retry};
use crate::controller::reconciler::types::{resource_key, Reconciler, ReconcilerError};
use crate::crd::{Module, SourceKind, CONDITION_FALSE, CONDITION_READY, CONDITION_SOURCE_HASH, CONDITION_TRUE};
use crate::observability::metrics;
use crate::store::object_key;
use chrono::Utc;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

const KIND: &str = "Module";
pub(crate) const SYNCED_MESSAGE: &str = "Module successfully parsed and status updated";

pub async fn reconcile_module(
    module: Arc<Module>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let (namespace, name) = object_key(module.as_ref());
    let span = tracing::info_span!(
        "reconcile",
        resource.kind = KIND,
        resource.namespace = namespace.as_str(),
        resource.name = name.as_str()
    );

    async move {
        metrics::increment_reconciliations(KIND);
        let start = Instant::now();
        let result = sync_module(&namespace, &name, &module, &ctx).await;
        metrics::observe_reconciliation_duration(KIND, start.elapsed().as_secs_f64());
        if result.is_ok() {
            ctx.reset_error_backoff(&resource_key(KIND, &namespace, &name));
        }
        result
    }
    .instrument(span)
    .await
}

fn transition(from: ModuleState, to: ModuleState) {
    debug!(from = from.as_str(), to = to.as_str(), "module state");
}

/// `observed` is the object the watch delivered; it identifies the Module once it is gone
async fn sync_module(
    namespace: &str,
    name: &str,
    observed: &Module,
    ctx: &Reconciler,
) -> Result<Action, ReconcilerError> {
    let module = match ctx.stores.modules.get(namespace, name).await {
        Ok(module) => module,
        Err(e) if e.is_not_found() => {
            ctx.notifier.forget(&ObjectRef::from_resource(observed)).await;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };

    if module.metadata.deletion_timestamp.is_some() {
        debug!("module is being deleted, nothing to do");
        ctx.notifier.forget(&ObjectRef::from_resource(&module)).await;
        return Ok(Action::await_change());
    }

    let hash = module.spec.source.content_hash();
    let status = module.status.clone().unwrap_or_default();
    if status.is_ready() && status.source_hash() == Some(hash.as_str()) {
        debug!(hash = hash.as_str(), "source unchanged since last sync, skipping");
        return Ok(Action::await_change());
    }

    if let Some(remaining) = retry_gate(
        module.metadata.generation,
        status.observed_generation,
        status.next_retry_time.as_deref(),
        Utc::now(),
    ) {
        debug!(remaining_secs = remaining.as_secs(), "last sync failed, waiting for retry time");
        return Ok(Action::requeue(remaining));
    }

    let uid = module.metadata.uid.as_deref().unwrap_or("local");
    let workspace = ctx.config.module_workspace(name, uid);
    let source = &module.spec.source;

    transition(ModuleState::Pending, ModuleState::Cloning);
    info!(source_type = source.r#type.as_str(), url = source.url.as_str(), "fetching module source");
    metrics::increment_module_fetch_total();
    let fetch_start = Instant::now();
    let root = match ctx.fetcher.fetch(source, &workspace).await {
        Ok(root) => {
            metrics::observe_module_fetch_duration(fetch_start.elapsed().as_secs_f64());
            root
        }
        Err(e) => {
            metrics::increment_module_fetch_errors_total();
            return record_failure(
                ctx,
                &module,
                ModuleState::CloneFailed,
                format!("Failed to fetch module source: {e}"),
            )
            .await;
        }
    };
    transition(ModuleState::Cloning, ModuleState::Cloned);

    transition(ModuleState::Cloned, ModuleState::Parsing);
    let interface = match ctx.introspector.introspect(&root).await {
        Ok(interface) => interface,
        Err(e) => {
            return record_failure(
                ctx,
                &module,
                ModuleState::ParseFailed,
                format!("Failed to parse module interface: {e}"),
            )
            .await;
        }
    };
    transition(ModuleState::Parsing, ModuleState::Parsed);

    let hash_message = match source.kind() {
        SourceKind::Local | SourceKind::Unknown(_) => format!(
            "Source type {:?} is not fetched; interface read from an empty workspace",
            source.r#type
        ),
        SourceKind::Git | SourceKind::Http => "Source hash of type, url and version".to_string(),
    };
    publish(ctx, namespace, name, &interface, &hash, &hash_message).await?;
    transition(ModuleState::Parsed, ModuleState::Ready);
    info!(
        inputs = interface.inputs.len(),
        outputs = interface.outputs.len(),
        "module interface published"
    );

    if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
        debug!(workspace = %workspace.display(), error = %e, "could not remove fetch workspace");
    }

    notify(
        ctx.notifier.as_ref(),
        &ObjectRef::from_resource(&module),
        Severity::Normal,
        "Synced",
        SYNCED_MESSAGE,
    )
    .await;
    Ok(Action::await_change())
}

async fn publish(
    ctx: &Reconciler,
    namespace: &str,
    name: &str,
    interface: &ModuleInterface,
    hash: &str,
    hash_message: &str,
) -> Result<(), ReconcilerError> {
    let now = Utc::now().to_rfc3339();
    update_status_with_retry(
        ctx.stores.modules.as_ref(),
        &ctx.config,
        namespace,
        name,
        |module: &mut Module| {
            let generation = module.metadata.generation;
            let status = module.status.get_or_insert_with(Default::default);
            status.description = interface.description.clone();
            status.inputs = interface.inputs.clone();
            status.outputs = interface.outputs.clone();
            status.providers = interface.providers.clone();
            status.requirements = interface.requirements.clone();
            status.resources = interface.resources.clone();
            status.submodules = interface.submodules.clone();
            status.last_synced = Some(now.clone());
            status
                .conditions
                .upsert(CONDITION_READY, CONDITION_TRUE, "Synced", SYNCED_MESSAGE);
            status
                .conditions
                .upsert(CONDITION_SOURCE_HASH, hash, "Synced", hash_message);
            status.observed_generation = generation;
            status.next_retry_time = None;
        },
    )
    .await?;
    Ok(())
}

/// Record a fetch or parse failure: Ready=False, other status fields untouched
async fn record_failure(
    ctx: &Reconciler,
    module: &Module,
    state: ModuleState,
    message: String,
) -> Result<Action, ReconcilerError> {
    let (namespace, name) = object_key(module);
    warn!(state = state.as_str(), message = message.as_str(), "module sync failed");

    let next_retry = next_retry_time(&ctx.config, Utc::now());
    update_status_with_retry(
        ctx.stores.modules.as_ref(),
        &ctx.config,
        &namespace,
        &name,
        |module: &mut Module| {
            let generation = module.metadata.generation;
            let status = module.status.get_or_insert_with(Default::default);
            status
                .conditions
                .upsert(CONDITION_READY, CONDITION_FALSE, state.as_str(), &message);
            status.observed_generation = generation;
            status.next_retry_time = Some(next_retry.clone());
        },
    )
    .await?;

    notify(
        ctx.notifier.as_ref(),
        &ObjectRef::from_resource(module),
        Severity::Warning,
        state.as_str(),
        &message,
    )
    .await;
    metrics::increment_requeues_total("module-failure");
    Ok(Action::requeue(ctx.config.failure_requeue_duration()))
}
