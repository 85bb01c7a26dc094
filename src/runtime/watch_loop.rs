//! # Watch Loop
//!
//! One `kube_runtime::Controller` per reconciled kind. Module, BackendConfig and Stack each get
//! their own watch, restarted when its stream ends, until shutdown is requested.

use crate::controller::reconciler::{
    reconcile_backend_config, reconcile_module, reconcile_stack, Reconciler, ReconcilerError,
};
use crate::crd::{BackendConfig, Module, Stack};
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error};
use crate::server::ServerState;
use futures::StreamExt;
use kube::api::Api;
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource};
use kube_runtime::{controller, controller::Action, watcher, Controller};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Run the Module, BackendConfig and Stack controllers until shutdown
pub async fn run_controllers(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
) -> Result<(), anyhow::Error> {
    let shutdown_state = server_state.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        shutdown_state.set_ready(false);
        info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
    });

    let namespace = reconciler.config.watch_namespace.clone();
    let modules: Api<Module> = scoped_api(&client, namespace.as_deref());
    let backend_configs: Api<BackendConfig> = scoped_api(&client, namespace.as_deref());
    let stacks: Api<Stack> = scoped_api(&client, namespace.as_deref());

    tokio::join!(
        run_controller(modules, reconcile_module, reconciler.clone(), server_state.clone()),
        run_controller(
            backend_configs,
            reconcile_backend_config,
            reconciler.clone(),
            server_state.clone()
        ),
        run_controller(stacks, reconcile_stack, reconciler, server_state),
    );

    info!("Controllers stopped gracefully");
    Ok(())
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Watch one kind, restarting the watch whenever the stream ends or errors out
async fn run_controller<K, R, Fut>(
    api: Api<K>,
    reconcile: R,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    R: FnMut(Arc<K>, Arc<Reconciler>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<Action, ReconcilerError>> + Send + 'static,
{
    let kind = K::kind(&()).to_string();
    let config = &reconciler.config;
    let backoff_duration_ms = Arc::new(AtomicU64::new(config.backoff_start_ms));

    loop {
        if !server_state.is_ready() {
            info!(resource.kind = kind.as_str(), "Shutdown requested, exiting watch loop");
            break;
        }

        let watch_span = tracing::info_span!(
            "controller.watch",
            resource.kind = kind.as_str(),
            operation = "watch_loop"
        );

        let backoff = backoff_duration_ms.clone();
        let backoff_start_ms = config.backoff_start_ms;
        let backoff_max_ms = config.backoff_max_ms;
        let watch_restart_delay = config.watch_restart_delay_duration();
        let filter_kind = kind.clone();

        info!("Starting {kind} controller watch...");
        Controller::new(api.clone(), watcher::Config::default().any_semantic())
            .with_config(
                controller::Config::default().concurrency(config.max_concurrent_reconciliations),
            )
            .shutdown_on_signal()
            .run(
                reconcile.clone(),
                handle_reconciliation_error::<K>,
                reconciler.clone(),
            )
            .filter_map(move |event| {
                let backoff = backoff.clone();
                let kind = filter_kind.clone();
                async move {
                    match &event {
                        Ok((object, action)) => {
                            backoff.store(backoff_start_ms, Ordering::Relaxed);
                            debug!(object = %object, action = ?action, "watch.event.reconciled");
                            Some(event)
                        }
                        Err(e) => {
                            let error_string = format!("{e:?}");
                            handle_watch_stream_error(
                                &kind,
                                &error_string,
                                &backoff,
                                backoff_max_ms,
                                watch_restart_delay,
                            )
                            .await
                            .map(|()| event)
                        }
                    }
                }
            })
            .for_each(|_| futures::future::ready(()))
            .instrument(watch_span)
            .await;

        if !server_state.is_ready() {
            info!(resource.kind = kind.as_str(), "Shutdown requested, exiting watch loop");
            break;
        }

        let delay = config.watch_restart_delay_after_end_duration();
        warn!(
            "{kind} watch stream ended, restarting in {} seconds...",
            delay.as_secs()
        );
        tokio::time::sleep(delay).await;
    }
}
