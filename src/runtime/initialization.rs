//! # Initialization
//!
//! Controller bootstrap: rustls provider, tracing, metrics, HTTP server, Kubernetes client,
//! reconciler context and a startup summary of existing resources.

use crate::config::ControllerConfig;
use crate::controller::reconciler::Reconciler;
use crate::observability;
use crate::server::{start_server, ServerState};
use crate::store::{object_key, ObjectStore};
use anyhow::{Context, Result};
use kube::{Client, Resource};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    pub reconciler: Arc<Reconciler>,
    /// Readiness shared with `/readyz`
    pub server_state: Arc<ServerState>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.is_ready())
            .finish_non_exhaustive()
    }
}

/// Install the tracing subscriber: `RUST_LOG` filter (default `astrolabe_operator=info`), JSON
/// lines when `log_format` is `json`.
pub fn init_tracing(log_format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "astrolabe_operator=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if log_format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

pub async fn initialize() -> Result<InitializationResult> {
    // Must happen before anything opens a TLS connection
    let crypto_installed = rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok();

    let config = ControllerConfig::from_env();
    init_tracing(&config.log_format)?;
    if !crypto_installed {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting astrolabe operator");
    info!(
        "Build info: datetime={}, git_hash={}",
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );
    info!(
        watch_namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        work_dir = %config.work_dir.display(),
        terraform = config.terraform_bin.as_str(),
        terraform_docs = config.terraform_docs_bin.as_str(),
        "configuration loaded"
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::new());
    let server_handle = tokio::spawn({
        let state = Arc::clone(&server_state);
        let port = config.metrics_port;
        async move {
            if let Err(e) = start_server(port, state).await {
                error!(error = %e, "health server stopped");
            }
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("Failed to create work dir {}", config.work_dir.display()))?;

    let reconciler = Arc::new(Reconciler::new(client.clone(), config)?);

    log_existing_resources(&reconciler).await;

    info!("Controller initialized, starting watch loops...");
    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
    })
}

/// Poll the readiness flag until the listener is bound, the server task dies, or the
/// startup timeout runs out.
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ControllerConfig,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(config.server_startup_timeout_secs);
    let poll_interval = Duration::from_millis(config.server_poll_interval_ms);

    let bound = tokio::time::timeout(startup_timeout, async {
        while !server_state.is_ready() {
            if server_handle.is_finished() {
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
        true
    })
    .await;

    match bound {
        Ok(true) => {
            info!(port = config.metrics_port, "health server is accepting connections");
            Ok(())
        }
        Ok(false) => anyhow::bail!("health server exited before binding port {}", config.metrics_port),
        Err(_) => anyhow::bail!(
            "health server did not bind port {} within {}s",
            config.metrics_port,
            startup_timeout.as_secs()
        ),
    }
}

/// Log how many resources of each kind already exist, by namespace
async fn log_existing_resources(reconciler: &Reconciler) {
    let namespace = reconciler.config.watch_namespace.as_deref();
    let stores = &reconciler.stores;
    summarize_kind("Module", stores.modules.as_ref(), namespace).await;
    summarize_kind("BackendConfig", stores.backend_configs.as_ref(), namespace).await;
    summarize_kind("CloudCredentials", stores.cloud_credentials.as_ref(), namespace).await;
    summarize_kind("Stack", stores.stacks.as_ref(), namespace).await;
}

async fn summarize_kind<K>(kind: &str, store: &dyn ObjectStore<K>, namespace: Option<&str>)
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let items = match store.list(namespace).await {
        Ok(items) => items,
        Err(e) => {
            error!("{kind} is not queryable: {e}. Is the CRD installed?");
            warn!("Continuing; the {kind} watch will retry");
            return;
        }
    };
    if items.is_empty() {
        info!("No existing {kind} resources");
        return;
    }

    let by_namespace = group_by_namespace(&items);
    info!(
        "{kind}: {} resources in {} namespaces",
        items.len(),
        by_namespace.len()
    );
    for (namespace, names) in &by_namespace {
        info!("  {namespace}: {}", format_names(names));
    }
}

/// Sorted names per namespace
pub fn group_by_namespace<K: Resource>(items: &[K]) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for item in items {
        let (namespace, name) = object_key(item);
        grouped.entry(namespace).or_default().push(name);
    }
    for names in grouped.values_mut() {
        names.sort();
    }
    grouped
}

/// `Resources (n): a, b, c` with the list cut after three names
pub fn format_names(names: &[String]) -> String {
    if names.len() <= 3 {
        format!("Resources ({}): {}", names.len(), names.join(", "))
    } else {
        format!(
            "Resources ({}): {}, ... ({} total)",
            names.len(),
            names[..3].join(", "),
            names.len()
        )
    }
}
