//! # Types
//!
//! Reconciler context shared by the three controllers, and the error type they return.

use crate::config::ControllerConfig;
use crate::constants::{CONTROLLER_NAME, ERROR_BACKOFF_MAX_MINUTES, ERROR_BACKOFF_MIN_MINUTES};
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::reconciler::module::{CommandFetcher, Introspector, SourceFetcher, TerraformDocs};
use crate::controller::reconciler::notify::{DedupSink, KubeEventSink, NotificationSink};
use crate::controller::reconciler::stack::{StepRunner, TerraformRunner};
use crate::crd::{BackendConfig, CloudCredentials, Module, Stack};
use crate::store::{KubeStore, ObjectStore, StoreError};
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Errors that could not be recorded in the resource's status.
///
/// Recorded failures (validation, missing dependencies, tool failures) are written to status
/// and returned as `Ok(Action)`; these go through the error policy instead.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("workspace error at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Reconciliation failed: {0}")]
    ReconciliationFailed(#[from] anyhow::Error),
}

/// A failure that is written to status: stable machine reason plus human message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: String,
    pub message: String,
}

impl Failure {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// Store handles for every kind the reconcilers read or write
#[derive(Clone)]
pub struct Stores {
    pub modules: Arc<dyn ObjectStore<Module>>,
    pub backend_configs: Arc<dyn ObjectStore<BackendConfig>>,
    pub cloud_credentials: Arc<dyn ObjectStore<CloudCredentials>>,
    pub stacks: Arc<dyn ObjectStore<Stack>>,
    pub secrets: Arc<dyn ObjectStore<Secret>>,
}

impl Stores {
    pub fn kube(client: &Client) -> Self {
        Self {
            modules: Arc::new(KubeStore::<Module>::new(client.clone())),
            backend_configs: Arc::new(KubeStore::<BackendConfig>::new(client.clone())),
            cloud_credentials: Arc::new(KubeStore::<CloudCredentials>::new(client.clone())),
            stacks: Arc::new(KubeStore::<Stack>::new(client.clone())),
            secrets: Arc::new(KubeStore::<Secret>::new(client.clone())),
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

pub struct Reconciler {
    pub stores: Stores,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub introspector: Arc<dyn Introspector>,
    pub runner: Arc<dyn StepRunner>,
    pub notifier: Arc<dyn NotificationSink>,
    pub config: ControllerConfig,
    // Error-policy backoff per resource, keyed by kind/namespace/name
    pub backoff_states: Arc<Mutex<HashMap<String, FibonacciBackoff>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Context backed by the API server and the real command-line collaborators
    pub fn new(client: Client, config: ControllerConfig) -> anyhow::Result<Self> {
        let fetcher = CommandFetcher::new()?;
        Ok(Self::from_parts(
            Stores::kube(&client),
            Arc::new(fetcher),
            Arc::new(TerraformDocs::new(config.terraform_docs_bin.clone())),
            Arc::new(TerraformRunner::new(config.terraform_bin.clone())),
            Arc::new(DedupSink::new(KubeEventSink::new(client, CONTROLLER_NAME))),
            config,
        ))
    }

    pub fn from_parts(
        stores: Stores,
        fetcher: Arc<dyn SourceFetcher>,
        introspector: Arc<dyn Introspector>,
        runner: Arc<dyn StepRunner>,
        notifier: Arc<dyn NotificationSink>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            stores,
            fetcher,
            introspector,
            runner,
            notifier,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Next error-policy delay for one resource
    pub fn next_error_backoff(&self, key: &str) -> (std::time::Duration, u32) {
        let mut states = self
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let backoff = states.entry(key.to_string()).or_insert_with(|| {
            FibonacciBackoff::new(ERROR_BACKOFF_MIN_MINUTES, ERROR_BACKOFF_MAX_MINUTES)
        });
        let delay = backoff.next_delay();
        (delay, backoff.attempts())
    }

    /// Forget the error-policy backoff after a clean reconciliation
    pub fn reset_error_backoff(&self, key: &str) {
        let mut states = self
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if states.remove(key).is_some() {
            tracing::debug!(resource = key, "error backoff reset");
        }
    }
}

/// Key used for per-resource bookkeeping
pub fn resource_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}/{namespace}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        let failure = Failure::new("MissingModule", "Module vpc not found");
        assert_eq!(failure.to_string(), "MissingModule: Module vpc not found");
    }

    #[test]
    fn test_resource_key() {
        assert_eq!(resource_key("Stack", "team-a", "network"), "Stack/team-a/network");
    }
}
