//! # Store
//!
//! Versioned access to resource records.
//!
//! Reconcilers never hold a `kube::Client` directly: they go through [`ObjectStore`], which
//! surfaces `NotFound` and `Conflict` as first-class outcomes so that every read-mutate-write
//! can branch on them. [`KubeStore`] talks to the API server; [`MemoryStore`] keeps records
//! in-process with the same version semantics.

mod api;
mod memory;

pub use api::KubeStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use kube::Resource;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("conflict writing {kind} {namespace}/{name}: resource version changed")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("API request failed: {0}")]
    Api(#[source] kube::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Versioned store of namespaced resources of kind `K`.
///
/// Writes carry the `resourceVersion` of the object passed in and fail with
/// [`StoreError::Conflict`] when the stored version has moved on.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError>;

    /// List objects in `namespace`, or in all namespaces when `None`
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace the whole status of `obj`, conditional on its resource version.
    ///
    /// Nothing of the stored status survives: a map key absent from `obj.status` is gone
    /// afterwards.
    async fn replace_status(&self, obj: &K) -> Result<K, StoreError>;

    /// Write `metadata.finalizers` of `obj`, conditional on its resource version
    async fn replace_finalizers(&self, obj: &K) -> Result<K, StoreError>;
}

/// `(namespace, name)` of an object, with the defaults used in log lines
pub fn object_key<K: Resource>(obj: &K) -> (String, String) {
    let meta = obj.meta();
    (
        meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
        meta.name.clone().unwrap_or_else(|| "unknown".to_string()),
    )
}
