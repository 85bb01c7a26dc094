//! In-process [`ObjectStore`] with API-server version semantics.
//!
//! Every write bumps a store-wide resource version, conditional writes compare versions,
//! and an object marked for deletion disappears once its last finalizer is removed.
//! Used by the integration tests, which can also inject conflicts to exercise retry paths.

use async_trait::async_trait;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{object_key, ObjectStore, StoreError};

type Key = (String, String);

pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<Key, K>>,
    version: AtomicU64,
    pending_conflicts: AtomicU32,
    status_writes: AtomicUsize,
    finalizer_writes: AtomicUsize,
}

impl<K> std::fmt::Debug for MemoryStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("kind", &std::any::type_name::<K>())
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            pending_conflicts: AtomicU32::new(0),
            status_writes: AtomicUsize::new(0),
            finalizer_writes: AtomicUsize::new(0),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Key, K>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn not_found(namespace: &str, name: &str) -> StoreError {
        StoreError::NotFound {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn conflict(namespace: &str, name: &str) -> StoreError {
        StoreError::Conflict {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Store `obj` as-is, filling in uid, generation and a fresh resource version
    pub fn insert(&self, mut obj: K) -> K {
        let key = object_key(&obj);
        let meta = obj.meta_mut();
        meta.namespace.get_or_insert_with(|| key.0.clone());
        meta.uid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        meta.generation.get_or_insert(1);
        meta.resource_version = Some(self.next_version());
        self.lock().insert(key, obj.clone());
        obj
    }

    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Edit the stored object as its author would: bumps generation and version
    pub fn update_spec(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut K)) -> Option<K> {
        let mut objects = self.lock();
        let obj = objects.get_mut(&(namespace.to_string(), name.to_string()))?;
        edit(obj);
        let version = self.next_version();
        let meta = obj.meta_mut();
        meta.generation = Some(meta.generation.unwrap_or(0) + 1);
        meta.resource_version = Some(version);
        Some(obj.clone())
    }

    /// Set `metadata.deletionTimestamp`; objects without finalizers are removed at once
    pub fn mark_for_deletion(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.lock();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Self::not_found(namespace, name))?;
        if stored.meta().finalizers.as_ref().is_none_or(Vec::is_empty) {
            objects.remove(&key);
            return Ok(());
        }
        let mut value = serde_json::to_value(stored)?;
        value["metadata"]["deletionTimestamp"] =
            serde_json::Value::String(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        let mut updated: K = serde_json::from_value(value)?;
        updated.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, updated);
        Ok(())
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Make the next `count` conditional writes fail as if another client wrote first
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn finalizer_writes(&self) -> usize {
        self.finalizer_writes.load(Ordering::SeqCst)
    }

    /// Version check shared by both conditional writes
    fn check_version(&self, stored: &mut K, obj: &K) -> Result<(), StoreError> {
        let (namespace, name) = object_key(obj);
        if stored.meta().resource_version != obj.meta().resource_version {
            return Err(Self::conflict(&namespace, &name));
        }
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            stored.meta_mut().resource_version = Some(self.next_version());
            return Err(Self::conflict(&namespace, &name));
        }
        Ok(())
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.snapshot(namespace, name)
            .ok_or_else(|| Self::not_found(namespace, name))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        Ok(self
            .lock()
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|wanted| wanted == ns))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_key(obj);
        if self.snapshot(&namespace, &name).is_some() {
            return Err(Self::conflict(&namespace, &name));
        }
        Ok(self.insert(obj.clone()))
    }

    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_key(obj);
        let mut objects = self.lock();
        let stored = objects
            .get_mut(&(namespace.clone(), name.clone()))
            .ok_or_else(|| Self::not_found(&namespace, &name))?;
        self.check_version(stored, obj)?;

        let mut value = serde_json::to_value(&*stored)?;
        let incoming = serde_json::to_value(obj)?;
        match (value.as_object_mut(), incoming.get("status")) {
            (Some(fields), Some(status)) => {
                fields.insert("status".to_string(), status.clone());
            }
            (Some(fields), None) => {
                fields.remove("status");
            }
            (None, _) => return Err(StoreError::Invalid("object is not a map".to_string())),
        }
        let mut updated: K = serde_json::from_value(value)?;
        updated.meta_mut().resource_version = Some(self.next_version());
        *stored = updated.clone();
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn replace_finalizers(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_key(obj);
        let key = (namespace.clone(), name.clone());
        let mut objects = self.lock();
        let stored = objects
            .get_mut(&key)
            .ok_or_else(|| Self::not_found(&namespace, &name))?;
        self.check_version(stored, obj)?;

        let finalizers = obj.meta().finalizers.clone().unwrap_or_default();
        let released = finalizers.is_empty() && stored.meta().deletion_timestamp.is_some();
        stored.meta_mut().finalizers = Some(finalizers);
        stored.meta_mut().resource_version = Some(self.next_version());
        let updated = stored.clone();
        if released {
            objects.remove(&key);
        }
        self.finalizer_writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}
