//! # Notifications
//!
//! Fire-and-forget notifications about reconciliation progress. In the cluster these are
//! core/v1 Events attached to the resource; [`DedupSink`] drops an emission that repeats the
//! previous `(reason, message)` for the same object.
//!
//! Dedup history is keyed by object uid, so an object deleted and recreated under the same
//! name starts with a clean history. Only a digest of the last emission is kept, and
//! reconcilers call [`NotificationSink::forget`] once an object is gone for good.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use kube::{
    api::{Api, ObjectMeta, PostParams},
    Client, Resource,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Maximum Event message length; longer messages keep their tail
const MAX_EVENT_MESSAGE_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Normal => "Normal",
            Severity::Warning => "Warning",
        }
    }
}

/// Identity of the object a notification is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

impl ObjectRef {
    pub fn from_resource<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            namespace: meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone(),
        }
    }

    /// The uid when known, `kind/namespace/name` otherwise
    fn key(&self) -> String {
        match self.uid.as_deref().filter(|uid| !uid.is_empty()) {
            Some(uid) => uid.to_string(),
            None => format!("{}/{}/{}", self.kind, self.namespace, self.name),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(
        &self,
        object: &ObjectRef,
        severity: Severity,
        reason: &str,
        message: &str,
    ) -> anyhow::Result<()>;

    /// Drop any per-object state held for `object`. Called when the object is deleted.
    async fn forget(&self, _object: &ObjectRef) {}
}

/// Emit a notification; failures are logged and swallowed
pub async fn notify(
    sink: &dyn NotificationSink,
    object: &ObjectRef,
    severity: Severity,
    reason: &str,
    message: &str,
) {
    if let Err(e) = sink.emit(object, severity, reason, message).await {
        warn!(
            resource.kind = object.kind.as_str(),
            resource.namespace = object.namespace.as_str(),
            resource.name = object.name.as_str(),
            reason,
            error = %e,
            "failed to emit notification"
        );
    }
}

/// Creates core/v1 Events
pub struct KubeEventSink {
    client: Client,
    component: String,
}

impl std::fmt::Debug for KubeEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventSink")
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}

impl KubeEventSink {
    pub fn new(client: Client, component: &str) -> Self {
        Self {
            client,
            component: component.to_string(),
        }
    }

    fn build_event(&self, object: &ObjectRef, severity: Severity, reason: &str, message: &str) -> Event {
        Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", object.name)),
                namespace: Some(object.namespace.clone()),
                ..ObjectMeta::default()
            },
            involved_object: ObjectReference {
                api_version: Some(object.api_version.clone()),
                kind: Some(object.kind.clone()),
                name: Some(object.name.clone()),
                namespace: Some(object.namespace.clone()),
                uid: object.uid.clone(),
                ..ObjectReference::default()
            },
            reason: Some(reason.to_string()),
            message: Some(truncate_tail(message, MAX_EVENT_MESSAGE_LEN)),
            type_: Some(severity.as_str().to_string()),
            count: Some(1),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                ..EventSource::default()
            }),
            reporting_component: Some(self.component.clone()),
            ..Event::default()
        }
    }
}

#[async_trait]
impl NotificationSink for KubeEventSink {
    async fn emit(
        &self,
        object: &ObjectRef,
        severity: Severity,
        reason: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &object.namespace);
        let event = self.build_event(object, severity, reason, message);
        api.create(&PostParams::default(), &event).await?;
        debug!(
            resource.kind = object.kind.as_str(),
            resource.name = object.name.as_str(),
            reason,
            "event emitted"
        );
        Ok(())
    }
}

type EmissionDigest = [u8; 32];

fn emission_digest(reason: &str, message: &str) -> EmissionDigest {
    let mut hasher = Sha256::new();
    hasher.update(reason.as_bytes());
    hasher.update([0]);
    hasher.update(message.as_bytes());
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Suppresses an emission identical to the previous one for the same object.
///
/// Holds one digest per live object; [`NotificationSink::forget`] removes it.
pub struct DedupSink<S> {
    inner: S,
    last: Mutex<HashMap<String, EmissionDigest>>,
}

impl<S> std::fmt::Debug for DedupSink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupSink").finish_non_exhaustive()
    }
}

impl<S> DedupSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn is_repeat(&self, key: &str, digest: &EmissionDigest) -> bool {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|last| last == digest)
    }

    fn remember(&self, key: String, digest: EmissionDigest) {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, digest);
    }

    /// Number of objects with dedup history
    pub fn tracked(&self) -> usize {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl<S: NotificationSink> NotificationSink for DedupSink<S> {
    async fn emit(
        &self,
        object: &ObjectRef,
        severity: Severity,
        reason: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let key = object.key();
        let digest = emission_digest(reason, message);
        if self.is_repeat(&key, &digest) {
            return Ok(());
        }
        self.inner.emit(object, severity, reason, message).await?;
        self.remember(key, digest);
        Ok(())
    }

    async fn forget(&self, object: &ObjectRef) {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&object.key());
        self.inner.forget(object).await;
    }
}

/// Keep the last `max` bytes of `message` (on a char boundary), marked with a leading `...`
pub(crate) fn truncate_tail(message: &str, max: usize) -> String {
    if message.len() <= max {
        return message.to_string();
    }
    let mut start = message.len() - max;
    while !message.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &message[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for Arc<Recorder> {
        async fn emit(
            &self,
            _object: &ObjectRef,
            _severity: Severity,
            reason: &str,
            message: &str,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("sink unavailable");
            }
            self.seen
                .lock()
                .unwrap()
                .push((reason.to_string(), message.to_string()));
            Ok(())
        }
    }

    fn object(name: &str) -> ObjectRef {
        ObjectRef {
            api_version: "astrolabe.io/v1".to_string(),
            kind: "Stack".to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
            uid: None,
        }
    }

    fn object_with_uid(name: &str, uid: &str) -> ObjectRef {
        ObjectRef {
            uid: Some(uid.to_string()),
            ..object(name)
        }
    }

    #[tokio::test]
    async fn test_consecutive_duplicates_are_dropped() {
        let recorder = Arc::new(Recorder::default());
        let sink = DedupSink::new(Arc::clone(&recorder));
        let stack = object("a");

        sink.emit(&stack, Severity::Warning, "MissingModule", "m").await.unwrap();
        sink.emit(&stack, Severity::Warning, "MissingModule", "m").await.unwrap();
        sink.emit(&stack, Severity::Normal, "Reconciling", "r").await.unwrap();
        sink.emit(&stack, Severity::Warning, "MissingModule", "m").await.unwrap();
        // other objects keep their own history
        sink.emit(&object("b"), Severity::Warning, "MissingModule", "m").await.unwrap();

        assert_eq!(recorder.seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_emission_is_swallowed_and_not_remembered() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let sink = DedupSink::new(Arc::clone(&recorder));
        notify(&sink, &object("a"), Severity::Normal, "Synced", "ok").await;
        assert!(!sink.is_repeat("Stack/default/a", &emission_digest("Synced", "ok")));
        assert_eq!(sink.tracked(), 0);
    }

    #[tokio::test]
    async fn test_recreated_object_starts_a_new_history() {
        let recorder = Arc::new(Recorder::default());
        let sink = DedupSink::new(Arc::clone(&recorder));

        sink.emit(&object_with_uid("a", "uid-1"), Severity::Warning, "MissingModule", "m")
            .await
            .unwrap();
        sink.emit(&object_with_uid("a", "uid-2"), Severity::Warning, "MissingModule", "m")
            .await
            .unwrap();

        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
        assert_eq!(sink.tracked(), 2);
    }

    #[tokio::test]
    async fn test_forget_releases_history() {
        let recorder = Arc::new(Recorder::default());
        let sink = DedupSink::new(Arc::clone(&recorder));
        let stack = object_with_uid("a", "uid-1");

        sink.emit(&stack, Severity::Normal, "DestroySucceeded", "d").await.unwrap();
        sink.emit(&object("b"), Severity::Normal, "Synced", "ok").await.unwrap();
        assert_eq!(sink.tracked(), 2);

        sink.forget(&stack).await;
        assert_eq!(sink.tracked(), 1);
        sink.emit(&stack, Severity::Normal, "DestroySucceeded", "d").await.unwrap();
        assert_eq!(recorder.seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_long_messages_keep_their_tail() {
        let message = format!("{}END", "x".repeat(2000));
        let truncated = truncate_tail(&message, MAX_EVENT_MESSAGE_LEN);
        assert!(truncated.ends_with("END"));
        assert_eq!(truncated.len(), MAX_EVENT_MESSAGE_LEN + 3);
    }
}
