//! # BackendConfig Reconciliation
//!
//! Pure validation, no external processes. The outcome is a single `Ready` condition (and its
//! message mirrored into `status.message`). A result is recorded once per generation; a failed
//! BackendConfig is re-evaluated only after its spec changes.

use crate::controller::reconciler::notify::{notify, ObjectRef, Severity};
use crate::controller::reconciler::status::update_status_with_retry;
use crate::controller::reconciler::types::{resource_key, Failure, Reconciler, ReconcilerError};
use crate::crd::{BackendConfig, CloudCredentials, CONDITION_FALSE, CONDITION_READY, CONDITION_TRUE};
use crate::observability::metrics;
use crate::store::{object_key, ObjectStore, StoreError};
use k8s_openapi::api::core::v1::Secret;
use kube_runtime::controller::Action;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

const KIND: &str = "BackendConfig";

pub(crate) const READY_MESSAGE: &str = "BackendConfig is valid and credentials verified";

/// Terraform backend types accepted in `spec.type`
pub const SUPPORTED_BACKENDS: &[&str] = &[
    "local",
    "s3",
    "azurerm",
    "gcs",
    "consul",
    "etcd",
    "etcdv3",
    "http",
    "oss",
    "artifactory",
    "swift",
    "pg",
    "remote",
];

/// Settings each backend type cannot do without
pub fn required_settings(backend_type: &str) -> &'static [&'static str] {
    match backend_type {
        "s3" => &["bucket", "region"],
        "azurerm" => &[
            "storage_account_name",
            "container_name",
            "key",
            "resource_group_name",
        ],
        "gcs" => &["bucket"],
        "consul" => &["path"],
        "pg" => &["conn_str"],
        "http" => &["address"],
        _ => &[],
    }
}

/// Keys the credential secret must carry for each backend type (compared case-insensitively)
pub fn required_secret_keys(backend_type: &str) -> &'static [&'static str] {
    match backend_type {
        "s3" => &["aws_access_key_id", "aws_secret_access_key"],
        "azurerm" => &["arm_access_key"],
        "gcs" => &["google_credentials"],
        _ => &[],
    }
}

/// Decode `settings`: an object, a JSON-encoded object string, or absent.
pub fn parse_settings(settings: Option<&Value>) -> Result<Map<String, Value>, String> {
    match settings {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(Value::String(raw)) if raw.trim().is_empty() => Ok(Map::new()),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(format!("expected an object, got {}", json_kind(&other))),
            Err(e) => Err(e.to_string()),
        },
        Some(other) => Err(format!("expected an object, got {}", json_kind(other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Names from `required` that are absent from `settings`, in table order
pub fn missing_settings(backend_type: &str, settings: &Map<String, Value>) -> Vec<&'static str> {
    required_settings(backend_type)
        .iter()
        .copied()
        .filter(|key| !settings.contains_key(*key))
        .collect()
}

/// All keys carried by a secret, from both `data` and `stringData`
pub(crate) fn secret_keys(secret: &Secret) -> BTreeSet<String> {
    let mut keys: BTreeSet<String> = secret
        .data
        .iter()
        .flat_map(|data| data.keys().cloned())
        .collect();
    keys.extend(secret.string_data.iter().flat_map(|data| data.keys().cloned()));
    keys
}

/// Validate the spec fields and settings of a BackendConfig, without touching other objects.
pub fn validate_spec(config: &BackendConfig) -> Result<Map<String, Value>, Failure> {
    let backend_type = config.spec.r#type.trim();
    if backend_type.is_empty() {
        return Err(Failure::new(
            "ValidationError",
            "Missing required spec field: type",
        ));
    }
    if !SUPPORTED_BACKENDS.contains(&backend_type) {
        return Err(Failure::new(
            "ValidationError",
            format!(
                "Unsupported backend type {backend_type:?}, expected one of: {}",
                SUPPORTED_BACKENDS.join(", ")
            ),
        ));
    }
    if config
        .spec
        .credential_ref
        .as_ref()
        .is_some_and(|r| r.name.trim().is_empty())
    {
        return Err(Failure::new(
            "ValidationError",
            "Missing required spec field: credentialRef.name",
        ));
    }

    let settings = parse_settings(config.spec.settings.as_ref()).map_err(|e| {
        Failure::new("SettingsParseError", format!("Failed to parse settings JSON: {e}"))
    })?;

    let missing = missing_settings(backend_type, &settings);
    if !missing.is_empty() {
        return Err(Failure::new(
            "ValidationError",
            format!(
                "Missing required settings for {backend_type} backend: [{}]",
                missing.join(" ")
            ),
        ));
    }
    Ok(settings)
}

/// Resolve `credentials_name` (a CloudCredentials in `namespace`) to its backing secret.
pub(crate) async fn resolve_cloud_credentials(
    cloud_credentials: &dyn ObjectStore<CloudCredentials>,
    secrets: &dyn ObjectStore<Secret>,
    namespace: &str,
    credentials_name: &str,
) -> Result<Result<Secret, Failure>, StoreError> {
    let credentials = match cloud_credentials.get(namespace, credentials_name).await {
        Ok(credentials) => credentials,
        Err(e) if e.is_not_found() => {
            return Ok(Err(Failure::new(
                "MissingCredential",
                format!("CloudCredentials {credentials_name} not found in namespace {namespace}"),
            )));
        }
        Err(e) => return Err(e),
    };

    let secret_ref = &credentials.spec.secret_ref;
    let secret_namespace = secret_ref
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(namespace);
    match secrets.get(secret_namespace, &secret_ref.name).await {
        Ok(secret) => Ok(Ok(secret)),
        Err(e) if e.is_not_found() => Ok(Err(Failure::new(
            "MissingCredential",
            format!(
                "Secret {secret_namespace}/{} referenced by CloudCredentials {credentials_name} not found",
                secret_ref.name
            ),
        ))),
        Err(e) => Err(e),
    }
}

pub async fn reconcile_backend_config(
    config: Arc<BackendConfig>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let (namespace, name) = object_key(config.as_ref());
    let span = tracing::info_span!(
        "reconcile",
        resource.kind = KIND,
        resource.namespace = namespace.as_str(),
        resource.name = name.as_str()
    );

    async move {
        metrics::increment_reconciliations(KIND);
        let start = Instant::now();
        let result = validate_backend_config(&namespace, &name, &config, &ctx).await;
        metrics::observe_reconciliation_duration(KIND, start.elapsed().as_secs_f64());
        if result.is_ok() {
            ctx.reset_error_backoff(&resource_key(KIND, &namespace, &name));
        }
        result
    }
    .instrument(span)
    .await
}

async fn validate_backend_config(
    namespace: &str,
    name: &str,
    observed: &BackendConfig,
    ctx: &Reconciler,
) -> Result<Action, ReconcilerError> {
    let config = match ctx.stores.backend_configs.get(namespace, name).await {
        Ok(config) => config,
        Err(e) if e.is_not_found() => {
            debug!("BackendConfig not found, must have been deleted");
            ctx.notifier.forget(&ObjectRef::from_resource(observed)).await;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };

    let observed = config.status.as_ref().and_then(|s| s.observed_generation);
    if observed.is_some() && observed == config.metadata.generation {
        debug!(generation = ?observed, "generation already validated");
        return Ok(Action::await_change());
    }

    let outcome = match validate_spec(&config) {
        Ok(_) => verify_credentials(ctx, &config, namespace).await?,
        Err(failure) => Err(failure),
    };

    let (ready, reason, message) = match &outcome {
        Ok(()) => {
            info!(backend_type = config.spec.r#type.as_str(), "{READY_MESSAGE}");
            (true, "Ready".to_string(), READY_MESSAGE.to_string())
        }
        Err(failure) => {
            warn!(reason = failure.reason.as_str(), message = failure.message.as_str(), "BackendConfig is invalid");
            (false, failure.reason.clone(), failure.message.clone())
        }
    };

    update_status_with_retry(
        ctx.stores.backend_configs.as_ref(),
        &ctx.config,
        namespace,
        name,
        |config: &mut BackendConfig| {
            let generation = config.metadata.generation;
            let status = config.status.get_or_insert_with(Default::default);
            let condition_status = if ready { CONDITION_TRUE } else { CONDITION_FALSE };
            status
                .conditions
                .upsert(CONDITION_READY, condition_status, &reason, &message);
            status.message = Some(message.clone());
            status.observed_generation = generation;
        },
    )
    .await?;

    let severity = if ready { Severity::Normal } else { Severity::Warning };
    notify(
        ctx.notifier.as_ref(),
        &ObjectRef::from_resource(&config),
        severity,
        &reason,
        &message,
    )
    .await;

    Ok(Action::await_change())
}

/// Resolve the optional credentialRef and check the secret carries the keys the type needs
async fn verify_credentials(
    ctx: &Reconciler,
    config: &BackendConfig,
    namespace: &str,
) -> Result<Result<(), Failure>, ReconcilerError> {
    let Some(credential_ref) = config.spec.credential_ref.as_ref() else {
        return Ok(Ok(()));
    };

    let secret = match resolve_cloud_credentials(
        ctx.stores.cloud_credentials.as_ref(),
        ctx.stores.secrets.as_ref(),
        namespace,
        &credential_ref.name,
    )
    .await?
    {
        Ok(secret) => secret,
        Err(failure) => return Ok(Err(failure)),
    };

    Ok(check_secret_keys(config.spec.r#type.trim(), &secret))
}

/// The secret must carry every key `backend_type` needs, matched case-insensitively
pub(crate) fn check_secret_keys(backend_type: &str, secret: &Secret) -> Result<(), Failure> {
    let present = secret_keys(secret);
    let missing: Vec<&str> = required_secret_keys(backend_type)
        .iter()
        .copied()
        .filter(|key| !present.iter().any(|k| k.eq_ignore_ascii_case(key)))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Failure::new(
        "MissingCredentialKeys",
        format!(
            "Secret {} is missing keys required by the {backend_type} backend: {}",
            secret.metadata.name.as_deref().unwrap_or_default(),
            missing.join(", ")
        ),
    ))
}
