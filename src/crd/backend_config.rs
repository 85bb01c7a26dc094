//! # BackendConfig
//!
//! Terraform state backend settings, validated by the BackendConfig reconciler and
//! referenced by Stacks through `backendRef`.

use serde::{Deserialize, Serialize};

use super::condition::{Conditions, CONDITION_READY};
use super::schema::preserve_unknown_value;

/// BackendConfig Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: astrolabe.io/v1
/// kind: BackendConfig
/// metadata:
///   name: s3-state
/// spec:
///   type: s3
///   settings:
///     bucket: my-state-bucket
///     region: eu-west-1
///   credentialRef:
///     name: aws-state-writer
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "BackendConfig",
    group = "astrolabe.io",
    version = "v1",
    namespaced,
    status = "BackendConfigStatus",
    shortname = "bc",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type", "description":"Backend type"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status", "description":"Ready status"}, {"name":"Message", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].message", "description":"Status message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfigSpec {
    /// Terraform backend type (local, s3, azurerm, gcs, consul, ...)
    #[serde(default)]
    pub r#type: String,
    /// Backend block settings, rendered verbatim into `backend "<type>" { ... }`. An object, or
    /// the same object JSON-encoded as a string.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_value")]
    pub settings: Option<serde_json::Value>,
    /// CloudCredentials in the same namespace holding the backend's credentials
    #[serde(default)]
    pub credential_ref: Option<CredentialReference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialReference {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfigStatus {
    #[serde(default)]
    pub conditions: Conditions,
    /// Copy of the Ready condition message
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl BackendConfig {
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_true(CONDITION_READY))
    }
}
