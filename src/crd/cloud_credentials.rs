//! # CloudCredentials
//!
//! Names the Secret that holds provider credentials. Referenced by BackendConfigs and
//! by Stacks with `credentialRef.kind: CloudCredentials`.

use serde::{Deserialize, Serialize};

#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "CloudCredentials",
    group = "astrolabe.io",
    version = "v1",
    namespaced,
    shortname = "cc",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}, {"name":"Secret", "type":"string", "jsonPath":".spec.secretRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CloudCredentialsSpec {
    /// Provider family (aws, azure, gcp, ...)
    pub r#type: String,
    pub secret_ref: SecretReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    /// Defaults to the namespace of the CloudCredentials
    #[serde(default)]
    pub namespace: Option<String>,
}
