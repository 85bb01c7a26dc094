//! # Module
//!
//! A terraform module source. The Module reconciler fetches the source, runs the
//! introspection tool against it and publishes the module's interface to status,
//! where Stacks read it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::condition::{Conditions, CONDITION_READY, CONDITION_SOURCE_HASH};
use super::schema::preserve_unknown_value;

/// Module Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: astrolabe.io/v1
/// kind: Module
/// metadata:
///   name: vpc
///   namespace: platform
/// spec:
///   source:
///     type: git
///     url: https://github.com/terraform-aws-modules/terraform-aws-vpc
///     version: v5.8.1
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Module",
    group = "astrolabe.io",
    version = "v1",
    namespaced,
    status = "ModuleStatus",
    shortname = "mod",
    printcolumn = r#"{"name":"SOURCETYPE", "type":"string", "jsonPath":".spec.source.type"}, {"name":"SOURCEURL", "type":"string", "jsonPath":".spec.source.url"}, {"name":"VERSION", "type":"string", "jsonPath":".spec.source.version"}, {"name":"READY", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    pub source: ModuleSource,
}

/// Where the module lives
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSource {
    /// Source type: git, http or local
    pub r#type: String,
    /// Repository URL, archive URL or local path
    pub url: String,
    /// Git ref (tag, branch) to pin to
    #[serde(default)]
    pub version: Option<String>,
    /// Sub-directory inside the source that holds the module
    #[serde(default)]
    pub path: Option<String>,
}

/// Parsed form of [`ModuleSource::type`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Git,
    Http,
    Local,
    Unknown(String),
}

impl ModuleSource {
    pub fn kind(&self) -> SourceKind {
        match self.r#type.as_str() {
            "git" => SourceKind::Git,
            "http" => SourceKind::Http,
            "local" => SourceKind::Local,
            other => SourceKind::Unknown(other.to_string()),
        }
    }

    /// Content address of the source: hex sha256 of `type|url|version`
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.r#type.as_bytes());
        hasher.update(b"|");
        hasher.update(self.url.as_bytes());
        hasher.update(b"|");
        hasher.update(self.version.as_deref().unwrap_or_default().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Sub-directory with surrounding slashes trimmed, if set
    pub fn sub_path(&self) -> Option<&str> {
        self.path
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
    }

    /// Locator used for `source = "..."` in rendered terraform
    ///
    /// git: `git::<url>[//<path>][?ref=<version>]`; anything else: the raw URL plus `//<path>`.
    pub fn locator(&self) -> String {
        let sub_path = self.sub_path().map(|p| format!("//{p}")).unwrap_or_default();
        match self.kind() {
            SourceKind::Git => match self.version.as_deref().filter(|v| !v.is_empty()) {
                Some(version) => format!("git::{}{sub_path}?ref={version}", self.url),
                None => format!("git::{}{sub_path}", self.url),
            },
            _ => format!("{}{sub_path}", self.url),
        }
    }
}

/// Observed interface of the module
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<ModuleInput>,
    #[serde(default)]
    pub outputs: Vec<ModuleOutput>,
    #[serde(default)]
    pub providers: Vec<ModuleProvider>,
    #[serde(default)]
    pub requirements: ModuleRequirements,
    #[serde(default)]
    pub resources: Vec<ModuleResource>,
    #[serde(default)]
    pub submodules: Vec<ModuleSubmodule>,
    #[serde(default)]
    pub conditions: Conditions,
    /// Time the interface was last published (RFC3339)
    #[serde(default)]
    pub last_synced: Option<String>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Earliest time a failed fetch/parse is retried for the same generation (RFC3339)
    #[serde(default)]
    pub next_retry_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInput {
    pub name: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_value")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleOutput {
    pub name: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleProvider {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Terraform and provider version constraints
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct ModuleRequirements {
    #[serde(default)]
    pub terraform: TerraformRequirement,
    #[serde(default)]
    pub required_providers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct TerraformRequirement {
    #[serde(default)]
    pub required_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct ModuleResource {
    pub name: String,
    pub r#type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct ModuleSubmodule {
    pub name: String,
    pub source: String,
}

impl ModuleStatus {
    /// Stored source hash, if the module has synced before
    pub fn source_hash(&self) -> Option<&str> {
        self.conditions
            .find(CONDITION_SOURCE_HASH)
            .map(|c| c.status.as_str())
    }

    /// Whether the module has published its interface at least once
    pub fn is_populated(&self) -> bool {
        self.last_synced.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.conditions.is_true(CONDITION_READY)
    }

    pub fn required_inputs(&self) -> impl Iterator<Item = &ModuleInput> {
        self.inputs.iter().filter(|input| input.required)
    }
}
