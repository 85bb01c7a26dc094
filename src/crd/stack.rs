//! # Stack
//!
//! A set of module instances applied together against one state backend.
//!
//! [`StackPhase`] is the closed set of lifecycle phases; [`StackPhase::allows`] is the
//! transition table the reconciler consults before writing a phase.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::condition::Conditions;
use super::schema::{preserve_unknown_object, preserve_unknown_value};

/// Machine status while the pipeline is running
pub const STATUS_IN_PROGRESS: &str = "InProgress";
/// Machine status after a successful apply
pub const STATUS_SUCCESS: &str = "Success";

/// Stack Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: astrolabe.io/v1
/// kind: Stack
/// metadata:
///   name: network
///   namespace: platform
/// spec:
///   backendRef:
///     name: s3-state
///   credentialRef:
///     name: aws-deployer
///   modules:
///     - name: vpc
///       variables:
///         region: eu-west-1
///         azs: ["eu-west-1a", "eu-west-1b"]
///     - name: endpoints
///       dependsOn: [vpc]
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Stack",
    group = "astrolabe.io",
    version = "v1",
    namespaced,
    status = "StackStatus",
    shortname = "stk",
    printcolumn = r#"{"name":"MODULES", "type":"string", "jsonPath":".spec.modules[*].name"}, {"name":"PHASE", "type":"string", "jsonPath":".status.phase"}, {"name":"STATUS", "type":"string", "jsonPath":".status.status"}, {"name":"READY", "type":"boolean", "jsonPath":".status.ready"}, {"name":"AGE", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    /// Backend declared inline; takes precedence over `backendRef`
    #[serde(default)]
    pub backend_config: Option<InlineBackendConfig>,
    /// BackendConfig in the same namespace
    #[serde(default)]
    pub backend_ref: Option<BackendReference>,
    /// Credentials injected into every terraform step
    #[serde(default)]
    pub credential_ref: Option<StackCredentialRef>,
    #[serde(default)]
    pub modules: Vec<StackModule>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InlineBackendConfig {
    pub r#type: String,
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_value")]
    pub settings: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendReference {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackCredentialRef {
    pub name: String,
    #[serde(default)]
    pub kind: CredentialKind,
}

/// What `credentialRef.name` points at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum CredentialKind {
    /// A Secret in the Stack's namespace
    #[default]
    Secret,
    /// A CloudCredentials in the Stack's namespace
    CloudCredentials,
}

/// One module instance in the stack
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackModule {
    /// Instance name, used as `module "<name>"`
    pub name: String,
    /// Module resource to instantiate; defaults to `name`
    #[serde(default)]
    pub module_ref: Option<String>,
    /// Input bindings, keyed by input name
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub variables: Option<serde_json::Value>,
    /// Instance names this instance must be applied after
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl StackModule {
    pub fn module_name(&self) -> &str {
        self.module_ref
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.name)
    }
}

/// Lifecycle phase of a Stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema)]
pub enum StackPhase {
    Reconciling,
    Init,
    Plan,
    Apply,
    #[serde(alias = "Ready")]
    Applied,
    Error,
    Destroying,
    Destroyed,
}

impl StackPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StackPhase::Reconciling => "Reconciling",
            StackPhase::Init => "Init",
            StackPhase::Plan => "Plan",
            StackPhase::Apply => "Apply",
            StackPhase::Applied => "Applied",
            StackPhase::Error => "Error",
            StackPhase::Destroying => "Destroying",
            StackPhase::Destroyed => "Destroyed",
        }
    }

    /// Transition table. `from` is `None` for a Stack that has never been reconciled.
    pub fn allows(from: Option<StackPhase>, to: StackPhase) -> bool {
        use StackPhase::{Applied, Apply, Destroyed, Destroying, Error, Init, Plan, Reconciling};

        let Some(from) = from else {
            return matches!(to, Reconciling | Destroying);
        };
        if from == to {
            return true;
        }
        match to {
            Reconciling => !matches!(from, Destroying | Destroyed),
            Init => from == Reconciling,
            Plan => from == Init,
            Apply => from == Plan,
            Applied => from == Apply,
            Error => !matches!(from, Applied | Destroyed),
            Destroying => from != Destroyed,
            Destroyed => from == Destroying,
        }
    }
}

impl fmt::Display for StackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackStatus {
    #[serde(default)]
    pub phase: Option<StackPhase>,
    /// Machine-readable outcome: InProgress, Success or a failure reason
    #[serde(default)]
    pub status: Option<String>,
    /// Human-readable summary, including captured tool output on failure
    #[serde(default)]
    pub summary: Option<String>,
    /// Terraform outputs, name to value
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_value")]
    pub outputs: Option<serde_json::Value>,
    #[serde(default)]
    pub resources: Vec<StackResource>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Earliest time a failed attempt is retried for the same generation (RFC3339)
    #[serde(default)]
    pub next_retry_time: Option<String>,
}

/// A resource recorded in terraform state, as `type.name`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct StackResource {
    pub name: String,
}

impl Stack {
    pub fn phase(&self) -> Option<StackPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Applied with status Success for the current generation
    pub fn is_applied(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.phase == Some(StackPhase::Applied)
                && s.status.as_deref() == Some(STATUS_SUCCESS)
                && s.observed_generation == self.metadata.generation
        })
    }
}
