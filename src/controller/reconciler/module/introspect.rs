//! # Introspection
//!
//! Runs `terraform-docs json <root>` and turns its document into the module interface
//! published on Module status.

use crate::crd::{
    ModuleInput, ModuleOutput, ModuleProvider, ModuleRequirements, ModuleResource, ModuleSubmodule,
    TerraformRequirement,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IntrospectError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with code {code}: {stderr}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },
    #[error("failed to parse terraform-docs output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Interface of a module as published on its status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleInterface {
    pub description: Option<String>,
    pub inputs: Vec<ModuleInput>,
    pub outputs: Vec<ModuleOutput>,
    pub providers: Vec<ModuleProvider>,
    pub requirements: ModuleRequirements,
    pub resources: Vec<ModuleResource>,
    pub submodules: Vec<ModuleSubmodule>,
}

#[async_trait]
pub trait Introspector: Send + Sync {
    async fn introspect(&self, root: &Path) -> Result<ModuleInterface, IntrospectError>;
}

#[derive(Debug, Clone)]
pub struct TerraformDocs {
    bin: String,
}

impl TerraformDocs {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl Introspector for TerraformDocs {
    async fn introspect(&self, root: &Path) -> Result<ModuleInterface, IntrospectError> {
        debug!(root = %root.display(), "running terraform-docs");
        let output = Command::new(&self.bin)
            .arg("json")
            .arg(root)
            .output()
            .await
            .map_err(|source| IntrospectError::Spawn {
                program: self.bin.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(IntrospectError::Failed {
                program: self.bin.clone(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_document(&output.stdout)
    }
}

// terraform-docs emits `null` for empty sections, so every list is optional here

#[derive(Debug, Default, Deserialize)]
struct DocsDocument {
    #[serde(default)]
    header: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    inputs: Option<Vec<DocsInput>>,
    #[serde(default)]
    outputs: Option<Vec<DocsOutput>>,
    #[serde(default)]
    providers: Option<Vec<DocsProvider>>,
    #[serde(default)]
    requirements: Option<serde_json::Value>,
    #[serde(default)]
    resources: Option<Vec<DocsResource>>,
    #[serde(default)]
    modules: Option<Vec<DocsModule>>,
}

#[derive(Debug, Deserialize)]
struct DocsInput {
    name: String,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    default: Option<serde_json::Value>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    sensitive: bool,
}

#[derive(Debug, Deserialize)]
struct DocsOutput {
    name: String,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    sensitive: bool,
}

#[derive(Debug, Deserialize)]
struct DocsProvider {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DocsResource {
    name: String,
    #[serde(default)]
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct DocsModule {
    name: String,
    #[serde(default)]
    source: String,
}

#[derive(Debug, Default, Deserialize)]
struct DocsRequirements {
    #[serde(default)]
    terraform: Option<DocsTerraformRequirement>,
    #[serde(default)]
    required_providers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct DocsTerraformRequirement {
    #[serde(default)]
    required_version: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Requirements are only read in their object form; the list form yields empty requirements
fn parse_requirements(raw: Option<serde_json::Value>) -> ModuleRequirements {
    let Some(value @ serde_json::Value::Object(_)) = raw else {
        return ModuleRequirements::default();
    };
    let parsed: DocsRequirements = serde_json::from_value(value).unwrap_or_default();
    ModuleRequirements {
        terraform: TerraformRequirement {
            required_version: parsed.terraform.and_then(|t| non_empty(t.required_version)),
        },
        required_providers: parsed.required_providers.unwrap_or_default(),
    }
}

/// Parse a `terraform-docs json` document
pub fn parse_document(raw: &[u8]) -> Result<ModuleInterface, IntrospectError> {
    let docs: DocsDocument = serde_json::from_slice(raw)?;

    let inputs = docs
        .inputs
        .unwrap_or_default()
        .into_iter()
        .map(|input| ModuleInput {
            name: input.name,
            r#type: input.r#type.unwrap_or_default(),
            description: non_empty(input.description),
            default: input.default.filter(|v| !v.is_null()),
            required: input.required,
            sensitive: input.sensitive,
        })
        .collect();
    let outputs = docs
        .outputs
        .unwrap_or_default()
        .into_iter()
        .map(|output| ModuleOutput {
            name: output.name,
            r#type: output.r#type.unwrap_or_default(),
            description: non_empty(output.description),
            sensitive: output.sensitive,
        })
        .collect();
    let providers = docs
        .providers
        .unwrap_or_default()
        .into_iter()
        .map(|p| ModuleProvider {
            name: p.name,
            version: non_empty(p.version),
            source: non_empty(p.source),
        })
        .collect();
    let resources = docs
        .resources
        .unwrap_or_default()
        .into_iter()
        .map(|r| ModuleResource {
            name: r.name,
            r#type: r.r#type,
        })
        .collect();
    let submodules = docs
        .modules
        .unwrap_or_default()
        .into_iter()
        .map(|m| ModuleSubmodule {
            name: m.name,
            source: m.source,
        })
        .collect();

    Ok(ModuleInterface {
        description: non_empty(docs.description).or_else(|| non_empty(docs.header)),
        inputs,
        outputs,
        providers,
        requirements: parse_requirements(docs.requirements),
        resources,
        submodules,
    })
}
