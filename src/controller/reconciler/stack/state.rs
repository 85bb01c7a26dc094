//! # State Extraction
//!
//! Reads the JSON document `terraform state pull` prints and keeps the two things a Stack
//! publishes in its status:
//!
//! - **outputs**: root output name to value. Outputs terraform marks sensitive are
//!   published as [`REDACTED`] rather than their value.
//! - **resources**: full resource addresses, sorted and deduplicated. A resource inside a
//!   module keeps its module path (`module.vpc.aws_vpc.this`), so the same `type.name`
//!   in two modules is listed twice.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateParseError {
    #[error("failed to read state: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to parse state: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSummary {
    pub outputs: Map<String, Value>,
    pub resources: Vec<String>,
}

#[derive(Deserialize)]
struct StateDocument {
    #[serde(default)]
    outputs: BTreeMap<String, StateOutput>,
    #[serde(default)]
    resources: Vec<StateResource>,
}

/// Stands in for the value of a sensitive output
pub const REDACTED: &str = "(sensitive)";

#[derive(Deserialize)]
struct StateOutput {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    sensitive: bool,
}

#[derive(Deserialize)]
struct StateResource {
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    r#type: String,
    name: String,
}

impl StateResource {
    /// `[module.<m>.]<type>.<name>`, with `data.` in front of the type for data sources
    fn address(&self) -> String {
        let local = match self.mode.as_deref() {
            Some("data") => format!("data.{}.{}", self.r#type, self.name),
            _ => format!("{}.{}", self.r#type, self.name),
        };
        match self.module.as_deref() {
            Some(module) if !module.is_empty() => format!("{module}.{local}"),
            _ => local,
        }
    }
}

/// Parse a pulled state document. Unknown fields are ignored and missing `outputs` or
/// `resources` read as empty.
pub fn parse_state(raw: &[u8]) -> Result<StateSummary, StateParseError> {
    let document: StateDocument = serde_json::from_slice(raw)?;

    let outputs = document
        .outputs
        .into_iter()
        .map(|(name, output)| {
            let value = if output.sensitive {
                Value::String(REDACTED.to_string())
            } else {
                output.value
            };
            (name, value)
        })
        .collect();

    let mut resources: Vec<String> = document.resources.iter().map(StateResource::address).collect();
    resources.sort();
    resources.dedup();

    Ok(StateSummary { outputs, resources })
}
