//! # Workspace Rendering
//!
//! Renders `backend.tf`, `main.tf` and `outputs.tf` for a resolved Stack. Output is
//! deterministic: settings and variables are written in sorted key order.

use super::resolve::{ResolvedBackend, ResolvedModule};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::path::Path;
use tracing::warn;

pub const BACKEND_FILE: &str = "backend.tf";
pub const MAIN_FILE: &str = "main.tf";
pub const OUTPUTS_FILE: &str = "outputs.tf";

/// Backends whose state location is a `key` setting
const KEYED_BACKENDS: &[&str] = &["s3", "azurerm"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedWorkspace {
    pub backend: String,
    pub main: String,
    pub outputs: String,
}

impl RenderedWorkspace {
    /// Write the three files into `dir`, creating it if needed. Other files (`.terraform`,
    /// lock files, local state) are left alone.
    pub async fn write_to(&self, dir: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(BACKEND_FILE), &self.backend).await?;
        tokio::fs::write(dir.join(MAIN_FILE), &self.main).await?;
        tokio::fs::write(dir.join(OUTPUTS_FILE), &self.outputs).await?;
        Ok(())
    }
}

/// Render all three files. Setting and variable names must already be valid identifiers;
/// resolution and validation reject anything else before rendering.
pub fn render_workspace(
    backend: &ResolvedBackend,
    modules: &[ResolvedModule],
    bindings: &[Map<String, Value>],
    namespace: &str,
    stack_name: &str,
    key_prefix: &str,
) -> Result<RenderedWorkspace, fmt::Error> {
    Ok(RenderedWorkspace {
        backend: render_backend(backend, namespace, stack_name, key_prefix)?,
        main: render_main(modules, bindings)?,
        outputs: render_outputs(modules)?,
    })
}

/// State key used when a keyed backend has none: `<prefix>/<namespace>/<stack>.tfstate`
pub fn default_state_key(prefix: &str, namespace: &str, stack_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{namespace}/{stack_name}.tfstate")
    } else {
        format!("{prefix}/{namespace}/{stack_name}.tfstate")
    }
}

/// The `terraform { backend "<type>" { ... } }` block.
///
/// `s3` and `azurerm` get a derived `key` when the settings carry none.
pub fn render_backend(
    backend: &ResolvedBackend,
    namespace: &str,
    stack_name: &str,
    key_prefix: &str,
) -> Result<String, fmt::Error> {
    let mut settings = backend.settings.clone();
    if KEYED_BACKENDS.contains(&backend.r#type.as_str()) && !settings.contains_key("key") {
        settings.insert(
            "key".to_string(),
            Value::String(default_state_key(key_prefix, namespace, stack_name)),
        );
    }

    let mut out = String::new();
    out.push_str("terraform {\n");
    writeln!(out, "  backend {} {{", quote(&backend.r#type))?;
    let mut keys: Vec<&String> = settings.keys().collect();
    keys.sort();
    for key in keys {
        let value = &settings[key];
        // Booleans and numbers verbatim; lists and maps as JSON, which HCL also accepts
        let rendered = match value {
            Value::String(s) => quote(s),
            other => other.to_string(),
        };
        writeln!(out, "    {key} = {rendered}")?;
    }
    out.push_str("  }\n}\n");
    Ok(out)
}

/// One `module` block per instance, in declaration order, with its bindings sorted by name
pub fn render_main(
    modules: &[ResolvedModule],
    bindings: &[Map<String, Value>],
) -> Result<String, fmt::Error> {
    let mut out = String::new();
    for (module, variables) in modules.iter().zip(bindings) {
        writeln!(out, "module {} {{", quote(module.name()))?;
        writeln!(out, "  source = {}", quote(&module.module.spec.source.locator()))?;

        let mut names: Vec<&String> = variables.keys().collect();
        names.sort();
        for name in names {
            writeln!(out, "  {name} = {}", hcl_value(&variables[name]))?;
        }

        let depends_on = &module.instance.depends_on;
        if !depends_on.is_empty() {
            let edges: Vec<String> = depends_on.iter().map(|d| format!("module.{d}")).collect();
            writeln!(out, "  depends_on = [{}]", edges.join(", "))?;
        }
        out.push_str("}\n\n");
    }
    Ok(out)
}

/// Root outputs for every output the resolved Modules publish.
///
/// A name published by more than one module is prefixed with the instance name. If the
/// prefixed name still clashes (`vpc` + `id` against another module's own `vpc_id`), every
/// output claiming that name is left out and a warning is logged. Outputs the module marks
/// sensitive stay sensitive at the root.
pub fn render_outputs(modules: &[ResolvedModule]) -> Result<String, fmt::Error> {
    let published = || {
        modules.iter().flat_map(|module| {
            module
                .module
                .status
                .iter()
                .flat_map(|s| &s.outputs)
                .map(move |output| (module, output))
        })
    };

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (_, output) in published() {
        *counts.entry(output.name.as_str()).or_default() += 1;
    }
    let root_names: Vec<String> = published()
        .map(|(module, output)| {
            if counts.get(output.name.as_str()).copied().unwrap_or_default() > 1 {
                format!("{}_{}", module.name(), output.name)
            } else {
                output.name.clone()
            }
        })
        .collect();
    let mut claims: HashMap<&str, usize> = HashMap::new();
    for name in &root_names {
        *claims.entry(name.as_str()).or_default() += 1;
    }

    let mut out = String::new();
    for ((module, output), root_name) in published().zip(&root_names) {
        if claims.get(root_name.as_str()).copied().unwrap_or_default() > 1 {
            warn!(
                output = root_name.as_str(),
                module = module.name(),
                "root output name is claimed more than once, leaving it out"
            );
            continue;
        }
        writeln!(out, "output {} {{", quote(root_name))?;
        writeln!(out, "  value = module.{}.{}", module.name(), output.name)?;
        if output.sensitive {
            out.push_str("  sensitive = true\n");
        }
        out.push_str("}\n\n");
    }
    Ok(out)
}

/// HCL expression for a JSON value
pub fn hcl_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(hcl_value).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{} = {}", quote(k), hcl_value(&map[k])))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
    }
}

/// Quoted HCL string literal; template sequences are escaped so values are taken literally
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
