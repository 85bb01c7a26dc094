//! Validation of the stack's module instances before anything is rendered.
//!
//! Checked in this order, first failure wins:
//!
//! - instance names are identifiers and unique (`InvalidIdentifier`)
//! - `dependsOn` names other existing instances and has no cycle (`InvalidDependsOn`)
//! - per instance, `variables` is an object (`InvalidVariables`) whose keys are
//!   identifiers (`InvalidIdentifier`) and which binds every required input of the
//!   Module (`MissingVariables`)

use super::resolve::ResolvedModule;
use crate::controller::reconciler::types::Failure;
use crate::crd::StackModule;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("identifier pattern is valid")
});

/// Whether `name` can be used as a terraform block label or attribute name
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Decode an instance's bindings; absent means none
pub fn decode_variables(instance: &StackModule) -> Result<Map<String, Value>, Failure> {
    match instance.variables.as_ref() {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(Failure::new(
            "InvalidVariables",
            format!("Module {} variables must be an object", instance.name),
        )),
    }
}

/// Check names, `dependsOn` edges and required inputs; returns each instance's bindings in order.
pub fn validate_modules(modules: &[ResolvedModule]) -> Result<Vec<Map<String, Value>>, Failure> {
    let mut seen = HashSet::new();
    for module in modules {
        let name = module.name();
        if !is_identifier(name) {
            return Err(Failure::new(
                "InvalidIdentifier",
                format!("Module instance name {name:?} is not a valid identifier"),
            ));
        }
        if !seen.insert(name) {
            return Err(Failure::new(
                "InvalidIdentifier",
                format!("Module instance name {name} is used more than once"),
            ));
        }
    }

    validate_depends_on(modules, &seen)?;

    let mut bindings = Vec::with_capacity(modules.len());
    for module in modules {
        let variables = decode_variables(&module.instance)?;
        if let Some(bad) = variables.keys().find(|key| !is_identifier(key)) {
            return Err(Failure::new(
                "InvalidIdentifier",
                format!("Module {} variable name {bad:?} is not a valid identifier", module.name()),
            ));
        }

        let missing: Vec<&str> = module
            .module
            .status
            .iter()
            .flat_map(|status| status.required_inputs())
            .map(|input| input.name.as_str())
            .filter(|input| !variables.contains_key(*input))
            .collect();
        if !missing.is_empty() {
            return Err(Failure::new(
                "MissingVariables",
                format!("Module {} missing variables: {}", module.name(), missing.join(", ")),
            ));
        }
        bindings.push(variables);
    }
    Ok(bindings)
}

fn validate_depends_on(modules: &[ResolvedModule], names: &HashSet<&str>) -> Result<(), Failure> {
    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for module in modules {
        for dependency in &module.instance.depends_on {
            if dependency == module.name() {
                return Err(Failure::new(
                    "InvalidDependsOn",
                    format!("Module {} depends on itself", module.name()),
                ));
            }
            if !names.contains(dependency.as_str()) {
                return Err(Failure::new(
                    "InvalidDependsOn",
                    format!(
                        "Module {} depends on {dependency}, which is not part of the stack",
                        module.name()
                    ),
                ));
            }
            edges.entry(module.name()).or_default().push(dependency);
        }
    }

    // Depth-first search; a node met again while still on the path closes a cycle
    fn visit<'a>(
        node: &'a str,
        edges: &BTreeMap<&'a str, Vec<&'a str>>,
        on_path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Option<Vec<&'a str>> {
        if done.contains(node) {
            return None;
        }
        if let Some(pos) = on_path.iter().position(|n| *n == node) {
            let mut cycle = on_path[pos..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        on_path.push(node);
        for &next in edges.get(node).into_iter().flatten() {
            if let Some(cycle) = visit(next, edges, on_path, done) {
                return Some(cycle);
            }
        }
        on_path.pop();
        done.insert(node);
        None
    }

    let mut done = HashSet::new();
    for &node in edges.keys() {
        if let Some(cycle) = visit(node, &edges, &mut Vec::new(), &mut done) {
            return Err(Failure::new(
                "InvalidDependsOn",
                format!("dependsOn forms a cycle: {}", cycle.join(" -> ")),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Module, ModuleInput, ModuleSource, ModuleSpec, ModuleStatus};
    use serde_json::json;

    fn input(name: &str, required: bool) -> ModuleInput {
        ModuleInput {
            name: name.to_string(),
            r#type: "string".to_string(),
            description: None,
            default: None,
            required,
            sensitive: false,
        }
    }

    fn resolved(name: &str, variables: Value, depends_on: &[&str], inputs: Vec<ModuleInput>) -> ResolvedModule {
        let mut module = Module::new(
            name,
            ModuleSpec {
                source: ModuleSource {
                    r#type: "git".to_string(),
                    url: "https://example.com/m.git".to_string(),
                    version: None,
                    path: None,
                },
            },
        );
        module.status = Some(ModuleStatus {
            inputs,
            last_synced: Some("2026-01-01T00:00:00Z".to_string()),
            ..ModuleStatus::default()
        });
        ResolvedModule {
            instance: StackModule {
                name: name.to_string(),
                module_ref: None,
                variables: Some(variables),
                depends_on: depends_on.iter().map(|d| (*d).to_string()).collect(),
            },
            module,
        }
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("vpc"));
        assert!(is_identifier("_private-subnet_2"));
        assert!(!is_identifier("2vpc"));
        assert!(!is_identifier("vpc\" { }"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_required_inputs_must_be_bound() {
        let modules = vec![resolved(
            "vpc",
            json!({"cidr": "10.0.0.0/16"}),
            &[],
            vec![input("region", true), input("azs", true), input("cidr", false)],
        )];
        let failure = validate_modules(&modules).unwrap_err();
        assert_eq!(failure.reason, "MissingVariables");
        assert_eq!(failure.message, "Module vpc missing variables: region, azs");
    }

    #[test]
    fn test_optional_inputs_may_be_omitted() {
        let modules = vec![resolved(
            "vpc",
            json!({"region": "us-east-1"}),
            &[],
            vec![input("region", true), input("cidr", false)],
        )];
        let bindings = validate_modules(&modules).unwrap();
        assert_eq!(bindings[0]["region"], "us-east-1");
    }

    #[test]
    fn test_non_object_variables_are_rejected() {
        let modules = vec![resolved("vpc", json!(["region"]), &[], vec![])];
        assert_eq!(validate_modules(&modules).unwrap_err().reason, "InvalidVariables");
    }

    #[test]
    fn test_depends_on_must_name_stack_members() {
        let modules = vec![
            resolved("vpc", json!({}), &[], vec![]),
            resolved("eks", json!({}), &["network"], vec![]),
        ];
        let failure = validate_modules(&modules).unwrap_err();
        assert_eq!(failure.reason, "InvalidDependsOn");
        assert!(failure.message.contains("network"));
    }

    #[test]
    fn test_depends_on_cycle_is_rejected() {
        let modules = vec![
            resolved("a", json!({}), &["c"], vec![]),
            resolved("b", json!({}), &["a"], vec![]),
            resolved("c", json!({}), &["b"], vec![]),
        ];
        let failure = validate_modules(&modules).unwrap_err();
        assert_eq!(failure.reason, "InvalidDependsOn");
        assert!(failure.message.starts_with("dependsOn forms a cycle: "));
    }

    #[test]
    fn test_duplicate_and_invalid_instance_names() {
        let modules = vec![
            resolved("vpc", json!({}), &[], vec![]),
            resolved("vpc", json!({}), &[], vec![]),
        ];
        assert_eq!(validate_modules(&modules).unwrap_err().reason, "InvalidIdentifier");

        let modules = vec![resolved("my vpc", json!({}), &[], vec![])];
        assert_eq!(validate_modules(&modules).unwrap_err().reason, "InvalidIdentifier");
    }
}
