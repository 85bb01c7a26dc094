//! # CRD Schema Tests
//!
//! The generated CustomResourceDefinitions carry the names and printer columns kubectl uses.

use astrolabe_operator::constants::API_GROUP;
use astrolabe_operator::crd::{BackendConfig, CloudCredentials, Module, Stack};
use kube::core::CustomResourceExt;

#[test]
fn test_crd_names_and_group() {
    let cases = [
        (Module::crd(), "modules.astrolabe.io", "mod"),
        (BackendConfig::crd(), "backendconfigs.astrolabe.io", "bc"),
        (CloudCredentials::crd(), "cloudcredentials.astrolabe.io", "cc"),
        (Stack::crd(), "stacks.astrolabe.io", "stk"),
    ];
    for (crd, name, short) in cases {
        assert_eq!(crd.metadata.name.as_deref(), Some(name));
        assert_eq!(crd.spec.group, API_GROUP);
        assert_eq!(crd.spec.scope, "Namespaced");
        let short_names = crd.spec.names.short_names.unwrap_or_default();
        assert!(short_names.iter().any(|s| s == short), "{name} lacks short name {short}");
    }
}

#[test]
fn test_stack_printer_columns() {
    let crd = Stack::crd();
    let columns: Vec<String> = crd.spec.versions[0]
        .additional_printer_columns
        .iter()
        .flatten()
        .map(|c| c.name.clone())
        .collect();
    assert_eq!(columns, ["MODULES", "PHASE", "STATUS", "READY", "AGE"]);
}

#[test]
fn test_crds_serialize_to_yaml() {
    let yaml = serde_yaml::to_string(&Stack::crd()).unwrap();
    assert!(yaml.contains("kind: CustomResourceDefinition"));
    assert!(yaml.contains("x-kubernetes-preserve-unknown-fields: true"));
}
