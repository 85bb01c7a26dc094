//! # CRD Generator
//!
//! Prints the CustomResourceDefinitions for Module, BackendConfig, CloudCredentials and
//! Stack as one multi-document YAML stream.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/astrolabe.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use astrolabe_operator::crd::{BackendConfig, CloudCredentials, Module, Stack};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::CustomResourceExt;

fn main() {
    let crds: [CustomResourceDefinition; 4] = [
        Module::crd(),
        BackendConfig::crd(),
        CloudCredentials::crd(),
        Stack::crd(),
    ];

    println!("# This file is auto-generated by crdgen");
    println!("# DO NOT EDIT THIS FILE MANUALLY");
    println!("# Change the types under src/crd/ and regenerate");
    for crd in &crds {
        match serde_yaml::to_string(crd) {
            Ok(yaml) => {
                println!("---");
                print!("{yaml}");
            }
            Err(e) => {
                eprintln!("Failed to serialize CRD to YAML: {e}");
                std::process::exit(1);
            }
        }
    }
}
