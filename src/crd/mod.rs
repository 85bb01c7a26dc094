//! # Custom Resource Definitions
//!
//! CRD types for the astrolabe operator.
//!
//! ## Module Structure
//!
//! - `condition.rs` - Condition type and the upsert-by-type condition list
//! - `module.rs` - Module: a terraform module source and its published interface
//! - `backend_config.rs` - BackendConfig: terraform state backend settings
//! - `cloud_credentials.rs` - CloudCredentials: indirection to a credential secret
//! - `stack.rs` - Stack: a set of module instances applied together, plus its phase table
//! - `schema.rs` - schema overrides for opaque JSON fields

mod backend_config;
mod cloud_credentials;
mod condition;
mod module;
mod schema;
mod stack;

pub use backend_config::{BackendConfig, BackendConfigSpec, BackendConfigStatus, CredentialReference};
pub use cloud_credentials::{CloudCredentials, CloudCredentialsSpec, SecretReference};
pub use condition::{
    Condition, Conditions, CONDITION_FALSE, CONDITION_READY, CONDITION_SOURCE_HASH, CONDITION_TRUE,
};
pub use module::{
    Module, ModuleInput, ModuleOutput, ModuleProvider, ModuleRequirements, ModuleResource,
    ModuleSource, ModuleSpec, ModuleStatus, ModuleSubmodule, SourceKind, TerraformRequirement,
};
pub use stack::{
    BackendReference, CredentialKind, InlineBackendConfig, Stack, StackCredentialRef, StackModule,
    StackPhase, StackResource, StackSpec, StackStatus, STATUS_IN_PROGRESS, STATUS_SUCCESS,
};
