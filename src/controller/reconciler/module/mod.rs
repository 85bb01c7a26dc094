//! # Module Reconciliation
//!
//! Fetch a module source, introspect it, publish its interface to status.
//!
//! - `fetch.rs`: source fetching (git, http archives)
//! - `introspect.rs`: terraform-docs invocation and document parsing
//! - `reconcile.rs`: the reconcile loop, gated by the source hash

mod fetch;
mod introspect;
mod reconcile;

pub use fetch::{archive_extension, CommandFetcher, FetchError, SourceFetcher, GZIP_OUTPUT_FILE};
pub use introspect::{parse_document, IntrospectError, Introspector, ModuleInterface, TerraformDocs};
pub use reconcile::reconcile_module;

/// Progress of one module sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Pending,
    Cloning,
    Cloned,
    CloneFailed,
    Parsing,
    Parsed,
    ParseFailed,
    Ready,
}

impl ModuleState {
    /// Also used as the Ready condition reason for the failure states
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleState::Pending => "Pending",
            ModuleState::Cloning => "Cloning",
            ModuleState::Cloned => "Cloned",
            ModuleState::CloneFailed => "CloneFailed",
            ModuleState::Parsing => "Parsing",
            ModuleState::Parsed => "Parsed",
            ModuleState::ParseFailed => "ParseFailed",
            ModuleState::Ready => "Ready",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ModuleState::CloneFailed | ModuleState::ParseFailed)
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
