//! # Stack Reconciliation
//!
//! Applies a Stack: resolve dependencies, validate bindings, render the workspace, run
//! `init → plan → apply`, then publish outputs and resources from state. Deletion runs
//! `destroy` behind a finalizer.
//!
//! - `resolve.rs`: backend, credentials and module lookup
//! - `variables.rs`: instance names, `dependsOn` and required inputs
//! - `render.rs`: `backend.tf`, `main.tf`, `outputs.tf`
//! - `runner.rs`: the [`StepRunner`] seam and its terraform implementation
//! - `state.rs`: state document parsing
//! - `phase.rs`: guarded phase writes and their events
//! - `reconcile.rs`: the apply path
//! - `delete.rs`: the destroy path

mod delete;
mod phase;
mod reconcile;
mod render;
mod resolve;
mod runner;
mod state;
mod variables;

pub use reconcile::{reconcile_stack, APPLIED_SUMMARY};
pub use render::{
    default_state_key, hcl_value, quote, render_backend, render_main, render_outputs,
    render_workspace, RenderedWorkspace, BACKEND_FILE, MAIN_FILE, OUTPUTS_FILE,
};
pub use resolve::{ResolvedBackend, ResolvedModule, ResolvedStack};
pub use runner::{Step, StepError, StepRunner, TerraformRunner};
pub use state::{parse_state, StateParseError, StateSummary};
pub use variables::{decode_variables, is_identifier, validate_modules};

use crate::controller::reconciler::types::{Failure, ReconcilerError};
use crate::store::StoreError;
use thiserror::Error;

/// Outcome of a stack pipeline stage: a failure to record in status, or an error for the
/// error policy
#[derive(Debug, Error)]
pub enum StackError {
    #[error("{0}")]
    Failed(Failure),
    #[error(transparent)]
    Reconciler(#[from] ReconcilerError),
}

impl From<Failure> for StackError {
    fn from(failure: Failure) -> Self {
        StackError::Failed(failure)
    }
}

impl From<StoreError> for StackError {
    fn from(error: StoreError) -> Self {
        StackError::Reconciler(error.into())
    }
}
