//! # Controller
//!
//! - `backoff`: Fibonacci backoff for reconcile errors
//! - `reconciler`: Module, BackendConfig and Stack reconciliation
//!
//! The `crdgen` binary also lives here (`src/controller/crdgen.rs`) but is not part of the library.

pub mod backoff;
pub mod reconciler;
