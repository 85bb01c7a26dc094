//! # Reconciler
//!
//! Reconcilers for the astrolabe custom resources.
//!
//! ## Module Structure
//!
//! - `types.rs` - Reconciler context, store handles and error types
//! - `status.rs` - conflict-retrying status updates and the retry gate
//! - `finalizer.rs` - race-safe finalizer add/remove
//! - `notify.rs` - notification sink (Events) with deduplication
//! - `module/` - Module reconciliation (fetch, introspect, publish)
//! - `backend_config.rs` - BackendConfig validation
//! - `stack/` - Stack reconciliation (resolve, render, run, destroy)

pub mod backend_config;
pub mod finalizer;
pub mod module;
pub mod notify;
pub mod stack;
pub mod status;
pub mod types;

pub use backend_config::reconcile_backend_config;
pub use module::reconcile_module;
pub use stack::reconcile_stack;
pub use types::{resource_key, Failure, Reconciler, ReconcilerError, Stores};
