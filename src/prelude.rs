//! # Prelude
//!
//! Re-exports commonly used types and traits.
//!
//! ```rust
//! use astrolabe_operator::prelude::*;
//! ```

// CRD types
pub use crate::crd::*;

// Reconciler context, error types and entry points
pub use crate::controller::reconciler::{
    reconcile_backend_config, reconcile_module, reconcile_stack, Failure, Reconciler,
    ReconcilerError, Stores,
};

// Collaborator seams
pub use crate::controller::reconciler::module::{Introspector, ModuleInterface, SourceFetcher};
pub use crate::controller::reconciler::notify::NotificationSink;
pub use crate::controller::reconciler::stack::{Step, StepRunner};

pub use crate::config::ControllerConfig;
pub use crate::store::{KubeStore, MemoryStore, ObjectStore, StoreError};
