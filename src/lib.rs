//! Astrolabe Operator Library
//!
//! Kubernetes operator that publishes the interface of terraform modules (`Module`), validates
//! state backends (`BackendConfig`) and applies sets of module instances (`Stack`) with
//! `terraform`.
//!
//! ## Quick Start
//!
//! ```rust
//! use astrolabe_operator::prelude::*;
//! ```
//!
//! Tests live next to the code they cover, plus end-to-end reconciler tests under `tests/`.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
pub mod server;
pub mod store;
