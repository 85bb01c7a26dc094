//! # Runtime
//!
//! Process bootstrap and the controller loops.
//!
//! - `initialization.rs`: crypto provider, tracing, metrics, HTTP server, client, startup summary
//! - `watch_loop.rs`: one `kube_runtime::Controller` per reconciled kind, restarted on stream end
//! - `error_policy.rs`: per-resource backoff for reconcile errors and watch error classification

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
