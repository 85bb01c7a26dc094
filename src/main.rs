//! # Astrolabe Operator
//!
//! Watches Module, BackendConfig and Stack resources and reconciles them with `terraform`.
//!
//! Configuration comes from the environment; see `config/controller.rs` for the variables.

use astrolabe_operator::runtime::initialization::initialize;
use astrolabe_operator::runtime::watch_loop::run_controllers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let init = initialize().await?;
    run_controllers(init.client, init.reconciler, init.server_state).await
}
