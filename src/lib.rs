pub mod api;
pub mod approval;
pub mod audit;
pub mod auth;
pub mod blobstore;
pub mod canonical;
pub mod config;
pub mod core_state;
pub mod db;
pub mod export;
pub mod inference;
pub mod maintenance;
pub mod memory;
pub mod models;
pub mod money;
pub mod pipeline;

mod logging_audit;

use tracing_subscriber::EnvFilter;

/// Initialize tracing from the config filter, overridable via
/// `KONTURA_LOG` (handled by the config loader's env shadowing).
pub fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
}
