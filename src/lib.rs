pub mod config_core;
pub mod connections;
pub mod db;
pub mod documents;
pub mod errors;
pub mod grid;
pub mod models;
pub mod tenant_config;

pub use crate::config_core::ConfigCore;
pub use crate::documents::{DocumentPersistence, VersionedDocumentStore};
pub use crate::errors::{AppError, AppResult};
pub use crate::grid::pack_cards;
pub use crate::tenant_config::{ConnectionConfigPersistence, TenantConfigService};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the global JSON subscriber writing to a daily rolling file under
/// `data_dir/logs`. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(data_dir: &Path) -> AppResult<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "dashboard-config.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
