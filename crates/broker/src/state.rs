use std::sync::Arc;

use relay_core::store::JobStore;
use relay_core::transfer::FileTransfer;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Job store and lease state machine.
    pub store: Arc<JobStore>,
    /// Transfer mappings and result upload commit.
    pub transfer: Arc<FileTransfer>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Build fresh, empty state from configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            store: Arc::new(JobStore::new(config.lease_config())),
            transfer: Arc::new(FileTransfer::new(config.transfer_config())),
            config: Arc::new(config),
        }
    }
}
