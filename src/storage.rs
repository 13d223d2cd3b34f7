use std::sync::Arc;

pub use susu_ledger_core::{StorageBackend, StorageError};
pub use susu_ledger_memory::InMemoryStorage;
pub use susu_ledger_sqlite::SqliteStorage;

use crate::config::{StorageConfig, StorageKind};

/// Opens the backend selected in configuration.
pub fn open_backend(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match config.backend {
        StorageKind::Memory => {
            tracing::info!("Using in-memory storage");
            Ok(Arc::new(InMemoryStorage::new()))
        }
        StorageKind::Sqlite => {
            tracing::info!(path = %config.path, "Using SQLite storage");
            Ok(Arc::new(SqliteStorage::new(&config.path)?))
        }
    }
}
