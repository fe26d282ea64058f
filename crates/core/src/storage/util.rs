use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::config::{StorageConfig, StorageMethod};
use crate::storage::{MemoryStorage, SqliteStorage, Storage};

/// Build the backend selected by `config.method`.
///
/// The sqlite backend needs `config.path`; its parent directory is created
/// if missing.
pub fn open_storage(config: &StorageConfig) -> Result<Box<dyn Storage>> {
    match config.method {
        StorageMethod::Memory => {
            debug!("opening in-memory storage");
            Ok(Box::new(MemoryStorage::new(config)))
        }
        StorageMethod::Sqlite => {
            let Some(path) = config.path.as_deref() else {
                bail!("sqlite storage requires a database path");
            };
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create storage directory {}", parent.display())
                })?;
            }
            debug!(path = %path.display(), "opening sqlite storage");
            let storage = SqliteStorage::open(path, config).with_context(|| {
                format!("Failed to open storage database at {}", path.display())
            })?;
            Ok(Box::new(storage))
        }
    }
}
