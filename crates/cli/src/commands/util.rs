use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use codematch_core::config::{load_config, AppConfig};
use codematch_core::queue::WorkQueue;
use codematch_core::storage::{open_storage, Storage};
use serde::Serialize;

use crate::{canonicalize_or_current, config_path};

/// Resolve `root` and load its config file.
pub fn load_root_config(root: &str) -> Result<(PathBuf, AppConfig)> {
    let root_path = canonicalize_or_current(root)?;
    let path = config_path(&root_path);
    if !path.exists() {
        return Err(anyhow!(
            "No codematch config at {} (run `codematch init` first)",
            path.display()
        ));
    }
    let config = load_config(&path)?;
    Ok((root_path, config))
}

/// Load the config under `root` and open its storage backend.
pub fn open_root_storage(root: &str) -> Result<Box<dyn Storage>> {
    let (_root, config) = load_root_config(root)?;
    open_storage(&config.storage)
}

/// Load the config under `root` and open its work queue.
///
/// `consumer` overrides the configured consumer id.
pub fn open_root_queue(root: &str, consumer: Option<String>) -> Result<WorkQueue> {
    let (root_path, config) = load_root_config(root)?;
    let mut queue_config = config.queue.ok_or_else(|| {
        anyhow!("No queue configured in {}", config_path(&root_path).display())
    })?;
    if consumer.is_some() {
        queue_config.consumer_id = consumer;
    }
    WorkQueue::open(&queue_config).with_context(|| {
        format!("Failed to open work queue at {}", queue_config.path.display())
    })
}

/// Pretty-print any serializable value to stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    println!("{serialized}");
    Ok(())
}

/// Resolve `path` against `root` unless it is absolute.
pub fn resolve_under(root: &Path, path: &str) -> PathBuf {
    let input = Path::new(path);
    if input.is_absolute() {
        input.to_path_buf()
    } else {
        root.join(input)
    }
}
