use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use codematch_core::config::{save_config, AppConfig, QueueConfig, StorageConfig, StorageMethod};
use codematch_core::storage::open_storage;

use crate::commands::{load_root_config, print_json};
use crate::{canonicalize_or_current, config_path};

/// Default database file names, relative to the root.
pub const DEFAULT_STORAGE_DB: &str = "codematch.db";
pub const DEFAULT_QUEUE_DB: &str = "queue.db";

/// Write `codematch.json` under `root` and create the databases it names.
pub fn init_command(
    root: &str,
    method: StorageMethod,
    db: Option<String>,
    queue_db: Option<String>,
    force: bool,
) -> Result<()> {
    let root_path = canonicalize_or_current(root)?;
    fs::create_dir_all(&root_path)
        .with_context(|| format!("Failed to create root dir: {}", root_path.display()))?;

    let path = config_path(&root_path);
    if path.exists() && !force {
        return Err(anyhow!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        ));
    }

    let storage = match method {
        StorageMethod::Memory => StorageConfig::memory(),
        StorageMethod::Sqlite => {
            StorageConfig::sqlite(db.unwrap_or_else(|| DEFAULT_STORAGE_DB.to_string()))
        }
    };
    let queue = QueueConfig::new(queue_db.unwrap_or_else(|| DEFAULT_QUEUE_DB.to_string()));
    let config = AppConfig { storage, queue: Some(queue) };
    save_config(&path, &config)?;

    // Resolve relative paths the same way later loads will, then create the
    // databases so follow-on commands can rely on them.
    let resolved = config.clone().resolve_paths(&root_path);
    open_storage(&resolved.storage)?;
    if let Some(queue) = &resolved.queue {
        if let Some(parent) = queue.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create queue dir: {}", parent.display()))?;
        }
        codematch_core::queue::WorkQueue::open(queue).with_context(|| {
            format!("Failed to initialize work queue at {}", queue.path.display())
        })?;
    }

    println!("Initialized codematch:");
    println!("  Root: {}", root_path.display());
    println!("  Config: {}", path.display());
    println!("  Storage: {}", config.storage.method.as_str());
    if let Some(db_path) = &config.storage.path {
        println!("  Storage DB (relative): {}", db_path.display());
    }
    if let Some(queue) = &config.queue {
        println!("  Queue DB (relative): {}", queue.path.display());
    }

    Ok(())
}

/// Show the resolved configuration under `root`.
pub fn info_command(root: &str, json: bool) -> Result<()> {
    let (root_path, config) = load_root_config(root)?;

    if json {
        return print_json(&config);
    }

    println!("codematch v{}", codematch_core::version());
    println!("Root: {}", root_path.display());
    println!("Config file: {}", config_path(&root_path).display());
    println!("Storage method: {}", config.storage.method.as_str());
    print_path_status("Storage DB", config.storage.path.as_ref());
    println!("Drop disassembly: {}", config.storage.drop_disassembly);
    println!(
        "Bands: {} (seed {:#x}, signature length {})",
        config
            .storage
            .bands
            .bands
            .iter()
            .map(|(width, count)| format!("{count}x{width}"))
            .collect::<Vec<_>>()
            .join(", "),
        config.storage.bands.seed,
        config.storage.bands.signature_length
    );
    match &config.queue {
        Some(queue) => {
            print_path_status("Queue DB", Some(&queue.path));
            println!("Queue collection: {}", queue.collection);
            println!("Lease timeout: {}s", queue.lease_timeout_secs);
            println!("Max attempts: {}", queue.max_attempts);
        }
        None => println!("Queue: (not configured)"),
    }

    Ok(())
}

fn print_path_status(label: &str, path: Option<&PathBuf>) {
    match path {
        Some(path) => {
            let status = if path.is_file() { "OK" } else { "MISSING" };
            println!("{label}: {status} ({})", path.display());
        }
        None => println!("{label}: -"),
    }
}
