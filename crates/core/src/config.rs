//! Configuration consumed by the storage engine and the work queue.
//!
//! Config files are JSON (or YAML when the extension is `.yaml`/`.yml`).
//! Every field has a default, so `{}` is a valid config selecting the
//! in-memory backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Which storage backend to open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMethod {
    #[default]
    Memory,
    Sqlite,
}

impl StorageMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMethod::Memory => "memory",
            StorageMethod::Sqlite => "sqlite",
        }
    }
}

impl std::str::FromStr for StorageMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StorageMethod::Memory),
            "sqlite" => Ok(StorageMethod::Sqlite),
            other => Err(anyhow::anyhow!(
                "Invalid storage method '{}'. Allowed: memory, sqlite",
                other
            )),
        }
    }
}

/// LSH banding scheme: band width -> number of bands of that width.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BandConfig {
    /// Signature components per band mapped to how many such bands to build.
    #[serde(default = "default_bands")]
    pub bands: BTreeMap<usize, usize>,
    /// Seed for choosing which signature positions fall into which band.
    #[serde(default = "default_band_seed")]
    pub seed: u64,
    /// Expected number of components in a MinHash signature.
    #[serde(default = "default_signature_length")]
    pub signature_length: usize,
}

impl BandConfig {
    pub fn new(bands: BTreeMap<usize, usize>, seed: u64) -> Self {
        Self { bands, seed, signature_length: default_signature_length() }
    }

    pub fn with_signature_length(mut self, signature_length: usize) -> Self {
        self.signature_length = signature_length;
        self
    }
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            bands: default_bands(),
            seed: default_band_seed(),
            signature_length: default_signature_length(),
        }
    }
}

fn default_bands() -> BTreeMap<usize, usize> {
    BTreeMap::from([(4, 10), (5, 10), (6, 10)])
}

fn default_band_seed() -> u64 {
    0xDEAD_BEEF
}

fn default_signature_length() -> usize {
    64
}

/// Storage backend selection and behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub method: StorageMethod,
    /// Database file for the sqlite backend, relative to the config file if not absolute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Store an empty xcfg payload at ingestion time.
    #[serde(default)]
    pub drop_disassembly: bool,
    #[serde(default)]
    pub bands: BandConfig,
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self { method: StorageMethod::Sqlite, path: Some(path.into()), ..Self::default() }
    }

    pub fn with_bands(mut self, bands: BandConfig) -> Self {
        self.bands = bands;
        self
    }
}

/// Work queue location and lease policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Database file holding the job collection.
    pub path: PathBuf,
    /// Job collection (table) name.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Identifier recorded in `locked_by` for jobs this consumer claims.
    /// Unset means every opened queue generates its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    /// Seconds after which a held lease may be claimed by another consumer.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    /// Attempts granted to every new job.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl QueueConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            collection: default_collection(),
            consumer_id: None,
            lease_timeout_secs: default_lease_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_collection() -> String {
    "jobs".to_string()
}

fn default_lease_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

/// Top-level config file contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueConfig>,
}

impl AppConfig {
    /// Resolve relative paths against `base` (usually the config file's directory).
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        if let Some(path) = self.storage.path.as_mut() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        if let Some(queue) = self.queue.as_mut() {
            if queue.path.is_relative() {
                queue.path = base.join(&queue.path);
            }
        }
        self
    }
}

/// Load an [`AppConfig`] from disk, resolving relative paths against its directory.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    let is_yaml =
        matches!(path.extension().and_then(|ext| ext.to_str()), Some("yaml") | Some("yml"));
    let config: AppConfig = if is_yaml {
        serde_yaml::from_str(&contents).context("Failed to parse YAML config")?
    } else {
        serde_json::from_str(&contents).context("Failed to parse config JSON")?
    };
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok(config.resolve_paths(&base))
}

/// Write an [`AppConfig`] as pretty JSON.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write config at {}", path.display()))?;
    Ok(())
}
