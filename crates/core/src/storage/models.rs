use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ContentHash;

/// `(sample_id, function_id)` of one function carrying a given pichash.
pub type PicHashMatch = (u32, u64);

/// Pichash value mapped to every function carrying it.
pub type PicHashMatches = BTreeMap<u64, BTreeSet<PicHashMatch>>;

/// A named grouping of samples. Id 0 is the empty-name family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FamilyRecord {
    pub family_id: u32,
    pub family_name: String,
}

/// One ingested binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleRecord {
    pub sample_id: u32,
    pub family_id: u32,
    /// Family label, denormalized for display and library info.
    pub family: String,
    pub sha256: ContentHash,
    pub filename: String,
    pub is_library: bool,
    pub version: Option<String>,
    pub bitness: u32,
    pub base_addr: u64,
    /// Total code size across all functions.
    pub binweight: u64,
    pub num_functions: u32,
    /// Ids of the sample's functions, ascending.
    pub function_ids: Vec<u64>,
    pub timestamp: DateTime<Utc>,
}

/// One disassembled function of a sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionRecord {
    pub function_id: u64,
    pub sample_id: u32,
    pub offset: u64,
    pub function_name: Option<String>,
    pub num_instructions: u32,
    /// Size of the normalized code in bytes.
    pub binweight: u32,
    pub pichash: u64,
    /// Extended control-flow graph; `{}` once purged.
    pub xcfg: serde_json::Value,
}

impl FunctionRecord {
    /// Whether the heavy graph payload is still present.
    pub fn has_xcfg(&self) -> bool {
        match &self.xcfg {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => !map.is_empty(),
            _ => true,
        }
    }
}

/// A MinHash signature, optionally bound to a stored function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MinHash {
    pub function_id: Option<u64>,
    pub signature: Vec<u32>,
}

impl MinHash {
    pub fn new(function_id: u64, signature: Vec<u32>) -> Self {
        Self { function_id: Some(function_id), signature }
    }

    /// A signature not bound to any function, e.g. for candidate queries.
    pub fn unbound(signature: Vec<u32>) -> Self {
        Self { function_id: None, signature }
    }
}

/// Family and version of a sample flagged as a library.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibraryInfo {
    pub family: String,
    pub version: Option<String>,
}

/// Record counts across the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StorageStats {
    pub num_families: u64,
    pub num_samples: u64,
    pub num_functions: u64,
    /// Distinct pichash values among stored functions.
    pub num_pichashes: u64,
    pub num_minhashes: u64,
    /// Non-empty `(band, value)` buckets.
    pub num_band_buckets: u64,
}
