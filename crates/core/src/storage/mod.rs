//! Function storage and similarity indexes.
//!
//! Everything downstream code needs goes through the [`Storage`] trait:
//! - the entity store (families, samples, functions) with cascading delete,
//! - the exact-match PicHash index,
//! - the MinHash signature store and its LSH band buckets,
//! - construction of a read-only [`MatchingCache`].
//!
//! Two backends implement the trait with identical observable behaviour:
//! - [`MemoryStorage`]: everything in process memory behind one lock.
//! - [`SqliteStorage`]: a SQLite file shared by any number of processes.
//!
//! Lookups by unknown id or hash return `Ok(None)` or an empty collection.
//! `Err` is reserved for backend faults, which are never retried here.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::model::{ContentHash, DisassemblyReport};

pub mod bands;
pub mod cache;
mod ingest;
pub mod memory;
pub mod models;
pub mod pichash;
pub mod sqlite;
pub mod util;

pub use bands::BandScheme;
pub use cache::{CacheData, CacheError, MatchingCache};
pub use memory::MemoryStorage;
pub use models::{
    FamilyRecord, FunctionRecord, LibraryInfo, MinHash, PicHashMatch, PicHashMatches,
    SampleRecord, StorageStats,
};
pub use pichash::compute_pichash;
pub use sqlite::SqliteStorage;
pub use util::open_storage;

/// Error type for storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying SQLite error.
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// A stored JSON payload could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The database was created with a newer schema version than we support.
    #[error(
        "Unsupported schema version {found}; supported range is {min_supported}..={max_supported}"
    )]
    UnsupportedSchemaVersion { found: i32, min_supported: i32, max_supported: i32 },

    /// Another handle rebuilt the band buckets with a different layout.
    #[error("Band layout of the database no longer matches this handle's config; reopen it")]
    BandLayoutChanged,
}

/// Convenience result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// The storage façade shared by ingestion and matching pipelines.
///
/// Implementations must be safe to share between threads. Mutations are
/// expected to be serialized by the caller (one ingestion pipeline at a time);
/// each individual mutation is still atomic from a reader's point of view.
pub trait Storage: Send + Sync {
    /// Drop every record and reset all id counters.
    fn clear_storage(&self) -> StorageResult<()>;

    // --- families ---

    /// Return the id for `name`, assigning the next free id on first use.
    fn add_family(&self, name: &str) -> StorageResult<u32>;

    fn get_family(&self, family_id: u32) -> StorageResult<Option<FamilyRecord>>;

    fn get_family_id(&self, name: &str) -> StorageResult<Option<u32>>;

    /// All family ids ever assigned, ascending.
    fn get_family_ids(&self) -> StorageResult<Vec<u32>>;

    // --- samples ---

    /// Ingest `report` under `family`.
    ///
    /// Returns `Ok(None)` when a live sample already has the report's sha256.
    fn add_sample(
        &self,
        report: &dyn DisassemblyReport,
        family: &str,
    ) -> StorageResult<Option<SampleRecord>>;

    /// Ingest `report` under its own family label.
    fn add_report(&self, report: &dyn DisassemblyReport) -> StorageResult<Option<SampleRecord>> {
        self.add_sample(report, report.family())
    }

    /// Ids of all live samples, ascending.
    fn get_sample_ids(&self) -> StorageResult<Vec<u32>>;

    fn is_sample_id(&self, sample_id: u32) -> StorageResult<bool> {
        Ok(self.get_sample_by_id(sample_id)?.is_some())
    }

    fn get_sample_by_id(&self, sample_id: u32) -> StorageResult<Option<SampleRecord>>;

    fn get_sample_by_sha256(&self, sha256: &ContentHash) -> StorageResult<Option<SampleRecord>>;

    /// `None` iff the family id was never assigned.
    fn get_samples_by_family_id(&self, family_id: u32)
        -> StorageResult<Option<Vec<SampleRecord>>>;

    /// `None` when the sample is unknown or not flagged as a library.
    fn get_library_info_for_sample_id(&self, sample_id: u32) -> StorageResult<Option<LibraryInfo>> {
        Ok(self.get_sample_by_id(sample_id)?.and_then(|sample| {
            sample
                .is_library
                .then(|| LibraryInfo { family: sample.family, version: sample.version })
        }))
    }

    /// Delete a sample with its functions, pichash entries and minhashes.
    ///
    /// Returns `false` iff the sample id is unknown.
    fn delete_sample(&self, sample_id: u32) -> StorageResult<bool>;

    // --- functions ---

    fn get_function_by_id(&self, function_id: u64) -> StorageResult<Option<FunctionRecord>>;

    fn get_functions_by_sample_id(
        &self,
        sample_id: u32,
    ) -> StorageResult<Option<Vec<FunctionRecord>>>;

    fn get_function_ids_by_sample_id(&self, sample_id: u32) -> StorageResult<Option<Vec<u64>>> {
        Ok(self.get_sample_by_id(sample_id)?.map(|sample| sample.function_ids))
    }

    fn get_sample_id_by_function_id(&self, function_id: u64) -> StorageResult<Option<u32>> {
        Ok(self.get_function_by_id(function_id)?.map(|function| function.sample_id))
    }

    fn is_function_id(&self, function_id: u64) -> StorageResult<bool>;

    /// Purge the xcfg payload of one sample's functions; unknown ids are a no-op.
    fn delete_xcfg_for_sample_id(&self, sample_id: u32) -> StorageResult<()>;

    /// Purge the xcfg payload of every stored function.
    fn delete_xcfg_data(&self) -> StorageResult<()>;

    // --- pichash index ---

    fn is_pichash(&self, pichash: u64) -> StorageResult<bool>;

    /// All `(sample_id, function_id)` pairs with this pichash; empty if none.
    fn get_matches_for_pichash(&self, pichash: u64) -> StorageResult<BTreeSet<PicHashMatch>>;

    /// The pichash of `function_id` mapped to every function sharing it.
    ///
    /// The function itself is part of its own match set. `None` if unknown.
    fn get_pichash_matches_by_function_id(
        &self,
        function_id: u64,
    ) -> StorageResult<Option<PicHashMatches>> {
        let Some(function) = self.get_function_by_id(function_id)? else {
            return Ok(None);
        };
        let matches = self.get_matches_for_pichash(function.pichash)?;
        Ok(Some(BTreeMap::from([(function.pichash, matches)])))
    }

    /// Merge of the single-id form over `function_ids`; unknown ids are skipped.
    fn get_pichash_matches_by_function_ids(
        &self,
        function_ids: &[u64],
    ) -> StorageResult<PicHashMatches> {
        let unique: BTreeSet<u64> = function_ids.iter().copied().collect();
        let mut merged = PicHashMatches::new();
        for function_id in unique {
            if let Some(matches) = self.get_pichash_matches_by_function_id(function_id)? {
                for (pichash, pairs) in matches {
                    merged.entry(pichash).or_default().extend(pairs);
                }
            }
        }
        Ok(merged)
    }

    /// The batch form over exactly this sample's functions; `None` if unknown.
    fn get_pichash_matches_by_sample_id(
        &self,
        sample_id: u32,
    ) -> StorageResult<Option<PicHashMatches>> {
        match self.get_function_ids_by_sample_id(sample_id)? {
            Some(function_ids) => Ok(Some(self.get_pichash_matches_by_function_ids(&function_ids)?)),
            None => Ok(None),
        }
    }

    // --- minhash / LSH index ---

    /// Store (or overwrite) a function's signature and re-bucket it.
    ///
    /// Returns `false` without touching the index when the function id is
    /// unset or not a stored function.
    fn add_minhash(&self, minhash: &MinHash) -> StorageResult<bool>;

    fn get_minhash_by_function_id(&self, function_id: u64) -> StorageResult<Option<Vec<u32>>>;

    /// Functions sharing at least one full band with `minhash`.
    fn get_candidates_for_minhash(&self, minhash: &MinHash) -> StorageResult<BTreeSet<u64>>;

    // --- bulk matching ---

    /// Snapshot the given samples into an in-memory [`MatchingCache`].
    ///
    /// Unknown sample ids are skipped.
    fn create_matching_cache(&self, sample_ids: &[u32]) -> StorageResult<MatchingCache> {
        let mut data = CacheData::default();
        for &sample_id in sample_ids {
            let Some(function_ids) = self.get_function_ids_by_sample_id(sample_id)? else {
                continue;
            };
            for &function_id in &function_ids {
                data.func_id_to_sample_id.insert(function_id, sample_id);
                if let Some(signature) = self.get_minhash_by_function_id(function_id)? {
                    data.func_id_to_minhash.insert(function_id, signature);
                }
            }
            data.sample_id_to_func_ids.insert(sample_id, function_ids);
        }
        Ok(MatchingCache::new(data))
    }

    fn get_stats(&self) -> StorageResult<StorageStats>;
}

/// Generic helpers over any [`Storage`], including `dyn Storage`.
pub trait StorageExt: Storage {
    /// Candidate lookup for a batch of signatures, keyed however the caller likes.
    fn get_candidates_for_minhashes<K: Ord + Clone>(
        &self,
        minhashes: &BTreeMap<K, MinHash>,
    ) -> StorageResult<BTreeMap<K, BTreeSet<u64>>> {
        let mut out = BTreeMap::new();
        for (key, minhash) in minhashes {
            out.insert(key.clone(), self.get_candidates_for_minhash(minhash)?);
        }
        Ok(out)
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}
