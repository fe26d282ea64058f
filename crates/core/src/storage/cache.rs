//! Read-only snapshot of a sample subset for batch similarity runs.
//!
//! A [`MatchingCache`] is built once by [`Storage::create_matching_cache`] and
//! then answers lookups from flat maps without touching the backend. Lookups
//! outside the snapshot are errors: falling back to the store would defeat the
//! point of the cache.
//!
//! [`Storage::create_matching_cache`]: crate::storage::Storage::create_matching_cache

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lookup outside the snapshotted subset.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("function id {0} is not part of this matching cache")]
    UnknownFunctionId(u64),

    #[error("sample id {0} is not part of this matching cache")]
    UnknownSampleId(u32),
}

/// Flat projection a [`MatchingCache`] is built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheData {
    pub func_id_to_minhash: HashMap<u64, Vec<u32>>,
    pub func_id_to_sample_id: HashMap<u64, u32>,
    pub sample_id_to_func_ids: HashMap<u32, Vec<u64>>,
}

#[derive(Debug, Clone)]
pub struct MatchingCache {
    data: CacheData,
}

impl MatchingCache {
    pub fn new(data: CacheData) -> Self {
        Self { data }
    }

    pub fn is_sample_id(&self, sample_id: u32) -> bool {
        self.data.sample_id_to_func_ids.contains_key(&sample_id)
    }

    /// `Ok(None)` for a snapshotted function that has no signature.
    pub fn get_minhash_by_function_id(&self, function_id: u64) -> Result<Option<&[u32]>, CacheError> {
        if !self.data.func_id_to_sample_id.contains_key(&function_id) {
            return Err(CacheError::UnknownFunctionId(function_id));
        }
        Ok(self.data.func_id_to_minhash.get(&function_id).map(Vec::as_slice))
    }

    pub fn get_sample_id_by_function_id(&self, function_id: u64) -> Result<u32, CacheError> {
        self.data
            .func_id_to_sample_id
            .get(&function_id)
            .copied()
            .ok_or(CacheError::UnknownFunctionId(function_id))
    }

    pub fn get_function_ids_by_sample_id(&self, sample_id: u32) -> Result<&[u64], CacheError> {
        self.data
            .sample_id_to_func_ids
            .get(&sample_id)
            .map(Vec::as_slice)
            .ok_or(CacheError::UnknownSampleId(sample_id))
    }

    /// Snapshotted sample ids, ascending.
    pub fn sample_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.data.sample_id_to_func_ids.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of snapshotted functions.
    pub fn len(&self) -> usize {
        self.data.func_id_to_sample_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.func_id_to_sample_id.is_empty()
    }

    pub fn data(&self) -> &CacheData {
        &self.data
    }
}
