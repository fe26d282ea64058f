//! In-process storage backend.
//!
//! All state sits behind a single `RwLock`, so every mutation (including the
//! delete cascade) is applied under one write guard and readers never observe
//! a half-applied change.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{BandConfig, StorageConfig};
use crate::model::{empty_xcfg, ContentHash, DisassemblyReport};
use crate::storage::bands::BandScheme;
use crate::storage::ingest::prepare_sample;
use crate::storage::models::{
    FamilyRecord, FunctionRecord, MinHash, PicHashMatch, SampleRecord, StorageStats,
};
use crate::storage::{Storage, StorageResult};

#[derive(Debug, Default)]
struct MemoryState {
    family_names: BTreeMap<u32, String>,
    family_ids: HashMap<String, u32>,
    samples: BTreeMap<u32, SampleRecord>,
    sample_by_sha256: HashMap<ContentHash, u32>,
    functions: BTreeMap<u64, FunctionRecord>,
    pichashes: HashMap<u64, BTreeSet<PicHashMatch>>,
    minhashes: HashMap<u64, Vec<u32>>,
    /// Band values each indexed function currently occupies.
    function_bands: HashMap<u64, Vec<(u32, u64)>>,
    band_buckets: HashMap<(u32, u64), BTreeSet<u64>>,
    next_family_id: u32,
    next_sample_id: u32,
    next_function_id: u64,
}

impl MemoryState {
    fn new() -> Self {
        let mut state = Self::default();
        state.ensure_family("");
        state
    }

    fn ensure_family(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.family_ids.get(name) {
            return id;
        }
        let id = self.next_family_id;
        self.next_family_id += 1;
        self.family_names.insert(id, name.to_string());
        self.family_ids.insert(name.to_string(), id);
        id
    }

    fn index_minhash(&mut self, scheme: &BandScheme, function_id: u64, signature: Vec<u32>) {
        self.unindex_minhash(function_id);
        let bands = scheme.band_values(&signature);
        for &key in &bands {
            self.band_buckets.entry(key).or_default().insert(function_id);
        }
        self.function_bands.insert(function_id, bands);
        self.minhashes.insert(function_id, signature);
    }

    fn unindex_minhash(&mut self, function_id: u64) {
        self.minhashes.remove(&function_id);
        let Some(bands) = self.function_bands.remove(&function_id) else {
            return;
        };
        for key in bands {
            if let Some(bucket) = self.band_buckets.get_mut(&key) {
                bucket.remove(&function_id);
                if bucket.is_empty() {
                    self.band_buckets.remove(&key);
                }
            }
        }
    }

    fn add_pichash(&mut self, sample_id: u32, function_id: u64, pichash: u64) {
        self.pichashes.entry(pichash).or_default().insert((sample_id, function_id));
    }

    fn remove_pichash(&mut self, sample_id: u32, function_id: u64, pichash: u64) {
        if let Some(matches) = self.pichashes.get_mut(&pichash) {
            matches.remove(&(sample_id, function_id));
            if matches.is_empty() {
                self.pichashes.remove(&pichash);
            }
        }
    }
}

/// Storage backend keeping everything in process memory.
#[derive(Debug)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
    scheme: BandScheme,
    drop_disassembly: bool,
}

impl MemoryStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            state: RwLock::new(MemoryState::new()),
            scheme: BandScheme::new(&config.bands),
            drop_disassembly: config.drop_disassembly,
        }
    }

    pub fn with_bands(bands: &BandConfig) -> Self {
        Self::new(&StorageConfig::memory().with_bands(bands.clone()))
    }

    pub fn band_scheme(&self) -> &BandScheme {
        &self.scheme
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(&StorageConfig::memory())
    }
}

impl Storage for MemoryStorage {
    fn clear_storage(&self) -> StorageResult<()> {
        *self.state.write() = MemoryState::new();
        info!("cleared in-memory storage");
        Ok(())
    }

    fn add_family(&self, name: &str) -> StorageResult<u32> {
        Ok(self.state.write().ensure_family(name))
    }

    fn get_family(&self, family_id: u32) -> StorageResult<Option<FamilyRecord>> {
        let state = self.state.read();
        Ok(state
            .family_names
            .get(&family_id)
            .map(|name| FamilyRecord { family_id, family_name: name.clone() }))
    }

    fn get_family_id(&self, name: &str) -> StorageResult<Option<u32>> {
        Ok(self.state.read().family_ids.get(name).copied())
    }

    fn get_family_ids(&self) -> StorageResult<Vec<u32>> {
        Ok(self.state.read().family_names.keys().copied().collect())
    }

    fn add_sample(
        &self,
        report: &dyn DisassemblyReport,
        family: &str,
    ) -> StorageResult<Option<SampleRecord>> {
        let prepared = prepare_sample(report, family, self.drop_disassembly);
        let mut state = self.state.write();
        if let Some(existing) = state.sample_by_sha256.get(&prepared.sha256) {
            debug!(sha256 = %prepared.sha256, sample_id = existing, "sample already stored");
            return Ok(None);
        }

        let family_id = state.ensure_family(&prepared.family);
        let sample_id = state.next_sample_id;
        state.next_sample_id += 1;
        let first_function_id = state.next_function_id;
        state.next_function_id += prepared.num_functions() as u64;

        let rows = prepared.into_rows(sample_id, family_id, first_function_id);
        for function in rows.functions {
            state.add_pichash(sample_id, function.function_id, function.pichash);
            state.functions.insert(function.function_id, function);
        }
        for (function_id, signature) in rows.minhashes {
            state.index_minhash(&self.scheme, function_id, signature);
        }
        state.sample_by_sha256.insert(rows.sample.sha256, sample_id);
        state.samples.insert(sample_id, rows.sample.clone());

        info!(
            sample_id,
            family_id,
            sha256 = %rows.sample.sha256,
            num_functions = rows.sample.num_functions,
            "added sample"
        );
        Ok(Some(rows.sample))
    }

    fn get_sample_ids(&self) -> StorageResult<Vec<u32>> {
        Ok(self.state.read().samples.keys().copied().collect())
    }

    fn is_sample_id(&self, sample_id: u32) -> StorageResult<bool> {
        Ok(self.state.read().samples.contains_key(&sample_id))
    }

    fn get_sample_by_id(&self, sample_id: u32) -> StorageResult<Option<SampleRecord>> {
        Ok(self.state.read().samples.get(&sample_id).cloned())
    }

    fn get_sample_by_sha256(&self, sha256: &ContentHash) -> StorageResult<Option<SampleRecord>> {
        let state = self.state.read();
        Ok(state.sample_by_sha256.get(sha256).and_then(|id| state.samples.get(id)).cloned())
    }

    fn get_samples_by_family_id(
        &self,
        family_id: u32,
    ) -> StorageResult<Option<Vec<SampleRecord>>> {
        let state = self.state.read();
        if !state.family_names.contains_key(&family_id) {
            return Ok(None);
        }
        Ok(Some(
            state.samples.values().filter(|sample| sample.family_id == family_id).cloned().collect(),
        ))
    }

    fn delete_sample(&self, sample_id: u32) -> StorageResult<bool> {
        let mut state = self.state.write();
        let Some(sample) = state.samples.remove(&sample_id) else {
            return Ok(false);
        };
        state.sample_by_sha256.remove(&sample.sha256);
        for function_id in &sample.function_ids {
            if let Some(function) = state.functions.remove(function_id) {
                state.remove_pichash(sample_id, *function_id, function.pichash);
            }
            state.unindex_minhash(*function_id);
        }
        info!(sample_id, num_functions = sample.function_ids.len(), "deleted sample");
        Ok(true)
    }

    fn get_function_by_id(&self, function_id: u64) -> StorageResult<Option<FunctionRecord>> {
        Ok(self.state.read().functions.get(&function_id).cloned())
    }

    fn get_functions_by_sample_id(
        &self,
        sample_id: u32,
    ) -> StorageResult<Option<Vec<FunctionRecord>>> {
        let state = self.state.read();
        Ok(state.samples.get(&sample_id).map(|sample| {
            sample.function_ids.iter().filter_map(|id| state.functions.get(id)).cloned().collect()
        }))
    }

    fn is_function_id(&self, function_id: u64) -> StorageResult<bool> {
        Ok(self.state.read().functions.contains_key(&function_id))
    }

    fn delete_xcfg_for_sample_id(&self, sample_id: u32) -> StorageResult<()> {
        let mut state = self.state.write();
        let Some(function_ids) = state.samples.get(&sample_id).map(|s| s.function_ids.clone())
        else {
            return Ok(());
        };
        for function_id in function_ids {
            if let Some(function) = state.functions.get_mut(&function_id) {
                function.xcfg = empty_xcfg();
            }
        }
        debug!(sample_id, "purged xcfg payloads");
        Ok(())
    }

    fn delete_xcfg_data(&self) -> StorageResult<()> {
        let mut state = self.state.write();
        for function in state.functions.values_mut() {
            function.xcfg = empty_xcfg();
        }
        debug!("purged all xcfg payloads");
        Ok(())
    }

    fn is_pichash(&self, pichash: u64) -> StorageResult<bool> {
        Ok(self.state.read().pichashes.contains_key(&pichash))
    }

    fn get_matches_for_pichash(&self, pichash: u64) -> StorageResult<BTreeSet<PicHashMatch>> {
        Ok(self.state.read().pichashes.get(&pichash).cloned().unwrap_or_default())
    }

    fn add_minhash(&self, minhash: &MinHash) -> StorageResult<bool> {
        let Some(function_id) = minhash.function_id else {
            return Ok(false);
        };
        let mut state = self.state.write();
        if !state.functions.contains_key(&function_id) {
            return Ok(false);
        }
        state.index_minhash(&self.scheme, function_id, minhash.signature.clone());
        Ok(true)
    }

    fn get_minhash_by_function_id(&self, function_id: u64) -> StorageResult<Option<Vec<u32>>> {
        Ok(self.state.read().minhashes.get(&function_id).cloned())
    }

    fn get_candidates_for_minhash(&self, minhash: &MinHash) -> StorageResult<BTreeSet<u64>> {
        let state = self.state.read();
        let mut candidates = BTreeSet::new();
        for key in self.scheme.band_values(&minhash.signature) {
            if let Some(bucket) = state.band_buckets.get(&key) {
                candidates.extend(bucket.iter().copied());
            }
        }
        Ok(candidates)
    }

    fn get_stats(&self) -> StorageResult<StorageStats> {
        let state = self.state.read();
        Ok(StorageStats {
            num_families: state.family_names.len() as u64,
            num_samples: state.samples.len() as u64,
            num_functions: state.functions.len() as u64,
            num_pichashes: state.pichashes.len() as u64,
            num_minhashes: state.minhashes.len() as u64,
            num_band_buckets: state.band_buckets.len() as u64,
        })
    }
}
