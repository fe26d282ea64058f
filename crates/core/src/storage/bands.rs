//! LSH banding over MinHash signatures.
//!
//! Each band selects a fixed set of signature positions. Two signatures land
//! in the same bucket of a band iff they agree on every selected position.
//! The layout depends only on the [`BandConfig`], so every process and backend
//! using the same config buckets signatures identically.

use rand::rngs::StdRng;
use rand::SeedableRng;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::BandConfig;

/// One band: the signature positions it consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Band {
    pub band_id: u32,
    pub positions: Vec<usize>,
}

/// The resolved band layout for a [`BandConfig`].
#[derive(Debug, Clone)]
pub struct BandScheme {
    config: BandConfig,
    bands: Vec<Band>,
}

impl BandScheme {
    /// Draw band positions from a RNG seeded with `config.seed`.
    ///
    /// Widths are visited in ascending order; band ids are sequential in
    /// that order. A width larger than the signature is clamped to it.
    pub fn new(config: &BandConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut bands = Vec::new();
        for (&width, &count) in &config.bands {
            let width = width.min(config.signature_length);
            if width == 0 {
                continue;
            }
            for _ in 0..count {
                let positions =
                    rand::seq::index::sample(&mut rng, config.signature_length, width).into_vec();
                bands.push(Band { band_id: bands.len() as u32, positions });
            }
        }
        Self { config: config.clone(), bands }
    }

    pub fn config(&self) -> &BandConfig {
        &self.config
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    /// `(band_id, band_value)` for every band the signature fully covers, in
    /// band order. Bands reaching past the end of a short signature yield no
    /// bucket, so short signatures never match on components they lack.
    pub fn band_values(&self, signature: &[u32]) -> Vec<(u32, u64)> {
        self.bands
            .iter()
            .filter_map(|band| {
                band_value(signature, &band.positions).map(|value| (band.band_id, value))
            })
            .collect()
    }
}

/// xxh3 over the selected components, or `None` if any is missing.
fn band_value(signature: &[u32], positions: &[usize]) -> Option<u64> {
    let mut buf = Vec::with_capacity(positions.len() * 4);
    for &pos in positions {
        buf.extend_from_slice(&signature.get(pos)?.to_le_bytes());
    }
    Some(xxh3_64(&buf))
}

/// SQLite stores band values bit-for-bit as signed integers.
pub(crate) fn to_sql(value: u64) -> i64 {
    value as i64
}

pub(crate) fn from_sql(value: i64) -> u64 {
    value as u64
}
