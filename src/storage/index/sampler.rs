//! Selectivity estimation for the query planner.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::tree::TreeSnapshot;
use crate::types::Result;

use super::layout::SchemaLayout;

/// How a sampler walks the index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Visit every entry; exact counts.
    Full,
    /// Keep a uniform random sample of `size` value tuples and scale the
    /// distinct count to the index size.
    Reservoir {
        /// Maximum tuples retained.
        size: usize,
        /// Seed for the sampling generator, so estimates are reproducible.
        seed: u64,
    },
}

impl Default for SamplingStrategy {
    fn default() -> Self {
        SamplingStrategy::Reservoir {
            size: 8_192,
            seed: 0x5eed,
        }
    }
}

/// Estimated shape of an index.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexSample {
    /// Entries in the index.
    pub index_size: u64,
    /// Distinct value tuples, exact for full sampling, estimated otherwise.
    pub unique_values: u64,
    /// Entries the estimate is based on.
    pub sample_size: u64,
}

impl IndexSample {
    /// Fraction of distinct value tuples, 1.0 for an empty index.
    pub fn selectivity(&self) -> f64 {
        if self.index_size == 0 {
            1.0
        } else {
            self.unique_values as f64 / self.index_size as f64
        }
    }
}

/// Sampler bound to a reader's snapshot.
pub struct IndexSampler<L: SchemaLayout> {
    snapshot: TreeSnapshot<L>,
    strategy: SamplingStrategy,
}

impl<L: SchemaLayout> IndexSampler<L> {
    pub(crate) fn new(snapshot: TreeSnapshot<L>, strategy: SamplingStrategy) -> Self {
        Self { snapshot, strategy }
    }

    /// Strategy in use.
    pub fn strategy(&self) -> SamplingStrategy {
        self.strategy
    }

    /// Walks the snapshot and produces an estimate.
    pub fn sample_index(&self) -> Result<IndexSample> {
        let index_size = self.snapshot.len() as u64;
        let sample = match self.strategy {
            SamplingStrategy::Reservoir { size, seed } if index_size > size as u64 => {
                self.reservoir(index_size, size, seed)?
            }
            _ => self.full(index_size)?,
        };
        debug!(
            index_size = sample.index_size,
            unique_values = sample.unique_values,
            sample_size = sample.sample_size,
            "index.sample.completed"
        );
        Ok(sample)
    }

    fn full(&self, index_size: u64) -> Result<IndexSample> {
        let mut previous: Option<Vec<u8>> = None;
        let mut unique = 0u64;
        for hit in self.snapshot.scan_all() {
            let hit = hit?;
            let mut values = Vec::new();
            hit.key.encode_values(&mut values);
            if previous.as_deref() != Some(values.as_slice()) {
                unique += 1;
                previous = Some(values);
            }
        }
        Ok(IndexSample {
            index_size,
            unique_values: unique,
            sample_size: index_size,
        })
    }

    fn reservoir(&self, index_size: u64, size: usize, seed: u64) -> Result<IndexSample> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut reservoir: Vec<Vec<u8>> = Vec::with_capacity(size);
        for (seen, hit) in self.snapshot.scan_all().enumerate() {
            let hit = hit?;
            let mut values = Vec::new();
            hit.key.encode_values(&mut values);
            if reservoir.len() < size {
                reservoir.push(values);
            } else {
                let slot = rng.gen_range(0..=seen);
                if slot < size {
                    reservoir[slot] = values;
                }
            }
        }
        reservoir.sort_unstable();
        reservoir.dedup();
        let distinct = reservoir.len() as u64;
        let unique_values = if size == 0 {
            0
        } else {
            ((distinct as f64 / size as f64) * index_size as f64).round() as u64
        };
        Ok(IndexSample {
            index_size,
            unique_values: unique_values.clamp(distinct.min(1), index_size),
            sample_size: size as u64,
        })
    }
}
