//! Index configuration, loadable from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::index::SamplingStrategy;
use crate::storage::tree::IoLimit;

/// Options applied when opening a [`crate::storage::index::NativeIndexAccessor`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    /// Create the index file when it does not exist.
    pub create_if_missing: bool,
    /// Strategy used by readers' samplers.
    pub sampling: SamplingStrategy,
    /// Entry updates per updater batch during population.
    pub population_batch_size: usize,
    /// Ceiling on transient bytes a store scan may hold for one entity.
    pub scan_memory_limit: Option<usize>,
    /// I/O budget for the checkpoint that ends a population.
    pub checkpoint_io_limit: IoLimit,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sampling: SamplingStrategy::default(),
            population_batch_size: 1_024,
            scan_memory_limit: None,
            checkpoint_io_limit: IoLimit::Unlimited,
        }
    }
}

impl IndexConfig {
    /// Parses a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse { source })
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Sets whether a missing index file is created.
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Sets the sampling strategy.
    pub fn sampling(mut self, sampling: SamplingStrategy) -> Self {
        self.sampling = sampling;
        self
    }

    /// Sets the population batch size.
    pub fn population_batch_size(mut self, size: usize) -> Self {
        self.population_batch_size = size;
        self
    }

    /// Sets the scan memory ceiling.
    pub fn scan_memory_limit(mut self, limit: Option<usize>) -> Self {
        self.scan_memory_limit = limit;
        self
    }

    /// Sets the population checkpoint I/O budget.
    pub fn checkpoint_io_limit(mut self, limit: IoLimit) -> Self {
        self.checkpoint_io_limit = limit;
        self
    }
}

/// Failure loading or rendering an [`IndexConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read index config {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The document is not a valid config.
    #[error("failed to parse index config: {source}")]
    Parse {
        /// Parser error.
        source: toml::de::Error,
    },
    /// The config could not be rendered.
    #[error("failed to serialize index config: {source}")]
    Serialize {
        /// Serializer error.
        source: toml::ser::Error,
    },
}
