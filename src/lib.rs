//! Native schema indexes for an embedded graph store.
//!
//! A schema index maps property values of labelled nodes or typed
//! relationships to entity ids. [`storage::index::NativeIndexAccessor`] owns
//! one index file and hands out updaters and readers;
//! [`storage::scan::StoreScan`] walks the entity store to populate it.

#![warn(missing_docs)]

pub mod config;
pub mod primitives;
pub mod storage;
pub mod types;

pub use config::{ConfigError, IndexConfig};
pub use types::{IndexError, Result};
