//! Index storage engine: the ordered tree, schema indexes and store scans.

/// Schema index accessor, updater and reader.
///
/// Generic over a key layout, with numeric, string and composite variants.
pub mod index;

/// In-memory entity store.
pub mod memory;

/// Store scans feeding index population.
pub mod scan;

/// Durable ordered key-value tree.
///
/// Copy-on-write committed state with whole-file checkpoints.
pub mod tree;

pub use memory::MemoryStore;
