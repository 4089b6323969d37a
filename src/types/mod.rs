//! Identifiers, property values and the crate-wide error type.

#![forbid(unsafe_code)]

use std::fmt;

mod value;

pub use value::{PropValue, ValueGroup};

/// Identifier of a node or relationship record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct EntityId(pub u64);

/// Identifier of a label (nodes) or relationship type (relationships).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TokenId(pub u32);

/// Identifier of a property key.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PropId(pub u32);

/// Identifier of a schema index.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct IndexId(pub u32);

impl EntityId {
    /// Lowest possible entity id, used as the low tie-break in key bounds.
    pub const MIN: EntityId = EntityId(0);
    /// Highest possible entity id, used as the high tie-break in key bounds.
    pub const MAX: EntityId = EntityId(u64::MAX);
}

/// Kind of entity an index or a scan covers.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum EntityKind {
    /// Graph nodes, tokens are labels.
    Node,
    /// Graph relationships, the single token is the relationship type.
    Relationship,
}

impl EntityKind {
    /// Stable lowercase name used in log fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::Relationship => "relationship",
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PropId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        EntityId(value)
    }
}

impl From<u32> for TokenId {
    fn from(value: u32) -> Self {
        TokenId(value)
    }
}

impl From<u32> for PropId {
    fn from(value: u32) -> Self {
        PropId(value)
    }
}

/// One group of entities that share an indexed value tuple in a unique index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntryConflict {
    /// The shared value tuple.
    pub values: Vec<PropValue>,
    /// Every entity holding `values`, ascending.
    pub entities: Vec<EntityId>,
}

impl fmt::Display for IndexEntryConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (idx, value) in self.values.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ") held by entities [")?;
        for (idx, entity) in self.entities.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{entity}")?;
        }
        write!(f, "]")
    }
}

/// Every uniqueness violation found by one write batch or verification pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstraintConflicts {
    /// Violations in key order.
    pub conflicts: Vec<IndexEntryConflict>,
}

impl ConstraintConflicts {
    /// Returns `true` when no violation was recorded.
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Number of violating value groups.
    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    /// All entity ids involved in any violation, ascending and deduplicated.
    pub fn entities(&self) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self
            .conflicts
            .iter()
            .flat_map(|conflict| conflict.entities.iter().copied())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

impl fmt::Display for ConstraintConflicts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} conflicting value group(s)", self.conflicts.len())?;
        for conflict in &self.conflicts {
            write!(f, "; {conflict}")?;
        }
        Ok(())
    }
}

/// Error type shared by the index, tree, lock and scan layers.
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    /// Reading or writing index files failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted state failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied malformed key material.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A uniqueness index maps more than one entity to an equal key.
    #[error("index entry conflict: {0}")]
    Conflict(ConstraintConflicts),
    /// The query cannot be answered by this index's key layout.
    #[error("index not applicable: {0}")]
    NotApplicable(String),
    /// Operation on a closed or dropped index, or a second concurrent writer.
    #[error("lifecycle violation: {0}")]
    Lifecycle(&'static str),
    /// The memory tracker refused a transient allocation.
    #[error("memory limit exceeded: requested {requested} bytes with limit {limit}")]
    MemoryLimitExceeded {
        /// Bytes that would have been held after the allocation.
        requested: usize,
        /// Configured ceiling.
        limit: usize,
    },
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, IndexError>;
