use smallvec::SmallVec;

use crate::types::{EntityKind, IndexId, PropId, TokenId};

/// What an index covers: entities of `kind` carrying `token`, keyed by the
/// values of `props` in order.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SchemaDescriptor {
    /// Node or relationship.
    pub kind: EntityKind,
    /// Label or relationship type.
    pub token: TokenId,
    /// Indexed property keys, in key slot order.
    pub props: SmallVec<[PropId; 2]>,
}

impl SchemaDescriptor {
    /// Schema over nodes labelled `label`.
    pub fn for_label(label: TokenId, props: &[PropId]) -> Self {
        Self {
            kind: EntityKind::Node,
            token: label,
            props: SmallVec::from_slice(props),
        }
    }

    /// Schema over relationships of type `rel_type`.
    pub fn for_rel_type(rel_type: TokenId, props: &[PropId]) -> Self {
        Self {
            kind: EntityKind::Relationship,
            token: rel_type,
            props: SmallVec::from_slice(props),
        }
    }

    /// Number of properties in the key.
    pub fn arity(&self) -> usize {
        self.props.len()
    }

    /// Slot position of `prop`, if indexed.
    pub fn slot_of(&self, prop: PropId) -> Option<usize> {
        self.props.iter().position(|p| *p == prop)
    }
}

/// Identity of a schema index.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct IndexDescriptor {
    /// Catalog id.
    pub id: IndexId,
    /// Human readable name, used in logs.
    pub name: String,
    /// Covered entities and properties.
    pub schema: SchemaDescriptor,
    /// Backs a uniqueness constraint.
    pub unique: bool,
}

impl IndexDescriptor {
    /// Non-unique index.
    pub fn new(id: IndexId, name: impl Into<String>, schema: SchemaDescriptor) -> Self {
        Self {
            id,
            name: name.into(),
            schema,
            unique: false,
        }
    }

    /// Index backing a uniqueness constraint.
    pub fn unique(id: IndexId, name: impl Into<String>, schema: SchemaDescriptor) -> Self {
        Self {
            unique: true,
            ..Self::new(id, name, schema)
        }
    }
}
