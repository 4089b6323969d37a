use crate::types::{EntityId, EntityKind, PropId, PropValue, Result, TokenId};

use super::tracer::CursorTracer;
use super::updates::TokenSet;

/// Current state of one entity as read under its lock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityRecord {
    /// Entity id.
    pub id: EntityId,
    /// Labels or relationship type, ascending.
    pub tokens: TokenSet,
    /// Property values, ascending by key.
    pub properties: Vec<(PropId, PropValue)>,
}

impl EntityRecord {
    /// Value of `prop`, if set.
    pub fn property(&self, prop: PropId) -> Option<&PropValue> {
        self.properties
            .binary_search_by_key(&prop, |(p, _)| *p)
            .ok()
            .map(|idx| &self.properties[idx].1)
    }
}

/// Random and sequential access to entity records.
pub trait StorageReader: Send + Sync {
    /// Highest id ever allocated for `kind`, `None` for an empty store.
    fn highest_entity_id(&self, kind: EntityKind) -> Result<Option<EntityId>>;

    /// Reads an entity, `None` when the id is unused.
    fn read_entity(
        &self,
        kind: EntityKind,
        id: EntityId,
        tracer: &dyn CursorTracer,
    ) -> Result<Option<EntityRecord>>;
}

/// Token membership index: which entities carry a token.
pub trait TokenScanStore: Send + Sync {
    /// Ids of entities of `kind` carrying `token`, ascending.
    fn entities_with_token(
        &self,
        kind: EntityKind,
        token: TokenId,
        tracer: &dyn CursorTracer,
    ) -> Result<Vec<EntityId>>;
}

/// Live property lookup, used to re-check index entries.
pub trait PropertyAccessor: Send + Sync {
    /// Current value of `prop` on the entity, `None` when unset or the
    /// entity does not exist.
    fn property_value(
        &self,
        kind: EntityKind,
        entity: EntityId,
        prop: PropId,
    ) -> Result<Option<PropValue>>;
}
