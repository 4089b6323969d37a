//! Thread-safe in-memory entity store implementing every store trait the
//! index layer consumes.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::storage::scan::{
    CursorTracer, EntityRecord, PropertyAccessor, StorageReader, TokenScanStore, TokenSet,
};
use crate::types::{EntityId, EntityKind, IndexError, PropId, PropValue, Result, TokenId};

#[derive(Default)]
struct StoredEntity {
    tokens: TokenSet,
    props: BTreeMap<PropId, PropValue>,
}

#[derive(Default)]
struct KindTable {
    records: BTreeMap<u64, StoredEntity>,
    next_id: u64,
}

/// In-memory node and relationship records.
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<KindTable>,
    relationships: RwLock<KindTable>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: EntityKind) -> &RwLock<KindTable> {
        match kind {
            EntityKind::Node => &self.nodes,
            EntityKind::Relationship => &self.relationships,
        }
    }

    /// Creates an entity carrying `tokens` and returns its id.
    pub fn create_entity(&self, kind: EntityKind, tokens: &[TokenId]) -> EntityId {
        let mut table = self.table(kind).write();
        let id = table.next_id;
        table.next_id += 1;
        let mut set: TokenSet = tokens.iter().copied().collect();
        set.sort_unstable();
        set.dedup();
        table.records.insert(
            id,
            StoredEntity {
                tokens: set,
                props: BTreeMap::new(),
            },
        );
        EntityId(id)
    }

    /// Creates a node with `labels`.
    pub fn create_node(&self, labels: &[TokenId]) -> EntityId {
        self.create_entity(EntityKind::Node, labels)
    }

    /// Creates a relationship of `rel_type`.
    pub fn create_relationship(&self, rel_type: TokenId) -> EntityId {
        self.create_entity(EntityKind::Relationship, &[rel_type])
    }

    /// Deletes an entity. Returns `false` when it did not exist.
    pub fn delete_entity(&self, kind: EntityKind, id: EntityId) -> bool {
        self.table(kind).write().records.remove(&id.0).is_some()
    }

    /// Adds `token` to the entity. Returns `false` when already present.
    pub fn add_token(&self, kind: EntityKind, id: EntityId, token: TokenId) -> Result<bool> {
        self.with_entity(kind, id, |entity| match entity.tokens.binary_search(&token) {
            Ok(_) => false,
            Err(pos) => {
                entity.tokens.insert(pos, token);
                true
            }
        })
    }

    /// Removes `token` from the entity. Returns `false` when absent.
    pub fn remove_token(&self, kind: EntityKind, id: EntityId, token: TokenId) -> Result<bool> {
        self.with_entity(kind, id, |entity| match entity.tokens.binary_search(&token) {
            Ok(pos) => {
                entity.tokens.remove(pos);
                true
            }
            Err(_) => false,
        })
    }

    /// Sets a property, returning the previous value.
    pub fn set_property(
        &self,
        kind: EntityKind,
        id: EntityId,
        prop: PropId,
        value: impl Into<PropValue>,
    ) -> Result<Option<PropValue>> {
        let value = value.into();
        if matches!(value, PropValue::Null) {
            return self.remove_property(kind, id, prop);
        }
        self.with_entity(kind, id, |entity| entity.props.insert(prop, value))
    }

    /// Removes a property, returning the previous value.
    pub fn remove_property(
        &self,
        kind: EntityKind,
        id: EntityId,
        prop: PropId,
    ) -> Result<Option<PropValue>> {
        self.with_entity(kind, id, |entity| entity.props.remove(&prop))
    }

    /// Live entities of `kind`.
    pub fn entity_count(&self, kind: EntityKind) -> usize {
        self.table(kind).read().records.len()
    }

    fn with_entity<R>(
        &self,
        kind: EntityKind,
        id: EntityId,
        f: impl FnOnce(&mut StoredEntity) -> R,
    ) -> Result<R> {
        let mut table = self.table(kind).write();
        let entity = table
            .records
            .get_mut(&id.0)
            .ok_or(IndexError::Invalid("unknown entity id"))?;
        Ok(f(entity))
    }
}

impl StorageReader for MemoryStore {
    fn highest_entity_id(&self, kind: EntityKind) -> Result<Option<EntityId>> {
        let table = self.table(kind).read();
        Ok(table.next_id.checked_sub(1).map(EntityId))
    }

    fn read_entity(
        &self,
        kind: EntityKind,
        id: EntityId,
        tracer: &dyn CursorTracer,
    ) -> Result<Option<EntityRecord>> {
        tracer.pin();
        tracer.hit();
        let table = self.table(kind).read();
        let record = table.records.get(&id.0).map(|entity| EntityRecord {
            id,
            tokens: entity.tokens.clone(),
            properties: entity
                .props
                .iter()
                .map(|(prop, value)| (*prop, value.clone()))
                .collect(),
        });
        drop(table);
        tracer.unpin();
        Ok(record)
    }
}

impl TokenScanStore for MemoryStore {
    fn entities_with_token(
        &self,
        kind: EntityKind,
        token: TokenId,
        tracer: &dyn CursorTracer,
    ) -> Result<Vec<EntityId>> {
        tracer.pin();
        tracer.hit();
        let table = self.table(kind).read();
        let ids = table
            .records
            .iter()
            .filter(|(_, entity)| entity.tokens.binary_search(&token).is_ok())
            .map(|(id, _)| EntityId(*id))
            .collect();
        drop(table);
        tracer.unpin();
        Ok(ids)
    }
}

impl PropertyAccessor for MemoryStore {
    fn property_value(
        &self,
        kind: EntityKind,
        entity: EntityId,
        prop: PropId,
    ) -> Result<Option<PropValue>> {
        let table = self.table(kind).read();
        Ok(table
            .records
            .get(&entity.0)
            .and_then(|stored| stored.props.get(&prop).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::scan::NoopCursorTracer;

    #[test]
    fn records_reflect_mutations() -> Result<()> {
        let store = MemoryStore::new();
        let node = store.create_node(&[TokenId(2), TokenId(1), TokenId(2)]);
        store.set_property(EntityKind::Node, node, PropId(5), 10i64)?;
        assert!(store.add_token(EntityKind::Node, node, TokenId(3))?);
        assert!(!store.add_token(EntityKind::Node, node, TokenId(3))?);
        let record = store
            .read_entity(EntityKind::Node, node, &NoopCursorTracer)?
            .expect("node exists");
        assert_eq!(record.tokens.as_slice(), &[TokenId(1), TokenId(2), TokenId(3)]);
        assert_eq!(record.property(PropId(5)), Some(&PropValue::Int(10)));
        assert_eq!(
            store.set_property(EntityKind::Node, node, PropId(5), PropValue::Null)?,
            Some(PropValue::Int(10))
        );
        assert_eq!(store.property_value(EntityKind::Node, node, PropId(5))?, None);
        Ok(())
    }

    #[test]
    fn deleted_ids_keep_the_high_water_mark() -> Result<()> {
        let store = MemoryStore::new();
        assert_eq!(store.highest_entity_id(EntityKind::Relationship)?, None);
        let a = store.create_relationship(TokenId(1));
        let b = store.create_relationship(TokenId(1));
        assert!(store.delete_entity(EntityKind::Relationship, b));
        assert_eq!(store.highest_entity_id(EntityKind::Relationship)?, Some(b));
        assert!(store
            .read_entity(EntityKind::Relationship, b, &NoopCursorTracer)?
            .is_none());
        assert_eq!(
            store.entities_with_token(EntityKind::Relationship, TokenId(1), &NoopCursorTracer)?,
            vec![a]
        );
        assert!(matches!(
            store.set_property(EntityKind::Relationship, b, PropId(1), 1i64),
            Err(IndexError::Invalid(_))
        ));
        Ok(())
    }
}
