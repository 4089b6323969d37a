use smallvec::SmallVec;

use crate::storage::index::{IndexEntryUpdate, SchemaDescriptor};
use crate::types::{EntityId, EntityKind, PropId, PropValue, TokenId};

/// Sorted, deduplicated token ids.
pub type TokenSet = SmallVec<[TokenId; 4]>;

/// Token membership change for one entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityTokenUpdate {
    /// Entity id.
    pub entity: EntityId,
    /// Tokens before the change, per the caller's baseline.
    pub before: TokenSet,
    /// Tokens now held.
    pub after: TokenSet,
}

impl EntityTokenUpdate {
    /// Tokens gained.
    pub fn added(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.after
            .iter()
            .copied()
            .filter(move |token| self.before.binary_search(token).is_err())
    }

    /// Tokens lost.
    pub fn removed(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.before
            .iter()
            .copied()
            .filter(move |token| self.after.binary_search(token).is_err())
    }
}

/// Before/after value of one property.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyChange {
    /// Property key.
    pub prop: PropId,
    /// Previous value, `None` if unset.
    pub before: Option<PropValue>,
    /// Current value, `None` if removed.
    pub after: Option<PropValue>,
}

/// Property changes of one entity, restricted to the keys a scan cares
/// about.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityUpdates {
    /// Entity id.
    pub entity: EntityId,
    /// Node or relationship.
    pub kind: EntityKind,
    /// Tokens the entity holds now.
    pub tokens: TokenSet,
    /// Changed properties, ascending by key.
    pub changes: Vec<PropertyChange>,
}

impl EntityUpdates {
    /// Change recorded for `prop`.
    pub fn change(&self, prop: PropId) -> Option<&PropertyChange> {
        self.changes
            .binary_search_by_key(&prop, |change| change.prop)
            .ok()
            .map(|idx| &self.changes[idx])
    }

    /// Converts the changes into an entry update for the index over
    /// `schema`, or `None` when the index is unaffected.
    ///
    /// Every indexed property must be covered by a change.
    pub fn for_index(&self, schema: &SchemaDescriptor) -> Option<IndexEntryUpdate> {
        if self.kind != schema.kind || self.tokens.binary_search(&schema.token).is_err() {
            return None;
        }
        let mut before = Vec::with_capacity(schema.arity());
        let mut after = Vec::with_capacity(schema.arity());
        for prop in &schema.props {
            let change = self.change(*prop)?;
            before.push(change.before.clone());
            after.push(change.after.clone());
        }
        let before: Option<Vec<PropValue>> = before.into_iter().collect();
        let after: Option<Vec<PropValue>> = after.into_iter().collect();
        match (before, after) {
            (None, Some(values)) => Some(IndexEntryUpdate::Add {
                entity: self.entity,
                values,
            }),
            (Some(values), None) => Some(IndexEntryUpdate::Remove {
                entity: self.entity,
                values,
            }),
            (Some(before), Some(after)) => {
                let same = before.len() == after.len()
                    && before.iter().zip(&after).all(|(a, b)| a.index_eq(b));
                (!same).then_some(IndexEntryUpdate::Change {
                    entity: self.entity,
                    before,
                    after,
                })
            }
            (None, None) => None,
        }
    }
}
