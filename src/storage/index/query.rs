//! Predicate evaluation against the key order.

use std::ops::Bound;

use crate::storage::tree::Seeker;
use crate::types::{EntityId, IndexError, PropId, PropValue, Result, ValueGroup};

use super::key::{IndexKey, KeySlot};
use super::layout::SchemaLayout;

/// One predicate over one indexed property.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexQuery {
    /// The property has any value.
    Exists {
        /// Property key.
        prop: PropId,
    },
    /// The property equals `value`.
    Exact {
        /// Property key.
        prop: PropId,
        /// Value to match.
        value: PropValue,
    },
    /// The property lies between the bounds. Both bounds must belong to the
    /// same value group; at least one must be present.
    Range {
        /// Property key.
        prop: PropId,
        /// Lower bound.
        from: Bound<PropValue>,
        /// Upper bound.
        to: Bound<PropValue>,
    },
    /// The property is a string starting with `prefix`.
    StringPrefix {
        /// Property key.
        prop: PropId,
        /// Required prefix.
        prefix: String,
    },
}

impl IndexQuery {
    /// Equality predicate.
    pub fn exact(prop: PropId, value: impl Into<PropValue>) -> Self {
        IndexQuery::Exact {
            prop,
            value: value.into(),
        }
    }

    /// Existence predicate.
    pub fn exists(prop: PropId) -> Self {
        IndexQuery::Exists { prop }
    }

    /// Range predicate.
    pub fn range(prop: PropId, from: Bound<PropValue>, to: Bound<PropValue>) -> Self {
        IndexQuery::Range { prop, from, to }
    }

    /// Prefix predicate.
    pub fn string_prefix(prop: PropId, prefix: impl Into<String>) -> Self {
        IndexQuery::StringPrefix {
            prop,
            prefix: prefix.into(),
        }
    }

    /// Property the predicate applies to.
    pub fn prop(&self) -> PropId {
        match self {
            IndexQuery::Exists { prop }
            | IndexQuery::Exact { prop, .. }
            | IndexQuery::Range { prop, .. }
            | IndexQuery::StringPrefix { prop, .. } => *prop,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            IndexQuery::Exists { .. } => "exists",
            IndexQuery::Exact { .. } => "exact",
            IndexQuery::Range { .. } => "range",
            IndexQuery::StringPrefix { .. } => "string prefix",
        }
    }
}

/// Seek bounds and post-filter for a predicate list.
#[derive(Clone, Debug)]
pub(crate) struct QueryPlan {
    pub from: Bound<IndexKey>,
    pub to: Bound<IndexKey>,
    pub prefix: Option<(usize, String)>,
}

fn not_applicable(message: String) -> IndexError {
    IndexError::NotApplicable(message)
}

/// Turns `predicates` into a single contiguous key range, or explains why
/// the layout cannot answer them.
pub(crate) fn plan<L: SchemaLayout>(
    layout: &L,
    props: &[PropId],
    predicates: &[IndexQuery],
) -> Result<QueryPlan> {
    let arity = layout.arity();
    if predicates.len() != arity || props.len() != arity {
        return Err(not_applicable(format!(
            "index over {} propert{} needs one predicate per property, got {}",
            arity,
            if arity == 1 { "y" } else { "ies" },
            predicates.len()
        )));
    }
    let mut from: Vec<KeySlot> = Vec::with_capacity(arity);
    let mut to: Vec<KeySlot> = Vec::with_capacity(arity);
    let mut from_incl = true;
    let mut to_incl = true;
    // Once a non-exact predicate is placed, later slots are unconstrained
    // and take the sentinel that keeps the bound on the correct side.
    let mut from_tail: Option<KeySlot> = None;
    let mut to_tail: Option<KeySlot> = None;
    let mut prefix = None;

    for (slot, (predicate, prop)) in predicates.iter().zip(props).enumerate() {
        if predicate.prop() != *prop {
            return Err(not_applicable(format!(
                "predicate {} targets property {} but slot {} indexes property {}",
                slot,
                predicate.prop(),
                slot,
                prop
            )));
        }
        if let (Some(from_rest), Some(to_rest)) = (&from_tail, &to_tail) {
            if !matches!(predicate, IndexQuery::Exists { .. }) {
                return Err(not_applicable(format!(
                    "{} predicate on slot {} follows a non-exact predicate",
                    predicate.kind(),
                    slot
                )));
            }
            from.push(from_rest.clone());
            to.push(to_rest.clone());
            continue;
        }
        match predicate {
            IndexQuery::Exact { value, .. } => {
                check_value(layout, slot, value)?;
                from.push(KeySlot::Value(value.clone()));
                to.push(KeySlot::Value(value.clone()));
            }
            IndexQuery::Exists { .. } => {
                from.push(KeySlot::Low(None));
                to.push(KeySlot::High(None));
                from_tail = Some(KeySlot::Low(None));
                to_tail = Some(KeySlot::High(None));
            }
            IndexQuery::Range { from: lo, to: hi, .. } => {
                let group = range_group(layout, slot, lo, hi)?;
                match lo {
                    Bound::Included(v) => {
                        from.push(KeySlot::Value(v.clone()));
                        from_tail = Some(KeySlot::Low(None));
                    }
                    Bound::Excluded(v) => {
                        from.push(KeySlot::Value(v.clone()));
                        from_tail = Some(KeySlot::High(None));
                        from_incl = false;
                    }
                    Bound::Unbounded => {
                        from.push(KeySlot::Low(Some(group)));
                        from_tail = Some(KeySlot::Low(None));
                    }
                }
                match hi {
                    Bound::Included(v) => {
                        to.push(KeySlot::Value(v.clone()));
                        to_tail = Some(KeySlot::High(None));
                    }
                    Bound::Excluded(v) => {
                        to.push(KeySlot::Value(v.clone()));
                        to_tail = Some(KeySlot::Low(None));
                        to_incl = false;
                    }
                    Bound::Unbounded => {
                        to.push(KeySlot::High(Some(group)));
                        to_tail = Some(KeySlot::High(None));
                    }
                }
            }
            IndexQuery::StringPrefix { prefix: p, .. } => {
                if !layout.accepts(slot, ValueGroup::Text) {
                    return Err(not_applicable(format!(
                        "{} index slot {} cannot hold text",
                        layout.name(),
                        slot
                    )));
                }
                from.push(KeySlot::Value(PropValue::Str(p.clone())));
                to.push(KeySlot::High(Some(ValueGroup::Text)));
                from_tail = Some(KeySlot::Low(None));
                to_tail = Some(KeySlot::High(None));
                prefix = Some((slot, p.clone()));
            }
        }
    }

    // The entity id tie-break follows the same side as the trailing slots.
    let from_entity = if matches!(from_tail, Some(KeySlot::High(_))) {
        EntityId::MAX
    } else {
        EntityId::MIN
    };
    let to_entity = if matches!(to_tail, Some(KeySlot::Low(_))) {
        EntityId::MIN
    } else {
        EntityId::MAX
    };
    let from_key = IndexKey::from_slots(from_entity, from);
    let to_key = IndexKey::from_slots(to_entity, to);
    Ok(QueryPlan {
        from: if from_incl {
            Bound::Included(from_key)
        } else {
            Bound::Excluded(from_key)
        },
        to: if to_incl {
            Bound::Included(to_key)
        } else {
            Bound::Excluded(to_key)
        },
        prefix,
    })
}

fn check_value<L: SchemaLayout>(layout: &L, slot: usize, value: &PropValue) -> Result<ValueGroup> {
    let Some(group) = value.group() else {
        return Err(not_applicable(format!(
            "null cannot be looked up in slot {slot}"
        )));
    };
    if matches!(value, PropValue::Float(f) if f.is_nan()) {
        return Err(not_applicable(format!("NaN cannot be looked up in slot {slot}")));
    }
    if !layout.accepts(slot, group) {
        return Err(not_applicable(format!(
            "{} index slot {} cannot hold {} values",
            layout.name(),
            slot,
            group.as_str()
        )));
    }
    Ok(group)
}

fn range_group<L: SchemaLayout>(
    layout: &L,
    slot: usize,
    from: &Bound<PropValue>,
    to: &Bound<PropValue>,
) -> Result<ValueGroup> {
    let lo = match from {
        Bound::Included(v) | Bound::Excluded(v) => Some(check_value(layout, slot, v)?),
        Bound::Unbounded => None,
    };
    let hi = match to {
        Bound::Included(v) | Bound::Excluded(v) => Some(check_value(layout, slot, v)?),
        Bound::Unbounded => None,
    };
    match (lo, hi) {
        (Some(a), Some(b)) if a != b => Err(not_applicable(format!(
            "range bounds mix {} and {} values",
            a.as_str(),
            b.as_str()
        ))),
        (Some(group), _) | (_, Some(group)) => Ok(group),
        (None, None) => Err(not_applicable(format!(
            "range on slot {slot} needs at least one bound"
        ))),
    }
}

/// Lazy, finite sequence of entity ids matching a query, in key order.
pub struct IndexHits<L: SchemaLayout> {
    seeker: Seeker<L>,
    prefix: Option<(usize, String)>,
    done: bool,
}

impl<L: SchemaLayout> IndexHits<L> {
    pub(crate) fn new(seeker: Seeker<L>, prefix: Option<(usize, String)>) -> Self {
        Self {
            seeker,
            prefix,
            done: false,
        }
    }

    /// Next matching entity id.
    pub fn next_entity(&mut self) -> Result<Option<EntityId>> {
        if self.done {
            return Ok(None);
        }
        let Some(hit) = self.seeker.next_hit()? else {
            self.done = true;
            return Ok(None);
        };
        if let Some((slot, prefix)) = &self.prefix {
            let matches = matches!(
                hit.key.slots().get(*slot),
                Some(KeySlot::Value(PropValue::Str(s))) if s.starts_with(prefix.as_str())
            );
            if !matches {
                // Keys sharing a prefix are contiguous.
                self.done = true;
                return Ok(None);
            }
        }
        Ok(Some(hit.key.entity()))
    }

    /// Pushes up to `max` ids into `out`; returns `true` while more may remain.
    pub fn next_batch(&mut self, out: &mut Vec<EntityId>, max: usize) -> Result<bool> {
        for _ in 0..max {
            match self.next_entity()? {
                Some(entity) => out.push(entity),
                None => return Ok(false),
            }
        }
        Ok(!self.done)
    }
}

impl<L: SchemaLayout> Iterator for IndexHits<L> {
    type Item = Result<EntityId>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entity().transpose()
    }
}
