use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::types::{EntityId, EntityKind, Result, TokenId};

use super::store::{StorageReader, TokenScanStore};
use super::tracer::CursorTracer;

/// Source of entity ids for a store scan, ascending and without repeats.
pub trait EntityIdIterator: Iterator<Item = EntityId> + Send {
    /// Upper bound on ids still to come, used for progress reporting.
    fn remaining_hint(&self) -> u64;
}

/// Every id from 0 up to the store's high-water mark. Unused ids are
/// skipped by the scan when the record read comes back empty.
pub struct FullStoreIdIterator {
    next: u64,
    end: u64,
}

impl FullStoreIdIterator {
    /// Iterator over all ids of `kind` allocated so far.
    pub fn new(store: &dyn StorageReader, kind: EntityKind) -> Result<Self> {
        let end = store
            .highest_entity_id(kind)?
            .map(|id| id.0.saturating_add(1))
            .unwrap_or(0);
        Ok(Self { next: 0, end })
    }
}

impl Iterator for FullStoreIdIterator {
    type Item = EntityId;

    fn next(&mut self) -> Option<EntityId> {
        if self.next >= self.end {
            return None;
        }
        let id = EntityId(self.next);
        self.next += 1;
        Some(id)
    }
}

impl EntityIdIterator for FullStoreIdIterator {
    fn remaining_hint(&self) -> u64 {
        self.end - self.next.min(self.end)
    }
}

/// Ids of entities carrying any of a set of tokens, read from the token scan
/// store and merged into one ascending sequence.
pub struct TokenScanViewIdIterator {
    lists: Vec<Vec<EntityId>>,
    positions: Vec<usize>,
    heap: BinaryHeap<Reverse<(EntityId, usize)>>,
    last: Option<EntityId>,
}

impl TokenScanViewIdIterator {
    /// Reads the membership lists of `tokens`.
    pub fn new(
        store: &dyn TokenScanStore,
        kind: EntityKind,
        tokens: &[TokenId],
        tracer: &dyn CursorTracer,
    ) -> Result<Self> {
        let mut lists = Vec::with_capacity(tokens.len());
        for token in tokens {
            lists.push(store.entities_with_token(kind, *token, tracer)?);
        }
        let mut heap = BinaryHeap::with_capacity(lists.len());
        for (idx, list) in lists.iter().enumerate() {
            if let Some(first) = list.first() {
                heap.push(Reverse((*first, idx)));
            }
        }
        Ok(Self {
            positions: vec![0; lists.len()],
            lists,
            heap,
            last: None,
        })
    }
}

impl Iterator for TokenScanViewIdIterator {
    type Item = EntityId;

    fn next(&mut self) -> Option<EntityId> {
        while let Some(Reverse((id, idx))) = self.heap.pop() {
            self.positions[idx] += 1;
            if let Some(next) = self.lists[idx].get(self.positions[idx]) {
                self.heap.push(Reverse((*next, idx)));
            }
            if self.last == Some(id) {
                continue;
            }
            self.last = Some(id);
            return Some(id);
        }
        None
    }
}

impl EntityIdIterator for TokenScanViewIdIterator {
    fn remaining_hint(&self) -> u64 {
        self.lists
            .iter()
            .zip(&self.positions)
            .map(|(list, pos)| (list.len() - pos) as u64)
            .sum()
    }
}
