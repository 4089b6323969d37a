//! Single-use batch writer over a schema index.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::storage::tree::{OrderedTree, TreeWriter};
use crate::types::{
    ConstraintConflicts, EntityId, IndexEntryConflict, IndexError, IndexId, PropValue, Result,
};

use super::key::IndexKey;
use super::layout::{IndexValue, SchemaLayout};

/// How an updater treats uniqueness and missing or duplicate entries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexUpdateMode {
    /// Transaction apply: uniqueness is enforced per batch and removing an
    /// absent entry is corruption.
    Online,
    /// Bulk population: uniqueness is deferred to
    /// `verify_deferred_constraints`.
    Batched,
    /// Log replay: re-adding present entries and removing absent ones is
    /// allowed.
    Recovery,
}

/// One change to the indexed values of an entity.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexEntryUpdate {
    /// The entity started matching the index.
    Add {
        /// Entity id.
        entity: EntityId,
        /// Indexed values, in slot order.
        values: Vec<PropValue>,
    },
    /// The entity's indexed values changed.
    Change {
        /// Entity id.
        entity: EntityId,
        /// Values currently in the index.
        before: Vec<PropValue>,
        /// Replacement values.
        after: Vec<PropValue>,
    },
    /// The entity stopped matching the index.
    Remove {
        /// Entity id.
        entity: EntityId,
        /// Values currently in the index.
        values: Vec<PropValue>,
    },
}

impl IndexEntryUpdate {
    /// Entity the update concerns.
    pub fn entity(&self) -> EntityId {
        match self {
            IndexEntryUpdate::Add { entity, .. }
            | IndexEntryUpdate::Change { entity, .. }
            | IndexEntryUpdate::Remove { entity, .. } => *entity,
        }
    }
}

/// Counters returned when an updater applies its batch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UpdateSummary {
    /// Keys inserted.
    pub added: u64,
    /// Keys removed.
    pub removed: u64,
}

/// Token granting the right to write the index. Exactly one exists per
/// accessor; it lives either in the accessor's slot or in an open updater.
#[derive(Debug)]
pub(crate) struct WriterPermit(());

pub(crate) type WriterSlot = Arc<Mutex<Option<WriterPermit>>>;

pub(crate) fn new_writer_slot() -> WriterSlot {
    Arc::new(Mutex::new(Some(WriterPermit(()))))
}

/// Holds the permit for the lifetime of an updater and hands it back on drop.
struct PermitLease {
    slot: WriterSlot,
    permit: Option<WriterPermit>,
}

impl PermitLease {
    fn take(slot: &WriterSlot) -> Result<Self> {
        let permit = slot
            .lock()
            .take()
            .ok_or(IndexError::Lifecycle("index updater already open"))?;
        Ok(Self {
            slot: Arc::clone(slot),
            permit: Some(permit),
        })
    }
}

impl Drop for PermitLease {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            *self.slot.lock() = Some(permit);
        }
    }
}

enum Staged {
    Insert(IndexKey),
    Remove(IndexKey),
}

impl Staged {
    fn key(&self) -> &IndexKey {
        match self {
            Staged::Insert(key) | Staged::Remove(key) => key,
        }
    }
}

/// Buffers entry updates and applies them atomically on [`close`].
///
/// Dropping an updater without closing it discards the batch and returns
/// the writer permit.
///
/// [`close`]: NativeIndexUpdater::close
pub struct NativeIndexUpdater<L: SchemaLayout> {
    index: IndexId,
    tree: OrderedTree<L>,
    writer: TreeWriter<L>,
    mode: IndexUpdateMode,
    unique: bool,
    staged: Vec<Staged>,
    _lease: PermitLease,
}

impl<L: SchemaLayout> NativeIndexUpdater<L> {
    pub(crate) fn open(
        index: IndexId,
        tree: &OrderedTree<L>,
        slot: &WriterSlot,
        mode: IndexUpdateMode,
        unique: bool,
    ) -> Result<Self> {
        // Permit first: a failed writer acquisition returns it on drop.
        let lease = PermitLease::take(slot)?;
        let writer = tree.writer()?;
        debug!(index = %index, ?mode, "index.updater.opened");
        Ok(Self {
            index,
            tree: tree.clone(),
            writer,
            mode,
            unique,
            staged: Vec::new(),
            _lease: lease,
        })
    }

    /// Mode the updater was opened with.
    pub fn mode(&self) -> IndexUpdateMode {
        self.mode
    }

    /// Operations staged so far.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Validates and stages one update. Nothing becomes visible before
    /// [`NativeIndexUpdater::close`].
    pub fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        let layout = self.tree.layout();
        match update {
            IndexEntryUpdate::Add { entity, values } => {
                self.staged.push(Staged::Insert(layout.key_for(entity, &values)?));
            }
            IndexEntryUpdate::Remove { entity, values } => {
                self.staged.push(Staged::Remove(layout.key_for(entity, &values)?));
            }
            IndexEntryUpdate::Change {
                entity,
                before,
                after,
            } => {
                let old = layout.key_for(entity, &before)?;
                let new = layout.key_for(entity, &after)?;
                if old.compare_values(&new).is_eq() {
                    return Ok(());
                }
                self.staged.push(Staged::Remove(old));
                self.staged.push(Staged::Insert(new));
            }
        }
        Ok(())
    }

    /// Applies the batch as one atomic commit and releases the writer.
    ///
    /// On a uniqueness violation nothing is applied and the error lists every
    /// conflicting value group.
    pub fn close(self) -> Result<UpdateSummary> {
        let NativeIndexUpdater {
            index,
            tree,
            mut writer,
            mode,
            unique,
            staged,
            _lease,
        } = self;
        let start = Instant::now();
        if unique && mode == IndexUpdateMode::Online {
            let conflicts = find_conflicts(&tree, &staged)?;
            if !conflicts.is_empty() {
                info!(
                    index = %index,
                    conflicts = conflicts.len(),
                    "index.updater.conflict"
                );
                return Err(IndexError::Conflict(conflicts));
            }
        }

        let mut summary = UpdateSummary::default();
        for op in &staged {
            match op {
                Staged::Insert(key) => {
                    if writer.get(key)?.is_some() {
                        continue;
                    }
                    writer.put(key, &IndexValue);
                    summary.added += 1;
                }
                Staged::Remove(key) => {
                    let previous = writer.remove(key)?;
                    if previous.is_none() && mode == IndexUpdateMode::Online {
                        return Err(IndexError::Corruption(
                            "index entry missing during remove",
                        ));
                    }
                    summary.removed += u64::from(previous.is_some());
                }
            }
        }
        writer.commit()?;
        info!(
            index = %index,
            ?mode,
            added = summary.added,
            removed = summary.removed,
            duration_ms = start.elapsed().as_secs_f64() * 1_000.0,
            "index.updater.applied"
        );
        Ok(summary)
    }
}

/// Replays the batch over committed state, per distinct value tuple that the
/// batch inserts, and reports every tuple left with more than one holder.
fn find_conflicts<L: SchemaLayout>(
    tree: &OrderedTree<L>,
    staged: &[Staged],
) -> Result<ConstraintConflicts> {
    let mut groups: BTreeMap<Vec<u8>, Vec<&Staged>> = BTreeMap::new();
    for op in staged {
        let mut values = Vec::new();
        op.key().encode_values(&mut values);
        groups.entry(values).or_default().push(op);
    }
    let snapshot = tree.snapshot()?;
    let mut conflicts = ConstraintConflicts::default();
    for ops in groups.values() {
        let Some(Staged::Insert(sample)) = ops.iter().find(|op| matches!(op, Staged::Insert(_)))
        else {
            continue;
        };
        let mut low = sample.clone();
        low.set_entity(EntityId::MIN);
        let mut high = sample.clone();
        high.set_entity(EntityId::MAX);
        let mut holders = BTreeSet::new();
        for hit in snapshot.seek(Bound::Included(&low), Bound::Included(&high)) {
            holders.insert(hit?.key.entity());
        }
        for op in ops {
            match op {
                Staged::Insert(key) => holders.insert(key.entity()),
                Staged::Remove(key) => holders.remove(&key.entity()),
            };
        }
        if holders.len() > 1 {
            conflicts.conflicts.push(IndexEntryConflict {
                values: sample.values(),
                entities: holders.into_iter().collect(),
            });
        }
    }
    Ok(conflicts)
}
