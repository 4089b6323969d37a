//! Lifecycle façade binding a schema index to its tree file.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::storage::scan::PropertyAccessor;
use crate::storage::tree::{CheckpointStats, FileSnapshot, IoLimit, OrderedTree};
use crate::types::{
    ConstraintConflicts, EntityId, IndexEntryConflict, IndexError, PropValue, Result,
};

use super::descriptor::IndexDescriptor;
use super::key::IndexKey;
use super::layout::SchemaLayout;
use super::reader::{AllEntriesReader, NativeIndexReader, ReaderLease};
use super::updater::{new_writer_slot, IndexUpdateMode, NativeIndexUpdater, WriterSlot};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AccessorState {
    Open,
    Closed,
    Dropped,
}

/// Owns one schema index and hands out its updaters and readers.
pub struct NativeIndexAccessor<L: SchemaLayout> {
    descriptor: IndexDescriptor,
    tree: OrderedTree<L>,
    config: IndexConfig,
    writer_slot: WriterSlot,
    open_readers: Arc<AtomicUsize>,
    state: Mutex<AccessorState>,
}

impl<L: SchemaLayout> NativeIndexAccessor<L> {
    /// Opens the index stored at `path`, creating it when allowed by
    /// `config.create_if_missing`.
    pub fn open(
        path: impl AsRef<Path>,
        descriptor: IndexDescriptor,
        layout: L,
        config: IndexConfig,
    ) -> Result<Self> {
        if layout.arity() != descriptor.schema.arity() {
            return Err(IndexError::Invalid(
                "layout arity does not match index schema",
            ));
        }
        let tree = OrderedTree::open(path, layout, config.create_if_missing)?;
        info!(
            index = %descriptor.id,
            name = %descriptor.name,
            layout = tree.layout().name(),
            unique = descriptor.unique,
            "index.opened"
        );
        Ok(Self {
            descriptor,
            tree,
            config,
            writer_slot: new_writer_slot(),
            open_readers: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(AccessorState::Open),
        })
    }

    /// Identity of the index.
    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    /// Configuration the accessor was opened with.
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Key layout.
    pub fn layout(&self) -> &L {
        self.tree.layout()
    }

    /// Readers and all-entries readers not yet dropped.
    pub fn open_readers(&self) -> usize {
        self.open_readers.load(Ordering::Acquire)
    }

    /// Returns `true` while an updater holds the writer permit.
    pub fn has_open_updater(&self) -> bool {
        self.writer_slot.lock().is_none()
    }

    /// Opens the single updater. Fails with a lifecycle error while another
    /// updater is open.
    pub fn new_updater(&self, mode: IndexUpdateMode) -> Result<NativeIndexUpdater<L>> {
        self.ensure_open()?;
        NativeIndexUpdater::open(
            self.descriptor.id,
            &self.tree,
            &self.writer_slot,
            mode,
            self.descriptor.unique,
        )
    }

    /// Checkpoints without an I/O limit.
    pub fn force(&self) -> Result<CheckpointStats> {
        self.force_with_limit(IoLimit::Unlimited)
    }

    /// Checkpoints, pacing writes to `limit`. A no-op when nothing changed
    /// since the previous checkpoint.
    pub fn force_with_limit(&self, limit: IoLimit) -> Result<CheckpointStats> {
        self.ensure_open()?;
        let stats = self.tree.checkpoint(limit)?;
        debug!(
            index = %self.descriptor.id,
            generation = stats.generation,
            skipped = stats.skipped,
            "index.force"
        );
        Ok(stats)
    }

    /// Releases the tree. Every later operation fails.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            AccessorState::Open => {}
            AccessorState::Closed => return Err(IndexError::Lifecycle("index already closed")),
            AccessorState::Dropped => return Err(IndexError::Lifecycle("index was dropped")),
        }
        if self.has_open_updater() {
            warn!(index = %self.descriptor.id, "index.close.updater_open");
        }
        self.tree.close()?;
        *state = AccessorState::Closed;
        info!(index = %self.descriptor.id, "index.closed");
        Ok(())
    }

    /// Deletes every file of the index. No updater, reader or file snapshot
    /// may be open.
    pub fn drop_index(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == AccessorState::Dropped {
            return Err(IndexError::Lifecycle("index already dropped"));
        }
        if self.has_open_updater() {
            return Err(IndexError::Lifecycle("cannot drop index with an open updater"));
        }
        if self.open_readers() > 0 {
            return Err(IndexError::Lifecycle("cannot drop index with open readers"));
        }
        if self.tree.open_file_snapshots() > 0 {
            return Err(IndexError::Lifecycle(
                "cannot drop index with an open file snapshot",
            ));
        }
        if *state == AccessorState::Open {
            self.tree.close()?;
        }
        self.tree.delete_files()?;
        *state = AccessorState::Dropped;
        info!(index = %self.descriptor.id, "index.dropped");
        Ok(())
    }

    /// Reader over committed state as of now.
    pub fn new_reader(&self) -> Result<NativeIndexReader<L>> {
        self.ensure_open()?;
        Ok(NativeIndexReader::new(
            self.tree.snapshot()?,
            self.descriptor.schema.props.clone(),
            self.config.sampling,
            ReaderLease::new(&self.open_readers),
        ))
    }

    /// Every indexed entity id, lazily, in key order.
    pub fn new_all_entries_reader(&self) -> Result<AllEntriesReader<L>> {
        self.ensure_open()?;
        Ok(AllEntriesReader::new(
            self.tree.snapshot()?,
            ReaderLease::new(&self.open_readers),
        ))
    }

    /// Pins the files of the last completed checkpoint for backup.
    pub fn snapshot_files(&self) -> Result<FileSnapshot> {
        // Held across the pin so a concurrent drop sees the snapshot.
        let state = self.state.lock();
        if *state != AccessorState::Open {
            return Err(IndexError::Lifecycle("index is not open"));
        }
        self.tree.snapshot_files()
    }

    /// Re-checks uniqueness against live entity state and reports every
    /// value tuple still held by more than one entity.
    pub fn verify_deferred_constraints(&self, accessor: &dyn PropertyAccessor) -> Result<()> {
        self.ensure_open()?;
        if !self.descriptor.unique {
            return Ok(());
        }
        let start = Instant::now();
        let snapshot = self.tree.snapshot()?;
        let mut conflicts = ConstraintConflicts::default();
        let mut run: Vec<IndexKey> = Vec::new();
        let mut run_values: Vec<u8> = Vec::new();
        for hit in snapshot.scan_all() {
            let key = hit?.key;
            let mut values = Vec::new();
            key.encode_values(&mut values);
            if values != run_values {
                self.check_run(&run, accessor, &mut conflicts)?;
                run.clear();
                run_values = values;
            }
            run.push(key);
        }
        self.check_run(&run, accessor, &mut conflicts)?;
        info!(
            index = %self.descriptor.id,
            entries = snapshot.len(),
            conflicts = conflicts.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1_000.0,
            "index.verify.completed"
        );
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(IndexError::Conflict(conflicts))
        }
    }

    fn check_run(
        &self,
        run: &[IndexKey],
        accessor: &dyn PropertyAccessor,
        conflicts: &mut ConstraintConflicts,
    ) -> Result<()> {
        if run.len() < 2 {
            return Ok(());
        }
        let values = run[0].values();
        let mut live: Vec<EntityId> = Vec::with_capacity(run.len());
        for key in run {
            if self.holds_values(accessor, key.entity(), &values)? {
                live.push(key.entity());
            }
        }
        if live.len() > 1 {
            conflicts.conflicts.push(IndexEntryConflict {
                values,
                entities: live,
            });
        }
        Ok(())
    }

    fn holds_values(
        &self,
        accessor: &dyn PropertyAccessor,
        entity: EntityId,
        values: &[PropValue],
    ) -> Result<bool> {
        let schema = &self.descriptor.schema;
        for (prop, expected) in schema.props.iter().zip(values) {
            match accessor.property_value(schema.kind, entity, *prop)? {
                Some(actual) if actual.index_eq(expected) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn ensure_open(&self) -> Result<()> {
        match *self.state.lock() {
            AccessorState::Open => Ok(()),
            AccessorState::Closed => Err(IndexError::Lifecycle("index is closed")),
            AccessorState::Dropped => Err(IndexError::Lifecycle("index was dropped")),
        }
    }
}
