use std::time::Instant;

use tracing::{debug, info};

use crate::storage::scan::{EntityUpdates, Visitor};
use crate::storage::tree::CheckpointStats;
use crate::types::Result;

use super::accessor::NativeIndexAccessor;
use super::layout::SchemaLayout;
use super::updater::{IndexEntryUpdate, IndexUpdateMode};

/// Totals for a population run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PopulationSummary {
    /// Entry updates accepted.
    pub updates: u64,
    /// Updater batches applied.
    pub batches: u64,
    /// Keys inserted.
    pub added: u64,
    /// Keys removed.
    pub removed: u64,
    /// Entities skipped because the layout cannot hold their values.
    pub skipped: u64,
}

/// Collects scan output for one index and writes it in batched updaters.
///
/// Entities whose values the layout does not accept (text under a number
/// index, say) are skipped and counted. Uniqueness is not checked per batch;
/// run
/// [`NativeIndexAccessor::verify_deferred_constraints`] afterwards for
/// unique indexes.
pub struct IndexPopulator<'a, L: SchemaLayout> {
    accessor: &'a NativeIndexAccessor<L>,
    batch: Vec<IndexEntryUpdate>,
    batch_size: usize,
    summary: PopulationSummary,
    started: Instant,
}

impl<'a, L: SchemaLayout> IndexPopulator<'a, L> {
    /// Populator writing into `accessor`, sized by its configuration.
    pub fn new(accessor: &'a NativeIndexAccessor<L>) -> Self {
        let batch_size = accessor.config().population_batch_size.max(1);
        Self {
            accessor,
            batch: Vec::with_capacity(batch_size),
            batch_size,
            summary: PopulationSummary::default(),
            started: Instant::now(),
        }
    }

    /// Queues one update, flushing when the batch is full.
    pub fn add(&mut self, update: IndexEntryUpdate) -> Result<()> {
        self.batch.push(update);
        self.summary.updates += 1;
        if self.batch.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Totals so far.
    pub fn summary(&self) -> PopulationSummary {
        self.summary
    }

    /// Applies the remaining batch and checkpoints with the configured I/O
    /// limit.
    pub fn finish(mut self) -> Result<(PopulationSummary, CheckpointStats)> {
        self.flush()?;
        let stats = self
            .accessor
            .force_with_limit(self.accessor.config().checkpoint_io_limit)?;
        info!(
            index = %self.accessor.descriptor().id,
            updates = self.summary.updates,
            batches = self.summary.batches,
            skipped = self.summary.skipped,
            generation = stats.generation,
            duration_ms = self.started.elapsed().as_secs_f64() * 1_000.0,
            "index.population.completed"
        );
        Ok((self.summary, stats))
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let mut updater = self.accessor.new_updater(IndexUpdateMode::Batched)?;
        for update in self.batch.drain(..) {
            updater.process(update)?;
        }
        let applied = updater.close()?;
        self.summary.batches += 1;
        self.summary.added += applied.added;
        self.summary.removed += applied.removed;
        debug!(
            index = %self.accessor.descriptor().id,
            added = applied.added,
            removed = applied.removed,
            "index.population.batch"
        );
        Ok(())
    }
}

impl<L: SchemaLayout> Visitor<EntityUpdates> for IndexPopulator<'_, L> {
    fn visit(&mut self, item: &EntityUpdates) -> Result<bool> {
        let Some(update) = item.for_index(&self.accessor.descriptor().schema) else {
            return Ok(false);
        };
        if let Err(err) = self.accepts(&update) {
            debug!(
                index = %self.accessor.descriptor().id,
                entity = %update.entity(),
                error = %err,
                "index.population.skipped"
            );
            self.summary.skipped += 1;
            return Ok(false);
        }
        self.add(update)?;
        Ok(false)
    }
}

impl<L: SchemaLayout> IndexPopulator<'_, L> {
    fn accepts(&self, update: &IndexEntryUpdate) -> Result<()> {
        let layout = self.accessor.layout();
        match update {
            IndexEntryUpdate::Add { values, .. } | IndexEntryUpdate::Remove { values, .. } => {
                layout.validate(values)
            }
            IndexEntryUpdate::Change { before, after, .. } => {
                layout.validate(before)?;
                layout.validate(after)
            }
        }
    }
}
