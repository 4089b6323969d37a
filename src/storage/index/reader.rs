use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::storage::tree::{Seeker, TreeSnapshot};
use crate::types::{EntityId, PropId, PropValue, Result};

use super::layout::SchemaLayout;
use super::query::{plan, IndexHits, IndexQuery};
use super::sampler::{IndexSampler, SamplingStrategy};

/// Counts a reader as open until dropped.
pub(crate) struct ReaderLease {
    open: Arc<AtomicUsize>,
}

impl ReaderLease {
    pub(crate) fn new(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::AcqRel);
        Self {
            open: Arc::clone(open),
        }
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Read-only view of an index, fixed at acquisition.
pub struct NativeIndexReader<L: SchemaLayout> {
    snapshot: TreeSnapshot<L>,
    props: SmallVec<[PropId; 2]>,
    sampling: SamplingStrategy,
    _lease: ReaderLease,
}

impl<L: SchemaLayout> NativeIndexReader<L> {
    pub(crate) fn new(
        snapshot: TreeSnapshot<L>,
        props: SmallVec<[PropId; 2]>,
        sampling: SamplingStrategy,
        lease: ReaderLease,
    ) -> Self {
        Self {
            snapshot,
            props,
            sampling,
            _lease: lease,
        }
    }

    /// Number of entries keyed exactly by `(values, entity)`.
    pub fn count_indexed_entities(&self, entity: EntityId, values: &[PropValue]) -> Result<u64> {
        let key = self.snapshot.layout().key_for(entity, values)?;
        self.snapshot
            .seek(Bound::Included(&key), Bound::Included(&key))
            .count_remaining()
    }

    /// Sampler over this reader's view.
    pub fn create_sampler(&self) -> IndexSampler<L> {
        IndexSampler::new(self.snapshot.clone(), self.sampling)
    }

    /// Entity ids matching every predicate, one predicate per indexed
    /// property in index order.
    pub fn query(&self, predicates: &[IndexQuery]) -> Result<IndexHits<L>> {
        let plan = plan(self.snapshot.layout(), &self.props, predicates)?;
        let seeker = self
            .snapshot
            .seek(plan.from.as_ref(), plan.to.as_ref());
        Ok(IndexHits::new(seeker, plan.prefix))
    }

    /// Entries in this reader's view.
    pub fn entries(&self) -> u64 {
        self.snapshot.len() as u64
    }

    /// Releases the view.
    pub fn close(self) {}
}

/// Every indexed entity id in key order. Not restartable.
pub struct AllEntriesReader<L: SchemaLayout> {
    seeker: Seeker<L>,
    max_count: u64,
    _lease: ReaderLease,
}

impl<L: SchemaLayout> AllEntriesReader<L> {
    pub(crate) fn new(snapshot: TreeSnapshot<L>, lease: ReaderLease) -> Self {
        Self {
            max_count: snapshot.len() as u64,
            seeker: snapshot.scan_all(),
            _lease: lease,
        }
    }

    /// Upper bound on the ids this reader yields.
    pub fn max_count(&self) -> u64 {
        self.max_count
    }
}

impl<L: SchemaLayout> Iterator for AllEntriesReader<L> {
    type Item = Result<EntityId>;

    fn next(&mut self) -> Option<Self::Item> {
        self.seeker
            .next_hit()
            .map(|hit| hit.map(|hit| hit.key.entity()))
            .transpose()
    }
}
