//! Single-pass scan over every entity of one kind, feeding index
//! population visitors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::primitives::concurrency::{LockMode, LockService, LockTarget};
use crate::types::{EntityId, EntityKind, IndexError, PropId, Result, TokenId};

use super::id_iter::{EntityIdIterator, FullStoreIdIterator, TokenScanViewIdIterator};
use super::store::{EntityRecord, StorageReader, TokenScanStore};
use super::tracer::{default_tracer, CursorTracer, LocalMemoryTracker, MemoryTracker};
use super::updates::{EntityTokenUpdate, EntityUpdates, PropertyChange, TokenSet};

/// Receives scan events. Returning `Ok(true)` stops the scan after the
/// current entity.
pub trait Visitor<T> {
    /// Handles one event.
    fn visit(&mut self, item: &T) -> Result<bool>;
}

impl<T, F> Visitor<T> for F
where
    F: FnMut(&T) -> Result<bool>,
{
    fn visit(&mut self, item: &T) -> Result<bool> {
        self(item)
    }
}

/// Token state already reflected in the target index, so a rerun only
/// reports what actually differs.
pub trait TokenBaseline: Send + Sync {
    /// Tokens the index already records for `entity`.
    fn tokens_before(&self, entity: EntityId) -> TokenSet;
}

/// Baseline of an empty index: no entity has any token yet.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyBaseline;

impl TokenBaseline for EmptyBaseline {
    fn tokens_before(&self, _entity: EntityId) -> TokenSet {
        TokenSet::new()
    }
}

/// Entities processed versus the expected total.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PopulationProgress {
    /// Ids handled so far.
    pub completed: u64,
    /// Ids expected, an upper bound for token-view scans.
    pub total: u64,
}

/// Counters of a finished or stopped scan.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScanOutcome {
    /// Entities that existed and were read.
    pub entities_visited: u64,
    /// Token update events dispatched.
    pub token_updates: u64,
    /// Property update events dispatched.
    pub property_updates: u64,
    /// The scan ended early on request.
    pub stopped: bool,
}

#[derive(Default)]
struct ScanShared {
    stop: AtomicBool,
    completed: AtomicU64,
    total: AtomicU64,
}

/// Cross-thread control over a running scan.
#[derive(Clone)]
pub struct ScanStopHandle {
    shared: Arc<ScanShared>,
}

impl ScanStopHandle {
    /// Asks the scan to stop before its next entity.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Returns `true` once [`ScanStopHandle::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Current progress.
    pub fn progress(&self) -> PopulationProgress {
        PopulationProgress {
            completed: self.shared.completed.load(Ordering::Acquire),
            total: self.shared.total.load(Ordering::Acquire),
        }
    }
}

enum IdSource<'a> {
    Full,
    View {
        token_store: &'a dyn TokenScanStore,
        tokens: Vec<TokenId>,
    },
}

type PropertyFilter<'a> = Box<dyn Fn(PropId) -> bool + Send + 'a>;

/// Configures a [`StoreScan`].
pub struct StoreScanBuilder<'a> {
    kind: EntityKind,
    store: &'a dyn StorageReader,
    locks: &'a dyn LockService,
    source: IdSource<'a>,
    token_filter: Option<Vec<TokenId>>,
    property_filter: Option<PropertyFilter<'a>>,
    token_visitor: Option<Box<dyn Visitor<EntityTokenUpdate> + 'a>>,
    property_visitor: Option<Box<dyn Visitor<EntityUpdates> + 'a>>,
    baseline: Option<&'a dyn TokenBaseline>,
    tracer: Arc<dyn CursorTracer>,
    memory_limit: Option<usize>,
}

impl<'a> StoreScanBuilder<'a> {
    fn new(
        kind: EntityKind,
        store: &'a dyn StorageReader,
        locks: &'a dyn LockService,
        source: IdSource<'a>,
    ) -> Self {
        let token_filter = match &source {
            IdSource::View { tokens, .. } => Some(tokens.clone()),
            IdSource::Full => None,
        };
        Self {
            kind,
            store,
            locks,
            source,
            token_filter,
            property_filter: None,
            token_visitor: None,
            property_visitor: None,
            baseline: None,
            tracer: default_tracer(),
            memory_limit: None,
        }
    }

    /// Sequential scan over every node record.
    pub fn nodes(store: &'a dyn StorageReader, locks: &'a dyn LockService) -> Self {
        Self::new(EntityKind::Node, store, locks, IdSource::Full)
    }

    /// Sequential scan over every relationship record.
    pub fn relationships(store: &'a dyn StorageReader, locks: &'a dyn LockService) -> Self {
        Self::new(EntityKind::Relationship, store, locks, IdSource::Full)
    }

    /// Node scan sourcing ids from the label scan store, limited to `labels`.
    pub fn label_view(
        store: &'a dyn StorageReader,
        token_store: &'a dyn TokenScanStore,
        locks: &'a dyn LockService,
        labels: &[TokenId],
    ) -> Self {
        Self::new(
            EntityKind::Node,
            store,
            locks,
            IdSource::View {
                token_store,
                tokens: sorted_tokens(labels),
            },
        )
    }

    /// Relationship scan sourcing ids from the relationship type scan store,
    /// limited to `types`.
    pub fn relationship_type_view(
        store: &'a dyn StorageReader,
        token_store: &'a dyn TokenScanStore,
        locks: &'a dyn LockService,
        types: &[TokenId],
    ) -> Self {
        Self::new(
            EntityKind::Relationship,
            store,
            locks,
            IdSource::View {
                token_store,
                tokens: sorted_tokens(types),
            },
        )
    }

    /// Only entities carrying one of `tokens` produce events.
    pub fn token_filter(mut self, tokens: &[TokenId]) -> Self {
        self.token_filter = Some(sorted_tokens(tokens));
        self
    }

    /// Only properties accepted by `filter` appear in property updates.
    pub fn property_filter(mut self, filter: impl Fn(PropId) -> bool + Send + 'a) -> Self {
        self.property_filter = Some(Box::new(filter));
        self
    }

    /// Receives token membership updates.
    pub fn token_visitor(mut self, visitor: impl Visitor<EntityTokenUpdate> + 'a) -> Self {
        self.token_visitor = Some(Box::new(visitor));
        self
    }

    /// Receives property updates.
    pub fn property_visitor(mut self, visitor: impl Visitor<EntityUpdates> + 'a) -> Self {
        self.property_visitor = Some(Box::new(visitor));
        self
    }

    /// Token state to diff against; defaults to [`EmptyBaseline`].
    pub fn baseline(mut self, baseline: &'a dyn TokenBaseline) -> Self {
        self.baseline = Some(baseline);
        self
    }

    /// Page cursor tracer for I/O accounting.
    pub fn tracer(mut self, tracer: Arc<dyn CursorTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Ceiling on transient bytes held for a single entity.
    pub fn memory_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Finishes configuration.
    pub fn build(self) -> StoreScan<'a> {
        StoreScan {
            memory: LocalMemoryTracker::new(self.memory_limit),
            config: self,
            shared: Arc::new(ScanShared::default()),
            ran: false,
        }
    }
}

fn sorted_tokens(tokens: &[TokenId]) -> Vec<TokenId> {
    let mut out = tokens.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

/// A configured, not yet started scan. Runs at most once.
pub struct StoreScan<'a> {
    config: StoreScanBuilder<'a>,
    memory: LocalMemoryTracker,
    shared: Arc<ScanShared>,
    ran: bool,
}

impl<'a> StoreScan<'a> {
    /// Handle for stopping the scan or polling progress from another thread.
    pub fn stop_handle(&self) -> ScanStopHandle {
        ScanStopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current progress.
    pub fn progress(&self) -> PopulationProgress {
        self.stop_handle().progress()
    }

    /// Transient memory accounting for the scan.
    pub fn memory(&self) -> &dyn MemoryTracker {
        &self.memory
    }

    /// Walks every entity once. Each entity is read and dispatched under a
    /// shared entity lock that is released before the next one is taken.
    pub fn run(&mut self) -> Result<ScanOutcome> {
        if self.ran {
            return Err(IndexError::Lifecycle("store scan already ran"));
        }
        self.ran = true;
        let start = Instant::now();
        let kind = self.config.kind;
        let mut ids: Box<dyn EntityIdIterator + 'a> = match &self.config.source {
            IdSource::Full => Box::new(FullStoreIdIterator::new(self.config.store, kind)?),
            IdSource::View {
                token_store,
                tokens,
            } => Box::new(TokenScanViewIdIterator::new(
                *token_store,
                kind,
                tokens,
                self.config.tracer.as_ref(),
            )?),
        };
        self.shared
            .total
            .store(ids.remaining_hint(), Ordering::Release);
        debug!(
            kind = kind.as_str(),
            total = ids.remaining_hint(),
            "store_scan.started"
        );

        let mut outcome = ScanOutcome::default();
        for id in ids.by_ref() {
            if self.shared.stop.load(Ordering::Acquire) {
                outcome.stopped = true;
                break;
            }
            let stop = self.process(id, &mut outcome)?;
            self.shared.completed.fetch_add(1, Ordering::AcqRel);
            if stop {
                self.shared.stop.store(true, Ordering::Release);
                outcome.stopped = true;
                break;
            }
        }

        let duration_ms = start.elapsed().as_secs_f64() * 1_000.0;
        if outcome.stopped {
            info!(
                kind = kind.as_str(),
                visited = outcome.entities_visited,
                token_updates = outcome.token_updates,
                property_updates = outcome.property_updates,
                duration_ms,
                "store_scan.stopped"
            );
        } else {
            info!(
                kind = kind.as_str(),
                visited = outcome.entities_visited,
                token_updates = outcome.token_updates,
                property_updates = outcome.property_updates,
                duration_ms,
                "store_scan.completed"
            );
        }
        Ok(outcome)
    }

    fn process(&mut self, id: EntityId, outcome: &mut ScanOutcome) -> Result<bool> {
        let kind = self.config.kind;
        let target = match kind {
            EntityKind::Node => LockTarget::node(id),
            EntityKind::Relationship => LockTarget::relationship(id),
        };
        let _guard = self.config.locks.acquire(target, LockMode::Shared)?;
        let Some(record) = self
            .config
            .store
            .read_entity(kind, id, self.config.tracer.as_ref())?
        else {
            return Ok(false);
        };
        outcome.entities_visited += 1;

        let reserved = record_footprint(&record);
        self.memory.allocate(reserved)?;
        let result = self.dispatch(record, outcome);
        self.memory.release(reserved);
        result
    }

    fn dispatch(&mut self, record: EntityRecord, outcome: &mut ScanOutcome) -> Result<bool> {
        let selected = match &self.config.token_filter {
            Some(filter) => record
                .tokens
                .iter()
                .any(|token| filter.binary_search(token).is_ok()),
            None => true,
        };
        if !selected {
            return Ok(false);
        }
        let mut stop = false;

        if let Some(visitor) = self.config.token_visitor.as_mut() {
            let before = match self.config.baseline {
                Some(baseline) => baseline.tokens_before(record.id),
                None => TokenSet::new(),
            };
            if before != record.tokens {
                let update = EntityTokenUpdate {
                    entity: record.id,
                    before,
                    after: record.tokens.clone(),
                };
                outcome.token_updates += 1;
                stop |= visitor.visit(&update)?;
            }
        }

        if let Some(visitor) = self.config.property_visitor.as_mut() {
            let filter = &self.config.property_filter;
            let changes: Vec<PropertyChange> = record
                .properties
                .into_iter()
                .filter(|(prop, _)| filter.as_ref().map_or(true, |accept| accept(*prop)))
                .map(|(prop, value)| PropertyChange {
                    prop,
                    before: None,
                    after: Some(value),
                })
                .collect();
            if !changes.is_empty() {
                let updates = EntityUpdates {
                    entity: record.id,
                    kind: self.config.kind,
                    tokens: record.tokens,
                    changes,
                };
                outcome.property_updates += 1;
                stop |= visitor.visit(&updates)?;
            }
        }
        Ok(stop)
    }
}

fn record_footprint(record: &EntityRecord) -> usize {
    let tokens = record.tokens.len() * std::mem::size_of::<TokenId>();
    let props: usize = record
        .properties
        .iter()
        .map(|(_, value)| std::mem::size_of::<PropId>() + value.estimated_size())
        .sum();
    tokens + props
}
