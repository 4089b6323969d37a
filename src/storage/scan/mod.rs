#![forbid(unsafe_code)]

//! Store scans that drive index population.

mod id_iter;
mod store;
mod store_scan;
mod tracer;
mod updates;

pub use id_iter::{EntityIdIterator, FullStoreIdIterator, TokenScanViewIdIterator};
pub use store::{EntityRecord, PropertyAccessor, StorageReader, TokenScanStore};
pub use store_scan::{
    EmptyBaseline, PopulationProgress, ScanOutcome, ScanStopHandle, StoreScan, StoreScanBuilder,
    TokenBaseline, Visitor,
};
pub use tracer::{
    default_tracer, CountingCursorTracer, CursorStats, CursorTracer, LocalMemoryTracker,
    MemoryTracker, NoopCursorTracer,
};
pub use updates::{EntityTokenUpdate, EntityUpdates, PropertyChange, TokenSet};
