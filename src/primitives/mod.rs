//! Low-level primitives shared by the index and scan layers.

/// Concurrency primitives and synchronization.
///
/// Entity lock service arbitrating reads during store scans against
/// transactional writes.
pub mod concurrency;
