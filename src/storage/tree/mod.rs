#![forbid(unsafe_code)]

//! Durable ordered key-value tree consumed by the schema index.
//!
//! The tree keeps its committed state as an immutable sorted map that is
//! swapped wholesale when a writer commits, so readers that captured the map
//! keep a stable view without blocking the writer. Durability comes from
//! explicit checkpoints that persist the committed map to a single file.
//!
//! A commit made while a reader or snapshot still shares the map clones it
//! first, so such commits cost O(entries) rather than O(batch).

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{IndexError, Result};

mod file;

use file::Entries;

/// Type-specific rule for constructing, encoding and ordering keys and values.
///
/// `encode_key` must be order preserving: the byte-wise order of two encoded
/// keys is the order of the keys themselves.
pub trait Layout: Send + Sync + 'static {
    /// Key type stored in the tree.
    type Key: Clone + fmt::Debug + Send + Sync + 'static;
    /// Value type stored next to each key.
    type Value: Clone + fmt::Debug + Send + Sync + 'static;

    /// Identifier persisted with every checkpoint; a file written by another
    /// layout is refused on open.
    fn identifier(&self) -> u64;

    /// Fresh key with layout-defined initial contents.
    fn new_key(&self) -> Self::Key;

    /// Fresh value with layout-defined initial contents.
    fn new_value(&self) -> Self::Value;

    /// Encode `key` into `out` using the order-preserving representation.
    fn encode_key(&self, key: &Self::Key, out: &mut Vec<u8>);

    /// Decode a key from its encoded representation.
    fn decode_key(&self, bytes: &[u8]) -> Result<Self::Key>;

    /// Encode `value` into `out`.
    fn encode_value(&self, value: &Self::Value, out: &mut Vec<u8>);

    /// Decode a value from `src`.
    fn decode_value(&self, src: &[u8]) -> Result<Self::Value>;
}

/// I/O budget for a checkpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoLimit {
    /// No throttling.
    #[default]
    Unlimited,
    /// Average write rate ceiling.
    BytesPerSecond(u64),
}

/// Result of a checkpoint call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CheckpointStats {
    /// Generation of the durable state after the call.
    pub generation: u64,
    /// Entries persisted, zero when skipped.
    pub entries: u64,
    /// Bytes written, zero when skipped.
    pub bytes: u64,
    /// `true` when nothing changed since the previous checkpoint.
    pub skipped: bool,
}

/// One key/value pair returned by a seek.
#[derive(Clone, Debug)]
pub struct Hit<K, V> {
    /// Decoded key.
    pub key: K,
    /// Decoded value.
    pub value: V,
}

struct Committed {
    entries: Arc<Entries>,
    version: u64,
}

#[derive(Debug)]
struct CheckpointState {
    generation: u64,
    version: u64,
}

struct TreeInner<L: Layout> {
    layout: L,
    path: PathBuf,
    committed: RwLock<Committed>,
    checkpoint: Arc<RwLock<CheckpointState>>,
    durable_generation: AtomicU64,
    file_snapshots: Arc<AtomicUsize>,
    writer_held: AtomicBool,
    closed: AtomicBool,
}

/// Handle to an open tree. Clones share the same tree.
pub struct OrderedTree<L: Layout> {
    inner: Arc<TreeInner<L>>,
}

impl<L: Layout> Clone for OrderedTree<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Layout> OrderedTree<L> {
    /// Opens the tree stored at `path`, creating an empty one (and its first
    /// checkpoint) when the file is missing and `create_if_missing` is set.
    pub fn open(path: impl AsRef<Path>, layout: L, create_if_missing: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        remove_if_exists(&file::staging_path(&path))?;
        let layout_id = layout.identifier();
        let (entries, generation) = if path.exists() {
            let checkpoint = file::read_checkpoint(&path, layout_id)?;
            (checkpoint.entries, checkpoint.generation)
        } else if create_if_missing {
            let entries = Entries::new();
            file::write_checkpoint(&path, layout_id, 1, &entries, IoLimit::Unlimited)?;
            (entries, 1)
        } else {
            return Err(IndexError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("tree file not found: {}", path.display()),
            )));
        };
        debug!(
            path = %path.display(),
            generation,
            entries = entries.len(),
            "tree.open"
        );
        Ok(Self {
            inner: Arc::new(TreeInner {
                layout,
                path,
                committed: RwLock::new(Committed {
                    entries: Arc::new(entries),
                    version: 0,
                }),
                checkpoint: Arc::new(RwLock::new(CheckpointState {
                    generation,
                    version: 0,
                })),
                durable_generation: AtomicU64::new(generation),
                file_snapshots: Arc::new(AtomicUsize::new(0)),
                writer_held: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Layout driving key/value construction and ordering.
    pub fn layout(&self) -> &L {
        &self.inner.layout
    }

    /// Fresh key from the layout.
    pub fn new_key(&self) -> L::Key {
        self.inner.layout.new_key()
    }

    /// Fresh value from the layout.
    pub fn new_value(&self) -> L::Value {
        self.inner.layout.new_value()
    }

    /// Path of the durable file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Acquires the exclusive writer. Fails while another writer is open.
    pub fn writer(&self) -> Result<TreeWriter<L>> {
        self.ensure_open()?;
        if self
            .inner
            .writer_held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(IndexError::Lifecycle("tree writer already acquired"));
        }
        Ok(TreeWriter {
            inner: Arc::clone(&self.inner),
            pending: BTreeMap::new(),
        })
    }

    /// Returns `true` while a writer is open.
    pub fn has_writer(&self) -> bool {
        self.inner.writer_held.load(Ordering::Acquire)
    }

    /// Captures the committed state as of now.
    pub fn snapshot(&self) -> Result<TreeSnapshot<L>> {
        self.ensure_open()?;
        let entries = Arc::clone(&self.inner.committed.read().entries);
        Ok(TreeSnapshot {
            inner: Arc::clone(&self.inner),
            entries,
        })
    }

    /// Seeks over committed state between `from` and `to`.
    pub fn seek(&self, from: Bound<&L::Key>, to: Bound<&L::Key>) -> Result<Seeker<L>> {
        Ok(self.snapshot()?.seek(from, to))
    }

    /// Persists committed state unless nothing changed since the last
    /// checkpoint. Durable once this returns.
    pub fn checkpoint(&self, limit: IoLimit) -> Result<CheckpointStats> {
        self.ensure_open()?;
        let mut state = self.inner.checkpoint.write();
        let (entries, version) = {
            let committed = self.inner.committed.read();
            (Arc::clone(&committed.entries), committed.version)
        };
        if version == state.version {
            debug!(
                path = %self.inner.path.display(),
                generation = state.generation,
                "tree.checkpoint.skipped"
            );
            return Ok(CheckpointStats {
                generation: state.generation,
                entries: 0,
                bytes: 0,
                skipped: true,
            });
        }
        let start = Instant::now();
        let generation = state.generation + 1;
        let bytes = file::write_checkpoint(
            &self.inner.path,
            self.inner.layout.identifier(),
            generation,
            &entries,
            limit,
        )?;
        state.generation = generation;
        state.version = version;
        self.inner
            .durable_generation
            .store(generation, Ordering::Release);
        info!(
            path = %self.inner.path.display(),
            generation,
            entries = entries.len(),
            bytes,
            duration_ms = start.elapsed().as_secs_f64() * 1_000.0,
            "tree.checkpoint.completed"
        );
        Ok(CheckpointStats {
            generation,
            entries: entries.len() as u64,
            bytes,
            skipped: false,
        })
    }

    /// Generation of the most recent durable checkpoint.
    pub fn checkpoint_generation(&self) -> u64 {
        self.inner.durable_generation.load(Ordering::Acquire)
    }

    /// Pins the durable files; checkpoints wait until the snapshot is dropped.
    ///
    /// Taking a further snapshot while one is held never waits, even with a
    /// checkpoint queued behind the first.
    pub fn snapshot_files(&self) -> Result<FileSnapshot> {
        self.ensure_open()?;
        let guard = self.inner.checkpoint.read_arc_recursive();
        let generation = guard.generation;
        self.inner.file_snapshots.fetch_add(1, Ordering::AcqRel);
        Ok(FileSnapshot {
            _guard: guard,
            open: Arc::clone(&self.inner.file_snapshots),
            generation,
            files: vec![self.inner.path.clone()],
        })
    }

    /// File snapshots not yet dropped.
    pub fn open_file_snapshots(&self) -> usize {
        self.inner.file_snapshots.load(Ordering::Acquire)
    }

    /// Marks the tree closed; later operations fail with a lifecycle error.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(IndexError::Lifecycle("tree already closed"));
        }
        debug!(path = %self.inner.path.display(), "tree.close");
        Ok(())
    }

    /// Removes every file belonging to the tree. The tree must be closed and
    /// no file snapshot may be held.
    pub fn delete_files(&self) -> Result<()> {
        if !self.inner.closed.load(Ordering::Acquire) {
            return Err(IndexError::Lifecycle("tree must be closed before deletion"));
        }
        if self.open_file_snapshots() > 0 {
            return Err(IndexError::Lifecycle("tree files are pinned by a snapshot"));
        }
        let _checkpoint = self.inner.checkpoint.write();
        remove_if_exists(&self.inner.path)?;
        remove_if_exists(&file::staging_path(&self.inner.path))?;
        info!(path = %self.inner.path.display(), "tree.files.deleted");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(IndexError::Lifecycle("tree is closed"));
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Exclusive batch writer. Staged changes become visible to readers only when
/// [`TreeWriter::commit`] runs; dropping the writer discards them.
pub struct TreeWriter<L: Layout> {
    inner: Arc<TreeInner<L>>,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<L: Layout> TreeWriter<L> {
    /// Stages `key -> value`, replacing any previous value.
    pub fn put(&mut self, key: &L::Key, value: &L::Value) {
        let mut k = Vec::new();
        self.inner.layout.encode_key(key, &mut k);
        let mut v = Vec::new();
        self.inner.layout.encode_value(value, &mut v);
        self.pending.insert(k, Some(v));
    }

    /// Stages removal of `key`, returning the value visible to this writer.
    pub fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>> {
        let mut k = Vec::new();
        self.inner.layout.encode_key(key, &mut k);
        let previous = self.lookup(&k);
        self.pending.insert(k, None);
        previous
            .map(|bytes| self.inner.layout.decode_value(&bytes))
            .transpose()
    }

    /// Value for `key` as seen by this writer, staged changes included.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        let mut k = Vec::new();
        self.inner.layout.encode_key(key, &mut k);
        self.lookup(&k)
            .map(|bytes| self.inner.layout.decode_value(&bytes))
            .transpose()
    }

    /// Number of staged operations.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Publishes every staged change at once and releases the writer.
    /// Returns the number of operations applied.
    pub fn commit(mut self) -> Result<usize> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(IndexError::Lifecycle("tree is closed"));
        }
        let pending = std::mem::take(&mut self.pending);
        let applied = pending.len();
        if applied == 0 {
            return Ok(0);
        }
        let mut committed = self.inner.committed.write();
        let entries = Arc::make_mut(&mut committed.entries);
        for (key, value) in pending {
            match value {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        committed.version += 1;
        Ok(applied)
    }

    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.pending.get(key) {
            Some(staged) => staged.clone(),
            None => self.inner.committed.read().entries.get(key).cloned(),
        }
    }
}

impl<L: Layout> Drop for TreeWriter<L> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                discarded = self.pending.len(),
                "tree.writer.discarded"
            );
        }
        self.inner.writer_held.store(false, Ordering::Release);
    }
}

/// Read view fixed at acquisition.
pub struct TreeSnapshot<L: Layout> {
    inner: Arc<TreeInner<L>>,
    entries: Arc<Entries>,
}

impl<L: Layout> Clone for TreeSnapshot<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<L: Layout> TreeSnapshot<L> {
    /// Number of entries in the view.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the view holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Layout of the underlying tree.
    pub fn layout(&self) -> &L {
        &self.inner.layout
    }

    /// Iterates hits between `from` and `to` in key order.
    pub fn seek(&self, from: Bound<&L::Key>, to: Bound<&L::Key>) -> Seeker<L> {
        let lower = self.encode_bound(from);
        let upper = self.encode_bound(to);
        let done = range_is_empty(&lower, &upper);
        Seeker {
            snapshot: self.clone(),
            lower,
            upper,
            done,
        }
    }

    /// Iterates every entry in key order.
    pub fn scan_all(&self) -> Seeker<L> {
        self.seek(Bound::Unbounded, Bound::Unbounded)
    }

    fn encode_bound(&self, bound: Bound<&L::Key>) -> Bound<Vec<u8>> {
        let encode = |key: &L::Key| {
            let mut out = Vec::new();
            self.inner.layout.encode_key(key, &mut out);
            out
        };
        match bound {
            Bound::Included(key) => Bound::Included(encode(key)),
            Bound::Excluded(key) => Bound::Excluded(encode(key)),
            Bound::Unbounded => Bound::Unbounded,
        }
    }
}

fn range_is_empty(lower: &Bound<Vec<u8>>, upper: &Bound<Vec<u8>>) -> bool {
    match (lower, upper) {
        (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
        (Bound::Included(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi))
        | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
        _ => false,
    }
}

/// Lazy, finite cursor over a [`TreeSnapshot`].
pub struct Seeker<L: Layout> {
    snapshot: TreeSnapshot<L>,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    done: bool,
}

impl<L: Layout> Seeker<L> {
    /// Advances and returns the next hit, if any.
    pub fn next_hit(&mut self) -> Result<Option<Hit<L::Key, L::Value>>> {
        if self.done {
            return Ok(None);
        }
        let lower = std::mem::replace(&mut self.lower, Bound::Unbounded);
        let next = self
            .snapshot
            .entries
            .range::<Vec<u8>, _>((lower, self.upper.clone()))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        let Some((key, value)) = next else {
            self.done = true;
            return Ok(None);
        };
        self.lower = Bound::Excluded(key.clone());
        self.done = range_is_empty(&self.lower, &self.upper);
        let layout = &self.snapshot.inner.layout;
        let hit = Hit {
            key: layout.decode_key(&key)?,
            value: layout.decode_value(&value)?,
        };
        Ok(Some(hit))
    }

    /// Consumes the cursor, returning the number of remaining hits.
    pub fn count_remaining(mut self) -> Result<u64> {
        let mut count = 0u64;
        while self.next_hit()?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

impl<L: Layout> Iterator for Seeker<L> {
    type Item = Result<Hit<L::Key, L::Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_hit().transpose()
    }
}

/// Durable files pinned for an online backup.
pub struct FileSnapshot {
    _guard: ArcRwLockReadGuard<RawRwLock, CheckpointState>,
    open: Arc<AtomicUsize>,
    generation: u64,
    files: Vec<PathBuf>,
}

impl FileSnapshot {
    /// Checkpoint generation the files represent.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Files to copy.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl Drop for FileSnapshot {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for FileSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSnapshot")
            .field("generation", &self.generation)
            .field("files", &self.files)
            .finish()
    }
}

#[cfg(test)]
mod tests;
