use super::*;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

struct U64Layout;

impl Layout for U64Layout {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        0x7465_7374
    }

    fn new_key(&self) -> u64 {
        0
    }

    fn new_value(&self) -> u64 {
        0
    }

    fn encode_key(&self, key: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<u64> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| IndexError::Corruption("unexpected key length"))?;
        Ok(u64::from_be_bytes(arr))
    }

    fn encode_value(&self, value: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode_value(&self, src: &[u8]) -> Result<u64> {
        self.decode_key(src)
    }
}

fn open_tree(path: &Path) -> Result<OrderedTree<U64Layout>> {
    OrderedTree::open(path, U64Layout, true)
}

fn collect_keys(seeker: Seeker<U64Layout>) -> Result<Vec<u64>> {
    seeker.map(|hit| hit.map(|hit| hit.key)).collect()
}

#[test]
fn second_writer_is_refused_until_first_is_dropped() -> Result<()> {
    let dir = tempdir()?;
    let tree = open_tree(&dir.path().join("t.sidx"))?;
    let writer = tree.writer()?;
    assert!(matches!(
        tree.writer(),
        Err(IndexError::Lifecycle("tree writer already acquired"))
    ));
    drop(writer);
    assert!(!tree.has_writer());
    let _again = tree.writer()?;
    Ok(())
}

#[test]
fn readers_never_observe_partial_batches() -> Result<()> {
    let dir = tempdir()?;
    let tree = open_tree(&dir.path().join("t.sidx"))?;
    let mut writer = tree.writer()?;
    for key in 0..10u64 {
        writer.put(&key, &(key * 10));
    }
    let before = tree.snapshot()?;
    assert_eq!(before.len(), 0, "staged puts stay invisible");
    assert_eq!(writer.get(&3)?, Some(30), "writer sees its own puts");
    assert_eq!(writer.commit()?, 10);
    assert_eq!(before.len(), 0, "old snapshot keeps its view");
    assert_eq!(tree.snapshot()?.len(), 10);
    Ok(())
}

#[test]
fn dropped_writer_discards_pending_changes() -> Result<()> {
    let dir = tempdir()?;
    let tree = open_tree(&dir.path().join("t.sidx"))?;
    let mut writer = tree.writer()?;
    writer.put(&1, &1);
    drop(writer);
    assert!(tree.snapshot()?.is_empty());
    Ok(())
}

#[test]
fn remove_returns_previous_value() -> Result<()> {
    let dir = tempdir()?;
    let tree = open_tree(&dir.path().join("t.sidx"))?;
    let mut writer = tree.writer()?;
    writer.put(&5, &50);
    writer.commit()?;
    let mut writer = tree.writer()?;
    assert_eq!(writer.remove(&5)?, Some(50));
    assert_eq!(writer.remove(&5)?, None);
    assert_eq!(writer.get(&5)?, None);
    writer.commit()?;
    assert!(tree.snapshot()?.is_empty());
    Ok(())
}

#[test]
fn seek_honours_bound_kinds() -> Result<()> {
    let dir = tempdir()?;
    let tree = open_tree(&dir.path().join("t.sidx"))?;
    let mut writer = tree.writer()?;
    for key in 1..=9u64 {
        writer.put(&key, &key);
    }
    writer.commit()?;

    let keys = collect_keys(tree.seek(Bound::Included(&3), Bound::Excluded(&6))?)?;
    assert_eq!(keys, vec![3, 4, 5]);
    let keys = collect_keys(tree.seek(Bound::Excluded(&3), Bound::Included(&6))?)?;
    assert_eq!(keys, vec![4, 5, 6]);
    let keys = collect_keys(tree.seek(Bound::Included(&4), Bound::Included(&4))?)?;
    assert_eq!(keys, vec![4]);
    let keys = collect_keys(tree.seek(Bound::Included(&7), Bound::Included(&2))?)?;
    assert!(keys.is_empty(), "inverted range is empty");
    let keys = collect_keys(tree.seek(Bound::Excluded(&4), Bound::Excluded(&4))?)?;
    assert!(keys.is_empty());
    assert_eq!(tree.snapshot()?.scan_all().count_remaining()?, 9);
    Ok(())
}

#[test]
fn checkpointed_state_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.sidx");
    {
        let tree = open_tree(&path)?;
        let mut writer = tree.writer()?;
        writer.put(&11, &110);
        writer.put(&12, &120);
        writer.commit()?;
        let stats = tree.checkpoint(IoLimit::Unlimited)?;
        assert!(!stats.skipped);
        assert_eq!(stats.entries, 2);

        let mut writer = tree.writer()?;
        writer.put(&13, &130);
        writer.commit()?;
        tree.close()?;
    }
    let tree = open_tree(&path)?;
    let keys = collect_keys(tree.snapshot()?.scan_all())?;
    assert_eq!(keys, vec![11, 12], "uncheckpointed write is not durable");
    Ok(())
}

#[test]
fn checkpoint_without_changes_is_skipped() -> Result<()> {
    let dir = tempdir()?;
    let tree = open_tree(&dir.path().join("t.sidx"))?;
    let mut writer = tree.writer()?;
    writer.put(&1, &1);
    writer.commit()?;
    let first = tree.checkpoint(IoLimit::Unlimited)?;
    let second = tree.checkpoint(IoLimit::Unlimited)?;
    assert!(!first.skipped);
    assert!(second.skipped);
    assert_eq!(first.generation, second.generation);
    assert_eq!(tree.checkpoint_generation(), first.generation);
    Ok(())
}

#[test]
fn file_snapshot_holds_off_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let tree = open_tree(&dir.path().join("t.sidx"))?;
    let mut writer = tree.writer()?;
    writer.put(&1, &1);
    writer.commit()?;

    let snapshot = tree.snapshot_files()?;
    let generation = snapshot.generation();
    assert_eq!(snapshot.files(), &[tree.path().to_path_buf()]);

    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    let background = tree.clone();
    let handle = thread::spawn(move || {
        let stats = background
            .checkpoint(IoLimit::Unlimited)
            .expect("checkpoint");
        done_flag.store(true, Ordering::SeqCst);
        stats
    });
    thread::sleep(Duration::from_millis(50));
    assert!(
        !done.load(Ordering::SeqCst),
        "checkpoint waits for the file snapshot"
    );
    assert_eq!(tree.checkpoint_generation(), generation);
    let nested = tree.snapshot_files()?;
    assert_eq!(nested.generation(), generation);
    assert_eq!(tree.open_file_snapshots(), 2);
    drop(nested);
    drop(snapshot);
    let stats = handle.join().unwrap();
    assert_eq!(stats.generation, generation + 1);
    assert_eq!(tree.checkpoint_generation(), generation + 1);
    assert_eq!(tree.open_file_snapshots(), 0);
    Ok(())
}

#[test]
fn pinned_files_cannot_be_deleted() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.sidx");
    let tree = open_tree(&path)?;
    let snapshot = tree.snapshot_files()?;
    tree.close()?;
    assert!(matches!(
        tree.delete_files(),
        Err(IndexError::Lifecycle("tree files are pinned by a snapshot"))
    ));
    assert!(path.exists());
    drop(snapshot);
    tree.delete_files()?;
    assert!(!path.exists());
    Ok(())
}

#[test]
fn closed_tree_rejects_operations_and_can_be_deleted() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.sidx");
    let tree = open_tree(&path)?;
    assert!(matches!(
        tree.delete_files(),
        Err(IndexError::Lifecycle(_))
    ));
    tree.close()?;
    assert!(matches!(tree.close(), Err(IndexError::Lifecycle(_))));
    assert!(matches!(tree.writer(), Err(IndexError::Lifecycle(_))));
    assert!(matches!(tree.snapshot(), Err(IndexError::Lifecycle(_))));
    tree.delete_files()?;
    assert!(!path.exists());
    Ok(())
}

#[test]
fn open_without_create_reports_missing_file() {
    let dir = tempdir().unwrap();
    let result = OrderedTree::open(dir.path().join("missing.sidx"), U64Layout, false);
    assert!(matches!(result, Err(IndexError::Io(_))));
}
