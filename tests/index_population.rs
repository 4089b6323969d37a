#![allow(missing_docs)]

use std::ops::Bound;
use std::path::Path;
use std::sync::Once;

use sombra_schema_index::{
    primitives::concurrency::EntityLockService,
    storage::{
        index::{
            CompositeLayout, IndexDescriptor, IndexPopulator, IndexQuery, NativeIndexAccessor,
            NumberLayout, PopulationSummary, SchemaDescriptor, SchemaLayout,
        },
        scan::{EntityUpdates, StoreScanBuilder, Visitor},
        tree::IoLimit,
        MemoryStore,
    },
    types::{EntityId, EntityKind, IndexError, IndexId, PropId, PropValue, Result, TokenId},
    IndexConfig,
};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

const PERSON: TokenId = TokenId(1);
const ROBOT: TokenId = TokenId(2);
const FOLLOWS: TokenId = TokenId(20);
const NAME: PropId = PropId(1);
const AGE: PropId = PropId(2);
const SINCE: PropId = PropId(3);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_schema_index=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// 100 nodes: even ids are people, every third id is a robot. People
/// divisible by 10 have no age.
fn people() -> Result<MemoryStore> {
    init_tracing();
    let store = MemoryStore::new();
    for id in 0..100u64 {
        let mut labels = Vec::new();
        if id % 2 == 0 {
            labels.push(PERSON);
        }
        if id % 3 == 0 {
            labels.push(ROBOT);
        }
        let node = store.create_node(&labels);
        store.set_property(EntityKind::Node, node, NAME, format!("n{id:03}"))?;
        if id % 10 != 0 {
            store.set_property(EntityKind::Node, node, AGE, id as i64)?;
        }
    }
    Ok(store)
}

fn populate<L: SchemaLayout>(
    store: &MemoryStore,
    index: &NativeIndexAccessor<L>,
) -> Result<PopulationSummary> {
    let schema = index.descriptor().schema.clone();
    let locks = EntityLockService::new();
    let mut populator = IndexPopulator::new(index);
    {
        let props = schema.props.clone();
        let builder = match schema.kind {
            EntityKind::Node => StoreScanBuilder::label_view(store, store, &locks, &[schema.token]),
            EntityKind::Relationship => {
                StoreScanBuilder::relationship_type_view(store, store, &locks, &[schema.token])
            }
        };
        let mut scan = builder
            .memory_limit(index.config().scan_memory_limit)
            .property_filter(move |prop| props.contains(&prop))
            .property_visitor(|updates: &EntityUpdates| -> Result<bool> {
                populator.visit(updates)
            })
            .build();
        scan.run()?;
    }
    assert_eq!(locks.held_locks(), 0);
    let (summary, stats) = populator.finish()?;
    assert!(!stats.skipped || summary.updates == 0);
    Ok(summary)
}

fn age_index(path: &Path, unique: bool, config: IndexConfig) -> Result<NativeIndexAccessor<NumberLayout>> {
    let schema = SchemaDescriptor::for_label(PERSON, &[AGE]);
    let descriptor = if unique {
        IndexDescriptor::unique(IndexId(1), "person_age", schema)
    } else {
        IndexDescriptor::new(IndexId(1), "person_age", schema)
    };
    NativeIndexAccessor::open(path, descriptor, NumberLayout, config)
}

fn query_ids<L: SchemaLayout>(
    index: &NativeIndexAccessor<L>,
    predicates: &[IndexQuery],
) -> Result<Vec<u64>> {
    index
        .new_reader()?
        .query(predicates)?
        .map(|hit| hit.map(|entity| entity.0))
        .collect()
}

#[test]
fn label_scan_populates_only_labelled_entities_with_values() -> Result<()> {
    let dir = tempdir()?;
    let store = people()?;
    let config = IndexConfig::default()
        .population_batch_size(16)
        .checkpoint_io_limit(IoLimit::BytesPerSecond(64 << 20));
    let index = age_index(&dir.path().join("age.sidx"), false, config)?;

    let summary = populate(&store, &index)?;
    assert_eq!(summary.updates, 40, "50 people minus 10 without age");
    assert_eq!(summary.added, 40);
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.skipped, 0);

    let young = query_ids(
        &index,
        &[IndexQuery::range(
            AGE,
            Bound::Included(PropValue::Int(0)),
            Bound::Excluded(PropValue::Int(13)),
        )],
    )?;
    assert_eq!(young, vec![2, 4, 6, 8, 12]);
    Ok(())
}

#[test]
fn populated_index_is_durable() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("age.sidx");
    let store = people()?;
    {
        let index = age_index(&path, false, IndexConfig::default())?;
        populate(&store, &index)?;
        index.close()?;
    }
    let index = age_index(&path, false, IndexConfig::default().create_if_missing(false))?;
    assert_eq!(index.new_reader()?.entries(), 40);
    assert_eq!(
        query_ids(&index, &[IndexQuery::exact(AGE, 98i64)])?,
        vec![98]
    );
    Ok(())
}

#[test]
fn values_the_layout_cannot_hold_are_skipped() -> Result<()> {
    let dir = tempdir()?;
    let store = people()?;
    store.set_property(EntityKind::Node, EntityId(4), AGE, "four")?;
    let index = age_index(&dir.path().join("age.sidx"), false, IndexConfig::default())?;

    let summary = populate(&store, &index)?;
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.updates, 39);
    assert_eq!(index.new_reader()?.entries(), 39);
    assert_eq!(
        query_ids(
            &index,
            &[IndexQuery::range(
                AGE,
                Bound::Included(PropValue::Int(0)),
                Bound::Excluded(PropValue::Int(9)),
            )],
        )?,
        vec![2, 6, 8]
    );
    Ok(())
}

#[test]
fn composite_population_requires_every_property() -> Result<()> {
    let dir = tempdir()?;
    let store = people()?;
    let index = NativeIndexAccessor::open(
        dir.path().join("robot.sidx"),
        IndexDescriptor::new(
            IndexId(2),
            "robot_name_age",
            SchemaDescriptor::for_label(ROBOT, &[NAME, AGE]),
        ),
        CompositeLayout::new(2)?,
        IndexConfig::default(),
    )?;
    // 34 robots (0, 3, ..., 99), 4 of which (0, 30, 60, 90) have no age.
    assert_eq!(populate(&store, &index)?.updates, 30);
    assert_eq!(
        query_ids(
            &index,
            &[
                IndexQuery::string_prefix(NAME, "n0"),
                IndexQuery::exists(AGE),
            ],
        )?,
        vec![3, 6, 9, 12, 15, 18, 21, 24, 27, 33, 36, 39, 42, 45, 48, 51, 54, 57, 63, 66, 69, 72, 75, 78, 81, 84, 87, 93, 96, 99]
    );
    assert_eq!(
        query_ids(
            &index,
            &[IndexQuery::exact(NAME, "n042"), IndexQuery::exact(AGE, 42i64)],
        )?,
        vec![42]
    );
    Ok(())
}

#[test]
fn relationship_index_population() -> Result<()> {
    let dir = tempdir()?;
    let store = MemoryStore::new();
    for id in 0..12u64 {
        let rel_type = if id < 8 { FOLLOWS } else { TokenId(21) };
        let rel = store.create_relationship(rel_type);
        store.set_property(EntityKind::Relationship, rel, SINCE, 2_000 + id as i64)?;
    }
    let index = NativeIndexAccessor::open(
        dir.path().join("follows.sidx"),
        IndexDescriptor::new(
            IndexId(3),
            "follows_since",
            SchemaDescriptor::for_rel_type(FOLLOWS, &[SINCE]),
        ),
        NumberLayout,
        IndexConfig::default(),
    )?;
    let summary = populate(&store, &index)?;
    assert_eq!(summary.updates, 8);
    assert_eq!(summary.batches, 1);
    assert_eq!(
        query_ids(
            &index,
            &[IndexQuery::range(
                SINCE,
                Bound::Included(PropValue::Int(2_006)),
                Bound::Unbounded,
            )],
        )?,
        vec![6, 7]
    );
    Ok(())
}

#[test]
fn unique_population_defers_conflicts_to_verification() -> Result<()> {
    let dir = tempdir()?;
    let store = MemoryStore::new();
    for age in [30i64, 31, 30, 32, 31, 30] {
        let node = store.create_node(&[PERSON]);
        store.set_property(EntityKind::Node, node, AGE, age)?;
    }
    let index = age_index(
        &dir.path().join("age.sidx"),
        true,
        IndexConfig::default().population_batch_size(2),
    )?;
    let summary = populate(&store, &index)?;
    assert_eq!(summary.updates, 6);
    assert_eq!(summary.batches, 3);

    match index.verify_deferred_constraints(&store) {
        Err(IndexError::Conflict(conflicts)) => {
            assert_eq!(conflicts.len(), 2);
            assert_eq!(
                conflicts.conflicts[0].entities,
                vec![EntityId(0), EntityId(2), EntityId(5)]
            );
            assert_eq!(
                conflicts.conflicts[1].entities,
                vec![EntityId(1), EntityId(4)]
            );
        }
        other => panic!("expected conflicts, got {other:?}"),
    }

    // Resolving the duplicates in the store clears the violations.
    for (node, age) in [(2u64, 40i64), (5, 41), (4, 42)] {
        store.set_property(EntityKind::Node, EntityId(node), AGE, age)?;
    }
    index.verify_deferred_constraints(&store)?;
    Ok(())
}

#[test]
fn population_respects_scan_memory_limit() -> Result<()> {
    let dir = tempdir()?;
    let store = people()?;
    let node = store.create_node(&[PERSON]);
    store.set_property(EntityKind::Node, node, AGE, 1i64)?;
    store.set_property(EntityKind::Node, node, NAME, "y".repeat(10_000))?;
    let index = age_index(
        &dir.path().join("age.sidx"),
        false,
        IndexConfig::default().scan_memory_limit(Some(1_024)),
    )?;
    assert!(matches!(
        populate(&store, &index),
        Err(IndexError::MemoryLimitExceeded { limit: 1_024, .. })
    ));
    assert!(!index.has_open_updater());
    Ok(())
}
