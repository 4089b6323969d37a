#![allow(missing_docs)]

use std::ops::Bound;
use std::path::Path;

use sombra_schema_index::{
    storage::index::{
        CompositeLayout, IndexDescriptor, IndexEntryUpdate, IndexHits, IndexQuery,
        IndexUpdateMode, NativeIndexAccessor, NumberLayout, SamplingStrategy, SchemaDescriptor,
        SchemaLayout, StringLayout,
    },
    types::{EntityId, IndexError, IndexId, PropId, PropValue, Result, TokenId},
    IndexConfig,
};
use tempfile::tempdir;

const CITY: TokenId = TokenId(3);
const NAME: PropId = PropId(1);
const POPULATION: PropId = PropId(2);

fn open<L: SchemaLayout>(
    path: &Path,
    props: &[PropId],
    layout: L,
    config: IndexConfig,
) -> Result<NativeIndexAccessor<L>> {
    let descriptor = IndexDescriptor::new(
        IndexId(10),
        "city_lookup",
        SchemaDescriptor::for_label(CITY, props),
    );
    NativeIndexAccessor::open(path, descriptor, layout, config)
}

fn load<L: SchemaLayout>(
    index: &NativeIndexAccessor<L>,
    rows: impl IntoIterator<Item = (u64, Vec<PropValue>)>,
) -> Result<()> {
    let mut updater = index.new_updater(IndexUpdateMode::Online)?;
    for (entity, values) in rows {
        updater.process(IndexEntryUpdate::Add {
            entity: EntityId(entity),
            values,
        })?;
    }
    updater.close()?;
    Ok(())
}

fn ids<L: SchemaLayout>(hits: IndexHits<L>) -> Result<Vec<u64>> {
    hits.map(|hit| hit.map(|entity| entity.0)).collect()
}

fn numbers(dir: &Path) -> Result<NativeIndexAccessor<NumberLayout>> {
    let index = open(
        &dir.join("population.sidx"),
        &[POPULATION],
        NumberLayout,
        IndexConfig::default(),
    )?;
    load(
        &index,
        [
            (1, vec![PropValue::Int(10)]),
            (2, vec![PropValue::Float(10.5)]),
            (3, vec![PropValue::Int(20)]),
            (4, vec![PropValue::Float(20.0)]),
            (5, vec![PropValue::Int(-3)]),
            (6, vec![PropValue::Int(30)]),
        ],
    )?;
    Ok(index)
}

#[test]
fn numeric_ranges_respect_bound_inclusivity() -> Result<()> {
    let dir = tempdir()?;
    let index = numbers(dir.path())?;
    let reader = index.new_reader()?;

    let inclusive = reader.query(&[IndexQuery::range(
        POPULATION,
        Bound::Included(PropValue::Int(10)),
        Bound::Included(PropValue::Int(20)),
    )])?;
    assert_eq!(ids(inclusive)?, vec![1, 2, 3, 4]);

    let exclusive = reader.query(&[IndexQuery::range(
        POPULATION,
        Bound::Excluded(PropValue::Int(10)),
        Bound::Excluded(PropValue::Float(20.0)),
    )])?;
    assert_eq!(ids(exclusive)?, vec![2]);

    let open_low = reader.query(&[IndexQuery::range(
        POPULATION,
        Bound::Unbounded,
        Bound::Excluded(PropValue::Int(10)),
    )])?;
    assert_eq!(ids(open_low)?, vec![5]);

    let open_high = reader.query(&[IndexQuery::range(
        POPULATION,
        Bound::Excluded(PropValue::Int(20)),
        Bound::Unbounded,
    )])?;
    assert_eq!(ids(open_high)?, vec![6]);
    Ok(())
}

#[test]
fn exact_matches_integers_and_equal_floats() -> Result<()> {
    let dir = tempdir()?;
    let index = numbers(dir.path())?;
    let reader = index.new_reader()?;
    assert_eq!(
        ids(reader.query(&[IndexQuery::exact(POPULATION, 20i64)])?)?,
        vec![3, 4]
    );
    assert_eq!(
        ids(reader.query(&[IndexQuery::exact(POPULATION, 20.0f64)])?)?,
        vec![3, 4]
    );
    assert!(ids(reader.query(&[IndexQuery::exact(POPULATION, 11i64)])?)?.is_empty());
    assert_eq!(ids(reader.query(&[IndexQuery::exists(POPULATION)])?)?.len(), 6);
    Ok(())
}

#[test]
fn hits_can_be_drained_in_batches() -> Result<()> {
    let dir = tempdir()?;
    let index = numbers(dir.path())?;
    let reader = index.new_reader()?;
    let mut hits = reader.query(&[IndexQuery::exists(POPULATION)])?;
    let mut out = Vec::new();
    assert!(hits.next_batch(&mut out, 4)?);
    assert_eq!(out.len(), 4);
    assert!(!hits.next_batch(&mut out, 4)?);
    assert_eq!(
        out,
        [5, 1, 2, 3, 4, 6].into_iter().map(EntityId).collect::<Vec<_>>()
    );
    assert_eq!(hits.next_entity()?, None);
    Ok(())
}

#[test]
fn string_prefix_stops_at_first_non_match() -> Result<()> {
    let dir = tempdir()?;
    let index = open(
        &dir.path().join("name.sidx"),
        &[NAME],
        StringLayout,
        IndexConfig::default(),
    )?;
    load(
        &index,
        ["a", "ab", "abc", "abd", "ac", "b", "", "äb"]
            .into_iter()
            .enumerate()
            .map(|(id, name)| (id as u64, vec![PropValue::from(name)])),
    )?;
    let reader = index.new_reader()?;
    assert_eq!(
        ids(reader.query(&[IndexQuery::string_prefix(NAME, "ab")])?)?,
        vec![1, 2, 3]
    );
    assert_eq!(
        ids(reader.query(&[IndexQuery::string_prefix(NAME, "")])?)?.len(),
        8
    );
    assert!(ids(reader.query(&[IndexQuery::string_prefix(NAME, "z")])?)?.is_empty());
    assert_eq!(
        ids(reader.query(&[IndexQuery::range(
            NAME,
            Bound::Included(PropValue::from("ab")),
            Bound::Excluded(PropValue::from("b")),
        )])?)?,
        vec![1, 2, 3, 4]
    );
    Ok(())
}

#[test]
fn composite_queries_use_exact_prefix_then_range() -> Result<()> {
    let dir = tempdir()?;
    let index = open(
        &dir.path().join("city.sidx"),
        &[NAME, POPULATION],
        CompositeLayout::new(2)?,
        IndexConfig::default(),
    )?;
    load(
        &index,
        [
            (1, vec![PropValue::from("Oslo"), PropValue::Int(700)]),
            (2, vec![PropValue::from("Oslo"), PropValue::Int(50)]),
            (3, vec![PropValue::from("Oslo"), PropValue::from("unknown")]),
            (4, vec![PropValue::from("Bergen"), PropValue::Int(280)]),
            (5, vec![PropValue::from("Osaka"), PropValue::Int(2_700)]),
        ],
    )?;
    let reader = index.new_reader()?;

    let in_range = reader.query(&[
        IndexQuery::exact(NAME, "Oslo"),
        IndexQuery::range(
            POPULATION,
            Bound::Included(PropValue::Int(100)),
            Bound::Unbounded,
        ),
    ])?;
    assert_eq!(ids(in_range)?, vec![1]);

    let any_population = reader.query(&[
        IndexQuery::exact(NAME, "Oslo"),
        IndexQuery::exists(POPULATION),
    ])?;
    assert_eq!(ids(any_population)?, vec![2, 1, 3]);

    let by_prefix = reader.query(&[
        IndexQuery::string_prefix(NAME, "Os"),
        IndexQuery::exists(POPULATION),
    ])?;
    assert_eq!(ids(by_prefix)?, vec![5, 2, 1, 3]);

    let everything = reader.query(&[IndexQuery::exists(NAME), IndexQuery::exists(POPULATION)])?;
    assert_eq!(ids(everything)?.len(), 5);
    Ok(())
}

#[test]
fn unanswerable_queries_are_not_applicable() -> Result<()> {
    let dir = tempdir()?;
    let index = open(
        &dir.path().join("city.sidx"),
        &[NAME, POPULATION],
        CompositeLayout::new(2)?,
        IndexConfig::default(),
    )?;
    let reader = index.new_reader()?;
    let rejected: Vec<Vec<IndexQuery>> = vec![
        vec![IndexQuery::exact(NAME, "Oslo")],
        vec![
            IndexQuery::exists(NAME),
            IndexQuery::exact(POPULATION, 10i64),
        ],
        vec![
            IndexQuery::exact(POPULATION, 10i64),
            IndexQuery::exact(NAME, "Oslo"),
        ],
        vec![
            IndexQuery::range(
                NAME,
                Bound::Included(PropValue::from("a")),
                Bound::Included(PropValue::Int(1)),
            ),
            IndexQuery::exists(POPULATION),
        ],
        vec![
            IndexQuery::exact(NAME, PropValue::Null),
            IndexQuery::exists(POPULATION),
        ],
    ];
    for predicates in rejected {
        assert!(
            matches!(reader.query(&predicates), Err(IndexError::NotApplicable(_))),
            "{predicates:?} should be rejected"
        );
    }

    let numeric = numbers(dir.path())?;
    let numeric_reader = numeric.new_reader()?;
    assert!(matches!(
        numeric_reader.query(&[IndexQuery::string_prefix(POPULATION, "1")]),
        Err(IndexError::NotApplicable(_))
    ));
    Ok(())
}

#[test]
fn full_sampling_counts_distinct_values_exactly() -> Result<()> {
    let dir = tempdir()?;
    let index = open(
        &dir.path().join("sampled.sidx"),
        &[POPULATION],
        NumberLayout,
        IndexConfig::default().sampling(SamplingStrategy::Full),
    )?;
    load(
        &index,
        (0..100u64).map(|id| (id, vec![PropValue::Int((id % 10) as i64)])),
    )?;
    let sample = index.new_reader()?.create_sampler().sample_index()?;
    assert_eq!(sample.index_size, 100);
    assert_eq!(sample.unique_values, 10);
    assert_eq!(sample.sample_size, 100);
    assert!((sample.selectivity() - 0.1).abs() < f64::EPSILON);
    Ok(())
}

#[test]
fn reservoir_sampling_is_reproducible_and_bounded() -> Result<()> {
    let dir = tempdir()?;
    let strategy = SamplingStrategy::Reservoir { size: 64, seed: 42 };
    let index = open(
        &dir.path().join("sampled.sidx"),
        &[POPULATION],
        NumberLayout,
        IndexConfig::default().sampling(strategy),
    )?;
    load(
        &index,
        (0..1_000u64).map(|id| (id, vec![PropValue::Int(id as i64)])),
    )?;
    let reader = index.new_reader()?;
    let sampler = reader.create_sampler();
    assert_eq!(sampler.strategy(), strategy);
    let first = sampler.sample_index()?;
    let second = reader.create_sampler().sample_index()?;
    assert_eq!(first, second);
    assert_eq!(first.index_size, 1_000);
    assert_eq!(first.sample_size, 64);
    assert!(first.unique_values <= first.index_size);
    assert!(first.unique_values > 500, "all-distinct index estimated as such");

    let empty = open(
        &dir.path().join("empty.sidx"),
        &[POPULATION],
        NumberLayout,
        IndexConfig::default().sampling(strategy),
    )?;
    let sample = empty.new_reader()?.create_sampler().sample_index()?;
    assert_eq!(sample.index_size, 0);
    assert_eq!(sample.selectivity(), 1.0);
    Ok(())
}
