#![forbid(unsafe_code)]

//! Native schema index: layouts, accessor, updater and reader.

mod accessor;
mod descriptor;
mod key;
mod layout;
mod population;
mod query;
mod reader;
mod sampler;
mod updater;

pub use accessor::NativeIndexAccessor;
pub use descriptor::{IndexDescriptor, SchemaDescriptor};
pub use key::{IndexKey, KeySlot};
pub use layout::{CompositeLayout, IndexValue, NumberLayout, SchemaLayout, StringLayout};
pub use population::{IndexPopulator, PopulationSummary};
pub use query::{IndexHits, IndexQuery};
pub use reader::{AllEntriesReader, NativeIndexReader};
pub use sampler::{IndexSample, IndexSampler, SamplingStrategy};
pub use updater::{IndexEntryUpdate, IndexUpdateMode, NativeIndexUpdater, UpdateSummary};
