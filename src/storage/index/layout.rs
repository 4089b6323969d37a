use crate::storage::tree::Layout;
use crate::types::{EntityId, IndexError, PropValue, Result, ValueGroup};

use super::key::IndexKey;

const NUMBER_LAYOUT_ID: u64 = 0x5349_4458_4e55_4d31; // "SIDXNUM1"
const STRING_LAYOUT_ID: u64 = 0x5349_4458_5354_5231; // "SIDXSTR1"
const COMPOSITE_LAYOUT_ID: u64 = 0x5349_4458_434d_0000; // "SIDXCM" + arity

/// Payload stored next to every index key. Schema index entries carry no
/// data beyond the key itself.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexValue;

/// Key layout of a schema index: how many value slots a key has and which
/// value groups each slot accepts.
pub trait SchemaLayout: Layout<Key = IndexKey, Value = IndexValue> + Clone {
    /// Number of property values per key.
    fn arity(&self) -> usize;

    /// Returns `true` when slot `slot` may hold values of `group`.
    fn accepts(&self, slot: usize, group: ValueGroup) -> bool;

    /// Short name used in log fields and error messages.
    fn name(&self) -> &'static str;

    /// Checks that `values` can be stored under this layout.
    fn validate(&self, values: &[PropValue]) -> Result<()> {
        if values.len() != self.arity() {
            return Err(IndexError::Invalid("value count does not match index arity"));
        }
        for (slot, value) in values.iter().enumerate() {
            let Some(group) = value.group() else {
                return Err(IndexError::Invalid("null values are not indexed"));
            };
            if let PropValue::Float(f) = value {
                if f.is_nan() {
                    return Err(IndexError::Invalid("NaN values are not indexed"));
                }
            }
            if !self.accepts(slot, group) {
                return Err(IndexError::Invalid(
                    "value group not accepted by index layout",
                ));
            }
        }
        Ok(())
    }

    /// Validated key for `entity` holding `values`.
    fn key_for(&self, entity: EntityId, values: &[PropValue]) -> Result<IndexKey> {
        self.validate(values)?;
        Ok(IndexKey::from_values(entity, values))
    }
}

fn encode_index_key(key: &IndexKey, out: &mut Vec<u8>) {
    key.encode(out);
}

fn decode_index_value(src: &[u8]) -> Result<IndexValue> {
    if src.is_empty() {
        Ok(IndexValue)
    } else {
        Err(IndexError::Corruption("schema index value must be empty"))
    }
}

/// Single numeric property.
#[derive(Clone, Copy, Debug, Default)]
pub struct NumberLayout;

impl Layout for NumberLayout {
    type Key = IndexKey;
    type Value = IndexValue;

    fn identifier(&self) -> u64 {
        NUMBER_LAYOUT_ID
    }

    fn new_key(&self) -> IndexKey {
        IndexKey::lowest(1)
    }

    fn new_value(&self) -> IndexValue {
        IndexValue
    }

    fn encode_key(&self, key: &IndexKey, out: &mut Vec<u8>) {
        encode_index_key(key, out);
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<IndexKey> {
        IndexKey::decode(1, bytes)
    }

    fn encode_value(&self, _value: &IndexValue, _out: &mut Vec<u8>) {}

    fn decode_value(&self, src: &[u8]) -> Result<IndexValue> {
        decode_index_value(src)
    }
}

impl SchemaLayout for NumberLayout {
    fn arity(&self) -> usize {
        1
    }

    fn accepts(&self, _slot: usize, group: ValueGroup) -> bool {
        group == ValueGroup::Number
    }

    fn name(&self) -> &'static str {
        "number"
    }
}

/// Single string property.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringLayout;

impl Layout for StringLayout {
    type Key = IndexKey;
    type Value = IndexValue;

    fn identifier(&self) -> u64 {
        STRING_LAYOUT_ID
    }

    fn new_key(&self) -> IndexKey {
        IndexKey::lowest(1)
    }

    fn new_value(&self) -> IndexValue {
        IndexValue
    }

    fn encode_key(&self, key: &IndexKey, out: &mut Vec<u8>) {
        encode_index_key(key, out);
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<IndexKey> {
        IndexKey::decode(1, bytes)
    }

    fn encode_value(&self, _value: &IndexValue, _out: &mut Vec<u8>) {}

    fn decode_value(&self, src: &[u8]) -> Result<IndexValue> {
        decode_index_value(src)
    }
}

impl SchemaLayout for StringLayout {
    fn arity(&self) -> usize {
        1
    }

    fn accepts(&self, _slot: usize, group: ValueGroup) -> bool {
        group == ValueGroup::Text
    }

    fn name(&self) -> &'static str {
        "string"
    }
}

/// Any number of properties of any non-null value group.
#[derive(Clone, Copy, Debug)]
pub struct CompositeLayout {
    arity: usize,
}

impl CompositeLayout {
    /// Largest supported number of properties.
    pub const MAX_ARITY: usize = 16;

    /// Layout over `arity` properties.
    pub fn new(arity: usize) -> Result<Self> {
        if arity == 0 || arity > Self::MAX_ARITY {
            return Err(IndexError::Invalid("composite arity must be within 1..=16"));
        }
        Ok(Self { arity })
    }
}

impl Layout for CompositeLayout {
    type Key = IndexKey;
    type Value = IndexValue;

    fn identifier(&self) -> u64 {
        COMPOSITE_LAYOUT_ID | self.arity as u64
    }

    fn new_key(&self) -> IndexKey {
        IndexKey::lowest(self.arity)
    }

    fn new_value(&self) -> IndexValue {
        IndexValue
    }

    fn encode_key(&self, key: &IndexKey, out: &mut Vec<u8>) {
        encode_index_key(key, out);
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<IndexKey> {
        IndexKey::decode(self.arity, bytes)
    }

    fn encode_value(&self, _value: &IndexValue, _out: &mut Vec<u8>) {}

    fn decode_value(&self, src: &[u8]) -> Result<IndexValue> {
        decode_index_value(src)
    }
}

impl SchemaLayout for CompositeLayout {
    fn arity(&self) -> usize {
        self.arity
    }

    fn accepts(&self, slot: usize, _group: ValueGroup) -> bool {
        slot < self.arity
    }

    fn name(&self) -> &'static str {
        "composite"
    }
}
