//! Index key construction and order-preserving encoding.
//!
//! A key is a list of value slots followed by the entity id. Each slot starts
//! with a tag byte; real values use the group tag, while the low/high
//! sentinels sit just below/above a group (or below/above every group) so
//! range bounds can be expressed as ordinary keys.

use std::cmp::Ordering;

use smallvec::SmallVec;

use crate::types::{EntityId, IndexError, PropValue, Result, ValueGroup};

const TAG_LOWEST: u8 = 0x00;
const TAG_HIGHEST: u8 = 0xFF;
const TAG_BOOL: u8 = 0x10;
const TAG_NUMBER: u8 = 0x20;
const TAG_TEXT: u8 = 0x30;
const TAG_BYTES: u8 = 0x40;
const TAG_DATE: u8 = 0x50;
const TAG_DATETIME: u8 = 0x60;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x00;

/// 2^63 as a double; the first double that no longer fits an `i64`.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// One value position in a key.
#[derive(Clone, Debug, PartialEq)]
pub enum KeySlot {
    /// Sorts below every value of the group, or below everything for `None`.
    Low(Option<ValueGroup>),
    /// A concrete indexed value.
    Value(PropValue),
    /// Sorts above every value of the group, or above everything for `None`.
    High(Option<ValueGroup>),
}

impl KeySlot {
    /// The concrete value, if this slot holds one.
    pub fn value(&self) -> Option<&PropValue> {
        match self {
            KeySlot::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Composite of property values plus the entity id; ties between equal values
/// are broken by entity id ascending.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexKey {
    slots: SmallVec<[KeySlot; 2]>,
    entity: EntityId,
}

impl IndexKey {
    /// Empty key with `arity` lowest slots and entity 0.
    pub fn lowest(arity: usize) -> Self {
        Self {
            slots: (0..arity).map(|_| KeySlot::Low(None)).collect(),
            entity: EntityId::MIN,
        }
    }

    /// Key with `arity` highest slots and the highest entity id.
    pub fn highest(arity: usize) -> Self {
        Self {
            slots: (0..arity).map(|_| KeySlot::High(None)).collect(),
            entity: EntityId::MAX,
        }
    }

    /// Key for `entity` holding `values`. No layout validation is applied.
    pub fn from_values(entity: EntityId, values: &[PropValue]) -> Self {
        Self {
            slots: values.iter().cloned().map(KeySlot::Value).collect(),
            entity,
        }
    }

    /// Key built from explicit slots.
    pub fn from_slots(entity: EntityId, slots: impl IntoIterator<Item = KeySlot>) -> Self {
        Self {
            slots: slots.into_iter().collect(),
            entity,
        }
    }

    /// Entity the key points at.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Replaces the entity id.
    pub fn set_entity(&mut self, entity: EntityId) {
        self.entity = entity;
    }

    /// All slots in order.
    pub fn slots(&self) -> &[KeySlot] {
        &self.slots
    }

    /// Replaces slot `idx`.
    pub fn set_slot(&mut self, idx: usize, slot: KeySlot) {
        self.slots[idx] = slot;
    }

    /// Concrete values, in slot order. Sentinel slots are skipped.
    pub fn values(&self) -> Vec<PropValue> {
        self.slots
            .iter()
            .filter_map(|slot| slot.value().cloned())
            .collect()
    }

    /// Encodes only the slots. Two keys with equal values (under the index
    /// order) produce identical bytes here.
    pub fn encode_values(&self, out: &mut Vec<u8>) {
        for slot in &self.slots {
            encode_slot(slot, out);
        }
    }

    /// Full order-preserving encoding: slots, then entity id.
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.encode_values(out);
        out.extend_from_slice(&self.entity.0.to_be_bytes());
    }

    /// Inverse of [`IndexKey::encode`] for a key with `arity` slots.
    pub fn decode(arity: usize, mut bytes: &[u8]) -> Result<Self> {
        let mut slots = SmallVec::with_capacity(arity);
        for _ in 0..arity {
            slots.push(decode_slot(&mut bytes)?);
        }
        if bytes.len() != 8 {
            return Err(IndexError::Corruption("index key entity id truncated"));
        }
        let entity = EntityId(u64::from_be_bytes(take::<8>(&mut bytes)?));
        Ok(Self { slots, entity })
    }

    /// Compares the value slots only, ignoring the entity id.
    pub fn compare_values(&self, other: &IndexKey) -> Ordering {
        let mut a = Vec::new();
        let mut b = Vec::new();
        self.encode_values(&mut a);
        other.encode_values(&mut b);
        a.cmp(&b)
    }
}

const fn group_tag(group: ValueGroup) -> u8 {
    match group {
        ValueGroup::Bool => TAG_BOOL,
        ValueGroup::Number => TAG_NUMBER,
        ValueGroup::Text => TAG_TEXT,
        ValueGroup::Bytes => TAG_BYTES,
        ValueGroup::Date => TAG_DATE,
        ValueGroup::DateTime => TAG_DATETIME,
    }
}

fn group_for_tag(tag: u8) -> Option<ValueGroup> {
    Some(match tag {
        TAG_BOOL => ValueGroup::Bool,
        TAG_NUMBER => ValueGroup::Number,
        TAG_TEXT => ValueGroup::Text,
        TAG_BYTES => ValueGroup::Bytes,
        TAG_DATE => ValueGroup::Date,
        TAG_DATETIME => ValueGroup::DateTime,
        _ => return None,
    })
}

fn encode_slot(slot: &KeySlot, out: &mut Vec<u8>) {
    match slot {
        KeySlot::Low(None) => out.push(TAG_LOWEST),
        KeySlot::High(None) => out.push(TAG_HIGHEST),
        KeySlot::Low(Some(group)) => out.push(group_tag(*group) - 1),
        KeySlot::High(Some(group)) => out.push(group_tag(*group) + 1),
        KeySlot::Value(value) => encode_value(value, out),
    }
}

fn encode_value(value: &PropValue, out: &mut Vec<u8>) {
    match value {
        // Null is rejected by every layout; keep it below all groups.
        PropValue::Null => out.push(TAG_LOWEST),
        PropValue::Bool(v) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*v));
        }
        PropValue::Int(v) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&encode_f64_key(*v as f64));
            out.extend_from_slice(&encode_i64_key(*v));
        }
        PropValue::Float(v) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&encode_f64_key(*v));
            out.extend_from_slice(&encode_i64_key(float_tiebreak(*v)));
        }
        PropValue::Str(s) => {
            out.push(TAG_TEXT);
            encode_escaped(s.as_bytes(), out);
        }
        PropValue::Bytes(b) => {
            out.push(TAG_BYTES);
            encode_escaped(b, out);
        }
        PropValue::Date(v) => {
            out.push(TAG_DATE);
            out.extend_from_slice(&encode_i64_key(*v));
        }
        PropValue::DateTime(v) => {
            out.push(TAG_DATETIME);
            out.extend_from_slice(&encode_i64_key(*v));
        }
    }
}

fn decode_slot(bytes: &mut &[u8]) -> Result<KeySlot> {
    let [tag] = take::<1>(bytes)?;
    if tag == TAG_LOWEST {
        return Ok(KeySlot::Low(None));
    }
    if tag == TAG_HIGHEST {
        return Ok(KeySlot::High(None));
    }
    if let Some(group) = group_for_tag(tag + 1) {
        return Ok(KeySlot::Low(Some(group)));
    }
    if let Some(group) = group_for_tag(tag - 1) {
        return Ok(KeySlot::High(Some(group)));
    }
    let value = match group_for_tag(tag) {
        Some(ValueGroup::Bool) => {
            let [b] = take::<1>(bytes)?;
            PropValue::Bool(b != 0)
        }
        Some(ValueGroup::Number) => {
            let float = decode_f64_key(take::<8>(bytes)?);
            let int = decode_i64_key(take::<8>(bytes)?);
            canonical_number(float, int)
        }
        Some(ValueGroup::Text) => {
            let raw = decode_escaped(bytes)?;
            PropValue::Str(
                String::from_utf8(raw)
                    .map_err(|_| IndexError::Corruption("index key text is not utf-8"))?,
            )
        }
        Some(ValueGroup::Bytes) => PropValue::Bytes(decode_escaped(bytes)?),
        Some(ValueGroup::Date) => PropValue::Date(decode_i64_key(take::<8>(bytes)?)),
        Some(ValueGroup::DateTime) => PropValue::DateTime(decode_i64_key(take::<8>(bytes)?)),
        None => return Err(IndexError::Corruption("unknown index key slot tag")),
    };
    Ok(KeySlot::Value(value))
}

fn take<const N: usize>(bytes: &mut &[u8]) -> Result<[u8; N]> {
    if bytes.len() < N {
        return Err(IndexError::Corruption("index key truncated"));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    *bytes = &bytes[N..];
    Ok(out)
}

fn encode_i64_key(value: i64) -> [u8; 8] {
    ((value as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

fn decode_i64_key(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ 0x8000_0000_0000_0000) as i64
}

fn encode_f64_key(value: f64) -> [u8; 8] {
    // -0.0 and 0.0 are the same number.
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    let normalized = if bits & 0x8000_0000_0000_0000 != 0 {
        !bits
    } else {
        bits ^ 0x8000_0000_0000_0000
    };
    normalized.to_be_bytes()
}

fn decode_f64_key(bytes: [u8; 8]) -> f64 {
    let normalized = u64::from_be_bytes(bytes);
    let bits = if normalized & 0x8000_0000_0000_0000 != 0 {
        normalized ^ 0x8000_0000_0000_0000
    } else {
        !normalized
    };
    f64::from_bits(bits)
}

/// Exact integer component for a float, so an integral float ties with the
/// equal integer and distinct large integers sharing a double stay ordered.
fn float_tiebreak(value: f64) -> i64 {
    if !value.is_finite() {
        return if value > 0.0 { i64::MAX } else { i64::MIN };
    }
    if value >= I64_LIMIT {
        i64::MAX
    } else if value < -I64_LIMIT {
        i64::MIN
    } else {
        value as i64
    }
}

fn canonical_number(float: f64, int: i64) -> PropValue {
    if float.is_finite() && float.fract() == 0.0 && float.abs() < I64_LIMIT && int as f64 == float
    {
        PropValue::Int(int)
    } else {
        PropValue::Float(float)
    }
}

fn encode_escaped(raw: &[u8], out: &mut Vec<u8>) {
    for &byte in raw {
        out.push(byte);
        if byte == ESCAPE {
            out.push(ESCAPED_ZERO);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

fn decode_escaped(bytes: &mut &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let [byte] = take::<1>(bytes)?;
        if byte != ESCAPE {
            out.push(byte);
            continue;
        }
        let [next] = take::<1>(bytes)?;
        match next {
            ESCAPED_ZERO => out.push(ESCAPE),
            TERMINATOR => return Ok(out),
            _ => return Err(IndexError::Corruption("invalid escape in index key")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(key: &IndexKey) -> Vec<u8> {
        let mut out = Vec::new();
        key.encode(&mut out);
        out
    }

    fn key(entity: u64, values: &[PropValue]) -> IndexKey {
        IndexKey::from_values(EntityId(entity), values)
    }

    #[test]
    fn numeric_order_is_preserved() {
        let ordered = [
            PropValue::Float(f64::NEG_INFINITY),
            PropValue::Int(i64::MIN),
            PropValue::Float(-2.5),
            PropValue::Int(-2),
            PropValue::Int(0),
            PropValue::Float(0.5),
            PropValue::Int(1),
            PropValue::Int(1i64 << 60),
            PropValue::Int((1i64 << 60) + 1),
            PropValue::Float(1e300),
        ];
        for pair in ordered.windows(2) {
            let a = encoded(&key(9, std::slice::from_ref(&pair[0])));
            let b = encoded(&key(1, std::slice::from_ref(&pair[1])));
            assert!(a < b, "{} should sort before {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn equal_numbers_tie_break_on_entity() {
        let int = encoded(&key(1, &[PropValue::Int(3)]));
        let float = encoded(&key(2, &[PropValue::Float(3.0)]));
        assert!(int < float);
        let mut a = Vec::new();
        key(1, &[PropValue::Int(3)]).encode_values(&mut a);
        let mut b = Vec::new();
        key(2, &[PropValue::Float(3.0)]).encode_values(&mut b);
        assert_eq!(a, b, "3 and 3.0 share the value encoding");
        let neg_zero = encoded(&key(1, &[PropValue::Float(-0.0)]));
        let zero = encoded(&key(1, &[PropValue::Int(0)]));
        assert_eq!(neg_zero, zero);
    }

    #[test]
    fn text_order_is_lexicographic() {
        let ordered = ["", "a", "a\0", "a\0b", "ab", "b", "\u{e9}"];
        for pair in ordered.windows(2) {
            let a = encoded(&key(u64::MAX, &[PropValue::from(pair[0])]));
            let b = encoded(&key(0, &[PropValue::from(pair[1])]));
            assert!(a < b, "{:?} should sort before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn sentinels_bracket_their_group() {
        let low_num = encoded(&IndexKey::from_slots(
            EntityId::MAX,
            [KeySlot::Low(Some(ValueGroup::Number))],
        ));
        let high_num = encoded(&IndexKey::from_slots(
            EntityId::MIN,
            [KeySlot::High(Some(ValueGroup::Number))],
        ));
        let bool_key = encoded(&key(u64::MAX, &[PropValue::Bool(true)]));
        let min_num = encoded(&key(0, &[PropValue::Float(f64::NEG_INFINITY)]));
        let max_num = encoded(&key(u64::MAX, &[PropValue::Float(f64::INFINITY)]));
        let text = encoded(&key(0, &[PropValue::from("")]));
        assert!(bool_key < low_num);
        assert!(low_num < min_num);
        assert!(max_num < high_num);
        assert!(high_num < text);
        assert!(encoded(&IndexKey::lowest(1)) < bool_key);
        assert!(text < encoded(&IndexKey::highest(1)));
    }

    #[test]
    fn decode_inverts_encode() -> Result<()> {
        let original = key(
            77,
            &[
                PropValue::from("x\0y"),
                PropValue::Float(2.25),
                PropValue::Int(-4),
                PropValue::Bool(true),
                PropValue::Bytes(vec![0, 1, 0]),
                PropValue::Date(19_000),
                PropValue::DateTime(-1),
            ],
        );
        let decoded = IndexKey::decode(7, &encoded(&original))?;
        assert_eq!(decoded, original);

        let bounds = IndexKey::from_slots(
            EntityId(5),
            [KeySlot::Low(Some(ValueGroup::Text)), KeySlot::High(None)],
        );
        assert_eq!(IndexKey::decode(2, &encoded(&bounds))?, bounds);
        Ok(())
    }

    #[test]
    fn integral_floats_decode_as_ints() -> Result<()> {
        let decoded = IndexKey::decode(1, &encoded(&key(1, &[PropValue::Float(8.0)])))?;
        assert_eq!(decoded.values(), vec![PropValue::Int(8)]);
        let decoded = IndexKey::decode(1, &encoded(&key(1, &[PropValue::Float(I64_LIMIT)])))?;
        assert_eq!(decoded.values(), vec![PropValue::Float(I64_LIMIT)]);
        Ok(())
    }

    #[test]
    fn truncated_key_is_corruption() {
        let bytes = encoded(&key(1, &[PropValue::Int(1)]));
        assert!(matches!(
            IndexKey::decode(1, &bytes[..bytes.len() - 1]),
            Err(IndexError::Corruption(_))
        ));
        assert!(matches!(
            IndexKey::decode(2, &bytes),
            Err(IndexError::Corruption(_))
        ));
    }
}
