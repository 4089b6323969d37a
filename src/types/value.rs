use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Owned property value as read from the store or supplied to the index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    /// Null value. Never indexed.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// Owned string.
    Str(String),
    /// Owned byte vector.
    Bytes(Vec<u8>),
    /// Date value represented as days since the Unix epoch.
    Date(i64),
    /// DateTime value represented as milliseconds since the Unix epoch.
    DateTime(i64),
}

/// Ordering class of a value. Values of different groups never compare equal
/// and sort by group first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ValueGroup {
    /// Booleans.
    Bool,
    /// Integers and floats, compared by numeric value.
    Number,
    /// Strings.
    Text,
    /// Raw bytes.
    Bytes,
    /// Dates.
    Date,
    /// Date-times.
    DateTime,
}

impl ValueGroup {
    /// Stable lowercase name used in error messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            ValueGroup::Bool => "bool",
            ValueGroup::Number => "number",
            ValueGroup::Text => "text",
            ValueGroup::Bytes => "bytes",
            ValueGroup::Date => "date",
            ValueGroup::DateTime => "datetime",
        }
    }
}

impl PropValue {
    /// Ordering group of this value, `None` for null.
    pub fn group(&self) -> Option<ValueGroup> {
        match self {
            PropValue::Null => None,
            PropValue::Bool(_) => Some(ValueGroup::Bool),
            PropValue::Int(_) | PropValue::Float(_) => Some(ValueGroup::Number),
            PropValue::Str(_) => Some(ValueGroup::Text),
            PropValue::Bytes(_) => Some(ValueGroup::Bytes),
            PropValue::Date(_) => Some(ValueGroup::Date),
            PropValue::DateTime(_) => Some(ValueGroup::DateTime),
        }
    }

    /// Rough heap plus inline footprint, used for memory accounting.
    pub fn estimated_size(&self) -> usize {
        let inline = std::mem::size_of::<PropValue>();
        match self {
            PropValue::Str(s) => inline + s.len(),
            PropValue::Bytes(b) => inline + b.len(),
            _ => inline,
        }
    }

    /// Total order used by the index: group first, then value. Ints and floats
    /// compare numerically, so `Int(3)` equals `Float(3.0)`. Null sorts first.
    pub fn index_cmp(&self, other: &PropValue) -> Ordering {
        use PropValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => unsigned_zero(*a).total_cmp(&unsigned_zero(*b)),
            (Int(a), Float(b)) => compare_int_float(*a, *b),
            (Float(a), Int(b)) => compare_int_float(*b, *a).reverse(),
            (Str(a), Str(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (a, b) => a.group().cmp(&b.group()),
        }
    }

    /// Equality under [`PropValue::index_cmp`].
    pub fn index_eq(&self, other: &PropValue) -> bool {
        self.index_cmp(other) == Ordering::Equal
    }
}

fn unsigned_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

fn compare_int_float(int: i64, float: f64) -> Ordering {
    if float.is_nan() {
        return Ordering::Less;
    }
    let as_float = int as f64;
    match as_float.partial_cmp(&float) {
        Some(Ordering::Equal) => {
            // Both land on the same double; the float is integral here, so
            // compare exactly in the integer domain, saturating at the top.
            if float >= i64::MAX as f64 {
                int.cmp(&i64::MAX)
            } else {
                int.cmp(&(float as i64))
            }
        }
        Some(order) => order,
        None => Ordering::Less,
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Null => write!(f, "null"),
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::Int(v) => write!(f, "{v}"),
            PropValue::Float(v) => write!(f, "{v}"),
            PropValue::Str(v) => write!(f, "{v}"),
            PropValue::Bytes(v) => write!(f, "bytes(len={})", v.len()),
            PropValue::Date(v) => write!(f, "date({v})"),
            PropValue::DateTime(v) => write!(f, "datetime({v})"),
        }
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Float(value)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Str(value.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::Str(value)
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_across_int_and_float() {
        assert!(PropValue::Int(3).index_eq(&PropValue::Float(3.0)));
        assert_eq!(
            PropValue::Int(3).index_cmp(&PropValue::Float(3.5)),
            Ordering::Less
        );
        assert_eq!(
            PropValue::Float(-0.5).index_cmp(&PropValue::Int(-1)),
            Ordering::Greater
        );
        let big = (1i64 << 60) + 1;
        assert_eq!(
            PropValue::Int(big).index_cmp(&PropValue::Float((1i64 << 60) as f64)),
            Ordering::Greater
        );
        assert!(PropValue::Float(-0.0).index_eq(&PropValue::Float(0.0)));
        assert!(PropValue::Int(i64::MAX).index_eq(&PropValue::Float(i64::MAX as f64)));
    }

    #[test]
    fn groups_order_before_values() {
        assert_eq!(
            PropValue::Bool(true).index_cmp(&PropValue::Int(-100)),
            Ordering::Less
        );
        assert_eq!(
            PropValue::Str("a".into()).index_cmp(&PropValue::Int(100)),
            Ordering::Greater
        );
        assert_eq!(PropValue::Null.group(), None);
    }
}
