//! Dynamic row values.
//!
//! The SQL front-end compiles queries over schemaless [`Row`]s: vectors of
//! [`Value`]s whose layout is tracked by the compiler, not by the row itself.
//! Rows are compared, hashed, and ordered structurally, which makes them
//! directly usable as Z-set elements.

use crate::error::StepError;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt};
use xxhash_rust::xxh3::xxh3_64;

/// A single SQL value.
///
/// `Double` wraps [`OrderedFloat`] so that rows containing floats still have
/// total `Eq`/`Ord`/`Hash`.  The derived cross-variant order
/// (`Null < Bool < Int < Double < Text`) is only used by ordered containers;
/// SQL comparisons go through [`Value::sql_cmp`], which coerces numeric types
/// and treats NULL as incomparable.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(OrderedFloat<f64>),
    Text(String),
}

impl Value {
    pub fn double(value: f64) -> Self {
        Self::Double(OrderedFloat(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int(_) => "INTEGER",
            Self::Double(_) => "DOUBLE",
            Self::Text(_) => "TEXT",
        }
    }

    /// SQL comparison: `None` when either side is NULL or the types are not
    /// comparable, so that predicates built on top evaluate to false.
    pub fn sql_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Bool(l), Self::Bool(r)) => Some(l.cmp(r)),
            (Self::Int(l), Self::Int(r)) => Some(l.cmp(r)),
            (Self::Double(l), Self::Double(r)) => Some(l.cmp(r)),
            (Self::Int(l), Self::Double(r)) => OrderedFloat(*l as f64).partial_cmp(r),
            (Self::Double(l), Self::Int(r)) => l.partial_cmp(&OrderedFloat(*r as f64)),
            (Self::Text(l), Self::Text(r)) => Some(l.cmp(r)),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Double(d) => Some(d.0),
            _ => None,
        }
    }

    fn numeric_pair(&self, other: &Self, op: &'static str) -> Result<Option<NumPair>, StepError> {
        if self.is_null() || other.is_null() {
            return Ok(None);
        }
        match (self, other) {
            (Self::Int(l), Self::Int(r)) => Ok(Some(NumPair::Int(*l, *r))),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(l), Some(r)) => Ok(Some(NumPair::Double(l, r))),
                _ => Err(StepError::TypeMismatch {
                    op,
                    left: self.type_name(),
                    right: other.type_name(),
                }),
            },
        }
    }

    /// Checked addition with NULL propagation; integer overflow is a step
    /// error per the error taxonomy.
    pub fn checked_add(&self, other: &Self) -> Result<Self, StepError> {
        match self.numeric_pair(other, "+")? {
            None => Ok(Self::Null),
            Some(NumPair::Int(l, r)) => l
                .checked_add(r)
                .map(Self::Int)
                .ok_or(StepError::IntegerOverflow),
            Some(NumPair::Double(l, r)) => Ok(Self::double(l + r)),
        }
    }

    pub fn checked_sub(&self, other: &Self) -> Result<Self, StepError> {
        match self.numeric_pair(other, "-")? {
            None => Ok(Self::Null),
            Some(NumPair::Int(l, r)) => l
                .checked_sub(r)
                .map(Self::Int)
                .ok_or(StepError::IntegerOverflow),
            Some(NumPair::Double(l, r)) => Ok(Self::double(l - r)),
        }
    }

    pub fn checked_mul(&self, other: &Self) -> Result<Self, StepError> {
        match self.numeric_pair(other, "*")? {
            None => Ok(Self::Null),
            Some(NumPair::Int(l, r)) => l
                .checked_mul(r)
                .map(Self::Int)
                .ok_or(StepError::IntegerOverflow),
            Some(NumPair::Double(l, r)) => Ok(Self::double(l * r)),
        }
    }

    /// Integer division truncates; division by zero is a step error.
    pub fn checked_div(&self, other: &Self) -> Result<Self, StepError> {
        match self.numeric_pair(other, "/")? {
            None => Ok(Self::Null),
            Some(NumPair::Int(_, 0)) => Err(StepError::DivisionByZero),
            Some(NumPair::Int(l, r)) => l
                .checked_div(r)
                .map(Self::Int)
                .ok_or(StepError::IntegerOverflow),
            Some(NumPair::Double(_, r)) if r == 0.0 => Err(StepError::DivisionByZero),
            Some(NumPair::Double(l, r)) => Ok(Self::double(l / r)),
        }
    }

    pub fn checked_neg(&self) -> Result<Self, StepError> {
        match self {
            Self::Null => Ok(Self::Null),
            Self::Int(i) => i
                .checked_neg()
                .map(Self::Int)
                .ok_or(StepError::IntegerOverflow),
            Self::Double(d) => Ok(Self::double(-d.0)),
            other => Err(StepError::BadCast {
                from: other.type_name(),
                to: "a numeric type",
            }),
        }
    }

    fn write_canonical(&self, bytes: &mut Vec<u8>) {
        match self {
            Self::Null => bytes.push(0),
            Self::Bool(b) => {
                bytes.push(1);
                bytes.push(*b as u8);
            }
            Self::Int(i) => {
                bytes.push(2);
                bytes.extend_from_slice(&i.to_le_bytes());
            }
            Self::Double(d) => {
                bytes.push(3);
                bytes.extend_from_slice(&d.0.to_bits().to_le_bytes());
            }
            Self::Text(s) => {
                bytes.push(4);
                bytes.extend_from_slice(&(s.len() as u64).to_le_bytes());
                bytes.extend_from_slice(s.as_bytes());
            }
        }
    }
}

enum NumPair {
    Int(i64, i64),
    Double(f64, f64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Double(d) => write!(f, "{}", d.0),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Self::double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// A row is a vector of values; the column layout is tracked by the schema
/// the compiler attaches to the stream carrying the row.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Row(Vec<Value>);

const NULL: Value = Value::Null;

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value of column `index`; out-of-range reads are NULL.
    pub fn col(&self, index: usize) -> &Value {
        self.0.get(index).unwrap_or(&NULL)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// Concatenation, used to build join output rows.
    pub fn concat(&self, other: &Self) -> Self {
        let mut values = Vec::with_capacity(self.0.len() + other.0.len());
        values.extend_from_slice(&self.0);
        values.extend_from_slice(&other.0);
        Self(values)
    }

    /// Structural fingerprint: an xxh3 hash over a canonical serialization,
    /// stable across runs.  This is the default key for rows without a
    /// declared primary key.
    pub fn fingerprint(&self) -> u64 {
        let mut bytes = Vec::with_capacity(self.0.len() * 9);
        for value in &self.0 {
            value.write_canonical(&mut bytes);
        }
        xxh3_64(&bytes)
    }
}

impl FromIterator<Value> for Row {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Builds a [`Row`] from a list of values convertible to [`Value`].
#[macro_export]
macro_rules! row {
    ( $($value:expr),* $(,)?) => {
        $crate::Row::new(vec![ $( $crate::Value::from($value) ),* ])
    };
}

#[cfg(test)]
mod test {
    use super::{Row, Value};
    use crate::error::StepError;
    use std::cmp::Ordering;

    #[test]
    fn sql_cmp_coerces_numerics_and_rejects_null() {
        assert_eq!(
            Value::Int(2).sql_cmp(&Value::double(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Null.sql_cmp(&Value::Int(1)), None);
        assert_eq!(Value::Int(1).sql_cmp(&Value::from("1")), None);
    }

    #[test]
    fn arithmetic_propagates_null_and_checks_overflow() {
        assert_eq!(
            Value::Null.checked_add(&Value::Int(1)).unwrap(),
            Value::Null
        );
        assert_eq!(
            Value::Int(i64::MAX).checked_add(&Value::Int(1)),
            Err(StepError::IntegerOverflow)
        );
        assert_eq!(
            Value::Int(7).checked_div(&Value::Int(2)).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            Value::Int(7).checked_div(&Value::Int(0)),
            Err(StepError::DivisionByZero)
        );
    }

    #[test]
    fn fingerprint_distinguishes_structure() {
        let a = row![1, "x"];
        let b = row![1, "y"];
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), row![1, "x"].fingerprint());
        // Type tags keep 1 and 1.0 apart even though they compare equal.
        assert_ne!(row![1].fingerprint(), row![1.0].fingerprint());
    }

    #[test]
    fn wire_values_roundtrip_through_json() {
        let row = row![42, "alice", 2.5, true];
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"[42,"alice",2.5,true]"#);
        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }
}
