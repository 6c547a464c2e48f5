//! Key/value payloads passed into and out of workers.
//!
//! [`Data`] is an ordered map from string keys to primitive [`Value`]s or
//! homogeneous arrays of primitives. Payloads are bounded by
//! [`MAX_DATA_BYTES`] once serialized.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Upper bound on the serialized size of a payload.
pub const MAX_DATA_BYTES: usize = 10 * 1024;

/// Errors produced when building or validating payloads.
#[derive(Debug, Error, PartialEq)]
pub enum DataError {
    /// Serialized payload exceeds [`MAX_DATA_BYTES`].
    #[error("payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    /// Array elements are not all of the same kind.
    #[error("array mixes {expected} and {found} elements")]
    MixedArray { expected: ValueKind, found: ValueKind },

    /// Arrays may only contain primitives.
    #[error("arrays cannot be nested")]
    NestedArray,

    /// Payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A single payload value.
///
/// Decoded arrays go through the same checks as [`Value::array`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "value",
    rename_all = "snake_case",
    try_from = "ValueRepr"
)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Homogeneous array of primitives. Build with [`Value::array`].
    Array(Vec<Value>),
}

/// Wire form of [`Value`] before array validation.
#[derive(Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum ValueRepr {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

impl TryFrom<ValueRepr> for Value {
    type Error = DataError;

    fn try_from(repr: ValueRepr) -> Result<Self, Self::Error> {
        Ok(match repr {
            ValueRepr::Bool(b) => Value::Bool(b),
            ValueRepr::Int(i) => Value::Int(i),
            ValueRepr::Double(d) => Value::Double(d),
            ValueRepr::String(s) => Value::String(s),
            ValueRepr::Bytes(b) => Value::Bytes(b),
            ValueRepr::Array(items) => Value::array(items)?,
        })
    }
}

/// Kind of a primitive value, used to check merge and array compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Double,
    String,
    Bytes,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Double => "double",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

impl Value {
    /// Build an array value, checking that every element is a primitive of
    /// the same kind.
    pub fn array(items: impl IntoIterator<Item = Value>) -> Result<Value, DataError> {
        let items: Vec<Value> = items.into_iter().collect();
        let mut expected: Option<ValueKind> = None;
        for item in &items {
            if item.is_array() {
                return Err(DataError::NestedArray);
            }
            let kind = item.kind();
            match (expected, kind) {
                (None, k) => expected = k,
                (Some(e), Some(k)) if e != k => {
                    return Err(DataError::MixedArray {
                        expected: e,
                        found: k,
                    });
                }
                _ => {}
            }
        }
        Ok(Value::Array(items))
    }

    /// Kind of the value, or of the elements for an array.
    ///
    /// Returns `None` only for an empty array.
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Int(_) => Some(ValueKind::Int),
            Value::Double(_) => Some(ValueKind::Double),
            Value::String(_) => Some(ValueKind::String),
            Value::Bytes(_) => Some(ValueKind::Bytes),
            Value::Array(items) => items.first().and_then(Value::kind),
        }
    }

    /// Whether the value is an array.
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Ordered key/value payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Data(BTreeMap<String, Value>);

impl Data {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder: add a key/value pair.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a value, returning the previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Size of the payload in its JSON wire form.
    pub fn serialized_size(&self) -> Result<usize, DataError> {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len())
            .map_err(|e| DataError::Serialization(e.to_string()))
    }

    /// Check the payload against [`MAX_DATA_BYTES`].
    pub fn ensure_within_limit(&self) -> Result<(), DataError> {
        let size = self.serialized_size()?;
        if size > MAX_DATA_BYTES {
            return Err(DataError::TooLarge {
                size,
                limit: MAX_DATA_BYTES,
            });
        }
        Ok(())
    }
}

impl FromIterator<(String, Value)> for Data {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Data {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", key, value)?;
        }
        f.write_str("}")
    }
}
