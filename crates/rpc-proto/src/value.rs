use bytes::Bytes;

use crate::geometry::Geometry;
use crate::numeric::{NumericArray, StructuredArray};

/// A named, ordered bag of fields standing in for a user dataclass.
///
/// Encoded recursively (ext code 5) with no top-level compression, matching
/// the uncompressed-record behavior the wire format requires for nested
/// payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// The dynamic value model every envelope payload is expressed in.
///
/// This is the Rust analogue of the dynamically-typed arguments and return
/// values a reflection-style RPC layer passes around: plain scalars and
/// containers plus the extension types the codec knows how to round-trip
/// (numeric arrays, structured arrays, timestamps, records, geometries).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// Seconds since the Unix epoch, carried on the wire as decimal text
    /// (ext code 3) so precision survives regardless of the reader's float
    /// width.
    Timestamp(f64),
    NumericArray(NumericArray),
    StructuredArray(StructuredArray),
    Geometry(Geometry),
    Record(Record),
    /// An extension type this codec instance doesn't know how to interpret,
    /// kept as opaque bytes so it can still be forwarded or re-encoded.
    Custom(i8, Bytes),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
