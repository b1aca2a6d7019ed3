use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rmpv::Value as Wire;

use crate::error::CodecError;
use crate::geometry::{self, Geometry};
use crate::numeric::{NumericArray, StructuredArray};
use crate::value::{Record, Value};

const EXT_NUMERIC_ARRAY: i8 = 1;
const EXT_STRUCTURED_ARRAY: i8 = 2;
const EXT_TIMESTAMP: i8 = 3;
const EXT_RECORD: i8 = 5;

/// Decodes the payload of a registered custom extension code back into a
/// [`Value`]. The matching encoder is the caller's own construction of a
/// [`Value::Custom`] — this codec only needs the decode half to turn the
/// opaque bytes back into something a receiver can interpret.
pub type ExtDecoder = Arc<dyn Fn(&[u8]) -> Result<Value, CodecError> + Send + Sync>;

/// Converts between the dynamic [`Value`] model and wire bytes.
///
/// A `Codec` owns an optional allowlist of record names: when non-empty,
/// encoding a [`Value::Record`] whose name isn't registered fails fast
/// rather than shipping a payload the peer has no schema for. Leave the
/// allowlist empty (the default) to pass any record through untouched.
///
/// It also owns a registry of decoders for extension codes beyond the
/// built-in set (numeric/structured arrays, timestamps, records,
/// geometries): a code with no built-in handler and no registered decoder
/// fails to decode with [`CodecError::UnknownExtType`].
pub struct Codec {
    known_records: RwLock<HashSet<String>>,
    ext_decoders: RwLock<HashMap<i8, ExtDecoder>>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self {
            known_records: RwLock::new(HashSet::new()),
            ext_decoders: RwLock::new(HashMap::new()),
        }
    }

    /// Allowlists a record name for encoding. Once any name is registered,
    /// only registered names may be encoded.
    pub fn register_record(&self, name: impl Into<String>) {
        self.known_records.write().insert(name.into());
    }

    /// Registers a decoder for extension `code`, for payloads a caller
    /// encodes by hand as [`Value::Custom`]. Idempotent — registering the
    /// same code again replaces the previous decoder. Refuses to shadow any
    /// of the codec's own built-in codes (numeric array, structured array,
    /// timestamp, record, geometry).
    pub fn register_ext_decoder(&self, code: i8, decoder: ExtDecoder) {
        if is_builtin_ext_code(code) {
            return;
        }
        self.ext_decoders.write().insert(code, decoder);
    }

    /// Serializes a value to its on-wire representation: MessagePack with
    /// this crate's extension types, LZ4-block-compressed as a whole.
    pub fn encode(&self, value: &Value) -> Result<Bytes, CodecError> {
        let wire = self.to_wire(value)?;
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &wire)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(Bytes::from(lz4_flex::block::compress_prepend_size(&buf)))
    }

    /// Inverse of [`Codec::encode`].
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let raw = lz4_flex::block::decompress_size_prepended(bytes)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let wire = rmpv::decode::read_value(&mut &raw[..])
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        self.from_wire(&wire)
    }

    /// Converts a [`Value`] into an [`rmpv::Value`] without touching
    /// compression. Used both for the outer encode and, recursively, for
    /// values nested inside extension payloads (records), which the wire
    /// format keeps uncompressed.
    pub(crate) fn to_wire(&self, value: &Value) -> Result<Wire, CodecError> {
        Ok(match value {
            Value::Nil => Wire::Nil,
            Value::Bool(b) => Wire::Boolean(*b),
            Value::Int(i) => Wire::from(*i),
            Value::UInt(u) => Wire::from(*u),
            Value::Float(f) => Wire::F64(*f),
            Value::Str(s) => Wire::String(s.clone().into()),
            Value::Bytes(b) => Wire::Binary(b.to_vec()),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.to_wire(item)?);
                }
                Wire::Array(out)
            }
            Value::Map(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    out.push((self.to_wire(k)?, self.to_wire(v)?));
                }
                Wire::Map(out)
            }
            Value::Timestamp(ts) => {
                Wire::Ext(EXT_TIMESTAMP, format!("{ts:.6}").into_bytes())
            }
            Value::NumericArray(arr) => Wire::Ext(EXT_NUMERIC_ARRAY, arr.encode()),
            Value::StructuredArray(arr) => Wire::Ext(EXT_STRUCTURED_ARRAY, arr.encode()),
            Value::Geometry(geom) => Wire::Ext(geom.ext_code(), geom.encode()),
            Value::Record(record) => {
                if !self.known_records.read().is_empty()
                    && !self.known_records.read().contains(&record.name)
                {
                    return Err(CodecError::UnknownRecord(record.name.clone()));
                }
                Wire::Ext(EXT_RECORD, self.encode_record(record)?)
            }
            Value::Custom(code, bytes) => Wire::Ext(*code, bytes.to_vec()),
        })
    }

    /// Inverse of [`Codec::to_wire`].
    pub(crate) fn from_wire(&self, wire: &Wire) -> Result<Value, CodecError> {
        Ok(match wire {
            Wire::Nil => Value::Nil,
            Wire::Boolean(b) => Value::Bool(*b),
            Wire::Integer(i) => {
                if let Some(v) = i.as_i64() {
                    Value::Int(v)
                } else if let Some(v) = i.as_u64() {
                    Value::UInt(v)
                } else {
                    return Err(CodecError::Malformed("integer out of range".into()));
                }
            }
            Wire::F32(f) => Value::Float(*f as f64),
            Wire::F64(f) => Value::Float(*f),
            Wire::String(s) => Value::Str(
                s.as_str()
                    .ok_or_else(|| CodecError::Malformed("invalid utf8 string".into()))?
                    .to_string(),
            ),
            Wire::Binary(b) => Value::Bytes(Bytes::copy_from_slice(b)),
            Wire::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.from_wire(item)?);
                }
                Value::Array(out)
            }
            Wire::Map(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    out.push((self.from_wire(k)?, self.from_wire(v)?));
                }
                Value::Map(out)
            }
            Wire::Ext(code, bytes) => self.decode_ext(*code, bytes)?,
            other => {
                return Err(CodecError::Malformed(format!(
                    "unsupported wire value: {other:?}"
                )))
            }
        })
    }

    fn decode_ext(&self, code: i8, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(match code {
            EXT_NUMERIC_ARRAY => Value::NumericArray(NumericArray::decode(bytes)?),
            EXT_STRUCTURED_ARRAY => Value::StructuredArray(StructuredArray::decode(bytes)?),
            EXT_TIMESTAMP => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| CodecError::Malformed("timestamp is not utf8".into()))?;
                let seconds: f64 = text
                    .parse()
                    .map_err(|_| CodecError::Malformed(format!("bad timestamp text {text:?}")))?;
                Value::Timestamp(seconds)
            }
            EXT_RECORD => Value::Record(self.decode_record(bytes)?),
            geometry::EXT_POINT
            | geometry::EXT_LINESTRING
            | geometry::EXT_POLYGON
            | geometry::EXT_MULTIPOINT
            | geometry::EXT_MULTILINESTRING
            | geometry::EXT_MULTIPOLYGON => Value::Geometry(Geometry::decode(code, bytes)?),
            other => match self.ext_decoders.read().get(&other) {
                Some(decoder) => decoder(bytes)?,
                None => return Err(CodecError::UnknownExtType(other)),
            },
        })
    }

    /// Records are framed as `[name, [[key, value], ...]]` and recursed into
    /// via [`Codec::to_wire`]/[`Codec::from_wire`] directly — no nested LZ4
    /// pass, since compression only ever wraps the outermost buffer.
    fn encode_record(&self, record: &Record) -> Result<Vec<u8>, CodecError> {
        let mut fields = Vec::with_capacity(record.fields.len());
        for (k, v) in &record.fields {
            fields.push((Wire::String(k.clone().into()), self.to_wire(v)?));
        }
        let framed = Wire::Array(vec![Wire::String(record.name.clone().into()), Wire::Map(fields)]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &framed)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(buf)
    }

    fn decode_record(&self, bytes: &[u8]) -> Result<Record, CodecError> {
        let framed = rmpv::decode::read_value(&mut &bytes[..])
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let items = framed
            .as_array()
            .ok_or_else(|| CodecError::Malformed("record frame is not an array".into()))?;
        let [name, fields] = items.as_slice() else {
            return Err(CodecError::Malformed("record frame has wrong arity".into()));
        };
        let name = name
            .as_str()
            .ok_or_else(|| CodecError::Malformed("record name is not a string".into()))?
            .to_string();
        if !self.known_records.read().is_empty() && !self.known_records.read().contains(&name) {
            return Err(CodecError::UnknownRecord(name));
        }
        let fields = fields
            .as_map()
            .ok_or_else(|| CodecError::Malformed("record fields is not a map".into()))?;
        let mut out = Vec::with_capacity(fields.len());
        for (k, v) in fields {
            let key = k
                .as_str()
                .ok_or_else(|| CodecError::Malformed("record field key is not a string".into()))?
                .to_string();
            out.push((key, self.from_wire(v)?));
        }
        Ok(Record { name, fields: out })
    }
}

fn is_builtin_ext_code(code: i8) -> bool {
    matches!(
        code,
        EXT_NUMERIC_ARRAY
            | EXT_STRUCTURED_ARRAY
            | EXT_TIMESTAMP
            | EXT_RECORD
            | geometry::EXT_POINT
            | geometry::EXT_LINESTRING
            | geometry::EXT_POLYGON
            | geometry::EXT_MULTIPOINT
            | geometry::EXT_MULTILINESTRING
            | geometry::EXT_MULTIPOLYGON
    )
}
