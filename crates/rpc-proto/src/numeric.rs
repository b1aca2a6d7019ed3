use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Element type carried by a [`NumericArray`] or a [`StructuredArray`] field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DType {
    F32 = 1,
    F64 = 2,
    I32 = 3,
    I64 = 4,
    U8 = 5,
    U32 = 6,
    U64 = 7,
    Bool = 8,
}

impl DType {
    pub fn item_size(self) -> usize {
        match self {
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F64 | DType::I64 | DType::U64 => 8,
            DType::U8 | DType::Bool => 1,
        }
    }

    fn from_u8(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            1 => DType::F32,
            2 => DType::F64,
            3 => DType::I32,
            4 => DType::I64,
            5 => DType::U8,
            6 => DType::U32,
            7 => DType::U64,
            8 => DType::Bool,
            other => return Err(CodecError::Malformed(format!("unknown dtype tag {other}"))),
        })
    }
}

/// Wire magic for the self-describing N-dim numeric array format (ext code 1).
const NUMERIC_MAGIC: &[u8; 4] = b"NDA1";
/// Wire magic for the structured-array format (ext code 2).
const STRUCT_MAGIC: &[u8; 4] = b"NDS1";

/// A dense, row-major, homogeneously-typed N-dimensional array.
///
/// Encoding: `[magic:4][dtype:u8][ndim:u32][shape:u64 * ndim][raw bytes]`.
/// Raw bytes are little-endian, packed in row-major (C) order.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub data: Bytes,
}

impl NumericArray {
    pub fn len(&self) -> u64 {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build an array from a flat row-major `f64` buffer and shape.
    pub fn from_f64(shape: Vec<u64>, values: &[f64]) -> Self {
        let mut data = BytesMut::with_capacity(values.len() * 8);
        for v in values {
            data.put_f64_le(*v);
        }
        Self {
            dtype: DType::F64,
            shape,
            data: data.freeze(),
        }
    }

    /// Decode into a flat row-major `f64` vector, widening integer dtypes.
    pub fn to_f64(&self) -> Result<Vec<f64>, CodecError> {
        let mut p = &self.data[..];
        let n = self.len() as usize;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            if p.remaining() < self.dtype.item_size() {
                return Err(CodecError::Malformed("numeric array truncated".into()));
            }
            out.push(match self.dtype {
                DType::F32 => p.get_f32_le() as f64,
                DType::F64 => p.get_f64_le(),
                DType::I32 => p.get_i32_le() as f64,
                DType::I64 => p.get_i64_le() as f64,
                DType::U8 => p.get_u8() as f64,
                DType::U32 => p.get_u32_le() as f64,
                DType::U64 => p.get_u64_le() as f64,
                DType::Bool => (p.get_u8() != 0) as u8 as f64,
            });
        }
        Ok(out)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(4 + 1 + 4 + self.shape.len() * 8 + self.data.len());
        out.extend_from_slice(NUMERIC_MAGIC);
        out.put_u8(self.dtype as u8);
        out.put_u32_le(self.shape.len() as u32);
        for dim in &self.shape {
            out.put_u64_le(*dim);
        }
        out.extend_from_slice(&self.data);
        out.to_vec()
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut p = bytes;
        if p.remaining() < 4 || &p[..4] != NUMERIC_MAGIC {
            return Err(CodecError::Malformed("bad numeric array magic".into()));
        }
        p.advance(4);
        if p.remaining() < 1 {
            return Err(CodecError::Malformed("numeric array truncated".into()));
        }
        let dtype = DType::from_u8(p.get_u8())?;
        if p.remaining() < 4 {
            return Err(CodecError::Malformed("numeric array truncated".into()));
        }
        let ndim = p.get_u32_le() as usize;
        if p.remaining() < ndim * 8 {
            return Err(CodecError::Malformed("numeric array shape truncated".into()));
        }
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            shape.push(p.get_u64_le());
        }
        let expected_items: u64 = shape.iter().product();
        let expected_bytes = expected_items as usize * dtype.item_size();
        if p.remaining() < expected_bytes {
            return Err(CodecError::Malformed("numeric array data truncated".into()));
        }
        let data = Bytes::copy_from_slice(&p[..expected_bytes]);
        Ok(Self { dtype, shape, data })
    }
}

/// A row-major table of named, independently-typed columns (ext code 2).
///
/// Encoding: `[magic:4][nfields:u32]{[name_len:u16][name][dtype:u8]}*
/// [len:u64][raw row-major field bytes]`.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredArray {
    pub fields: Vec<(String, DType)>,
    pub len: u64,
    pub data: Bytes,
}

impl StructuredArray {
    fn row_size(&self) -> usize {
        self.fields.iter().map(|(_, d)| d.item_size()).sum()
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.extend_from_slice(STRUCT_MAGIC);
        out.put_u32_le(self.fields.len() as u32);
        for (name, dtype) in &self.fields {
            out.put_u16_le(name.len() as u16);
            out.extend_from_slice(name.as_bytes());
            out.put_u8(*dtype as u8);
        }
        out.put_u64_le(self.len);
        out.extend_from_slice(&self.data);
        out.to_vec()
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut p = bytes;
        if p.remaining() < 4 || &p[..4] != STRUCT_MAGIC {
            return Err(CodecError::Malformed("bad structured array magic".into()));
        }
        p.advance(4);
        if p.remaining() < 4 {
            return Err(CodecError::Malformed("structured array truncated".into()));
        }
        let nfields = p.get_u32_le() as usize;
        let mut fields = Vec::with_capacity(nfields);
        for _ in 0..nfields {
            if p.remaining() < 2 {
                return Err(CodecError::Malformed("structured array field truncated".into()));
            }
            let name_len = p.get_u16_le() as usize;
            if p.remaining() < name_len + 1 {
                return Err(CodecError::Malformed("structured array field truncated".into()));
            }
            let name = std::str::from_utf8(&p[..name_len])
                .map_err(|_| CodecError::Malformed("invalid utf8 field name".into()))?
                .to_string();
            p.advance(name_len);
            let dtype = DType::from_u8(p.get_u8())?;
            fields.push((name, dtype));
        }
        if p.remaining() < 8 {
            return Err(CodecError::Malformed("structured array truncated".into()));
        }
        let len = p.get_u64_le();
        let row_size: usize = fields.iter().map(|(_, d)| d.item_size()).sum();
        let expected = row_size * len as usize;
        if p.remaining() < expected {
            return Err(CodecError::Malformed("structured array data truncated".into()));
        }
        let data = Bytes::copy_from_slice(&p[..expected]);
        let array = Self { fields, len, data };
        debug_assert_eq!(array.row_size(), row_size);
        Ok(array)
    }
}
