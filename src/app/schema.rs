//! Declared message schemas and payload decoding
//!
//! An app may declare the shape of the messages its clients send: fixed
//! integers (big-endian when tagged network-order, little-endian
//! otherwise), variable-length integer arrays with element-count bounds,
//! and strings with byte-length bounds. A schema with several cases
//! switches on a leading 1-byte tag. Variable-length fields carry a
//! big-endian u32 count prefix. A payload that fails its schema closes the
//! peer with 1007.

use crate::error::{ Result, SpoolError };

/// Fixed integer width in a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    fn bytes(self) -> usize {
        match self {
            Self::W8 => 1,
            Self::W16 => 2,
            Self::W32 => 4,
            Self::W64 => 8,
        }
    }
}

/// One field of a declared message.
#[derive(Debug, Clone)]
pub enum FieldSpec {
    /// Fixed-width integer; `net_order` selects big-endian on the wire
    Int {
        width: IntWidth,
        signed: bool,
        net_order: bool,
    },
    /// Count-prefixed array of fixed-width integers
    Array {
        elem: IntWidth,
        signed: bool,
        net_order: bool,
        min_elems: u32,
        max_elems: u32,
    },
    /// Count-prefixed UTF-8 string
    Str {
        min_bytes: u32,
        max_bytes: u32,
    },
}

/// A declared message shape, possibly switched over a leading case tag.
#[derive(Debug, Clone)]
pub struct MessageSchema {
    cases: Vec<Vec<FieldSpec>>,
}

impl MessageSchema {
    /// A schema with a single case and no leading tag.
    pub fn single(fields: Vec<FieldSpec>) -> Self {
        Self { cases: vec![fields] }
    }

    /// A schema switched by a leading 1-byte case tag.
    pub fn switched(cases: Vec<Vec<FieldSpec>>) -> Result<Self> {
        if cases.len() < 2 || cases.len() > 256 {
            return Err(SpoolError::config("switched schema needs 2..=256 cases"));
        }
        Ok(Self { cases })
    }

    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    /// Decode a payload against this schema.
    pub fn decode(&self, payload: &[u8]) -> std::result::Result<Decoded, SchemaViolation> {
        let mut cursor = Cursor { buf: payload, at: 0 };

        let case = if self.cases.len() > 1 { cursor.u8()? } else { 0 };
        let fields_spec = self.cases
            .get(case as usize)
            .ok_or(SchemaViolation("case tag out of range"))?;

        let mut fields = Vec::with_capacity(fields_spec.len());
        for spec in fields_spec {
            fields.push(decode_field(&mut cursor, spec)?);
        }
        if cursor.at != payload.len() {
            return Err(SchemaViolation("trailing bytes after last field"));
        }
        Ok(Decoded { case, fields })
    }
}

/// A decoded payload: the selected case and its field values in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub case: u8,
    pub fields: Vec<Value>,
}

/// One decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uint(u64),
    Int(i64),
    UintArray(Vec<u64>),
    IntArray(Vec<i64>),
    Str(String),
}

/// Why a payload failed its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaViolation(pub &'static str);

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "schema violation: {}", self.0)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], SchemaViolation> {
        let raw = self.buf
            .get(self.at..self.at + n)
            .ok_or(SchemaViolation("payload shorter than schema"))?;
        self.at += n;
        Ok(raw)
    }

    fn u8(&mut self) -> std::result::Result<u8, SchemaViolation> {
        Ok(self.take(1)?[0])
    }

    fn count(&mut self) -> std::result::Result<u32, SchemaViolation> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn uint(&mut self, width: IntWidth, net_order: bool) -> std::result::Result<u64, SchemaViolation> {
        let raw = self.take(width.bytes())?;
        let mut padded = [0u8; 8];
        if net_order {
            padded[8 - raw.len()..].copy_from_slice(raw);
            Ok(u64::from_be_bytes(padded))
        } else {
            padded[..raw.len()].copy_from_slice(raw);
            Ok(u64::from_le_bytes(padded))
        }
    }

    fn int(&mut self, width: IntWidth, net_order: bool) -> std::result::Result<i64, SchemaViolation> {
        let unsigned = self.uint(width, net_order)?;
        // sign-extend from the declared width
        let shift = 64 - 8 * (width.bytes() as u32);
        Ok(((unsigned << shift) as i64) >> shift)
    }
}

fn decode_field(
    cursor: &mut Cursor<'_>,
    spec: &FieldSpec
) -> std::result::Result<Value, SchemaViolation> {
    match spec {
        FieldSpec::Int { width, signed, net_order } => {
            if *signed {
                Ok(Value::Int(cursor.int(*width, *net_order)?))
            } else {
                Ok(Value::Uint(cursor.uint(*width, *net_order)?))
            }
        }
        FieldSpec::Array { elem, signed, net_order, min_elems, max_elems } => {
            let count = cursor.count()?;
            if count < *min_elems || count > *max_elems {
                return Err(SchemaViolation("array element count out of bounds"));
            }
            if *signed {
                let mut values = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    values.push(cursor.int(*elem, *net_order)?);
                }
                Ok(Value::IntArray(values))
            } else {
                let mut values = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    values.push(cursor.uint(*elem, *net_order)?);
                }
                Ok(Value::UintArray(values))
            }
        }
        FieldSpec::Str { min_bytes, max_bytes } => {
            let len = cursor.count()?;
            if len < *min_bytes || len > *max_bytes {
                return Err(SchemaViolation("string length out of bounds"));
            }
            let raw = cursor.take(len as usize)?;
            let text = std::str
                ::from_utf8(raw)
                .map_err(|_| SchemaViolation("string is not UTF-8"))?;
            Ok(Value::Str(text.to_owned()))
        }
    }
}
