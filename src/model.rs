use crate::error::{GraphError, Result};
use std::fmt;

/// Primitive type of one property column.
///
/// Every type except `Str` has a fixed encoded width; strings occupy a
/// fixed `(offset: u64, len: u32)` slot pointing into the column's blob heap.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PropType {
    Int32,
    Int64,
    UInt32,
    UInt64,
    Double,
    Bool,
    /// Days since the Unix epoch.
    Date,
    /// Milliseconds since the Unix epoch.
    DateTime,
    Str,
}

/// Width of a string column slot: offset (u64) + length (u32).
pub const STR_SLOT_WIDTH: usize = 12;

impl PropType {
    /// Encoded width of one cell of this type, in bytes.
    pub fn width(self) -> usize {
        match self {
            PropType::Int32 | PropType::UInt32 => 4,
            PropType::Int64
            | PropType::UInt64
            | PropType::Double
            | PropType::Date
            | PropType::DateTime => 8,
            PropType::Bool => 1,
            PropType::Str => STR_SLOT_WIDTH,
        }
    }

    /// Whether cells of this type are self-contained fixed-width values.
    pub fn is_fixed(self) -> bool {
        !matches!(self, PropType::Str)
    }
}

impl fmt::Display for PropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropType::Int32 => "int32",
            PropType::Int64 => "int64",
            PropType::UInt32 => "uint32",
            PropType::UInt64 => "uint64",
            PropType::Double => "double",
            PropType::Bool => "bool",
            PropType::Date => "date",
            PropType::DateTime => "datetime",
            PropType::Str => "string",
        };
        write!(f, "{name}")
    }
}

/// Property value with owned data.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Null value. Stored as a zeroed cell in fixed-width columns.
    Null,
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 32-bit unsigned integer.
    UInt32(u32),
    /// 64-bit unsigned integer.
    UInt64(u64),
    /// 64-bit floating point number.
    Double(f64),
    /// Boolean value.
    Bool(bool),
    /// Date as days since the Unix epoch.
    Date(i64),
    /// DateTime as milliseconds since the Unix epoch.
    DateTime(i64),
    /// Owned string.
    Str(String),
}

impl Value {
    /// Returns `true` when the value is compatible with cells of `ty`.
    pub fn matches(&self, ty: PropType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Int32(_), PropType::Int32)
                | (Value::Int64(_), PropType::Int64)
                | (Value::UInt32(_), PropType::UInt32)
                | (Value::UInt64(_), PropType::UInt64)
                | (Value::Double(_), PropType::Double)
                | (Value::Bool(_), PropType::Bool)
                | (Value::Date(_), PropType::Date)
                | (Value::DateTime(_), PropType::DateTime)
                | (Value::Str(_), PropType::Str)
        )
    }

    /// Encodes a fixed-width value into `out`, which must be `ty.width()`
    /// bytes. `Null` encodes as zeroes. Strings are not fixed-width and are
    /// rejected here; they go through the blob heap.
    pub fn encode_fixed(&self, ty: PropType, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), ty.width());
        if !self.matches(ty) {
            return Err(GraphError::InvalidArgument(format!(
                "value {self:?} does not match column type {ty}"
            )));
        }
        match self {
            Value::Null => out.fill(0),
            Value::Int32(v) => out.copy_from_slice(&v.to_le_bytes()),
            Value::Int64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Value::UInt32(v) => out.copy_from_slice(&v.to_le_bytes()),
            Value::UInt64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Value::Double(v) => out.copy_from_slice(&v.to_le_bytes()),
            Value::Bool(v) => out[0] = *v as u8,
            Value::Date(v) | Value::DateTime(v) => out.copy_from_slice(&v.to_le_bytes()),
            Value::Str(_) => {
                return Err(GraphError::InvalidArgument(
                    "string value is not fixed-width".into(),
                ))
            }
        }
        Ok(())
    }

    /// Decodes a fixed-width cell of type `ty` from `src`.
    pub fn decode_fixed(ty: PropType, src: &[u8]) -> Result<Value> {
        if src.len() < ty.width() {
            return Err(GraphError::Corruption("property cell truncated"));
        }
        let value = match ty {
            PropType::Int32 => Value::Int32(i32::from_le_bytes(src[..4].try_into().unwrap())),
            PropType::Int64 => Value::Int64(i64::from_le_bytes(src[..8].try_into().unwrap())),
            PropType::UInt32 => Value::UInt32(u32::from_le_bytes(src[..4].try_into().unwrap())),
            PropType::UInt64 => Value::UInt64(u64::from_le_bytes(src[..8].try_into().unwrap())),
            PropType::Double => Value::Double(f64::from_le_bytes(src[..8].try_into().unwrap())),
            PropType::Bool => Value::Bool(src[0] != 0),
            PropType::Date => Value::Date(i64::from_le_bytes(src[..8].try_into().unwrap())),
            PropType::DateTime => {
                Value::DateTime(i64::from_le_bytes(src[..8].try_into().unwrap()))
            }
            PropType::Str => {
                return Err(GraphError::InvalidArgument(
                    "string cells decode through the blob heap".into(),
                ))
            }
        };
        Ok(value)
    }

    /// Returns the signed-64 payload of the value, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "date({v})"),
            Value::DateTime(v) => write!(f, "datetime({v})"),
            Value::Str(v) => write!(f, "{v}"),
        }
    }
}
