//! Wire Values
//!
//! Tagged argument values for wire commands. Every value carries a one-byte
//! type tag on the wire. The tag table is closed and identical on both ends;
//! an unrecognized tag is a protocol error, never a guess.

use std::fmt;

use thiserror::Error;

/// Longest string the wire can carry (u16 length prefix).
pub const MAX_STR_BYTES: usize = u16::MAX as usize;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// A value tag outside the known table.
    #[error("unknown value tag {0:#04x}")]
    UnknownTag(u8),

    /// A command kind that was never registered.
    #[error("unknown command kind `{0}`")]
    UnknownKind(String),

    /// Input ended before the announced data did.
    #[error("truncated wire data")]
    Truncated,

    /// A string field longer than the u16 length prefix allows.
    #[error("string of {0} bytes exceeds wire limit")]
    StringTooLong(usize),

    /// A string field that is not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// A negative or absurd argument count.
    #[error("bad argument count {0}")]
    BadArgCount(i32),

    /// Bytes left over after a complete decode.
    #[error("{0} trailing bytes after command")]
    Trailing(usize),

    /// A frame longer than the configured maximum.
    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),
}

// =============================================================================
// VALUE
// =============================================================================

/// A typed command argument.
///
/// The `Sync` variant carries the serialized bytes of a delta-sync structure;
/// the command layer treats it as opaque.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit absence.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// 32-bit signed integer.
    I32(i32),
    /// 64-bit signed integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// UTF-8 string.
    Str(String),
    /// Serialized delta-sync payload.
    Sync(Vec<u8>),
}

impl Value {
    /// Wire tag for [`Value::Null`].
    pub const TAG_NULL: u8 = 0;
    /// Wire tag for [`Value::Bool`].
    pub const TAG_BOOL: u8 = 1;
    /// Wire tag for [`Value::I32`].
    pub const TAG_I32: u8 = 2;
    /// Wire tag for [`Value::I64`].
    pub const TAG_I64: u8 = 3;
    /// Wire tag for [`Value::F32`].
    pub const TAG_F32: u8 = 4;
    /// Wire tag for [`Value::F64`].
    pub const TAG_F64: u8 = 5;
    /// Wire tag for [`Value::Str`].
    pub const TAG_STR: u8 = 6;
    /// Wire tag for [`Value::Sync`].
    pub const TAG_SYNC: u8 = 7;

    /// The wire tag of this value.
    pub fn tag(&self) -> u8 {
        match self {
            Value::Null => Self::TAG_NULL,
            Value::Bool(_) => Self::TAG_BOOL,
            Value::I32(_) => Self::TAG_I32,
            Value::I64(_) => Self::TAG_I64,
            Value::F32(_) => Self::TAG_F32,
            Value::F64(_) => Self::TAG_F64,
            Value::Str(_) => Self::TAG_STR,
            Value::Sync(_) => Self::TAG_SYNC,
        }
    }

    /// Boolean payload, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// i32 payload, if this is an `I32`.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// i64 payload, if this is an `I64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// f32 payload, if this is an `F32`.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    /// f64 payload, if this is an `F64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// String payload, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Sync payload bytes, if this is a `Sync`.
    pub fn as_sync(&self) -> Option<&[u8]> {
        match self {
            Value::Sync(v) => Some(v),
            _ => None,
        }
    }

    /// True for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Write tag byte plus payload.
    pub fn write_tagged(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        put_u8(out, self.tag());
        match self {
            Value::Null => {}
            Value::Bool(v) => put_u8(out, u8::from(*v)),
            Value::I32(v) => put_i32(out, *v),
            Value::I64(v) => put_i64(out, *v),
            Value::F32(v) => put_f32(out, *v),
            Value::F64(v) => put_f64(out, *v),
            Value::Str(v) => put_str(out, v)?,
            Value::Sync(v) => {
                put_u32(out, v.len() as u32);
                out.extend_from_slice(v);
            }
        }
        Ok(())
    }

    /// Read a tag byte plus payload.
    pub fn read_tagged(input: &mut WireReader<'_>) -> Result<Self, WireError> {
        let tag = input.read_u8()?;
        match tag {
            Self::TAG_NULL => Ok(Value::Null),
            Self::TAG_BOOL => Ok(Value::Bool(input.read_u8()? != 0)),
            Self::TAG_I32 => Ok(Value::I32(input.read_i32()?)),
            Self::TAG_I64 => Ok(Value::I64(input.read_i64()?)),
            Self::TAG_F32 => Ok(Value::F32(input.read_f32()?)),
            Self::TAG_F64 => Ok(Value::F64(input.read_f64()?)),
            Self::TAG_STR => Ok(Value::Str(input.read_str()?.to_string())),
            Self::TAG_SYNC => {
                let len = input.read_u32()? as usize;
                Ok(Value::Sync(input.read_bytes(len)?.to_vec()))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}i32"),
            Value::I64(v) => write!(f, "{v}i64"),
            Value::F32(v) => write!(f, "{v}f32"),
            Value::F64(v) => write!(f, "{v}f64"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::Sync(v) => {
                let head = &v[..v.len().min(8)];
                write!(f, "sync[{} bytes: {}..]", v.len(), hex::encode(head))
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
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

// =============================================================================
// BYTE HELPERS
// =============================================================================

// All multi-byte fields are big-endian, fixed width. Strings are u16 byte
// length plus UTF-8 bytes.

/// Append one byte.
pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

/// Append a big-endian u16.
pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Append a big-endian u32.
pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Append a big-endian i32.
pub fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Append a big-endian i64.
pub fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Append a big-endian f32.
pub fn put_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Append a big-endian f64.
pub fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Append a length-prefixed UTF-8 string.
pub fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), WireError> {
    if s.len() > MAX_STR_BYTES {
        return Err(WireError::StringTooLong(s.len()));
    }
    put_u16(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Cursor over a borrowed byte slice.
///
/// Every read checks the remaining length first, so a truncated buffer
/// surfaces as [`WireError::Truncated`] instead of a panic.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Wrap a byte slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian u16.
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian i32.
    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian i64.
    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_be_bytes(arr))
    }

    /// Read a big-endian f32.
    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        let b = self.take(4)?;
        Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian f64.
    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_be_bytes(arr))
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<&'a str, WireError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }

    /// Read an exact run of raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) -> Value {
        let mut buf = Vec::new();
        value.write_tagged(&mut buf).unwrap();
        let mut reader = WireReader::new(&buf);
        let back = Value::read_tagged(&mut reader).unwrap();
        assert!(reader.is_empty());
        back
    }

    #[test]
    fn test_tag_table_is_stable() {
        assert_eq!(Value::Null.tag(), 0);
        assert_eq!(Value::Bool(true).tag(), 1);
        assert_eq!(Value::I32(0).tag(), 2);
        assert_eq!(Value::I64(0).tag(), 3);
        assert_eq!(Value::F32(0.0).tag(), 4);
        assert_eq!(Value::F64(0.0).tag(), 5);
        assert_eq!(Value::Str(String::new()).tag(), 6);
        assert_eq!(Value::Sync(Vec::new()).tag(), 7);
    }

    #[test]
    fn test_every_kind_roundtrips() {
        let samples = vec![
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::I32(-123_456),
            Value::I64(i64::MIN),
            Value::F32(3.5),
            Value::F64(-0.015625),
            Value::Str("könig of hearts".to_string()),
            Value::Sync(vec![2, 0, 0, 0, 1, 9]),
        ];
        for value in samples {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let buf = [0x2a, 0, 0, 0, 0];
        let mut reader = WireReader::new(&buf);
        assert_eq!(
            Value::read_tagged(&mut reader),
            Err(WireError::UnknownTag(0x2a))
        );
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let mut buf = Vec::new();
        Value::I64(7).write_tagged(&mut buf).unwrap();
        buf.truncate(5);
        let mut reader = WireReader::new(&buf);
        assert_eq!(Value::read_tagged(&mut reader), Err(WireError::Truncated));
    }

    #[test]
    fn test_oversized_string_rejected_on_encode() {
        let huge = "x".repeat(MAX_STR_BYTES + 1);
        let mut buf = Vec::new();
        assert_eq!(
            Value::Str(huge).write_tagged(&mut buf),
            Err(WireError::StringTooLong(MAX_STR_BYTES + 1))
        );
    }

    #[test]
    fn test_invalid_utf8_rejected_on_decode() {
        let buf = [Value::TAG_STR, 0, 2, 0xff, 0xfe];
        let mut reader = WireReader::new(&buf);
        assert_eq!(Value::read_tagged(&mut reader), Err(WireError::InvalidUtf8));
    }

    #[test]
    fn test_accessors_match_variants() {
        assert_eq!(Value::I32(9).as_i32(), Some(9));
        assert_eq!(Value::I32(9).as_i64(), None);
        assert_eq!(Value::Str("a".into()).as_str(), Some("a"));
        assert!(Value::Null.is_null());
        assert!(!Value::Bool(false).is_null());
    }

    #[test]
    fn test_reader_primitives() {
        let mut buf = Vec::new();
        put_u16(&mut buf, 0xbeef);
        put_i32(&mut buf, -1);
        put_f64(&mut buf, 2.5);
        put_str(&mut buf, "ok").unwrap();

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.read_u16().unwrap(), 0xbeef);
        assert_eq!(reader.read_i32().unwrap(), -1);
        assert_eq!(reader.read_f64().unwrap(), 2.5);
        assert_eq!(reader.read_str().unwrap(), "ok");
        assert!(reader.is_empty());
    }
}
