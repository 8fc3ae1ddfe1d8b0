//! Typed message payloads.

use crate::header::MAX_PAYLOAD;
use crate::WireError;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Inline buffer for variable-length payloads
pub type PayloadBuf = SmallVec<[u8; MAX_PAYLOAD]>;

/// Payload representation tag carried in the header (3 bits)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadType {
    /// Raw characters, not necessarily terminated
    String = 0,
    /// Unsigned 8-bit
    Byte = 1,
    /// Signed 16-bit
    Int16 = 2,
    /// Unsigned 16-bit
    UInt16 = 3,
    /// Signed 32-bit
    Long32 = 4,
    /// Unsigned 32-bit
    ULong32 = 5,
    /// Opaque bytes
    Custom = 6,
    /// 32-bit float followed by a decimal precision byte
    Float32 = 7,
}

impl TryFrom<u8> for PayloadType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PayloadType::String),
            1 => Ok(PayloadType::Byte),
            2 => Ok(PayloadType::Int16),
            3 => Ok(PayloadType::UInt16),
            4 => Ok(PayloadType::Long32),
            5 => Ok(PayloadType::ULong32),
            6 => Ok(PayloadType::Custom),
            7 => Ok(PayloadType::Float32),
            _ => Err(WireError::PayloadType(value)),
        }
    }
}

/// Message payload, carrying exactly the active representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Text
    Text(PayloadBuf),
    /// u8
    Byte(u8),
    /// i16
    Int16(i16),
    /// u16
    UInt16(u16),
    /// i32
    Long32(i32),
    /// u32
    ULong32(u32),
    /// f32 with the number of decimals used when rendered as text
    Float32 {
        /// Value
        value: f32,
        /// Decimal places
        precision: u8,
    },
    /// Opaque bytes
    Custom(PayloadBuf),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(PayloadBuf::new())
    }
}

impl Payload {
    /// Text payload, truncated to [`MAX_PAYLOAD`] bytes
    pub fn text(s: &str) -> Self {
        let bytes = s.as_bytes();
        Payload::Text(PayloadBuf::from_slice(&bytes[..bytes.len().min(MAX_PAYLOAD)]))
    }

    /// Opaque payload, truncated to [`MAX_PAYLOAD`] bytes
    pub fn custom(bytes: &[u8]) -> Self {
        Payload::Custom(PayloadBuf::from_slice(&bytes[..bytes.len().min(MAX_PAYLOAD)]))
    }

    /// Float payload
    pub fn float(value: f32, precision: u8) -> Self {
        Payload::Float32 { value, precision }
    }

    /// Representation tag for the header
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::Text(_) => PayloadType::String,
            Payload::Byte(_) => PayloadType::Byte,
            Payload::Int16(_) => PayloadType::Int16,
            Payload::UInt16(_) => PayloadType::UInt16,
            Payload::Long32(_) => PayloadType::Long32,
            Payload::ULong32(_) => PayloadType::ULong32,
            Payload::Float32 { .. } => PayloadType::Float32,
            Payload::Custom(_) => PayloadType::Custom,
        }
    }

    /// Bytes this payload occupies on the wire
    pub fn encoded_len(&self) -> usize {
        match self {
            Payload::Text(b) | Payload::Custom(b) => b.len(),
            Payload::Byte(_) => 1,
            Payload::Int16(_) | Payload::UInt16(_) => 2,
            Payload::Long32(_) | Payload::ULong32(_) => 4,
            Payload::Float32 { .. } => 5,
        }
    }

    /// Write the payload bytes (little-endian for numeric types)
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Payload::Text(b) | Payload::Custom(b) => buf.put_slice(b),
            Payload::Byte(v) => buf.put_u8(*v),
            Payload::Int16(v) => buf.put_i16_le(*v),
            Payload::UInt16(v) => buf.put_u16_le(*v),
            Payload::Long32(v) => buf.put_i32_le(*v),
            Payload::ULong32(v) => buf.put_u32_le(*v),
            Payload::Float32 { value, precision } => {
                buf.put_f32_le(*value);
                buf.put_u8(*precision);
            }
        }
    }

    /// Decode `bytes` as a payload of the given type
    ///
    /// Fixed-width types must match their width exactly.
    pub fn decode(payload_type: PayloadType, mut bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_PAYLOAD {
            return Err(WireError::Size(bytes.len()));
        }

        let length = bytes.len();
        let width = |n: usize| {
            if length == n {
                Ok(())
            } else {
                Err(WireError::PayloadLength {
                    payload_type,
                    length,
                })
            }
        };

        let payload = match payload_type {
            PayloadType::String => Payload::Text(PayloadBuf::from_slice(bytes)),
            PayloadType::Custom => Payload::Custom(PayloadBuf::from_slice(bytes)),
            PayloadType::Byte => {
                width(1)?;
                Payload::Byte(bytes.get_u8())
            }
            PayloadType::Int16 => {
                width(2)?;
                Payload::Int16(bytes.get_i16_le())
            }
            PayloadType::UInt16 => {
                width(2)?;
                Payload::UInt16(bytes.get_u16_le())
            }
            PayloadType::Long32 => {
                width(4)?;
                Payload::Long32(bytes.get_i32_le())
            }
            PayloadType::ULong32 => {
                width(4)?;
                Payload::ULong32(bytes.get_u32_le())
            }
            PayloadType::Float32 => {
                width(5)?;
                Payload::Float32 {
                    value: bytes.get_f32_le(),
                    precision: bytes.get_u8(),
                }
            }
        };
        Ok(payload)
    }

    /// Raw bytes of a text or opaque payload
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Text(b) | Payload::Custom(b) => Some(b),
            _ => None,
        }
    }

    /// Text payload as UTF-8, if it is valid
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Text(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Numeric view of the payload. Text is parsed as a leading integer,
    /// opaque bytes read as zero.
    pub fn as_i64(&self) -> i64 {
        match self {
            Payload::Text(b) => leading_int(b),
            Payload::Byte(v) => i64::from(*v),
            Payload::Int16(v) => i64::from(*v),
            Payload::UInt16(v) => i64::from(*v),
            Payload::Long32(v) => i64::from(*v),
            Payload::ULong32(v) => i64::from(*v),
            Payload::Float32 { value, .. } => *value as i64,
            Payload::Custom(_) => 0,
        }
    }

    /// Payload truncated to a byte
    pub fn as_u8(&self) -> u8 {
        self.as_i64() as u8
    }

    /// Payload truncated to an unsigned 32-bit value
    pub fn as_u32(&self) -> u32 {
        self.as_i64() as u32
    }

    /// Payload as a float
    pub fn as_f32(&self) -> f32 {
        match self {
            Payload::Float32 { value, .. } => *value,
            Payload::Text(b) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0.0),
            other => other.as_i64() as f32,
        }
    }
}

/// Parse an optionally signed run of leading decimal digits, zero if none
fn leading_int(bytes: &[u8]) -> i64 {
    let mut iter = bytes.iter().skip_while(|b| b.is_ascii_whitespace()).peekable();
    let negative = match iter.peek() {
        Some(b'-') => {
            iter.next();
            true
        }
        Some(b'+') => {
            iter.next();
            false
        }
        _ => false,
    };

    let mut value: i64 = 0;
    for b in iter.take_while(|b| b.is_ascii_digit()) {
        value = value.saturating_mul(10).saturating_add(i64::from(b - b'0'));
    }
    if negative {
        -value
    } else {
        value
    }
}

impl From<u8> for Payload {
    fn from(v: u8) -> Self {
        Payload::Byte(v)
    }
}

impl From<i16> for Payload {
    fn from(v: i16) -> Self {
        Payload::Int16(v)
    }
}

impl From<u16> for Payload {
    fn from(v: u16) -> Self {
        Payload::UInt16(v)
    }
}

impl From<i32> for Payload {
    fn from(v: i32) -> Self {
        Payload::Long32(v)
    }
}

impl From<u32> for Payload {
    fn from(v: u32) -> Self {
        Payload::ULong32(v)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::text(s)
    }
}
