//! Binary codec: tag/value wire format driven by message descriptors.
//!
//! Layout of one record:
//!
//! ```text
//! key   = varint(tag << 3 | wire_type)
//! value = varint                      (wire type 0)
//!       | 8 bytes little-endian       (wire type 1)
//!       | varint(len) + len bytes     (wire type 2)
//!       | 4 bytes little-endian       (wire type 5)
//! ```
//!
//! Default values are never written, so an all-default message encodes to an
//! empty buffer. Records are written in ascending tag order.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::{DynamicMessage, Value};
use crate::schema::{FieldDescriptor, FieldType, MessageDescriptor, WireType, MAX_TAG};

/// A varint never spans more than ten bytes.
pub const MAX_VARINT_LEN: usize = 10;

/// Nesting limit for embedded messages during decode.
pub const MAX_DECODE_DEPTH: usize = 100;

// ============================================================================
// Varint and ZigZag primitives
// ============================================================================

#[inline]
pub fn encode_varint(mut value: u64, buf: &mut impl BufMut) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

#[inline]
pub fn varint_len(value: u64) -> usize {
    // One byte per started group of seven bits; zero still takes a byte.
    ((64 - (value | 1).leading_zeros() as usize) + 6) / 7
}

#[inline]
pub fn zigzag_encode32(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

#[inline]
pub fn zigzag_decode32(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

#[inline]
pub fn zigzag_encode64(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
pub fn zigzag_decode64(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Read a varint starting at `*pos`, advancing it past the last byte.
fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let start = *pos;
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let Some(&byte) = buf.get(start + i) else {
            return Err(Error::malformed(start, "truncated varint"));
        };
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(Error::malformed(start, "varint overflows 64 bits"));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            *pos = start + i + 1;
            return Ok(value);
        }
    }
    Err(Error::malformed(start, "varint longer than 10 bytes"))
}

// ============================================================================
// Encoding
// ============================================================================

/// Serialize `msg` into a fresh buffer.
pub fn encode(msg: &DynamicMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(msg));
    encode_to(msg, &mut buf);
    buf.freeze()
}

/// Serialize `msg` into `buf`.
pub fn encode_to(msg: &DynamicMessage, buf: &mut impl BufMut) {
    for (field, value) in msg.set_fields() {
        encode_varint(key(field), buf);
        encode_value(field.field_type(), value, buf);
    }
}

/// Exact number of bytes [`encode`] produces for `msg`.
pub fn encoded_len(msg: &DynamicMessage) -> usize {
    msg.set_fields()
        .map(|(field, value)| varint_len(key(field)) + value_len(field.field_type(), value))
        .sum()
}

#[inline]
fn key(field: &FieldDescriptor) -> u64 {
    (u64::from(field.tag()) << 3) | field.wire_type() as u64
}

fn encode_value(field_type: &FieldType, value: &Value, buf: &mut impl BufMut) {
    match (field_type, value) {
        (FieldType::Bool, Value::Bool(v)) => encode_varint(u64::from(*v), buf),
        // Negative int32 is sign-extended to ten bytes.
        (FieldType::Int32, Value::I32(v)) => encode_varint(i64::from(*v) as u64, buf),
        (FieldType::Int64, Value::I64(v)) => encode_varint(*v as u64, buf),
        (FieldType::Uint32, Value::U32(v)) => encode_varint(u64::from(*v), buf),
        (FieldType::Uint64, Value::U64(v)) => encode_varint(*v, buf),
        (FieldType::Sint32, Value::I32(v)) => encode_varint(u64::from(zigzag_encode32(*v)), buf),
        (FieldType::Sint64, Value::I64(v)) => encode_varint(zigzag_encode64(*v), buf),
        (FieldType::Fixed32, Value::U32(v)) => buf.put_u32_le(*v),
        (FieldType::Sfixed32, Value::I32(v)) => buf.put_i32_le(*v),
        (FieldType::Float, Value::F32(v)) => buf.put_f32_le(*v),
        (FieldType::Fixed64, Value::U64(v)) => buf.put_u64_le(*v),
        (FieldType::Sfixed64, Value::I64(v)) => buf.put_i64_le(*v),
        (FieldType::Double, Value::F64(v)) => buf.put_f64_le(*v),
        (FieldType::String, Value::String(v)) => {
            encode_varint(v.len() as u64, buf);
            buf.put_slice(v.as_bytes());
        }
        (FieldType::Bytes, Value::Bytes(v)) => {
            encode_varint(v.len() as u64, buf);
            buf.put_slice(v);
        }
        (FieldType::Message(_), Value::Message(m)) => {
            encode_varint(encoded_len(m) as u64, buf);
            encode_to(m, buf);
        }
        // Unreachable: values are checked against their field on the way in.
        _ => {}
    }
}

fn value_len(field_type: &FieldType, value: &Value) -> usize {
    match (field_type, value) {
        (FieldType::Bool, Value::Bool(_)) => 1,
        (FieldType::Int32, Value::I32(v)) => varint_len(i64::from(*v) as u64),
        (FieldType::Int64, Value::I64(v)) => varint_len(*v as u64),
        (FieldType::Uint32, Value::U32(v)) => varint_len(u64::from(*v)),
        (FieldType::Uint64, Value::U64(v)) => varint_len(*v),
        (FieldType::Sint32, Value::I32(v)) => varint_len(u64::from(zigzag_encode32(*v))),
        (FieldType::Sint64, Value::I64(v)) => varint_len(zigzag_encode64(*v)),
        (FieldType::Fixed32 | FieldType::Sfixed32 | FieldType::Float, _) => 4,
        (FieldType::Fixed64 | FieldType::Sfixed64 | FieldType::Double, _) => 8,
        (FieldType::String, Value::String(v)) => varint_len(v.len() as u64) + v.len(),
        (FieldType::Bytes, Value::Bytes(v)) => varint_len(v.len() as u64) + v.len(),
        (FieldType::Message(_), Value::Message(m)) => {
            let len = encoded_len(m);
            varint_len(len as u64) + len
        }
        _ => 0,
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Payload of one record, borrowed from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawValue<'a> {
    Varint(u64),
    Fixed32(u32),
    Fixed64(u64),
    LengthDelimited(&'a [u8]),
}

impl RawValue<'_> {
    pub fn wire_type(&self) -> WireType {
        match self {
            RawValue::Varint(_) => WireType::Varint,
            RawValue::Fixed32(_) => WireType::Fixed32,
            RawValue::Fixed64(_) => WireType::Fixed64,
            RawValue::LengthDelimited(_) => WireType::LengthDelimited,
        }
    }
}

/// One key/value record and the offset its key starts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawField<'a> {
    pub tag: u32,
    pub value: RawValue<'a>,
    pub offset: usize,
}

/// Lazy scan over the records of an encoded message.
///
/// Yields records without consulting any schema; stops after the first error.
pub struct FieldScanner<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> FieldScanner<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }

    fn next_field(&mut self) -> Result<RawField<'a>> {
        let offset = self.pos;
        let key = read_varint(self.buf, &mut self.pos)?;
        let tag = u32::try_from(key >> 3)
            .ok()
            .filter(|tag| *tag <= MAX_TAG)
            .ok_or_else(|| Error::malformed(offset, format!("tag number {} out of range", key >> 3)))?;
        if tag == 0 {
            return Err(Error::malformed(offset, "tag number 0"));
        }
        let wire_type = WireType::from_u8((key & 0x7) as u8).ok_or_else(|| {
            Error::malformed(offset, format!("unsupported wire type {}", key & 0x7))
        })?;

        let value = match wire_type {
            WireType::Varint => RawValue::Varint(read_varint(self.buf, &mut self.pos)?),
            WireType::Fixed32 => RawValue::Fixed32(self.take(4)?.get_u32_le()),
            WireType::Fixed64 => RawValue::Fixed64(self.take(8)?.get_u64_le()),
            WireType::LengthDelimited => {
                let len_at = self.pos;
                let len = read_varint(self.buf, &mut self.pos)?;
                let len = usize::try_from(len)
                    .map_err(|_| Error::malformed(len_at, "length prefix exceeds buffer"))?;
                RawValue::LengthDelimited(self.take(len)?)
            }
        };

        Ok(RawField { tag, value, offset })
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let remaining = self.buf.len() - self.pos;
        if len > remaining {
            return Err(Error::malformed(
                self.pos,
                format!("need {len} bytes, have {remaining}"),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

impl<'a> Iterator for FieldScanner<'a> {
    type Item = Result<RawField<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let field = self.next_field();
        self.failed = field.is_err();
        Some(field)
    }
}

/// Parse `buf` as an instance of `descriptor`.
///
/// Unknown tags are skipped. A known tag carrying the wrong wire type, or any
/// truncation, is an error; corrupt input never decodes to defaults.
pub fn decode(buf: &[u8], descriptor: &Arc<MessageDescriptor>) -> Result<DynamicMessage> {
    let mut msg = DynamicMessage::new(descriptor.clone());
    merge(&mut msg, buf, 0)?;
    Ok(msg)
}

fn merge(msg: &mut DynamicMessage, buf: &[u8], depth: usize) -> Result<()> {
    if depth > MAX_DECODE_DEPTH {
        return Err(Error::malformed(0, "message nesting too deep"));
    }
    let descriptor = msg.descriptor().clone();

    for raw in FieldScanner::new(buf) {
        let raw = raw?;
        let Some(field) = descriptor.field_by_tag(raw.tag) else {
            debug!(
                message = descriptor.full_name(),
                tag = raw.tag,
                wire_type = ?raw.value.wire_type(),
                "skipping unknown field"
            );
            continue;
        };
        if raw.value.wire_type() != field.wire_type() {
            return Err(Error::malformed(
                raw.offset,
                format!(
                    "field `{}` expects wire type {:?}, found {:?}",
                    field.full_name(),
                    field.wire_type(),
                    raw.value.wire_type()
                ),
            ));
        }

        match (field.message_type(), raw.value) {
            // Repeated occurrences of an embedded message merge into one.
            (Some(nested), RawValue::LengthDelimited(bytes)) => {
                let mut child = match msg.take(field.tag()) {
                    Some(Value::Message(existing)) => *existing,
                    _ => DynamicMessage::new(nested.clone()),
                };
                merge(&mut child, bytes, depth + 1)?;
                msg.store(field.tag(), Value::Message(Box::new(child)));
            }
            (_, value) => {
                let value = scalar_value(field, value, raw.offset)?;
                msg.store(field.tag(), value);
            }
        }
    }
    Ok(())
}

fn scalar_value(field: &FieldDescriptor, raw: RawValue<'_>, offset: usize) -> Result<Value> {
    let value = match (field.field_type(), raw) {
        (FieldType::Bool, RawValue::Varint(v)) => Value::Bool(v != 0),
        (FieldType::Int32, RawValue::Varint(v)) => Value::I32(v as i32),
        (FieldType::Int64, RawValue::Varint(v)) => Value::I64(v as i64),
        (FieldType::Uint32, RawValue::Varint(v)) => Value::U32(v as u32),
        (FieldType::Uint64, RawValue::Varint(v)) => Value::U64(v),
        (FieldType::Sint32, RawValue::Varint(v)) => Value::I32(zigzag_decode32(v as u32)),
        (FieldType::Sint64, RawValue::Varint(v)) => Value::I64(zigzag_decode64(v)),
        (FieldType::Fixed32, RawValue::Fixed32(v)) => Value::U32(v),
        (FieldType::Sfixed32, RawValue::Fixed32(v)) => Value::I32(v as i32),
        (FieldType::Float, RawValue::Fixed32(v)) => Value::F32(f32::from_bits(v)),
        (FieldType::Fixed64, RawValue::Fixed64(v)) => Value::U64(v),
        (FieldType::Sfixed64, RawValue::Fixed64(v)) => Value::I64(v as i64),
        (FieldType::Double, RawValue::Fixed64(v)) => Value::F64(f64::from_bits(v)),
        (FieldType::String, RawValue::LengthDelimited(bytes)) => {
            let s = std::str::from_utf8(bytes).map_err(|e| {
                Error::malformed(offset, format!("field `{}`: {e}", field.full_name()))
            })?;
            Value::String(s.to_owned())
        }
        (FieldType::Bytes, RawValue::LengthDelimited(bytes)) => Value::Bytes(bytes.to_vec()),
        (field_type, raw) => {
            return Err(Error::malformed(
                offset,
                format!("cannot read {field_type} from {:?}", raw.wire_type()),
            ))
        }
    };
    Ok(value)
}
