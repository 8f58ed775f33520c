//! Minimal protobuf-wire-compatible varint and length-delimited codec.
//!
//! The Takion control messages (BIG, BANG, STREAMINFO, …) are protobuf on
//! the wire, but this engine has no `.proto` schema or `protoc`/`prost`
//! build step available to it (see `SPEC_FULL.md` for the reasoning); this
//! module hand-rolls just enough of the wire format — varints, tags, and
//! length-delimited fields — to encode/decode the handful of messages this
//! engine needs, built directly on `bytes::{Buf, BufMut}` like the rest of
//! the packet codec.

use bytes::{Buf, BufMut};

use crate::error::ParseError;

/// Protobuf wire types this engine produces/consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    LengthDelimited,
}

impl WireType {
    fn tag_bits(self) -> u64 {
        match self {
            Self::Varint => 0,
            Self::LengthDelimited => 2,
        }
    }

    fn from_tag_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(Self::Varint),
            2 => Some(Self::LengthDelimited),
            _ => None,
        }
    }
}

/// Writes a field tag `(field_number << 3) | wire_type`.
pub fn put_tag(buf: &mut impl BufMut, field_number: u32, wire_type: WireType) {
    put_varint(buf, (u64::from(field_number) << 3) | wire_type.tag_bits());
}

/// Writes an unsigned LEB128 varint.
pub fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            break;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Writes a varint field: tag + value.
pub fn put_varint_field(buf: &mut impl BufMut, field_number: u32, value: u64) {
    put_tag(buf, field_number, WireType::Varint);
    put_varint(buf, value);
}

/// Writes a length-delimited field (string or bytes): tag + length + bytes.
pub fn put_bytes_field(buf: &mut impl BufMut, field_number: u32, data: &[u8]) {
    put_tag(buf, field_number, WireType::LengthDelimited);
    put_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Writes a bool field as a varint 0/1.
pub fn put_bool_field(buf: &mut impl BufMut, field_number: u32, value: bool) {
    put_varint_field(buf, field_number, u64::from(value));
}

/// Reads an unsigned LEB128 varint.
pub fn get_varint(buf: &mut impl Buf) -> Result<u64, ParseError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(ParseError::MalformedWire);
        }
        let byte = buf.get_u8();
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(ParseError::MalformedWire);
        }
    }
}

/// A decoded `(field_number, wire_type)` tag.
pub struct Tag {
    pub field_number: u32,
    pub wire_type: WireType,
}

/// Reads a field tag.
pub fn get_tag(buf: &mut impl Buf) -> Result<Tag, ParseError> {
    let raw = get_varint(buf)?;
    let wire_type = WireType::from_tag_bits(raw & 0x7)
        .ok_or(ParseError::MalformedWire)?;
    let field_number = u32::try_from(raw >> 3).map_err(|_| ParseError::MalformedWire)?;
    Ok(Tag { field_number, wire_type })
}

/// Reads a length-delimited field's bytes.
pub fn get_bytes_field(buf: &mut impl Buf) -> Result<Vec<u8>, ParseError> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(ParseError::MalformedWire);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Reads a length-delimited field as a UTF-8 string (lossy, matching the
/// ASCII-only fields this protocol actually uses).
pub fn get_string_field(buf: &mut impl Buf) -> Result<String, ParseError> {
    let bytes = get_bytes_field(buf)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Skips a field's value given its wire type, for forward-compatibility with
/// unrecognized field numbers.
pub fn skip_field(buf: &mut impl Buf, wire_type: WireType) -> Result<(), ParseError> {
    match wire_type {
        WireType::Varint => {
            get_varint(buf)?;
        }
        WireType::LengthDelimited => {
            let len = get_varint(buf)? as usize;
            if buf.remaining() < len {
                return Err(ParseError::MalformedWire);
            }
            buf.advance(len);
        }
    }
    Ok(())
}
