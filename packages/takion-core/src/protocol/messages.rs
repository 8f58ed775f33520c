//! Takion control messages carried as `data_type = 0` (protobuf) payloads.
//!
//! Field numbers below are assigned per message in ascending order as there
//! is no recovered `.proto` schema to mirror field-for-field (see
//! `SPEC_FULL.md`); what matters for interoperability is that both peers in
//! a given deployment agree on the schema, which this module fixes once.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ParseError;
use crate::model::ControllerType;

use super::wire::{
    get_bytes_field, get_string_field, get_tag, get_varint, put_bool_field, put_bytes_field,
    put_varint_field, skip_field, WireType,
};

/// `BIG` — sent by the client after COOKIE_ACK to open the stream session.
#[derive(Debug, Clone)]
pub struct Big {
    pub client_version: u32,
    pub session_key: String,
    pub launch_spec: String,
    pub encrypted_key: Vec<u8>,
    pub ecdh_pub: Vec<u8>,
    pub ecdh_sig: Vec<u8>,
}

impl Big {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_varint_field(buf, 1, u64::from(self.client_version));
        put_bytes_field(buf, 2, self.session_key.as_bytes());
        put_bytes_field(buf, 3, self.launch_spec.as_bytes());
        put_bytes_field(buf, 4, &self.encrypted_key);
        put_bytes_field(buf, 5, &self.ecdh_pub);
        put_bytes_field(buf, 6, &self.ecdh_sig);
    }
}

/// `BANG` — console's reply to `BIG`.
#[derive(Debug, Clone)]
pub struct Bang {
    pub server_version: u32,
    pub version_accepted: bool,
    pub ecdh_pub: Vec<u8>,
    pub ecdh_sig: Vec<u8>,
}

impl Bang {
    pub fn decode(mut payload: &[u8]) -> Result<Self, ParseError> {
        let mut server_version = None;
        let mut version_accepted = None;
        let mut ecdh_pub = None;
        let mut ecdh_sig = None;

        while payload.has_remaining() {
            let tag = get_tag(&mut payload)?;
            match tag.field_number {
                1 => server_version = Some(get_varint(&mut payload)? as u32),
                2 => version_accepted = Some(get_varint(&mut payload)? != 0),
                3 => ecdh_pub = Some(get_bytes_field(&mut payload)?),
                4 => ecdh_sig = Some(get_bytes_field(&mut payload)?),
                _ => skip_field(&mut payload, tag.wire_type)?,
            }
        }

        Ok(Self {
            server_version: server_version.ok_or(ParseError::MissingField)?,
            version_accepted: version_accepted.ok_or(ParseError::MissingField)?,
            ecdh_pub: ecdh_pub.ok_or(ParseError::MissingField)?,
            ecdh_sig: ecdh_sig.ok_or(ParseError::MissingField)?,
        })
    }
}

/// One entry in `STREAMINFO.resolution`.
#[derive(Debug, Clone)]
pub struct StreamInfoProfile {
    pub width: u32,
    pub height: u32,
    pub video_header: Vec<u8>,
}

/// `STREAMINFO` — console announces available video profiles and the audio
/// header.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub resolutions: Vec<StreamInfoProfile>,
    pub audio_header: Vec<u8>,
}

impl StreamInfo {
    pub fn decode(mut payload: &[u8]) -> Result<Self, ParseError> {
        let mut resolutions = Vec::new();
        let mut audio_header = None;

        while payload.has_remaining() {
            let tag = get_tag(&mut payload)?;
            match tag.field_number {
                1 => resolutions.push(decode_resolution(&get_bytes_field(&mut payload)?)?),
                2 => audio_header = Some(get_bytes_field(&mut payload)?),
                _ => skip_field(&mut payload, tag.wire_type)?,
            }
        }

        Ok(Self {
            resolutions,
            audio_header: audio_header.ok_or(ParseError::MissingField)?,
        })
    }
}

fn decode_resolution(mut payload: &[u8]) -> Result<StreamInfoProfile, ParseError> {
    let mut width = None;
    let mut height = None;
    let mut video_header = None;

    while payload.has_remaining() {
        let tag = get_tag(&mut payload)?;
        match tag.field_number {
            1 => width = Some(get_varint(&mut payload)? as u32),
            2 => height = Some(get_varint(&mut payload)? as u32),
            3 => video_header = Some(get_bytes_field(&mut payload)?),
            _ => skip_field(&mut payload, tag.wire_type)?,
        }
    }

    Ok(StreamInfoProfile {
        width: width.ok_or(ParseError::MissingField)?,
        height: height.ok_or(ParseError::MissingField)?,
        video_header: video_header.ok_or(ParseError::MissingField)?,
    })
}

/// `STREAMINFOACK` — empty acknowledgement sent by the client.
pub struct StreamInfoAck;

impl StreamInfoAck {
    pub fn encode(&self, _buf: &mut BytesMut) {}
}

/// `HEARTBEAT` — empty, echoed by the client within the same task tick.
pub struct Heartbeat;

impl Heartbeat {
    pub fn encode(&self, _buf: &mut BytesMut) {}
}

/// `DISCONNECT` — sent by either side to end the stream.
#[derive(Debug, Clone)]
pub struct Disconnect {
    pub reason: String,
}

impl Disconnect {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_bytes_field(buf, 1, self.reason.as_bytes());
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ParseError> {
        let mut reason = String::new();
        while payload.has_remaining() {
            let tag = get_tag(&mut payload)?;
            match tag.field_number {
                1 => reason = get_string_field(&mut payload)?,
                _ => skip_field(&mut payload, tag.wire_type)?,
            }
        }
        Ok(Self { reason })
    }
}

/// `IDRREQUEST` — client requests a fresh keyframe.
pub struct IdrRequest;

impl IdrRequest {
    pub fn encode(&self, _buf: &mut BytesMut) {}
}

/// `CORRUPTFRAME` — client reports a range of lost frame indices.
#[derive(Debug, Clone, Copy)]
pub struct CorruptFrame {
    pub start: u16,
    pub end: u16,
}

impl CorruptFrame {
    /// Encodes, swapping `start`/`end` if `start > end` per the handling
    /// this engine mandates for malformed ranges (§9 open question).
    pub fn encode(&self, buf: &mut BytesMut) {
        let (start, end) = if self.start > self.end {
            (self.end, self.start)
        } else {
            (self.start, self.end)
        };
        put_varint_field(buf, 1, u64::from(start));
        put_varint_field(buf, 2, u64::from(end));
    }
}

/// `CONTROLLERCONNECTION` — client announces controller attach/detach.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConnection {
    pub connected: bool,
    pub controller_type: ControllerType,
}

impl ControllerConnection {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_bool_field(buf, 1, self.connected);
        let type_code = match self.controller_type {
            ControllerType::DualShock4 => 0,
            ControllerType::DualSense => 1,
        };
        put_varint_field(buf, 2, type_code);
    }
}

/// Dispatch tag for an inbound protobuf control message, decoded from the
/// message's own `type` field before selecting the message-specific decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakionMessageType {
    Bang,
    StreamInfo,
    Heartbeat,
    Disconnect,
}

impl TakionMessageType {
    /// Wire discriminant used in the `TakionMessage` envelope's field 1.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Bang),
            2 => Some(Self::StreamInfo),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// Envelope wrapping every protobuf control message: a type discriminant
/// (field 1) followed by the type-specific payload (field 2, opaque bytes
/// re-parsed by the matching decoder above).
pub struct TakionMessageEnvelope {
    pub message_type: TakionMessageType,
    pub payload: Vec<u8>,
}

impl TakionMessageEnvelope {
    pub fn decode(mut buf: &[u8]) -> Result<Self, ParseError> {
        let mut message_type = None;
        let mut payload = None;

        while buf.has_remaining() {
            let tag = get_tag(&mut buf)?;
            match tag.field_number {
                1 => {
                    let code = get_varint(&mut buf)? as u32;
                    message_type =
                        Some(TakionMessageType::from_code(code).ok_or(ParseError::MalformedWire)?);
                }
                2 => payload = Some(get_bytes_field(&mut buf)?),
                _ => skip_field(&mut buf, tag.wire_type)?,
            }
        }

        Ok(Self {
            message_type: message_type.ok_or(ParseError::MissingField)?,
            payload: payload.unwrap_or_default(),
        })
    }

    pub fn encode(message_type: TakionMessageType, payload_encoder: impl FnOnce(&mut BytesMut)) -> BytesMut {
        let mut inner = BytesMut::new();
        payload_encoder(&mut inner);

        let code: u32 = match message_type {
            TakionMessageType::Bang => 1,
            TakionMessageType::StreamInfo => 2,
            TakionMessageType::Heartbeat => 3,
            TakionMessageType::Disconnect => 4,
        };

        let mut buf = BytesMut::new();
        put_varint_field(&mut buf, 1, u64::from(code));
        put_bytes_field(&mut buf, 2, &inner);
        buf
    }
}
