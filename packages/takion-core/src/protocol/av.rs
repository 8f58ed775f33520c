//! AV unit header parsing (post-decrypt).
//!
//! An `AVPacket` is what remains after the packet envelope has been parsed
//! and the payload decrypted; it carries frame/unit indices used by
//! [`ReorderQueue`](crate::reorder::ReorderQueue) and [`FrameAssembler`](crate::frame::FrameAssembler).

use bytes::{Buf, Bytes};

use crate::error::ParseError;

use super::constants::{audio_codec_byte, video_codec_byte, AV_UNIT_HEADER_LEN};

/// Codec carried by a video `AVPacket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    Av1,
}

/// Codec carried by an audio `AVPacket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Opus,
    Aac,
}

/// Either codec family, resolved from the raw codec byte and the packet's
/// `is_video` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Video(VideoCodec),
    Audio(AudioCodec),
}

fn resolve_codec(is_video: bool, byte: u8) -> Result<Codec, ParseError> {
    if is_video {
        let codec = match byte {
            video_codec_byte::H264 => VideoCodec::H264,
            video_codec_byte::H265 => VideoCodec::H265,
            video_codec_byte::AV1 => VideoCodec::Av1,
            _ => return Err(ParseError::UnknownChunkType),
        };
        Ok(Codec::Video(codec))
    } else {
        let codec = match byte {
            audio_codec_byte::OPUS_A | audio_codec_byte::OPUS_B => AudioCodec::Opus,
            audio_codec_byte::AAC_A | audio_codec_byte::AAC_B => AudioCodec::Aac,
            _ => return Err(ParseError::UnknownChunkType),
        };
        Ok(Codec::Audio(codec))
    }
}

/// A decrypted audio/video unit, ready for reorder + assembly.
#[derive(Debug, Clone)]
pub struct AvPacket {
    pub frame_index: u16,
    pub unit_index: u16,
    pub units_in_frame_src: u16,
    pub units_in_frame_total: u16,
    pub codec: Codec,
    pub key_pos: u32,
    pub is_video: bool,
    pub is_last: bool,
    pub is_last_src: bool,
    pub data_type: u8,
    /// Which `STREAMINFO` profile this unit was encoded against. Carried on
    /// the wire in the upper nibble of the codec byte, since the codec
    /// values themselves only ever occupy the low nibble (§9 open
    /// question: no recovered field for this, so this engine reuses the
    /// otherwise-unused bits rather than widening the header).
    pub adaptive_stream_index: u8,
    pub data: Bytes,
}

impl AvPacket {
    /// Parses a decrypted AV unit.
    ///
    /// Layout: `frame_index(2,BE) unit_index(2,BE) units_in_frame_src(2,BE)
    /// units_in_frame_total(2,BE) flags(1) codec(1) key_pos(4,BE) data_type(1)`
    /// followed by the unit payload. `flags` bit 0 = `is_video`, bit 1 =
    /// `is_last`, bit 2 = `is_last_src`. `codec`'s low nibble selects the
    /// codec; the high nibble carries `adaptive_stream_index`.
    pub fn parse(mut buf: Bytes) -> Result<Self, ParseError> {
        if buf.remaining() < AV_UNIT_HEADER_LEN {
            return Err(ParseError::TooShortForAvHeader);
        }

        let frame_index = buf.get_u16();
        let unit_index = buf.get_u16();
        let units_in_frame_src = buf.get_u16();
        let units_in_frame_total = buf.get_u16();
        let flags = buf.get_u8();
        let codec_byte = buf.get_u8();
        let key_pos = buf.get_u32();
        let data_type = buf.get_u8();

        let is_video = flags & 0x01 != 0;
        let is_last = flags & 0x02 != 0;
        let is_last_src = flags & 0x04 != 0;
        let adaptive_stream_index = codec_byte >> 4;
        let codec = resolve_codec(is_video, codec_byte & 0x0F)?;

        Ok(Self {
            frame_index,
            unit_index,
            units_in_frame_src,
            units_in_frame_total,
            codec,
            key_pos,
            is_video,
            is_last,
            is_last_src,
            data_type,
            adaptive_stream_index,
            data: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn build_unit(is_video: bool, codec_byte: u8, data_type: u8, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(7); // frame_index
        buf.put_u16(1); // unit_index
        buf.put_u16(4); // units_in_frame_src
        buf.put_u16(4); // units_in_frame_total
        let flags = if is_video { 0x01 } else { 0x00 } | 0x02;
        buf.put_u8(flags);
        buf.put_u8(codec_byte);
        buf.put_u32(1234);
        buf.put_u8(data_type);
        buf.put_slice(payload);
        buf.freeze()
    }

    #[test]
    fn parses_video_unit() {
        let bytes = build_unit(true, video_codec_byte::H264, 0, b"payload");
        let packet = AvPacket::parse(bytes).unwrap();
        assert_eq!(packet.frame_index, 7);
        assert!(packet.is_video);
        assert!(packet.is_last);
        assert_eq!(packet.codec, Codec::Video(VideoCodec::H264));
        assert_eq!(&packet.data[..], b"payload");
    }

    #[test]
    fn parses_audio_unit() {
        let bytes = build_unit(false, audio_codec_byte::OPUS_A, 0, b"snd");
        let packet = AvPacket::parse(bytes).unwrap();
        assert!(!packet.is_video);
        assert_eq!(packet.codec, Codec::Audio(AudioCodec::Opus));
    }

    #[test]
    fn rejects_short_buffer() {
        let bytes = Bytes::from_static(&[0u8; 4]);
        assert_eq!(
            AvPacket::parse(bytes).unwrap_err(),
            ParseError::TooShortForAvHeader
        );
    }

    #[test]
    fn rejects_unknown_codec_byte() {
        let bytes = build_unit(true, 0xEE, 0, b"x");
        assert_eq!(
            AvPacket::parse(bytes).unwrap_err(),
            ParseError::UnknownChunkType
        );
    }
}
