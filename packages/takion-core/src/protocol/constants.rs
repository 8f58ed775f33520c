//! Wire-level constants: ports, header sizes, chunk/data type tags.

/// UDP port the console's Takion stream listens on.
pub const STREAM_PORT: u16 = 9296;
/// UDP port used by the Senkusha pre-flight probe (out of scope for this
/// engine; documented here because it shares the console endpoint).
pub const SENKUSHA_PORT: u16 = 9297;

/// Fixed size of the packet envelope header (§3): `type + tag_remote + gmac + key_pos`.
pub const PACKET_HEADER_LEN: usize = 1 + 4 + 4 + 4;

/// Fixed size of a control chunk header: `chunk_type + flag + length`.
pub const CHUNK_HEADER_LEN: usize = 1 + 1 + 2;

/// Fixed size of the DATA payload prefix: `tsn + channel + 3 reserved bytes`.
pub const DATA_PREFIX_LEN: usize = 4 + 2 + 3;

/// Fixed size of a feedback-packet header: `type + sequence + pad + key_pos + gmac`.
pub const FEEDBACK_HEADER_LEN: usize = 1 + 2 + 1 + 4 + 4;

/// `AVPacket` fixed unit header length preceding the payload.
pub const AV_UNIT_HEADER_LEN: usize = 2 + 2 + 2 + 2 + 1 + 4 + 1;

/// Low-nibble `type` values in the packet envelope's first byte.
pub mod packet_type {
    pub const CONTROL: u8 = 0;
    pub const FEEDBACK_EVENT: u8 = 1;
    pub const VIDEO: u8 = 2;
    pub const AUDIO: u8 = 3;
    pub const CONGESTION: u8 = 5;
    pub const FEEDBACK_STATE: u8 = 6;
}

/// Control-chunk type byte values.
pub mod chunk_type {
    pub const INIT: u8 = 1;
    pub const INIT_ACK: u8 = 2;
    pub const COOKIE: u8 = 3;
    pub const COOKIE_ACK: u8 = 4;
    pub const DATA: u8 = 5;
    pub const DATA_ACK: u8 = 6;
}

/// `AVPacket.data_type` values dispatched by `TakionSession` (§4.10).
pub mod data_type {
    pub const PROTOBUF: u8 = 0;
    pub const RUMBLE: u8 = 7;
    pub const PAD_INFO: u8 = 9;
    pub const TRIGGER_EFFECTS: u8 = 11;
}

/// Video codec byte values carried in `AVPacket::codec` for video units.
pub mod video_codec_byte {
    pub const H264: u8 = 0x00;
    pub const H265: u8 = 0x01;
    pub const AV1: u8 = 0x02;
}

/// Audio codec byte values carried in `AVPacket::codec` for audio units.
pub mod audio_codec_byte {
    pub const OPUS_A: u8 = 0x01;
    pub const OPUS_B: u8 = 0x02;
    pub const AAC_A: u8 = 0x03;
    pub const AAC_B: u8 = 0x04;
}

/// Fixed padding suffix length STREAMINFO video headers carry, required by
/// downstream decoders.
pub const VIDEO_HEADER_PADDING_LEN: usize = 64;

/// `a_rwnd` value used in INIT/DATA_ACK chunks.
pub const DEFAULT_A_RWND: u32 = 0x19000;
/// `out_streams`/`in_streams` used in INIT chunks.
pub const DEFAULT_STREAM_COUNT: u16 = 100;

/// Fixed key-position advance applied for DATA_ACK sends (§9 open question:
/// the reference implementation advances by a fixed constant regardless of
/// payload size; treated here as an opcode-specific constant rather than a
/// derived value).
pub const DATA_ACK_KEY_POS_ADVANCE: u64 = 29;

/// Channel carrying the protobuf-wire control message exchange (BIG, BANG,
/// STREAMINFO, STREAMINFOACK, HEARTBEAT, DISCONNECT, IDRREQUEST,
/// CONTROLLERCONNECTION).
pub const CONTROL_CHANNEL: u16 = 0;

/// Channel carrying CORRUPTFRAME reports (§8 scenario 3).
pub const CORRUPT_FRAME_CHANNEL: u16 = 2;

/// Fixed size of a congestion-report body: `type + word_0 + received + lost + gmac + key_pos`.
pub const CONGESTION_BODY_LEN: usize = 1 + 2 + 2 + 2 + 4 + 4;

/// `packets_received`/`packets_lost` values forced into every congestion
/// report while sustained-congestion override is enabled (§4.7).
pub const SUSTAINED_CONGESTION_RECEIVED: u16 = 5;
pub const SUSTAINED_CONGESTION_LOST: u16 = 5;
