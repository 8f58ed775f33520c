//! Bit-exact framing of the packet envelope, control chunks, and feedback
//! packets (§3, §4.2).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::StreamCipher;
use crate::error::ParseError;

use super::constants::{
    chunk_type, packet_type, CHUNK_HEADER_LEN, DATA_PREFIX_LEN, DEFAULT_A_RWND,
    DEFAULT_STREAM_COUNT, FEEDBACK_HEADER_LEN, PACKET_HEADER_LEN,
};

/// A parsed inbound packet, dispatched by `chunk_type`/`type` as appropriate.
#[derive(Debug, Clone)]
pub enum Packet {
    InitAck {
        tag: u32,
        init_tsn: u32,
        cookie: Vec<u8>,
    },
    CookieAck,
    Data {
        tsn: u32,
        channel: u16,
        data: Bytes,
        /// Header `gmac` field as received, for the caller to verify once it
        /// knows whether a cipher is in effect yet (handshake DATA chunks
        /// carry an all-zero header; see `build_data_unsealed`).
        gmac: [u8; 4],
        /// Header `key_pos` field as received. Receivers always use this
        /// value rather than a locally tracked counter.
        key_pos: u64,
        /// The full envelope with the `gmac`/`key_pos` header fields zeroed,
        /// ready to pass straight to `StreamCipher::verify_gmac`.
        header_for_gmac: Bytes,
    },
    DataAck {
        ack_tsn: u32,
        gap_ack_blocks: Vec<(u16, u16)>,
        dup_tsns: Vec<u32>,
    },
}

/// Framing for control/data chunks and feedback packets.
pub struct PacketCodec;

impl PacketCodec {
    /// Writes the fixed 13-byte packet envelope header.
    fn write_header(buf: &mut BytesMut, packet_type: u8, tag_remote: u32) {
        buf.put_u8(packet_type);
        buf.put_u32(tag_remote);
        buf.put_u32(0); // gmac placeholder, patched in by `seal`
        buf.put_u32(0); // key_pos placeholder, patched in by `seal`
    }

    /// Patches the `gmac` and `key_pos` header fields in place once the
    /// chunk/payload bytes that follow are final, computing the GMAC over
    /// the whole buffer with both fields zeroed per §3.
    fn seal(buf: &mut BytesMut, cipher: &StreamCipher, key_pos: u64) -> Result<(), crate::error::CipherError> {
        let gmac = cipher.gmac_at(buf, key_pos)?;
        buf[5..9].copy_from_slice(&gmac);
        buf[9..13].copy_from_slice(&(key_pos as u32).to_be_bytes());
        Ok(())
    }

    /// `build_init(tag_local, init_tsn)`: INIT control chunk. Sent before any
    /// cipher exists, so the header's gmac/key_pos fields stay zero.
    #[must_use]
    pub fn build_init(tag_local: u32, init_tsn: u32) -> BytesMut {
        let mut payload = BytesMut::new();
        payload.put_u32(tag_local);
        payload.put_u32(DEFAULT_A_RWND);
        payload.put_u16(DEFAULT_STREAM_COUNT);
        payload.put_u16(DEFAULT_STREAM_COUNT);
        payload.put_u32(init_tsn);

        Self::build_control_chunk(0, chunk_type::INIT, &payload)
    }

    /// `build_cookie(tag_local, tag_remote, cookie_data)`: COOKIE control
    /// chunk, with `tag_remote` already known from INIT_ACK. Still
    /// unencrypted at this handshake stage.
    #[must_use]
    pub fn build_cookie(tag_local: u32, tag_remote: u32, cookie_data: &[u8]) -> BytesMut {
        let mut payload = BytesMut::new();
        payload.put_u32(tag_local);
        payload.put_slice(cookie_data);

        Self::build_control_chunk(tag_remote, chunk_type::COOKIE, &payload)
    }

    fn build_control_chunk(tag_remote: u32, chunk: u8, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + CHUNK_HEADER_LEN + payload.len());
        Self::write_header(&mut buf, packet_type::CONTROL, tag_remote);
        buf.put_u8(chunk);
        buf.put_u8(0); // flag
        buf.put_u16((CHUNK_HEADER_LEN + payload.len()) as u16);
        buf.put_slice(payload);
        buf
    }

    /// `build_data(tsn, channel, flag, payload)`: DATA chunk carrying an
    /// already-encrypted payload (the caller encrypts via [`StreamCipher::encrypt`]
    /// before calling this), sealed with a fresh GMAC.
    pub fn build_data(
        tag_remote: u32,
        tsn: u32,
        channel: u16,
        flag: u8,
        encrypted_payload: &[u8],
        cipher: &StreamCipher,
        key_pos: u64,
    ) -> Result<BytesMut, crate::error::CipherError> {
        let mut chunk_payload =
            BytesMut::with_capacity(DATA_PREFIX_LEN + encrypted_payload.len());
        chunk_payload.put_u32(tsn);
        chunk_payload.put_u16(channel);
        chunk_payload.put_slice(&[0u8; 3]);
        chunk_payload.put_slice(encrypted_payload);

        let mut buf = BytesMut::with_capacity(
            PACKET_HEADER_LEN + CHUNK_HEADER_LEN + chunk_payload.len(),
        );
        Self::write_header(&mut buf, packet_type::CONTROL, tag_remote);
        buf.put_u8(chunk_type::DATA);
        buf.put_u8(flag);
        buf.put_u16((CHUNK_HEADER_LEN + chunk_payload.len()) as u16);
        buf.put_slice(&chunk_payload);

        Self::seal(&mut buf, cipher, key_pos)?;
        Ok(buf)
    }

    /// `build_data_unsealed(tsn, channel, flag, payload)`: a DATA chunk with
    /// its header gmac/key_pos left zero, for the BIG message — the one
    /// DATA chunk sent before a session cipher exists to seal anything with.
    #[must_use]
    pub fn build_data_unsealed(
        tag_remote: u32,
        tsn: u32,
        channel: u16,
        flag: u8,
        payload: &[u8],
    ) -> BytesMut {
        let mut chunk_payload = BytesMut::with_capacity(DATA_PREFIX_LEN + payload.len());
        chunk_payload.put_u32(tsn);
        chunk_payload.put_u16(channel);
        chunk_payload.put_slice(&[0u8; 3]);
        chunk_payload.put_slice(payload);

        Self::build_control_chunk(tag_remote, chunk_type::DATA, &chunk_payload)
    }

    /// `build_data_ack(ack_tsn)`: `(ack_tsn, a_rwnd, 0, 0)`, never encrypted
    /// — DATA_ACKs advance `key_pos` by a fixed constant rather than a
    /// derived payload length (§9 open question).
    #[must_use]
    pub fn build_data_ack(tag_remote: u32, ack_tsn: u32) -> BytesMut {
        let mut payload = BytesMut::new();
        payload.put_u32(ack_tsn);
        payload.put_u32(DEFAULT_A_RWND);
        payload.put_u32(0); // gap_ack_blocks count
        payload.put_u32(0); // dup_tsns count

        Self::build_control_chunk(tag_remote, chunk_type::DATA_ACK, &payload)
    }

    /// `build_feedback(type, sequence, payload, cipher)`: feedback-packet
    /// header + encrypted payload. The caller is responsible for advancing
    /// `cipher`'s `key_pos` by `payload.len()` after a successful send.
    pub fn build_feedback(
        feedback_type: u8,
        sequence: u16,
        payload: &[u8],
        cipher: &StreamCipher,
        key_pos: u64,
    ) -> Result<BytesMut, crate::error::CipherError> {
        let encrypted = cipher.encrypt(payload, key_pos);

        let mut buf = BytesMut::with_capacity(FEEDBACK_HEADER_LEN + encrypted.len());
        buf.put_u8(feedback_type);
        buf.put_u16(sequence);
        buf.put_u8(0); // pad
        buf.put_u32(key_pos as u32);
        buf.put_u32(0); // gmac placeholder, patched in below
        buf.put_slice(&encrypted);

        // §4.2: GMAC is computed with only the gmac field zeroed; key_pos is
        // already written above and stays part of the authenticated header.
        let gmac = cipher.gmac_at(&buf, key_pos)?;
        buf[8..12].copy_from_slice(&gmac);

        Ok(buf)
    }

    /// `parse(bytes)`: dispatches on the chunk type byte (offset 13) for
    /// control packets.
    pub fn parse(mut buf: Bytes) -> Result<Packet, ParseError> {
        if buf.remaining() < PACKET_HEADER_LEN + 2 {
            return Err(ParseError::TooShortForHeader);
        }

        let original = buf.clone();

        let _packet_type = buf.get_u8();
        let _tag_remote = buf.get_u32();
        let gmac = buf.get_u32();
        let key_pos = u64::from(buf.get_u32());

        let chunk = buf.get_u8();
        let _flag = buf.get_u8();
        let length = buf.get_u16() as usize;
        if length < CHUNK_HEADER_LEN {
            return Err(ParseError::ChunkLengthOverrun);
        }
        let payload_len = length - CHUNK_HEADER_LEN;
        if buf.remaining() < payload_len {
            return Err(ParseError::ChunkLengthOverrun);
        }

        match chunk {
            chunk_type::INIT_ACK => {
                if buf.remaining() < 8 {
                    return Err(ParseError::ChunkLengthOverrun);
                }
                let tag = buf.get_u32();
                let init_tsn = buf.get_u32();
                let cookie = buf.copy_to_bytes(buf.remaining()).to_vec();
                Ok(Packet::InitAck {
                    tag,
                    init_tsn,
                    cookie,
                })
            }
            chunk_type::COOKIE_ACK => Ok(Packet::CookieAck),
            chunk_type::DATA => {
                if buf.remaining() < DATA_PREFIX_LEN {
                    return Err(ParseError::ChunkLengthOverrun);
                }
                let tsn = buf.get_u32();
                let channel = buf.get_u16();
                buf.advance(3);
                let data = buf.copy_to_bytes(buf.remaining());

                let mut zeroed = original.to_vec();
                zeroed[5..9].fill(0);
                zeroed[9..13].fill(0);

                Ok(Packet::Data {
                    tsn,
                    channel,
                    data,
                    gmac: gmac.to_be_bytes(),
                    key_pos,
                    header_for_gmac: Bytes::from(zeroed),
                })
            }
            chunk_type::DATA_ACK => {
                if buf.remaining() < 12 {
                    return Err(ParseError::ChunkLengthOverrun);
                }
                let ack_tsn = buf.get_u32();
                let _a_rwnd = buf.get_u32();
                let gap_count = buf.get_u16();
                let _reserved = buf.get_u16();
                let mut gap_ack_blocks = Vec::with_capacity(gap_count as usize);
                for _ in 0..gap_count {
                    if buf.remaining() < 4 {
                        return Err(ParseError::ChunkLengthOverrun);
                    }
                    gap_ack_blocks.push((buf.get_u16(), buf.get_u16()));
                }
                let mut dup_tsns = Vec::new();
                while buf.remaining() >= 4 {
                    dup_tsns.push(buf.get_u32());
                }
                Ok(Packet::DataAck {
                    ack_tsn,
                    gap_ack_blocks,
                    dup_tsns,
                })
            }
            _ => Err(ParseError::UnknownChunkType),
        }
    }
}
