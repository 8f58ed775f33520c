//! Raw UDP → decrypted `AVPacket`, single writer / single reader (§4.5).

use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::crypto::StreamCipher;
use crate::protocol::av::AvPacket;
use crate::protocol::constants::{packet_type, PACKET_HEADER_LEN};

use super::PipelineCounters;

/// Parses and decrypts `VIDEO`/`AUDIO` envelope packets into `AVPacket`s.
/// Control-typed packets (handshake, feedback acks) are handled directly by
/// the session's receive loop and never reach this pipeline.
pub struct IngestPipeline {
    cipher: Arc<StreamCipher>,
    counters: PipelineCounters,
    parse_errors: u64,
    gmac_mismatches: u64,
}

impl IngestPipeline {
    #[must_use]
    pub fn new(cipher: Arc<StreamCipher>) -> Self {
        Self {
            cipher,
            counters: PipelineCounters::default(),
            parse_errors: 0,
            gmac_mismatches: 0,
        }
    }

    #[must_use]
    pub fn counters(&self) -> PipelineCounters {
        self.counters
    }

    /// Processes one datagram. Parse failures, GMAC mismatches, and decrypt
    /// failures increment counters and return `None` — they never
    /// propagate as errors (§7: lossy failures are swallowed locally).
    pub fn process_datagram(&mut self, mut datagram: Bytes) -> Option<AvPacket> {
        self.counters.received += 1;

        if datagram.remaining() < PACKET_HEADER_LEN {
            self.parse_errors += 1;
            self.counters.dropped += 1;
            return None;
        }

        let header_type = datagram[0];
        if !matches!(header_type, packet_type::VIDEO | packet_type::AUDIO) {
            // Not this pipeline's concern.
            return None;
        }

        let mut header_for_gmac = datagram.clone();
        // Zero the gmac (bytes 5..9) and key_pos (bytes 9..13) fields before
        // recomputing, per §3.
        let mut header_bytes = header_for_gmac.copy_to_bytes(PACKET_HEADER_LEN).to_vec();
        let received_gmac: [u8; 4] = header_bytes[5..9].try_into().expect("slice len 4");
        header_bytes[5..9].fill(0);
        header_bytes[9..13].fill(0);

        let _packet_type = datagram.get_u8();
        let _tag_remote = datagram.get_u32();
        let _gmac = datagram.get_u32();
        let key_pos = u64::from(datagram.get_u32());

        let remainder = datagram;
        let mut full_buffer = header_bytes;
        full_buffer.extend_from_slice(&remainder);

        if self
            .cipher
            .verify_gmac(&full_buffer, key_pos, received_gmac)
            .is_err()
        {
            self.gmac_mismatches += 1;
            self.counters.dropped += 1;
            return None;
        }

        let decrypted = self.cipher.decrypt(&remainder, key_pos);

        match AvPacket::parse(Bytes::from(decrypted)) {
            Ok(packet) => {
                self.counters.processed += 1;
                Some(packet)
            }
            Err(_) => {
                self.parse_errors += 1;
                self.counters.dropped += 1;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_video_datagram(cipher: &StreamCipher, key_pos: u64, unit_payload: &[u8]) -> Bytes {
        use bytes::{BufMut, BytesMut};

        let mut unit = BytesMut::new();
        unit.put_u16(0); // frame_index
        unit.put_u16(0); // unit_index
        unit.put_u16(1); // units_in_frame_src
        unit.put_u16(1); // units_in_frame_total
        unit.put_u8(0x01 | 0x02 | 0x04); // is_video | is_last | is_last_src
        unit.put_u8(0x00); // codec = H264
        unit.put_u32(0); // key_pos (informational, unused by parser)
        unit.put_u8(0); // data_type
        unit.put_slice(unit_payload);

        let encrypted = cipher.encrypt(&unit, key_pos);

        let mut header = vec![packet_type::VIDEO];
        header.extend_from_slice(&0xAAAA_BBBBu32.to_be_bytes()); // tag_remote
        header.extend_from_slice(&[0u8; 4]); // gmac placeholder
        header.extend_from_slice(&(key_pos as u32).to_be_bytes());

        let mut full = header.clone();
        full.extend_from_slice(&encrypted);
        let gmac = cipher.gmac_at(&full, key_pos).unwrap();
        header[5..9].copy_from_slice(&gmac);

        let mut datagram = header;
        datagram.extend_from_slice(&encrypted);
        Bytes::from(datagram)
    }

    #[test]
    fn valid_video_datagram_produces_av_packet() {
        let cipher = Arc::new(StreamCipher::new([5u8; 16]).unwrap());
        let datagram = build_video_datagram(&cipher, 0, b"frame-bytes");
        let mut pipeline = IngestPipeline::new(cipher);

        let packet = pipeline.process_datagram(datagram).unwrap();
        assert_eq!(&packet.data[..], b"frame-bytes");
        assert_eq!(pipeline.counters().processed, 1);
    }

    #[test]
    fn tampered_gmac_is_dropped() {
        let cipher = Arc::new(StreamCipher::new([5u8; 16]).unwrap());
        let mut datagram = build_video_datagram(&cipher, 0, b"frame-bytes").to_vec();
        datagram[5] ^= 0xFF;
        let mut pipeline = IngestPipeline::new(cipher);

        assert!(pipeline.process_datagram(Bytes::from(datagram)).is_none());
        assert_eq!(pipeline.counters().dropped, 1);
    }

    #[test]
    fn control_packets_are_ignored_by_this_pipeline() {
        let cipher = Arc::new(StreamCipher::new([5u8; 16]).unwrap());
        let mut pipeline = IngestPipeline::new(cipher);
        let datagram = Bytes::from(vec![packet_type::CONTROL, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(pipeline.process_datagram(datagram).is_none());
    }
}
