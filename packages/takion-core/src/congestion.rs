//! Congestion reporting: a ~15Hz drip of received/lost counters drained
//! from the video and audio pipelines, with a sustained-congestion override
//! the emergency recovery supervisor can force on (§4.7).

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, BytesMut};

use crate::crypto::StreamCipher;
use crate::error::CipherError;
use crate::protocol::constants::{
    packet_type, SUSTAINED_CONGESTION_LOST, SUSTAINED_CONGESTION_RECEIVED,
};

/// Builds the periodic congestion-report packet and tracks whether the
/// emergency recovery supervisor has forced the sustained-congestion
/// override on.
///
/// Body layout (15 bytes before encryption; congestion reports carry no
/// encrypted payload, only the sealed header): `type(1) word_0(2)=0
/// packets_received(2,BE) packets_lost(2,BE) gmac(4) key_pos(4,BE)`.
pub struct CongestionController {
    sustained: AtomicBool,
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sustained: AtomicBool::new(false),
        }
    }

    /// Enables the sustained-congestion override. Idempotent.
    pub fn enable_sustained(&self) {
        self.sustained.store(true, Ordering::SeqCst);
    }

    /// Disables the sustained-congestion override. Idempotent.
    pub fn disable_sustained(&self) {
        self.sustained.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_sustained(&self) -> bool {
        self.sustained.load(Ordering::SeqCst)
    }

    /// Builds one congestion report from the pipelines' rolling counters,
    /// overriding with the fixed sustained-congestion values if the
    /// override is active.
    pub fn build_report(
        &self,
        received: u16,
        lost: u16,
        cipher: &StreamCipher,
        key_pos: u64,
    ) -> Result<BytesMut, CipherError> {
        let (received, lost) = if self.is_sustained() {
            (SUSTAINED_CONGESTION_RECEIVED, SUSTAINED_CONGESTION_LOST)
        } else {
            (received, lost)
        };

        let mut buf = BytesMut::with_capacity(15);
        buf.put_u8(packet_type::CONGESTION);
        buf.put_u16(0); // word_0
        buf.put_u16(received);
        buf.put_u16(lost);
        buf.put_u32(0); // gmac placeholder
        buf.put_u32(0); // key_pos placeholder

        let gmac = cipher.gmac_at(&buf, key_pos)?;
        buf[7..11].copy_from_slice(&gmac);
        buf[11..15].copy_from_slice(&(key_pos as u32).to_be_bytes());

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_carries_given_counters_when_not_sustained() {
        let cipher = StreamCipher::new([1u8; 16]).unwrap();
        let controller = CongestionController::new();
        let buf = controller.build_report(12, 3, &cipher, 0).unwrap();
        assert_eq!(buf[0], packet_type::CONGESTION);
        assert_eq!(u16::from_be_bytes([buf[3], buf[4]]), 12);
        assert_eq!(u16::from_be_bytes([buf[5], buf[6]]), 3);
    }

    #[test]
    fn sustained_override_forces_fixed_counters() {
        let cipher = StreamCipher::new([1u8; 16]).unwrap();
        let controller = CongestionController::new();
        controller.enable_sustained();
        let buf = controller.build_report(100, 0, &cipher, 0).unwrap();
        assert_eq!(
            u16::from_be_bytes([buf[3], buf[4]]),
            SUSTAINED_CONGESTION_RECEIVED
        );
        assert_eq!(
            u16::from_be_bytes([buf[5], buf[6]]),
            SUSTAINED_CONGESTION_LOST
        );
    }

    #[test]
    fn disable_clears_the_override() {
        let controller = CongestionController::new();
        controller.enable_sustained();
        controller.disable_sustained();
        assert!(!controller.is_sustained());
    }

    #[test]
    fn gmac_field_verifies() {
        let cipher = StreamCipher::new([2u8; 16]).unwrap();
        let controller = CongestionController::new();
        let mut buf = controller.build_report(5, 1, &cipher, 7).unwrap();
        let received_gmac: [u8; 4] = buf[7..11].try_into().unwrap();
        buf[7..11].copy_from_slice(&[0u8; 4]);
        assert!(cipher.verify_gmac(&buf, 7, received_gmac).is_ok());
    }
}
