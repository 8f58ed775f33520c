//! Per-stream frame assembly from received AV units, with timeout, skip,
//! and corruption-report semantics (§4.4).

use std::time::{Duration, Instant};

use crate::events::{FrameStatus, StreamHealthEvent};
use crate::protocol::av::AvPacket;
use crate::utils::now_millis;

/// A decoded unit's payload slice plus the position it occupies in the
/// frame, tracked densely with holes represented as empty slices.
struct FrameBuildState {
    current_frame_index: u16,
    last_unit_index: Option<u16>,
    received_units: Vec<Vec<u8>>,
    units_in_frame_src: u16,
    missing_units: u32,
    frame_start: Instant,
}

impl FrameBuildState {
    fn new(frame_index: u16, units_in_frame_src: u16) -> Self {
        Self {
            current_frame_index: frame_index,
            last_unit_index: None,
            received_units: Vec::new(),
            units_in_frame_src,
            missing_units: 0,
            frame_start: Instant::now(),
        }
    }
}

/// Outcome of feeding one packet into the assembler.
pub enum AssembleOutcome {
    /// No frame is ready yet.
    Pending,
    /// A frame completed; bytes are the concatenation of its units'
    /// payloads in order.
    Complete {
        frame_index: u16,
        bytes: Vec<u8>,
    },
    /// The previous frame range `[start, end)` was abandoned because a new
    /// frame index arrived without the expected predecessor completing.
    Corrupt { start: u16, end: u16 },
}

/// Assembles fragmented AV units into complete frames. One instance per
/// stream kind (video / audio); video additionally sits behind a
/// [`ReorderQueue`](crate::reorder::ReorderQueue) upstream, audio does not.
pub struct FrameAssembler {
    is_video: bool,
    max_frame_wait: Duration,
    state: Option<FrameBuildState>,
    last_complete_frame_index: Option<u16>,
    last_complete_frame_bytes: Option<Vec<u8>>,
    consecutive_failures: u32,
    received: u64,
    lost: u64,
}

impl FrameAssembler {
    #[must_use]
    pub fn new(is_video: bool, max_frame_wait: Duration) -> Self {
        Self {
            is_video,
            max_frame_wait,
            state: None,
            last_complete_frame_index: None,
            last_complete_frame_bytes: None,
            consecutive_failures: 0,
            received: 0,
            lost: 0,
        }
    }

    /// Rolling received/lost counters fed into [`CongestionController`](crate::congestion::CongestionController).
    #[must_use]
    pub fn drain_counters(&mut self) -> (u64, u64) {
        let out = (self.received, self.lost);
        self.received = 0;
        self.lost = 0;
        out
    }

    /// Feeds one AV unit into assembly, returning the resulting outcome.
    pub fn accept(&mut self, packet: &AvPacket) -> AssembleOutcome {
        self.received += 1;

        let needs_new_frame = match &self.state {
            None => true,
            Some(state) => state.current_frame_index != packet.frame_index,
        };

        let mut corrupt_report = None;

        if needs_new_frame {
            if self.state.take().is_some() {
                let completed_idx = self.last_complete_frame_index;
                let expected_next = completed_idx.map(|i| i.wrapping_add(1));
                if let Some(completed) = completed_idx {
                    if expected_next != Some(packet.frame_index) {
                        corrupt_report = Some((completed.wrapping_add(1), packet.frame_index));
                    }
                }
            }
            self.state = Some(FrameBuildState::new(
                packet.frame_index,
                packet.units_in_frame_src,
            ));
        }

        let state = self.state.as_mut().expect("just ensured present");

        if let Some(last) = state.last_unit_index {
            let expected = last.wrapping_add(1);
            if packet.unit_index != expected {
                let gap = packet.unit_index.wrapping_sub(expected) as usize;
                for _ in 0..gap {
                    state.received_units.push(Vec::new());
                    state.missing_units += 1;
                    self.lost += 1;
                }
            }
        }

        state.received_units.push(packet.data.to_vec());
        state.last_unit_index = Some(packet.unit_index);

        let is_final_marker = if self.is_video {
            packet.is_last_src
        } else {
            packet.is_last
        };

        let complete = is_final_marker
            && state.received_units.len() as u16 >= state.units_in_frame_src;

        if let Some((start, end)) = corrupt_report {
            return AssembleOutcome::Corrupt { start, end };
        }

        if complete {
            let state = self.state.take().expect("present");
            let frame_index = state.current_frame_index;
            let src_count = state.units_in_frame_src as usize;
            let units = if self.is_video {
                &state.received_units[..src_count.min(state.received_units.len())]
            } else {
                &state.received_units[..]
            };
            let bytes: Vec<u8> = units.iter().flat_map(|u| u.iter().copied()).collect();

            self.last_complete_frame_index = Some(frame_index);
            self.last_complete_frame_bytes = Some(bytes.clone());
            self.consecutive_failures = 0;

            return AssembleOutcome::Complete { frame_index, bytes };
        }

        AssembleOutcome::Pending
    }

    /// Checks whether the in-progress frame has exceeded `max_frame_wait`
    /// and, if so, abandons it and produces a health event. Called on a
    /// cadence by the owning pipeline worker.
    pub fn check_timeout(&mut self) -> Option<StreamHealthEvent> {
        let state = self.state.as_ref()?;
        if state.frame_start.elapsed() < self.max_frame_wait {
            return None;
        }

        let state = self.state.take().expect("checked above");
        let frame_index = state.current_frame_index;
        self.consecutive_failures += 1;
        self.lost += 1;

        let (status, reused) = if let Some(bytes) = &self.last_complete_frame_bytes {
            let _ = bytes;
            (FrameStatus::Frozen, true)
        } else {
            (FrameStatus::Dropped, false)
        };

        Some(StreamHealthEvent {
            ts: now_millis(),
            frame_index,
            status,
            consecutive_failures: self.consecutive_failures,
            reused_last_frame: reused,
            recovered_by_fec: false,
            message: format!(
                "frame {} abandoned after {:?}, missing {} units",
                frame_index, self.max_frame_wait, state.missing_units
            ),
        })
    }

    /// Builds a `Success` health event for a completed frame.
    #[must_use]
    pub fn success_event(&self, frame_index: u16, recovered_by_fec: bool) -> StreamHealthEvent {
        StreamHealthEvent {
            ts: now_millis(),
            frame_index,
            status: if recovered_by_fec {
                FrameStatus::Recovered
            } else {
                FrameStatus::Success
            },
            consecutive_failures: 0,
            reused_last_frame: false,
            recovered_by_fec,
            message: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::av::Codec;
    use bytes::Bytes;

    fn packet(frame: u16, unit: u16, src_total: u16, is_last: bool) -> AvPacket {
        AvPacket {
            frame_index: frame,
            unit_index: unit,
            units_in_frame_src: src_total,
            units_in_frame_total: src_total,
            codec: Codec::Video(crate::protocol::av::VideoCodec::H264),
            key_pos: 0,
            is_video: true,
            is_last,
            is_last_src: is_last,
            data_type: 0,
            adaptive_stream_index: 0,
            data: Bytes::from_static(b"unit"),
        }
    }

    #[test]
    fn completes_frame_when_all_units_arrive() {
        let mut assembler = FrameAssembler::new(true, Duration::from_millis(50));
        assert!(matches!(
            assembler.accept(&packet(0, 0, 2, false)),
            AssembleOutcome::Pending
        ));
        match assembler.accept(&packet(0, 1, 2, true)) {
            AssembleOutcome::Complete { frame_index, bytes } => {
                assert_eq!(frame_index, 0);
                assert_eq!(bytes, b"unitunit");
            }
            _ => panic!("expected Complete"),
        }
    }

    #[test]
    fn gap_in_unit_index_is_counted_as_missing() {
        let mut assembler = FrameAssembler::new(true, Duration::from_millis(50));
        assembler.accept(&packet(0, 0, 3, false));
        assembler.accept(&packet(0, 2, 3, true));
        let (_received, lost) = assembler.drain_counters();
        assert_eq!(lost, 1);
    }

    #[test]
    fn skipped_frame_index_emits_corrupt_report() {
        let mut assembler = FrameAssembler::new(true, Duration::from_millis(50));
        assembler.accept(&packet(0, 0, 1, true));
        match assembler.accept(&packet(2, 0, 1, true)) {
            AssembleOutcome::Corrupt { start, end } => {
                assert_eq!(start, 1);
                assert_eq!(end, 2);
            }
            _ => panic!("expected Corrupt"),
        }
    }

    #[test]
    fn timeout_without_prior_frame_reports_dropped() {
        let mut assembler = FrameAssembler::new(true, Duration::from_millis(10));
        assembler.accept(&packet(0, 0, 5, false));
        std::thread::sleep(Duration::from_millis(20));
        let event = assembler.check_timeout().unwrap();
        assert_eq!(event.status, FrameStatus::Dropped);
    }

    #[test]
    fn timeout_with_prior_frame_reports_frozen() {
        let mut assembler = FrameAssembler::new(true, Duration::from_millis(10));
        assembler.accept(&packet(0, 0, 1, true));
        assembler.accept(&packet(1, 0, 5, false));
        std::thread::sleep(Duration::from_millis(20));
        let event = assembler.check_timeout().unwrap();
        assert_eq!(event.status, FrameStatus::Frozen);
        assert!(event.reused_last_frame);
    }
}
