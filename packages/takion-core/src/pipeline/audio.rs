//! Audio pipeline: fast path straight into the frame assembler (§4.5).
//!
//! Audio units arrive on a separate envelope `packet_type` and are never
//! reordered — losses show up as gaps in `unit_index`, which the assembler
//! already accounts for via its missing-unit counter.

use std::time::Duration;

use crate::events::StreamHealthEvent;
use crate::frame::{AssembleOutcome, FrameAssembler};
use crate::protocol::av::{AudioCodec, AvPacket, Codec};

use super::{PipelineCounters, ProcessedFrame};

/// Owns the audio stream's frame assembler. The codec is pinned on the
/// first packet seen and never expected to change mid-session.
pub struct AudioPipeline {
    assembler: FrameAssembler,
    codec: Option<AudioCodec>,
    counters: PipelineCounters,
}

impl AudioPipeline {
    #[must_use]
    pub fn new(max_frame_wait: Duration) -> Self {
        Self {
            assembler: FrameAssembler::new(false, max_frame_wait),
            codec: None,
            counters: PipelineCounters::default(),
        }
    }

    #[must_use]
    pub fn counters(&self) -> PipelineCounters {
        self.counters
    }

    /// Drains the rolling received/lost counters for the congestion
    /// controller.
    pub fn drain_health_counters(&mut self) -> (u64, u64) {
        self.assembler.drain_counters()
    }

    /// Feeds one decoded AV unit directly into assembly, no reorder stage.
    pub fn accept(&mut self, packet: AvPacket) -> Vec<(ProcessedFrame, Option<StreamHealthEvent>)> {
        self.counters.received += 1;

        if self.codec.is_none() {
            if let Codec::Audio(codec) = packet.codec {
                self.codec = Some(codec);
            }
        }

        let codec = packet.codec;
        match self.assembler.accept(&packet) {
            AssembleOutcome::Complete { frame_index, bytes } => {
                self.counters.complete_frames += 1;
                self.counters.processed += 1;
                let health = self.assembler.success_event(frame_index, false);
                vec![(
                    ProcessedFrame {
                        frame_index,
                        codec,
                        is_keyframe: false,
                        bytes,
                    },
                    Some(health),
                )]
            }
            AssembleOutcome::Corrupt { .. } | AssembleOutcome::Pending => Vec::new(),
        }
    }

    /// Called on a cadence by the owning worker task to detect stalled
    /// in-progress frames (no reorder queue to flush, unlike video).
    pub fn tick(&mut self) -> Option<StreamHealthEvent> {
        let event = self.assembler.check_timeout();
        if event.is_some() {
            self.counters.dropped += 1;
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet(unit: u16, src_total: u16, is_last: bool, codec_byte: u8) -> AvPacket {
        AvPacket {
            frame_index: 0,
            unit_index: unit,
            units_in_frame_src: src_total,
            units_in_frame_total: src_total,
            codec: Codec::Audio(if codec_byte <= 0x02 {
                AudioCodec::Opus
            } else {
                AudioCodec::Aac
            }),
            key_pos: 0,
            is_video: false,
            is_last,
            is_last_src: is_last,
            data_type: 0,
            adaptive_stream_index: 0,
            data: Bytes::from_static(b"a"),
        }
    }

    #[test]
    fn completes_frame_without_reordering() {
        let mut pipeline = AudioPipeline::new(Duration::from_millis(50));
        assert!(pipeline.accept(packet(0, 2, false, 0x01)).is_empty());
        let output = pipeline.accept(packet(1, 2, true, 0x01));
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].0.bytes, b"aa");
        assert!(!output[0].0.is_keyframe);
    }

    #[test]
    fn codec_is_pinned_from_first_packet() {
        let mut pipeline = AudioPipeline::new(Duration::from_millis(50));
        pipeline.accept(packet(0, 1, true, 0x01));
        assert_eq!(pipeline.codec, Some(AudioCodec::Opus));
    }

    #[test]
    fn stalled_frame_is_reported_on_tick() {
        let mut pipeline = AudioPipeline::new(Duration::from_millis(10));
        pipeline.accept(packet(0, 5, false, 0x03));
        std::thread::sleep(Duration::from_millis(20));
        let event = pipeline.tick().unwrap();
        assert_eq!(pipeline.counters().dropped, 1);
        let _ = event;
    }
}
