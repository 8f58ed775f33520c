//! Video pipeline: reorder queue + frame assembler → `ProcessedFrame` (§4.5).

use std::time::Duration;

use crate::config::ReorderConfig;
use crate::events::StreamHealthEvent;
use crate::frame::{AssembleOutcome, FrameAssembler};
use crate::protocol::av::AvPacket;
use crate::reorder::ReorderQueue;

use super::{PipelineCounters, ProcessedFrame};

/// Owns the video stream's reorder queue and frame assembler. Packets are
/// reordered by `unit_index` within the current frame (the reorder queue
/// operates on a flat 16-bit sequence derived from `frame_index` and
/// `unit_index`, since both wrap within the same 16-bit space the console
/// uses on the wire).
pub struct VideoPipeline {
    reorder: ReorderQueue<AvPacket>,
    assembler: FrameAssembler,
    counters: PipelineCounters,
}

impl VideoPipeline {
    #[must_use]
    pub fn new(reorder_config: ReorderConfig, max_frame_wait: Duration) -> Self {
        Self {
            reorder: ReorderQueue::new(reorder_config),
            assembler: FrameAssembler::new(true, max_frame_wait),
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

    /// Feeds one decoded AV unit through reorder + assembly.
    ///
    /// The flat sequence number is `unit_index` (which wraps at 16 bits
    /// within a frame) — frame boundaries are tracked by the assembler once
    /// packets are delivered in order by the reorder queue.
    pub fn accept(&mut self, packet: AvPacket) -> Vec<(ProcessedFrame, Option<StreamHealthEvent>)> {
        self.counters.received += 1;
        let seq = packet.unit_index;
        let ready = self.reorder.push(seq, packet);

        let mut output = Vec::new();
        for packet in ready {
            output.extend(self.feed_assembler(packet));
        }
        output
    }

    fn feed_assembler(
        &mut self,
        packet: AvPacket,
    ) -> Vec<(ProcessedFrame, Option<StreamHealthEvent>)> {
        let is_keyframe = packet.is_last_src && packet.unit_index == 0;
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
                        is_keyframe,
                        bytes,
                    },
                    Some(health),
                )]
            }
            AssembleOutcome::Corrupt { .. } | AssembleOutcome::Pending => Vec::new(),
        }
    }

    /// Called on a cadence by the reorder-timeout ticker task: flushes one
    /// stalled reorder slot and checks the assembler's in-progress frame
    /// for timeout.
    pub fn tick(&mut self) -> (Option<AvPacket>, Option<StreamHealthEvent>) {
        let released = self.reorder.flush(false);
        let timeout_event = self.assembler.check_timeout();
        if timeout_event.is_some() {
            self.counters.dropped += 1;
        }
        (released, timeout_event)
    }
}
