//! Ingest and per-type (video/audio) pipelines: raw UDP → decrypted
//! `AVPacket` → assembled `ProcessedFrame` (§4.5).

pub mod audio;
pub mod ingest;
pub mod video;

pub use audio::AudioPipeline;
pub use ingest::IngestPipeline;
pub use video::VideoPipeline;

use crate::protocol::av::Codec;

/// A fully assembled frame, stamped with codec and keyframe information,
/// ready for the [`AVReceiver`] trait.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub frame_index: u16,
    pub codec: Codec,
    pub is_keyframe: bool,
    pub bytes: Vec<u8>,
}

/// Downstream media sink the engine drives. Implementations must tolerate
/// concurrent calls from the video and audio pipeline workers.
///
/// The receiver itself (WebRTC re-encoder, HLS muxer, local decoder) is out
/// of scope for this engine; only this interface is specified.
pub trait AvReceiver: Send + Sync {
    /// Called once per profile/audio-header change (initial STREAMINFO, or
    /// a later `adaptive_stream_index` switch).
    fn on_stream_info(&self, video_header_with_padding: &[u8], audio_header: &[u8]);

    /// Called once per assembled video frame.
    fn on_video_frame(&self, bytes: &[u8], is_keyframe: bool, frame_index: u16);

    /// Called once per assembled audio frame.
    fn on_audio_frame(&self, bytes: &[u8], frame_index: u16);

    /// Called when a receiver is (re)attached mid-session, so the engine
    /// knows to prioritize the next keyframe request.
    fn enter_wait_for_idr(&self);
}

/// Diagnostic counters exposed by every pipeline stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineCounters {
    pub received: u64,
    pub processed: u64,
    pub dropped: u64,
    pub complete_frames: u64,
    pub output_queue_depth: usize,
}
