//! Session configuration: tunables for cadences, timeouts, and buffer sizes.
//!
//! Most of the numeric constants in this module are fixed by the Takion wire
//! protocol or by empirically-tuned defaults from the spec this engine
//! implements; they are collected into one validated struct instead of being
//! scattered across subsystems as magic numbers.

use std::time::Duration;

/// Drop strategy used by a [`ReorderQueue`](crate::reorder::ReorderQueue) when
/// it must make room for an incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropStrategy {
    /// Drop the incoming packet, keeping the buffered window intact.
    #[default]
    End,
    /// Drop the oldest slot (which may be a reserved hole or a real item).
    Begin,
}

/// Configuration for a single video or audio [`ReorderQueue`](crate::reorder::ReorderQueue).
#[derive(Debug, Clone, Copy)]
pub struct ReorderConfig {
    /// Initial buffer capacity.
    pub size_start: usize,
    /// Maximum buffer capacity the queue may grow to.
    pub size_max: usize,
    /// Age at which a stalled head slot is force-released by `flush`.
    pub timeout: Duration,
    /// What to drop when the queue is full and the incoming item doesn't fit.
    pub drop_strategy: DropStrategy,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            size_start: 32,
            size_max: 128,
            timeout: Duration::from_millis(50),
            drop_strategy: DropStrategy::End,
        }
    }
}

/// Top-level tunables for a [`TakionSession`](crate::session::TakionSession).
///
/// All fields have sensible defaults drawn from the spec this engine
/// implements; override only what a deployment actually needs to change.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// UDP port the console's Takion stream listens on.
    pub stream_port: u16,

    /// Cadence of the heartbeat echo task. Skipped while the cipher is unset.
    pub heartbeat_interval: Duration,

    /// Cadence of controller-state feedback packets.
    pub feedback_state_interval: Duration,
    /// Coalescing window: a button-transition event arriving within this
    /// many milliseconds of the next state send is folded into it.
    pub feedback_event_coalesce_window: Duration,

    /// Cadence of congestion reports (~15 Hz per spec).
    pub congestion_interval: Duration,

    /// Number of IDR requests sent in the initial post-BANG burst.
    pub idr_burst_count: u32,
    /// Spacing between IDR requests within the initial burst.
    pub idr_burst_interval: Duration,
    /// Steady-state IDR request cadence after the initial burst.
    pub idr_steady_interval: Duration,
    /// Minimum spacing between two `request_keyframe()` calls that actually
    /// hit the wire.
    pub idr_cooldown: Duration,

    /// BIG retry count and spacing before the handshake is declared failed.
    pub big_retry_count: u32,
    pub big_retry_interval: Duration,

    /// Delay after STREAMINFO before the scheduled IDR request fires.
    pub post_streaminfo_idr_delay: Duration,

    /// Maximum time a frame may spend under assembly before it's abandoned.
    pub max_frame_wait: Duration,

    /// Reorder queue sizing/timeout for the video pipeline. Audio has no
    /// reorder queue (fast path), so this only applies to video.
    pub video_reorder: ReorderConfig,

    /// Cadence of the reorder-timeout ticker that calls `flush(false)`.
    pub reorder_flush_interval: Duration,

    /// UDP recv-with-timeout budget for the ingest loop.
    pub recv_timeout: Duration,

    /// Silence threshold after which the stall-check supervisor synthesizes
    /// a `Dropped` health event and kicks the recovery supervisor.
    pub stall_threshold: Duration,
    /// Cadence of the stall-check task.
    pub stall_check_interval: Duration,

    /// Capacity of the bounded channel carrying `ProcessedFrame`s to the
    /// receiver (drop-oldest when full).
    pub output_channel_capacity: usize,
    /// Capacity of the bounded channel carrying raw/decrypted `AVPacket`s
    /// from ingest to the per-type pipelines (drop-write when full).
    pub ingest_channel_capacity: usize,

    /// Size of the duplicate-TSN suppression FIFO.
    pub tsn_dedup_window: usize,

    /// Consecutive-failure thresholds driving the recovery supervisor's
    /// Healthy → DegradedLight → DegradedHeavy transitions.
    pub degraded_light_threshold: u32,
    pub degraded_heavy_threshold: u32,
    /// Consecutive-failure count that forces DegradedHeavy → Reconnecting,
    /// independent of the silence-duration branch below.
    pub reconnect_failure_threshold: u32,
    /// `no_packet_for` threshold that forces DegradedHeavy → Reconnecting
    /// even if the consecutive-failure count hasn't reached
    /// `reconnect_failure_threshold`.
    pub reconnect_silence_threshold: Duration,
    /// Consecutive `Success` events (and minimum elapsed time/frame
    /// progress) required before the supervisor clears degraded state.
    pub recovery_success_threshold: u32,
    pub recovery_min_frame_advance: u16,
    pub recovery_min_elapsed: Duration,

    /// Handshake reconnect timeout/resend cadence used by
    /// `reconnect_takion`.
    pub reconnect_handshake_timeout: Duration,
    pub reconnect_resend_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stream_port: 9296,
            heartbeat_interval: Duration::from_secs(1),
            feedback_state_interval: Duration::from_millis(200),
            feedback_event_coalesce_window: Duration::from_millis(16),
            congestion_interval: Duration::from_millis(66),
            idr_burst_count: 5,
            idr_burst_interval: Duration::from_millis(500),
            idr_steady_interval: Duration::from_secs(2),
            idr_cooldown: Duration::from_secs(1),
            big_retry_count: 5,
            big_retry_interval: Duration::from_secs(1),
            post_streaminfo_idr_delay: Duration::from_millis(250),
            max_frame_wait: Duration::from_millis(50),
            video_reorder: ReorderConfig::default(),
            reorder_flush_interval: Duration::from_millis(10),
            recv_timeout: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(8),
            stall_check_interval: Duration::from_secs(2),
            output_channel_capacity: 512,
            ingest_channel_capacity: 512,
            tsn_dedup_window: 1000,
            degraded_light_threshold: 2,
            degraded_heavy_threshold: 4,
            reconnect_failure_threshold: 8,
            reconnect_silence_threshold: Duration::from_secs(8),
            recovery_success_threshold: 10,
            recovery_min_frame_advance: 3,
            recovery_min_elapsed: Duration::from_secs(2),
            reconnect_handshake_timeout: Duration::from_secs(10),
            reconnect_resend_interval: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    /// Validates invariants that would otherwise surface as confusing panics
    /// or silent misbehavior deep in the engine.
    ///
    /// # Errors
    /// Returns a description of the first violated invariant.
    pub fn validate(&self) -> Result<(), String> {
        if self.video_reorder.size_start == 0 || self.video_reorder.size_max == 0 {
            return Err("reorder queue sizes must be >= 1".to_string());
        }
        if self.video_reorder.size_start > self.video_reorder.size_max {
            return Err("reorder size_start must be <= size_max".to_string());
        }
        if self.output_channel_capacity == 0 || self.ingest_channel_capacity == 0 {
            return Err("channel capacities must be >= 1".to_string());
        }
        if self.tsn_dedup_window == 0 {
            return Err("tsn_dedup_window must be >= 1".to_string());
        }
        if self.degraded_light_threshold == 0 || self.degraded_heavy_threshold == 0 {
            return Err("degraded-state thresholds must be >= 1".to_string());
        }
        if self.degraded_heavy_threshold < self.degraded_light_threshold {
            return Err(
                "degraded_heavy_threshold must be >= degraded_light_threshold".to_string(),
            );
        }
        if self.reconnect_failure_threshold < self.degraded_heavy_threshold {
            return Err(
                "reconnect_failure_threshold must be >= degraded_heavy_threshold".to_string(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_reorder_sizes() {
        let mut config = SessionConfig::default();
        config.video_reorder.size_start = 200;
        config.video_reorder.size_max = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_channel_capacity() {
        let mut config = SessionConfig::default();
        config.output_channel_capacity = 0;
        assert!(config.validate().is_err());
    }
}
