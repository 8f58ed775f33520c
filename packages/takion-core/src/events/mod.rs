//! Event system for engine-to-consumer communication.
//!
//! Consumers of a [`TakionSession`](crate::session::TakionSession) want two
//! different things at once: "push" notifications for things that happen at
//! unpredictable times (a rumble command, a pad LED change, a health
//! transition, a disconnect) and the steady stream of decoded frames handed
//! to the `AVReceiver`. This module covers the former; frames flow through
//! `AVReceiver` directly instead of through the event stream, so the event
//! channel stays low-volume and easy to consume from a UI thread.
//!
//! The actual transport (an mpsc channel, a callback, a platform bridge) is
//! left to the session owner; [`EventEmitter`] only decouples subsystems from
//! that choice.

mod emitter;

pub use emitter::{BroadcastEventEmitter, EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

/// Controller rumble intensities, scaled host-side before being surfaced.
///
/// Mirrors the haptic-intensity codes carried in PAD_INFO control messages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HapticIntensity {
    /// Haptics disabled entirely (code `-1`).
    Off,
    /// Full intensity (`1.0`).
    Full,
    /// Half intensity (`0.5`).
    Medium,
    /// A third intensity (`0.33`).
    Weak,
}

impl HapticIntensity {
    /// Maps a wire haptic-intensity code to the scaling factor applied to
    /// incoming rumble values, or `None` if haptics are disabled.
    #[must_use]
    pub fn scale(self) -> Option<f32> {
        match self {
            Self::Off => None,
            Self::Full => Some(1.0),
            Self::Medium => Some(0.5),
            Self::Weak => Some(0.33),
        }
    }
}

/// A rumble command decoded from a data_type=7 control packet.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RumbleEvent {
    /// Left (strong) motor intensity after host-side scaling, 0-255.
    pub left: u8,
    /// Right (weak) motor intensity after host-side scaling, 0-255.
    pub right: u8,
}

/// Pad metadata decoded from a data_type=9 control packet.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PadInfoEvent {
    /// Player LED colour.
    pub led_color: (u8, u8, u8),
    /// Player index assigned by the console (0-3).
    pub player_index: u8,
    /// Whether the console asked the receiver to reset motion/orientation.
    pub motion_reset: bool,
    /// Haptic intensity to apply to subsequent rumble events.
    pub haptic_intensity: HapticIntensity,
    /// Trigger-effect intensity; `None` disables forwarding of trigger
    /// effect payloads entirely.
    pub trigger_intensity: Option<HapticIntensity>,
}

/// An opaque adaptive-trigger effect payload decoded from a data_type=11
/// control packet, forwarded only while the most recently observed
/// [`PadInfoEvent::trigger_intensity`] is not disabled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEffectsEvent {
    /// Raw adaptive-trigger payload, meaning defined by the controller
    /// firmware rather than this engine.
    pub payload: Vec<u8>,
}

/// Health status of the most recently processed frame for one stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameStatus {
    /// The frame assembled with no losses.
    Success,
    /// The frame had missing units that FEC recovered.
    Recovered,
    /// The frame was incomplete; the previous complete frame was reused.
    Frozen,
    /// The frame was incomplete and no substitute was available.
    Dropped,
}

/// Emitted by a pipeline worker after each frame (or frame timeout) to
/// drive [`EmergencyRecoverySupervisor`](crate::supervisor::EmergencyRecoverySupervisor).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHealthEvent {
    /// Unix timestamp in milliseconds.
    pub ts: u64,
    /// Frame index this event reports on.
    pub frame_index: u16,
    /// Outcome of assembling this frame.
    pub status: FrameStatus,
    /// Consecutive `Frozen`/`Dropped` events observed so far, reset on
    /// `Success`.
    pub consecutive_failures: u32,
    /// Whether the previous complete frame was redelivered in place of this
    /// one.
    pub reused_last_frame: bool,
    /// Whether FEC recovery, rather than a complete delivery, produced this
    /// frame.
    pub recovered_by_fec: bool,
    /// Free-form diagnostic context (missing unit ranges, etc).
    pub message: String,
}

/// Top-level sum of everything a [`TakionSession`](crate::session::TakionSession)
/// pushes to its owner outside of the `AVReceiver` frame path.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EngineEvent {
    /// Controller rumble command from the console.
    Rumble(RumbleEvent),
    /// Pad LED/motion/haptic-scaling update from the console.
    PadInfo(PadInfoEvent),
    /// Adaptive-trigger effect payload, forwarded only while triggers are
    /// not disabled (see [`TriggerEffectsEvent`]).
    TriggerEffects(TriggerEffectsEvent),
    /// Stream health transition (see [`StreamHealthEvent`]).
    Health(StreamHealthEvent),
    /// The peer sent DISCONNECT (or the session detected unrecoverable
    /// silence) outside of an in-progress emergency reconnect.
    Disconnect {
        /// Peer-supplied reason code, if any.
        reason: Option<String>,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

impl From<RumbleEvent> for EngineEvent {
    fn from(event: RumbleEvent) -> Self {
        Self::Rumble(event)
    }
}

impl From<PadInfoEvent> for EngineEvent {
    fn from(event: PadInfoEvent) -> Self {
        Self::PadInfo(event)
    }
}

impl From<TriggerEffectsEvent> for EngineEvent {
    fn from(event: TriggerEffectsEvent) -> Self {
        Self::TriggerEffects(event)
    }
}

impl From<StreamHealthEvent> for EngineEvent {
    fn from(event: StreamHealthEvent) -> Self {
        Self::Health(event)
    }
}
