//! Controller feedback: periodic state snapshots plus event-driven button
//! transitions, coalesced to avoid redundant wire traffic (§4.6).
//!
//! Payload layout is host-specific — the [`FeedbackSerializer`] a session
//! uses is chosen from [`HostType`](crate::model::HostType) at construction
//! time, mirroring how [`crate::model::HandshakeKeys`] documents the split.
//! Packet framing (header, gmac, key_pos) stays in
//! [`PacketCodec::build_feedback`](crate::protocol::codec::PacketCodec::build_feedback);
//! this module only produces the inner payload and decides when a send is
//! due.

use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};

use crate::model::{ButtonTransition, ControllerState, HostType};
use crate::protocol::constants::packet_type;

/// Serializes a [`ControllerState`] snapshot or a [`ButtonTransition`] into
/// the host-specific feedback payload bytes.
pub trait FeedbackSerializer: Send + Sync {
    fn encode_state(&self, state: &ControllerState) -> Vec<u8>;
    fn encode_event(&self, transition: ButtonTransition) -> Vec<u8>;
}

/// DualShock 4 / PS4 feedback layout: buttons (u32), two analog sticks and
/// two analog triggers (one byte each) — 10 bytes total.
pub struct Ps4FeedbackSerializer;

impl FeedbackSerializer for Ps4FeedbackSerializer {
    fn encode_state(&self, state: &ControllerState) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u32(state.buttons);
        buf.put_i8(state.left_stick.0);
        buf.put_i8(state.left_stick.1);
        buf.put_i8(state.right_stick.0);
        buf.put_i8(state.right_stick.1);
        buf.put_u8(state.left_trigger);
        buf.put_u8(state.right_trigger);
        buf.to_vec()
    }

    fn encode_event(&self, transition: ButtonTransition) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(transition.pressed);
        buf.put_u32(transition.released);
        buf.to_vec()
    }
}

/// DualSense / PS5 feedback layout: same 10-byte base layout as PS4 plus two
/// reserved bytes for the adaptive-trigger effect acknowledgement channel —
/// 12 bytes total.
pub struct Ps5FeedbackSerializer;

impl FeedbackSerializer for Ps5FeedbackSerializer {
    fn encode_state(&self, state: &ControllerState) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32(state.buttons);
        buf.put_i8(state.left_stick.0);
        buf.put_i8(state.left_stick.1);
        buf.put_i8(state.right_stick.0);
        buf.put_i8(state.right_stick.1);
        buf.put_u8(state.left_trigger);
        buf.put_u8(state.right_trigger);
        buf.put_u16(0); // reserved: adaptive-trigger ack
        buf.to_vec()
    }

    fn encode_event(&self, transition: ButtonTransition) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(transition.pressed);
        buf.put_u32(transition.released);
        buf.to_vec()
    }
}

#[must_use]
pub fn serializer_for(host_type: HostType) -> Box<dyn FeedbackSerializer> {
    match host_type {
        HostType::Ps4 => Box::new(Ps4FeedbackSerializer),
        HostType::Ps5 => Box::new(Ps5FeedbackSerializer),
    }
}

/// Owns the session's feedback sequence number, last-known controller state,
/// and the coalescing decision between event-driven and cadence-driven
/// sends. Does not touch the socket or the cipher itself; the session's
/// send path wraps the payloads this returns with
/// [`PacketCodec::build_feedback`](crate::protocol::codec::PacketCodec::build_feedback)
/// and advances `key_pos` after a successful send.
pub struct FeedbackSender {
    serializer: Box<dyn FeedbackSerializer>,
    sequence: u16,
    state: ControllerState,
    next_state_due: Instant,
}

impl FeedbackSender {
    #[must_use]
    pub fn new(host_type: HostType, state_interval: Duration) -> Self {
        Self {
            serializer: serializer_for(host_type),
            sequence: 0,
            state: ControllerState::default(),
            next_state_due: Instant::now() + state_interval,
        }
    }

    fn next_sequence(&mut self) -> u16 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    /// Updates the tracked controller snapshot and, if the button mask
    /// changed, returns an immediate `FEEDBACK_EVENT` payload — unless the
    /// change is close enough to the next scheduled state send that it will
    /// be captured there anyway (§4.6 coalescing window).
    pub fn update_controller_state(
        &mut self,
        new_state: ControllerState,
        now: Instant,
        coalesce_window: Duration,
    ) -> Option<(u8, u16, Vec<u8>)> {
        let pressed = new_state.buttons & !self.state.buttons;
        let released = self.state.buttons & !new_state.buttons;
        self.state = new_state;

        if pressed == 0 && released == 0 {
            return None;
        }

        if self
            .next_state_due
            .checked_duration_since(now)
            .map_or(true, |remaining| remaining <= coalesce_window)
        {
            // Close enough to the next state tick; let it carry the update.
            return None;
        }

        let transition = ButtonTransition { pressed, released };
        let payload = self.serializer.encode_event(transition);
        let sequence = self.next_sequence();
        Some((packet_type::FEEDBACK_EVENT, sequence, payload))
    }

    /// Called on the state cadence tick. Always produces a payload and
    /// reschedules the next tick.
    pub fn tick_state(&mut self, now: Instant, state_interval: Duration) -> (u8, u16, Vec<u8>) {
        self.next_state_due = now + state_interval;
        let payload = self.serializer.encode_state(&self.state);
        let sequence = self.next_sequence();
        (packet_type::FEEDBACK_STATE, sequence, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::packet_type as wire_packet_type;

    #[test]
    fn sequence_increments_and_wraps() {
        let mut sender = FeedbackSender::new(HostType::Ps5, Duration::from_millis(200));
        sender.next_state_due = Instant::now() - Duration::from_secs(1);
        let (_, first, _) = sender.tick_state(Instant::now(), Duration::from_millis(200));
        let (_, second, _) = sender.tick_state(Instant::now(), Duration::from_millis(200));
        assert_eq!(second, first.wrapping_add(1));
    }

    #[test]
    fn button_transition_emits_immediate_event_far_from_next_tick() {
        let mut sender = FeedbackSender::new(HostType::Ps4, Duration::from_millis(200));
        let now = Instant::now();
        sender.next_state_due = now + Duration::from_millis(200);

        let result = sender.update_controller_state(
            ControllerState {
                buttons: 0x01,
                ..ControllerState::default()
            },
            now,
            Duration::from_millis(16),
        );
        assert!(result.is_some());
        let (packet_type, _, _) = result.unwrap();
        assert_eq!(packet_type, wire_packet_type::FEEDBACK_EVENT);
    }

    #[test]
    fn button_transition_near_next_tick_is_coalesced() {
        let mut sender = FeedbackSender::new(HostType::Ps4, Duration::from_millis(200));
        let now = Instant::now();
        sender.next_state_due = now + Duration::from_millis(5); // inside the 16ms window

        let result = sender.update_controller_state(
            ControllerState {
                buttons: 0x01,
                ..ControllerState::default()
            },
            now,
            Duration::from_millis(16),
        );
        assert!(result.is_none());

        // The state still reflects the new buttons when the cadence fires.
        let (_, _, payload) = sender.tick_state(now, Duration::from_millis(200));
        assert!(!payload.is_empty());
    }

    #[test]
    fn no_transition_when_buttons_unchanged() {
        let mut sender = FeedbackSender::new(HostType::Ps5, Duration::from_millis(200));
        let now = Instant::now();
        sender.next_state_due = now + Duration::from_secs(1);
        assert!(sender
            .update_controller_state(ControllerState::default(), now, Duration::from_millis(16))
            .is_none());
    }

    #[test]
    fn ps4_and_ps5_state_payload_lengths_differ() {
        let ps4 = Ps4FeedbackSerializer.encode_state(&ControllerState::default());
        let ps5 = Ps5FeedbackSerializer.encode_state(&ControllerState::default());
        assert_eq!(ps4.len(), 10);
        assert_eq!(ps5.len(), 12);
    }
}
