//! Emergency recovery supervisor: a small state machine driven by
//! [`StreamHealthEvent`]s that decides when to request a keyframe, force
//! sustained congestion, report a corrupt frame range, or give up and
//! reconnect the whole Takion session (§4.9).
//!
//! Deliberately side-effect free: `observe_health`/`check_silence`/
//! `notify_handshake_complete` return the actions the caller (the session's
//! own task loop) must carry out, rather than holding a callback into the
//! session. Keeps this module testable without a socket or a cipher in
//! sight, and avoids a supervisor → session → supervisor reference cycle.

use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::events::{FrameStatus, StreamHealthEvent};

/// Supervisor's view of stream health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Healthy,
    DegradedLight,
    DegradedHeavy,
    Reconnecting,
}

/// An action the session must perform in response to a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    RequestKeyframe,
    SendCorruptFrame { start: u16, end: u16 },
    EnableSustainedCongestion,
    DisableSustainedCongestion,
    ResetStreamState,
    ReconnectTakion,
}

pub struct EmergencyRecoverySupervisor {
    state: RecoveryState,
    consecutive_failures: u32,
    consecutive_success: u32,
    degraded_entered_frame: Option<u16>,
    last_fallback_time: Option<Instant>,

    degraded_light_threshold: u32,
    degraded_heavy_threshold: u32,
    reconnect_failure_threshold: u32,
    recovery_success_threshold: u32,
    recovery_min_frame_advance: u16,
    recovery_min_elapsed: Duration,
}

impl EmergencyRecoverySupervisor {
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: RecoveryState::Healthy,
            consecutive_failures: 0,
            consecutive_success: 0,
            degraded_entered_frame: None,
            last_fallback_time: None,
            degraded_light_threshold: config.degraded_light_threshold,
            degraded_heavy_threshold: config.degraded_heavy_threshold,
            reconnect_failure_threshold: config.reconnect_failure_threshold,
            recovery_success_threshold: config.recovery_success_threshold,
            recovery_min_frame_advance: config.recovery_min_frame_advance,
            recovery_min_elapsed: config.recovery_min_elapsed,
        }
    }

    #[must_use]
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Feeds one health event from a pipeline worker, returning whatever
    /// recovery actions the session must now perform.
    pub fn observe_health(&mut self, event: &StreamHealthEvent) -> Vec<RecoveryAction> {
        match event.status {
            FrameStatus::Success | FrameStatus::Recovered => self.observe_success(event),
            FrameStatus::Frozen | FrameStatus::Dropped => self.observe_failure(event),
        }
    }

    fn observe_success(&mut self, event: &StreamHealthEvent) -> Vec<RecoveryAction> {
        self.consecutive_success += 1;
        self.consecutive_failures = 0;

        if self.state == RecoveryState::Healthy || self.state == RecoveryState::Reconnecting {
            return Vec::new();
        }

        let frame_advanced = self
            .degraded_entered_frame
            .map_or(true, |entered| event.frame_index.wrapping_sub(entered) >= self.recovery_min_frame_advance);
        let elapsed_ok = self
            .last_fallback_time
            .map_or(true, |t| t.elapsed() >= self.recovery_min_elapsed);

        if self.consecutive_success >= self.recovery_success_threshold && frame_advanced && elapsed_ok {
            self.state = RecoveryState::Healthy;
            self.consecutive_failures = 0;
            self.degraded_entered_frame = None;
            vec![RecoveryAction::DisableSustainedCongestion]
        } else {
            Vec::new()
        }
    }

    fn observe_failure(&mut self, event: &StreamHealthEvent) -> Vec<RecoveryAction> {
        self.consecutive_success = 0;
        self.consecutive_failures = event.consecutive_failures.max(self.consecutive_failures + 1);

        let mut actions = Vec::new();

        match self.state {
            RecoveryState::Healthy => {
                if self.consecutive_failures >= self.degraded_light_threshold {
                    self.state = RecoveryState::DegradedLight;
                    self.degraded_entered_frame = Some(event.frame_index);
                    self.last_fallback_time = Some(Instant::now());
                    actions.push(RecoveryAction::RequestKeyframe);
                    actions.push(RecoveryAction::EnableSustainedCongestion);
                }
            }
            RecoveryState::DegradedLight => {
                if self.consecutive_failures >= self.degraded_heavy_threshold {
                    let start = self
                        .degraded_entered_frame
                        .map(|f| f.wrapping_add(1))
                        .unwrap_or(event.frame_index);
                    self.state = RecoveryState::DegradedHeavy;
                    actions.push(RecoveryAction::SendCorruptFrame {
                        start,
                        end: event.frame_index,
                    });
                    actions.push(RecoveryAction::RequestKeyframe);
                }
            }
            RecoveryState::DegradedHeavy => {
                if self.consecutive_failures >= self.reconnect_failure_threshold {
                    self.state = RecoveryState::Reconnecting;
                    actions.push(RecoveryAction::ResetStreamState);
                    actions.push(RecoveryAction::ReconnectTakion);
                }
            }
            RecoveryState::Reconnecting => {}
        }

        actions
    }

    /// Called by the stall-check task with the elapsed time since the last
    /// packet of any kind was received. Independent of the failure-count
    /// branch above: long silence forces reconnection even mid-DegradedLight.
    pub fn check_silence(&mut self, no_packet_for: Duration, threshold: Duration) -> Vec<RecoveryAction> {
        if no_packet_for <= threshold || self.state == RecoveryState::Reconnecting {
            return Vec::new();
        }
        self.state = RecoveryState::Reconnecting;
        vec![RecoveryAction::ResetStreamState, RecoveryAction::ReconnectTakion]
    }

    /// Called once the reconnect handshake completes successfully.
    pub fn notify_handshake_complete(&mut self) -> Vec<RecoveryAction> {
        if self.state != RecoveryState::Reconnecting {
            return Vec::new();
        }
        self.state = RecoveryState::Healthy;
        self.consecutive_failures = 0;
        self.consecutive_success = 0;
        self.degraded_entered_frame = None;
        vec![RecoveryAction::RequestKeyframe]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_millis;

    fn failure_event(frame_index: u16, consecutive_failures: u32) -> StreamHealthEvent {
        StreamHealthEvent {
            ts: now_millis(),
            frame_index,
            status: FrameStatus::Dropped,
            consecutive_failures,
            reused_last_frame: false,
            recovered_by_fec: false,
            message: String::new(),
        }
    }

    fn success_event(frame_index: u16) -> StreamHealthEvent {
        StreamHealthEvent {
            ts: now_millis(),
            frame_index,
            status: FrameStatus::Success,
            consecutive_failures: 0,
            reused_last_frame: false,
            recovered_by_fec: false,
            message: String::new(),
        }
    }

    #[test]
    fn two_consecutive_failures_enter_degraded_light() {
        let config = SessionConfig::default();
        let mut supervisor = EmergencyRecoverySupervisor::new(&config);
        supervisor.observe_health(&failure_event(0, 1));
        let actions = supervisor.observe_health(&failure_event(1, 2));
        assert_eq!(supervisor.state(), RecoveryState::DegradedLight);
        assert!(actions.contains(&RecoveryAction::RequestKeyframe));
        assert!(actions.contains(&RecoveryAction::EnableSustainedCongestion));
    }

    #[test]
    fn four_consecutive_timeouts_reach_degraded_heavy_with_corrupt_frame() {
        let config = SessionConfig::default();
        let mut supervisor = EmergencyRecoverySupervisor::new(&config);
        supervisor.observe_health(&failure_event(0, 1));
        supervisor.observe_health(&failure_event(1, 2));
        supervisor.observe_health(&failure_event(2, 3));
        let actions = supervisor.observe_health(&failure_event(3, 4));
        assert_eq!(supervisor.state(), RecoveryState::DegradedHeavy);
        assert!(actions
            .iter()
            .any(|a| matches!(a, RecoveryAction::SendCorruptFrame { .. })));
    }

    #[test]
    fn sustained_failures_force_reconnect() {
        let config = SessionConfig::default();
        let mut supervisor = EmergencyRecoverySupervisor::new(&config);
        for i in 0..config.reconnect_failure_threshold {
            supervisor.observe_health(&failure_event(i as u16, i + 1));
        }
        assert_eq!(supervisor.state(), RecoveryState::Reconnecting);
    }

    #[test]
    fn silence_forces_reconnect_independent_of_failure_count() {
        let config = SessionConfig::default();
        let mut supervisor = EmergencyRecoverySupervisor::new(&config);
        let actions = supervisor.check_silence(Duration::from_secs(9), Duration::from_secs(8));
        assert_eq!(supervisor.state(), RecoveryState::Reconnecting);
        assert!(actions.contains(&RecoveryAction::ReconnectTakion));
    }

    #[test]
    fn handshake_complete_clears_reconnecting_and_requests_keyframe() {
        let config = SessionConfig::default();
        let mut supervisor = EmergencyRecoverySupervisor::new(&config);
        supervisor.check_silence(Duration::from_secs(9), Duration::from_secs(8));
        let actions = supervisor.notify_handshake_complete();
        assert_eq!(supervisor.state(), RecoveryState::Healthy);
        assert_eq!(actions, vec![RecoveryAction::RequestKeyframe]);
    }

    #[test]
    fn recovery_requires_success_streak_and_frame_and_time_progress() {
        let config = SessionConfig::default();
        let mut supervisor = EmergencyRecoverySupervisor::new(&config);
        supervisor.observe_health(&failure_event(0, 1));
        supervisor.observe_health(&failure_event(1, 2));
        assert_eq!(supervisor.state(), RecoveryState::DegradedLight);

        // Not enough successes yet.
        for i in 0..config.recovery_success_threshold - 1 {
            supervisor.observe_health(&success_event(2 + i as u16));
        }
        assert_eq!(supervisor.state(), RecoveryState::DegradedLight);
    }
}
