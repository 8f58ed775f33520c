//! Adaptive video profile tracking (§4.8).
//!
//! The console may encode the same stream at several resolutions/bitrates
//! ("profiles") and switch between them mid-session without a fresh
//! STREAMINFO exchange, signalling the active profile per-unit via
//! [`AvPacket::adaptive_stream_index`](crate::protocol::av::AvPacket). This
//! module tracks the advertised profile list and detects switches so the
//! session can re-init its decoder headers.

use crate::protocol::constants::VIDEO_HEADER_PADDING_LEN;
use crate::protocol::messages::StreamInfoProfile;

/// One video profile advertised in STREAMINFO, with the fixed padding
/// suffix decoders expect appended once, at registration time.
#[derive(Debug, Clone)]
pub struct Profile {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// `video_header` with [`VIDEO_HEADER_PADDING_LEN`] zero bytes appended.
    pub video_header_with_padding: Vec<u8>,
}

/// Tracks the profile list STREAMINFO advertised and the currently active
/// one, switching on `observe()` when an incoming unit names a different
/// profile than the one in effect.
#[derive(Debug, Default)]
pub struct AdaptiveStreamManager {
    profiles: Vec<Profile>,
    current_index: Option<usize>,
}

impl AdaptiveStreamManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the profile list from a freshly decoded STREAMINFO. Resets
    /// the active profile to index 0 if one wasn't already selected.
    pub fn set_profiles(&mut self, resolutions: &[StreamInfoProfile]) {
        self.profiles = resolutions
            .iter()
            .enumerate()
            .map(|(index, profile)| {
                let mut video_header_with_padding = profile.video_header.clone();
                video_header_with_padding.extend(std::iter::repeat(0u8).take(VIDEO_HEADER_PADDING_LEN));
                Profile {
                    index,
                    width: profile.width,
                    height: profile.height,
                    video_header_with_padding,
                }
            })
            .collect();

        if self.current_index.map_or(true, |i| i >= self.profiles.len()) {
            self.current_index = if self.profiles.is_empty() { None } else { Some(0) };
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<&Profile> {
        self.current_index.and_then(|i| self.profiles.get(i))
    }

    /// Called per incoming AV unit. Returns `Some(profile)` only when the
    /// unit names a profile different from the one currently active, so the
    /// caller knows to re-init its decoder with the new header.
    pub fn observe(&mut self, adaptive_stream_index: u8) -> Option<&Profile> {
        let index = adaptive_stream_index as usize;
        if index >= self.profiles.len() || Some(index) == self.current_index {
            return None;
        }
        self.current_index = Some(index);
        self.profiles.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles() -> Vec<StreamInfoProfile> {
        vec![
            StreamInfoProfile {
                width: 1920,
                height: 1080,
                video_header: vec![0xAA; 4],
            },
            StreamInfoProfile {
                width: 1280,
                height: 720,
                video_header: vec![0xBB; 4],
            },
        ]
    }

    #[test]
    fn set_profiles_selects_the_first_by_default() {
        let mut manager = AdaptiveStreamManager::new();
        manager.set_profiles(&profiles());
        assert_eq!(manager.current().unwrap().width, 1920);
    }

    #[test]
    fn video_header_carries_the_fixed_padding_suffix() {
        let mut manager = AdaptiveStreamManager::new();
        manager.set_profiles(&profiles());
        let header = &manager.current().unwrap().video_header_with_padding;
        assert_eq!(header.len(), 4 + VIDEO_HEADER_PADDING_LEN);
        assert!(header[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn observe_reports_only_on_profile_change() {
        let mut manager = AdaptiveStreamManager::new();
        manager.set_profiles(&profiles());
        assert!(manager.observe(0).is_none()); // already active
        let switched = manager.observe(1).unwrap();
        assert_eq!(switched.width, 1280);
        assert!(manager.observe(1).is_none()); // no further change
    }

    #[test]
    fn observe_ignores_out_of_range_index() {
        let mut manager = AdaptiveStreamManager::new();
        manager.set_profiles(&profiles());
        assert!(manager.observe(9).is_none());
    }
}
