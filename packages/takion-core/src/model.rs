//! Session data model: the immutable facts a [`TakionSession`](crate::session::TakionSession)
//! is constructed from, plus the values the handshake derives along the way.
//!
//! `Session` is produced by whatever registration layer acquired a session
//! token from the console (out of scope for this engine) and is immutable
//! from the engine's point of view; `HandshakeKeys` is filled in as the
//! BIG/BANG exchange proceeds.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Which console generation this session targets.
///
/// Several wire details (feedback packet serialization, STREAMINFO profile
/// count) differ between the two, hence [`FeedbackSerializer`](crate::feedback::FeedbackSerializer)
/// being chosen from this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostType {
    Ps4,
    Ps5,
}

/// Controller model in use, affecting the feedback packet's button/analog
/// layout and haptic capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerType {
    DualShock4,
    DualSense,
}

/// Video codec negotiated for the stream, carried in `AVPacket::codec` and in
/// STREAMINFO profile headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
    Av1,
}

/// Launch-time stream parameters, fixed for the life of the session.
///
/// Persisted/config state handed in by the registration layer; the engine
/// only reads these to build the BIG payload and to size initial pipeline
/// buffers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LaunchOptions {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub codec: VideoCodec,
    pub hdr: bool,
}

/// Process-lifetime state for one connected console, one per session.
///
/// Created by the registration layer that performed out-of-band HTTP
/// registration and session-token acquisition (outside this engine's scope)
/// and handed to [`TakionSession::builder`](crate::session::TakionSession::builder)
/// as an opaque, immutable value.
#[derive(Debug, Clone)]
pub struct Session {
    pub host_type: HostType,
    pub host_endpoint: SocketAddr,
    /// ASCII session identifier assigned by the console during registration.
    pub session_id: String,
    /// 32-byte pre-shared secret used to encrypt the launch spec in BIG.
    pub secret: [u8; 32],
    /// 16-byte session IV paired with `secret`.
    pub session_iv: [u8; 16],
    pub launch_options: LaunchOptions,
    /// RTT measured by the (out-of-scope) Senkusha pre-flight probe, if run.
    pub rtt_us: Option<u32>,
    /// Outbound MTU measured by Senkusha, if run.
    pub mtu_out: Option<u32>,
}

/// Local ECDH key material and the keys it derives during BIG→BANG.
///
/// Consumed once to build the session's [`StreamCipher`](crate::crypto::cipher::StreamCipher);
/// not retained afterward.
#[derive(Clone)]
pub struct HandshakeKeys {
    /// Local ECDH public key bytes, sent in BIG.
    pub public: Vec<u8>,
    /// Signature over the public key, sent in BIG.
    pub signature: Vec<u8>,
    /// Key derived from `(secret, session_iv)`, used to encrypt the launch
    /// spec embedded in BIG.
    pub handshake_key: [u8; 16],
    /// Shared secret negotiated once the peer's ECDH public key and
    /// signature arrive in BANG.
    pub ecdh_secret: Option<[u8; 32]>,
}

impl std::fmt::Debug for HandshakeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeKeys")
            .field("public_len", &self.public.len())
            .field("signature_len", &self.signature.len())
            .field("ecdh_secret_set", &self.ecdh_secret.is_some())
            .finish()
    }
}

/// Snapshot of controller input, supplied by the session owner on every
/// input-poll tick and consumed by [`FeedbackSender`](crate::feedback::FeedbackSender).
///
/// Layout is deliberately host-agnostic; a [`FeedbackSerializer`](crate::feedback::FeedbackSerializer)
/// maps it onto the wire layout the console generation expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerState {
    /// Bitmask of currently held buttons, application-defined bit order.
    pub buttons: u32,
    pub left_stick: (i8, i8),
    pub right_stick: (i8, i8),
    pub left_trigger: u8,
    pub right_trigger: u8,
}

/// Button bits that changed between two consecutive [`ControllerState`]
/// snapshots, computed by `FeedbackSender` itself rather than supplied by
/// the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonTransition {
    /// Bits that went from released to pressed.
    pub pressed: u32,
    /// Bits that went from pressed to released.
    pub released: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        Session {
            host_type: HostType::Ps5,
            host_endpoint: "192.168.1.50:9296".parse().unwrap(),
            session_id: "abc123".to_string(),
            secret: [0u8; 32],
            session_iv: [0u8; 16],
            launch_options: LaunchOptions {
                width: 1920,
                height: 1080,
                fps: 60,
                bitrate_kbps: 15000,
                codec: VideoCodec::H264,
                hdr: false,
            },
            rtt_us: None,
            mtu_out: None,
        }
    }

    #[test]
    fn session_is_cloneable_and_retains_fields() {
        let session = sample_session();
        let cloned = session.clone();
        assert_eq!(cloned.session_id, "abc123");
        assert_eq!(cloned.host_type, HostType::Ps5);
    }

    #[test]
    fn handshake_keys_debug_does_not_leak_secret_material() {
        let keys = HandshakeKeys {
            public: vec![1, 2, 3],
            signature: vec![4, 5, 6],
            handshake_key: [0u8; 16],
            ecdh_secret: Some([9u8; 32]),
        };
        let debug = format!("{:?}", keys);
        assert!(!debug.contains("9, 9, 9"));
        assert!(debug.contains("ecdh_secret_set: true"));
    }
}
