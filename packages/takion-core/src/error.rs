//! Centralized error types for the Takion streaming engine.
//!
//! Mirrors the engine's fatal/recoverable split: most failures (parse
//! errors, GMAC mismatches, decrypt failures, reorder drops) are counted and
//! swallowed by the subsystem that hit them, and never reach this type.
//! `TakionError` exists for the small set of failures that must propagate to
//! a caller: handshake refusal, fatal socket errors, and configuration
//! mistakes.

use thiserror::Error;

/// Trait for error types that provide a machine-readable error code.
///
/// Implemented by the engine's leaf error enums so callers building
/// telemetry or structured logs don't have to pattern-match on `Display`
/// strings.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

/// Errors from the AES-GCM stream cipher.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The buffer handed to `decrypt`/`gmac_at` was shorter than the fixed
    /// header region it must contain.
    #[error("buffer too short for cipher operation: got {got}, need at least {need}")]
    BufferTooShort { got: usize, need: usize },

    /// AES-GCM rejected the ciphertext (authentication failure).
    #[error("GMAC/AEAD authentication failed at key_pos {key_pos}")]
    TagMismatch { key_pos: u64 },

    /// The underlying AEAD primitive reported an internal failure
    /// (buffer capacity, invalid key length, etc).
    #[error("AEAD operation failed: {0}")]
    Aead(String),
}

impl ErrorCode for CipherError {
    fn code(&self) -> &'static str {
        match self {
            Self::BufferTooShort { .. } => "cipher_buffer_too_short",
            Self::TagMismatch { .. } => "cipher_tag_mismatch",
            Self::Aead(_) => "cipher_aead_failure",
        }
    }
}

/// Errors parsing an inbound Takion datagram.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram shorter than the 13-byte packet header")]
    TooShortForHeader,
    #[error("chunk length field extends past the end of the datagram")]
    ChunkLengthOverrun,
    #[error("unrecognized chunk type byte")]
    UnknownChunkType,
    #[error("AV packet shorter than the fixed unit header")]
    TooShortForAvHeader,
    #[error("malformed protobuf-wire payload")]
    MalformedWire,
    #[error("required field missing from control message")]
    MissingField,
}

impl ErrorCode for ParseError {
    fn code(&self) -> &'static str {
        match self {
            Self::TooShortForHeader => "parse_short_header",
            Self::ChunkLengthOverrun => "parse_chunk_overrun",
            Self::UnknownChunkType => "parse_unknown_chunk",
            Self::TooShortForAvHeader => "parse_short_av_header",
            Self::MalformedWire => "parse_malformed_wire",
            Self::MissingField => "parse_missing_field",
        }
    }
}

/// Top-level error type for operations that must propagate to the session
/// owner. Recoverable, per-packet failures (parse/GMAC/decrypt/reorder) are
/// never wrapped in this type — they are counted in place and stay local to
/// the subsystem that observed them.
#[derive(Debug, Error)]
pub enum TakionError {
    /// The BIG→BANG handshake did not complete within the retry budget.
    #[error("handshake timed out waiting for BANG after {retries} retries")]
    HandshakeTimeout { retries: u32 },

    /// The peer rejected the protocol version in BANG.
    #[error("peer rejected client version in BANG (version_accepted = false)")]
    VersionRejected,

    /// Failed to bind or use the UDP socket.
    #[error("socket error: {0}")]
    Socket(#[source] std::io::Error),

    /// Cipher construction or a cipher operation failed outside the
    /// per-packet recoverable path (e.g. during key derivation).
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Key agreement with the peer failed or produced an invalid signature.
    #[error("key exchange error: {0}")]
    KeyExchange(String),

    /// Invalid `SessionConfig`.
    #[error("invalid session configuration: {0}")]
    Configuration(String),

    /// The engine was asked to do something that requires a state it
    /// doesn't have yet (e.g. send feedback before the cipher is ready).
    #[error("session not ready: {0}")]
    NotReady(String),

    /// The session was already stopped.
    #[error("session already stopped")]
    AlreadyStopped,
}

impl ErrorCode for TakionError {
    fn code(&self) -> &'static str {
        match self {
            Self::HandshakeTimeout { .. } => "handshake_timeout",
            Self::VersionRejected => "version_rejected",
            Self::Socket(_) => "socket_error",
            Self::Cipher(_) => "cipher_error",
            Self::KeyExchange(_) => "key_exchange_error",
            Self::Configuration(_) => "configuration_error",
            Self::NotReady(_) => "not_ready",
            Self::AlreadyStopped => "already_stopped",
        }
    }
}

impl TakionError {
    /// Whether this error should surface to the session-owner callback
    /// (handshake refusal, fatal socket loss) versus being a condition the
    /// caller can retry or ignore.
    ///
    /// A `TakionError` reaching this point at all means it already cleared
    /// the recoverable per-packet path, so most variants here are fatal by
    /// construction; `NotReady` is the one exception since it's produced by
    /// calls the engine itself queues and later flushes.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NotReady(_))
    }
}

/// Convenient result alias for fallible engine operations.
pub type TakionResult<T> = Result<T, TakionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_timeout_is_fatal() {
        let err = TakionError::HandshakeTimeout { retries: 5 };
        assert!(err.is_fatal());
        assert_eq!(err.code(), "handshake_timeout");
    }

    #[test]
    fn not_ready_is_not_fatal() {
        let err = TakionError::NotReady("cipher unset".into());
        assert!(!err.is_fatal());
    }

    #[test]
    fn cipher_error_codes() {
        assert_eq!(
            CipherError::TagMismatch { key_pos: 0 }.code(),
            "cipher_tag_mismatch"
        );
        assert_eq!(
            CipherError::BufferTooShort { got: 1, need: 2 }.code(),
            "cipher_buffer_too_short"
        );
    }
}
