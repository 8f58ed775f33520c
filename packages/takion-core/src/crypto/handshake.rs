//! ECDH key agreement for the BIG/BANG handshake step.
//!
//! The actual primitives (ECDH, AES-GCM) are out of scope per this engine's
//! non-goals; what lives here is the small amount of glue that turns a
//! local keypair plus the peer's public key into the 32-byte shared secret
//! `HandshakeKeys::ecdh_secret` that seeds the session's [`StreamCipher`](super::cipher::StreamCipher).

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand_core::OsRng;

use crate::error::TakionError;
use crate::model::HandshakeKeys;

/// Generates a fresh local ECDH keypair for the handshake.
///
/// `signature` is left empty here: signing the public key is performed by
/// the session-token registration layer (out of scope), which holds the
/// console-issued signing material; this engine only carries the bytes it's
/// given in the BIG payload.
pub fn generate_handshake_keys(handshake_key: [u8; 16]) -> (EphemeralSecret, HandshakeKeys) {
    let secret = EphemeralSecret::random(&mut OsRng);
    let public = PublicKey::from(&secret);
    let public_bytes = public.to_encoded_point(false).as_bytes().to_vec();

    let keys = HandshakeKeys {
        public: public_bytes,
        signature: Vec::new(),
        handshake_key,
        ecdh_secret: None,
    };

    (secret, keys)
}

/// Derives the shared secret once the peer's public key arrives in BANG.
///
/// Signature verification over `peer_ecdh_sig` is performed by the caller
/// using console-specific verification material before this is called;
/// `peer_public` here is already trusted.
pub fn derive_shared_secret(
    local_secret: &EphemeralSecret,
    peer_public: &[u8],
) -> Result<[u8; 32], TakionError> {
    let peer_point = PublicKey::from_sec1_bytes(peer_public)
        .map_err(|e| TakionError::KeyExchange(format!("invalid peer public key: {e}")))?;

    let shared = local_secret.diffie_hellman(&peer_point);
    let bytes = shared.raw_secret_bytes();

    let mut out = [0u8; 32];
    out.copy_from_slice(bytes.as_slice());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_sides_derive_the_same_shared_secret() {
        let (alice_secret, alice_keys) = generate_handshake_keys([1u8; 16]);
        let (bob_secret, bob_keys) = generate_handshake_keys([1u8; 16]);

        let alice_shared = derive_shared_secret(&alice_secret, &bob_keys.public).unwrap();
        let bob_shared = derive_shared_secret(&bob_secret, &alice_keys.public).unwrap();

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn malformed_peer_key_is_rejected() {
        let (secret, _keys) = generate_handshake_keys([2u8; 16]);
        let result = derive_shared_secret(&secret, &[0u8; 3]);
        assert!(result.is_err());
    }
}
