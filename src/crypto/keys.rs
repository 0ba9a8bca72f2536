//! Session key material
//!
//! The initiator generates fresh random session key bytes for every
//! handshake. Both sides mix them with the network key shared by all
//! nodes of the overlay to obtain one ChaCha20-Poly1305 key per direction.

use rand::RngCore;

use crate::crypto::aead::KEY_LEN;
use crate::crypto::blake2s;

/// Length of the session key generated by initiators
pub const SESSION_KEY_LEN: usize = 32;

/// Label mixed into the network key before derivation
const LABEL: &[u8] = b"meshlink tunnel v1";

/// Generate fresh session key bytes
pub fn generate_session_key() -> Vec<u8> {
    let mut key = vec![0u8; SESSION_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Directional tunnel keys derived from one session
#[derive(Clone)]
pub struct TunnelKeys {
    /// Key for frames sent by the initiator
    pub initiator_to_responder: [u8; KEY_LEN],
    /// Key for frames sent by the responder
    pub responder_to_initiator: [u8; KEY_LEN],
}

impl TunnelKeys {
    /// (k_i2r, k_r2i) = KDF2(HASH(LABEL || network_key), session_key)
    pub fn derive(network_key: &[u8; KEY_LEN], session_key: &[u8]) -> Self {
        let chaining_key = blake2s::hash_two(LABEL, network_key);
        let (initiator_to_responder, responder_to_initiator) =
            blake2s::kdf2(&chaining_key, session_key);
        Self {
            initiator_to_responder,
            responder_to_initiator,
        }
    }

    /// Short fingerprint for logs, never the key itself
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake2s::hash(&self.initiator_to_responder)[..4])
    }
}

impl std::fmt::Debug for TunnelKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelKeys")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
