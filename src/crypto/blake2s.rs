//! BLAKE2s hashing and HMAC-based key derivation

use blake2::{
    digest::{FixedOutput, Update},
    Blake2s256, Digest,
};
use hmac::{Mac, SimpleHmac};

/// HMAC-BLAKE2s (RFC 2104 HMAC with BLAKE2s-256)
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// BLAKE2s-256 hash of two concatenated inputs: HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// HMAC-BLAKE2s
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = <HmacBlake2s as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// KDF2: Two-output key derivation
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let temp = hmac(key, input);

    // T1 = HMAC(temp, 0x01)
    let t1 = hmac(&temp, &[0x01]);

    // T2 = HMAC(temp, T1 || 0x02)
    let mut t2_input = [0u8; HASH_LEN + 1];
    t2_input[..HASH_LEN].copy_from_slice(&t1);
    t2_input[HASH_LEN] = 0x02;
    let t2 = hmac(&temp, &t2_input);

    (t1, t2)
}
