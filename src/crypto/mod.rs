//! Cryptographic primitives for meshlink tunnels
//!
//! - BLAKE2s hashing, HMAC, and key derivation (blake2s)
//! - ChaCha20-Poly1305 AEAD encryption (aead)
//! - Session key generation and tunnel key derivation (keys)

pub mod aead;
pub mod blake2s;
pub mod keys;
