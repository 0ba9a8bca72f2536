//! Negotiated handshake outcome
//!
//! A `Session` only lives between the end of the handshake and the
//! construction of the `RemotePeer` that consumes it.

use std::net::Ipv4Addr;

use crate::crypto::aead::KEY_LEN;
use crate::crypto::keys::TunnelKeys;
use crate::protocol::handshake::Role;
use crate::protocol::transport::TransportState;

/// Result of a successful handshake
pub struct Session {
    /// Our side of the exchange
    pub role: Role,
    /// Private IP advertised by the remote node
    pub peer_ip: Ipv4Addr,
    /// Session key entropy chosen by the initiator
    session_key: Vec<u8>,
}

impl Session {
    pub fn new(role: Role, session_key: Vec<u8>, peer_ip: Ipv4Addr) -> Self {
        Self {
            role,
            peer_ip,
            session_key,
        }
    }

    pub fn session_key(&self) -> &[u8] {
        &self.session_key
    }

    /// Derive directional keys and build the transport state for our role
    pub fn into_transport(self, network_key: &[u8; KEY_LEN]) -> (TunnelKeys, TransportState) {
        let keys = TunnelKeys::derive(network_key, &self.session_key);
        let transport = TransportState::new(&keys, self.role);
        (keys, transport)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("peer_ip", &self.peer_ip)
            .field("session_key_len", &self.session_key.len())
            .finish()
    }
}
