//! Configuration parsing for meshlink
//!
//! Node settings and seed peers come from a WireGuard-style `.conf` file.

mod parser;

pub use parser::{
    InterfaceConfig, MeshConfig, PeerConfig, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MTU,
};
