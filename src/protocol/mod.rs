//! meshlink session protocol
//!
//! - Handshake message wire formats (messages)
//! - Role-ordered handshake state machine (handshake)
//! - Negotiated session (session)
//! - Encrypted tunnel frames (transport)

pub mod handshake;
pub mod messages;
pub mod session;
pub mod transport;

pub use handshake::{handshake, Role};
pub use messages::{is_magic_valid, HandshakeMessage, MessageType, PeerInfo};
pub use session::Session;
pub use transport::{TransportReceiver, TransportSender, TransportState, MAX_PACKET_SIZE};
