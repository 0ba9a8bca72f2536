//! Session handshake
//!
//! One algorithm for both ends of a connection, ordered by [`Role`]:
//!
//! ```text
//! Initiator                         Responder
//!   Handshake(magic, key)  ------>    AwaitHandshake, ValidateMagic
//!                          <------    Ok
//!                          <------    PeerInfo(responder ip)
//!   PeerInfo(initiator ip) ------>    AwaitPeerInfo
//! ```
//!
//! A responder that sees a bad magic returns [`ProtocolError::InvalidMagic`]
//! without writing anything. There is no timeout here; callers put a
//! deadline around the whole exchange.

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::crypto::keys::generate_session_key;
use crate::error::{MeshError, ProtocolError};
use crate::protocol::messages::{self, HandshakeMessage};
use crate::protocol::session::Session;

/// Which side of the handshake we play
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialer: sends the Handshake first
    Initiator,
    /// Listener: validates the Handshake and answers
    Responder,
}

/// Run the handshake on `conn`, advertising `local_ip` as our private IP.
pub async fn handshake<C>(conn: &mut C, role: Role, local_ip: Ipv4Addr) -> Result<Session, MeshError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let session = match role {
        Role::Initiator => initiate(conn, local_ip).await?,
        Role::Responder => respond(conn, local_ip).await?,
    };

    if session.peer_ip == local_ip {
        return Err(ProtocolError::SelfConnection { ip: local_ip }.into());
    }

    Ok(session)
}

async fn initiate<C>(conn: &mut C, local_ip: Ipv4Addr) -> Result<Session, MeshError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let session_key = generate_session_key();
    messages::write_handshake(conn, &HandshakeMessage::new(session_key.clone())).await?;
    tracing::debug!("Handshake sent, waiting for Ok");

    messages::read_ok(conn).await?;
    let peer_info = messages::read_peer_info(conn).await?;
    tracing::debug!("Responder is {}", peer_info.private_ip);

    messages::write_peer_info(conn, local_ip).await?;

    Ok(Session::new(Role::Initiator, session_key, peer_info.private_ip))
}

async fn respond<C>(conn: &mut C, local_ip: Ipv4Addr) -> Result<Session, MeshError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let handshake_msg = messages::read_handshake(conn).await?;
    tracing::debug!("Processing handshake...");

    if !messages::is_magic_valid(&handshake_msg.to_bytes()) {
        return Err(ProtocolError::InvalidMagic.into());
    }

    tracing::debug!("Magic bytes are correct, sending Ok and PeerInfo");
    messages::write_ok(conn).await?;
    messages::write_peer_info(conn, local_ip).await?;

    let peer_info = messages::read_peer_info(conn).await?;
    tracing::debug!("Initiator is {}", peer_info.private_ip);

    Ok(Session::new(
        Role::Responder,
        handshake_msg.into_session_key(),
        peer_info.private_ip,
    ))
}
