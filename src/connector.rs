//! Outbound connections
//!
//! Dials a known endpoint and runs the initiator side of the handshake.
//! One attempt per call; retry policy belongs to the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::device::PacketDevice;
use crate::error::{MeshError, NetworkError};
use crate::net::Transport;
use crate::node::LocalNode;
use crate::peer::RemotePeer;
use crate::protocol::handshake::Role;

/// Dial `addr`, handshake as initiator, register the peer and start
/// forwarding.
pub async fn connect(
    local: &LocalNode,
    transport: &dyn Transport,
    addr: SocketAddr,
    device: Arc<dyn PacketDevice>,
) -> Result<Arc<RemotePeer>, MeshError> {
    tracing::info!("Dialing {}", addr);

    let conn = tokio::time::timeout(local.handshake_timeout(), transport.dial(addr))
        .await
        .map_err(|_| NetworkError::DialFailed {
            endpoint: addr.to_string(),
            reason: "timed out".to_string(),
        })??;

    local.open_tunnel(conn, Role::Initiator, device).await
}
