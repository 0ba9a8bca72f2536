//! Local node
//!
//! [`LocalNode`] holds the node's identity and the shared peer table and
//! turns raw connections into registered peers. [`Node`] wires the
//! listener, router and seed dials together for one running process.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::task::JoinHandle;

use crate::config::InterfaceConfig;
use crate::connector;
use crate::crypto::aead::KEY_LEN;
use crate::device::PacketDevice;
use crate::error::{MeshError, ProtocolError, TunnelError};
use crate::listener::ListenerService;
use crate::net::{BoxConnection, Transport};
use crate::peer::RemotePeer;
use crate::protocol::handshake::{handshake, Role};
use crate::router::Router;
use crate::table::PeerTable;

/// This node's identity on the overlay network
pub struct LocalNode {
    private_ip: Ipv4Addr,
    network: Ipv4Net,
    listen_port: u16,
    network_key: [u8; KEY_LEN],
    handshake_timeout: Duration,
    table: PeerTable,
    /// Set once shutdown starts; no peer may be registered afterwards
    closing: AtomicBool,
}

impl LocalNode {
    /// `address` is our private IP together with the overlay prefix
    pub fn new(
        address: Ipv4Net,
        listen_port: u16,
        network_key: [u8; KEY_LEN],
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            private_ip: address.addr(),
            network: address.trunc(),
            listen_port,
            network_key,
            handshake_timeout,
            table: PeerTable::new(),
            closing: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &InterfaceConfig) -> Self {
        Self::new(
            config.address,
            config.listen_port,
            config.network_key,
            config.handshake_timeout(),
        )
    }

    pub fn private_ip(&self) -> Ipv4Addr {
        self.private_ip
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn table(&self) -> &PeerTable {
        &self.table
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Stop registering peers and close every registered one.
    ///
    /// Handshakes still in flight fail once they complete.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.table.close_all();
    }

    /// Handshake on `conn` and register the resulting peer.
    ///
    /// The whole handshake runs under the node's deadline. On any failure
    /// the connection is dropped and nothing is registered.
    pub async fn establish(
        &self,
        mut conn: BoxConnection,
        role: Role,
    ) -> Result<Arc<RemotePeer>, MeshError> {
        if self.is_closing() {
            return Err(TunnelError::ShuttingDown.into());
        }

        let session = tokio::time::timeout(
            self.handshake_timeout,
            handshake(&mut conn, role, self.private_ip),
        )
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout {
            seconds: self.handshake_timeout.as_secs(),
        })??;

        if !self.network.contains(&session.peer_ip) {
            tracing::warn!(
                "Peer {} is outside the overlay network {}",
                session.peer_ip,
                self.network
            );
        }

        let peer = RemotePeer::new(conn, session, &self.network_key);
        self.table.add(peer.clone());

        // close() sets the flag before draining the table, so a peer added
        // after the drain always sees it here
        if self.is_closing() {
            peer.close();
            self.table.remove_peer(&peer);
            return Err(TunnelError::ShuttingDown.into());
        }

        tracing::info!(
            "Peer {} connected ({:?}, {:?})",
            peer.private_ip(),
            role,
            peer.remote_addr()
        );
        Ok(peer)
    }

    /// Establish a peer and spawn its forwarding task
    pub async fn open_tunnel(
        &self,
        conn: BoxConnection,
        role: Role,
        device: Arc<dyn PacketDevice>,
    ) -> Result<Arc<RemotePeer>, MeshError> {
        let peer = self.establish(conn, role).await?;
        tokio::spawn(peer.clone().forward(self.table.clone(), device));
        Ok(peer)
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("private_ip", &self.private_ip)
            .field("network", &self.network)
            .field("listen_port", &self.listen_port)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("peers", &self.table.len())
            .finish()
    }
}

/// A node ready to be started
pub struct Node {
    local: Arc<LocalNode>,
    transport: Arc<dyn Transport>,
    device: Arc<dyn PacketDevice>,
}

/// Handle to a started node
pub struct RunningNode {
    local: Arc<LocalNode>,
    listener: Arc<ListenerService>,
    router: Arc<Router>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub fn new(
        local: LocalNode,
        transport: Arc<dyn Transport>,
        device: Arc<dyn PacketDevice>,
    ) -> Self {
        Self {
            local: Arc::new(local),
            transport,
            device,
        }
    }

    /// Bind the listener, start routing, and dial every seed once
    pub async fn start(
        self,
        bind_addr: SocketAddr,
        seeds: Vec<SocketAddr>,
    ) -> Result<RunningNode, MeshError> {
        let acceptor = self.transport.listen(bind_addr).await?;
        let listener = Arc::new(ListenerService::new(
            self.local.clone(),
            acceptor,
            self.device.clone(),
        ));
        let router = Arc::new(Router::new(
            self.local.table().clone(),
            self.device.clone(),
            self.local.network(),
        ));

        tracing::info!(
            "Node {} on {} listening on {:?}",
            self.local.private_ip(),
            self.local.network(),
            listener.local_addr()
        );

        let mut tasks = Vec::with_capacity(2 + seeds.len());

        let service = listener.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = service.run().await {
                tracing::error!("Listener failed: {}", e);
            }
        }));

        let service = router.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = service.run().await {
                tracing::error!("Router stopped: {}", e);
            }
        }));

        for seed in seeds {
            let local = self.local.clone();
            let transport = self.transport.clone();
            let device = self.device.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = connector::connect(&local, transport.as_ref(), seed, device).await {
                    tracing::warn!("Could not reach seed {}: {}", seed, e);
                }
            }));
        }

        Ok(RunningNode {
            local: self.local,
            listener,
            router,
            tasks,
        })
    }
}

impl RunningNode {
    pub fn local(&self) -> &Arc<LocalNode> {
        &self.local
    }

    pub fn table(&self) -> &PeerTable {
        self.local.table()
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Stop accepting and routing, then close every peer
    pub async fn shutdown(self) {
        tracing::info!("Shutting down node {}", self.local.private_ip());
        self.listener.stop();
        self.router.stop();
        self.local.close();

        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::debug!("Node task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    use crate::device::MemoryDevice;
    use crate::protocol::messages::{self, HandshakeMessage};

    fn node(ip: [u8; 4]) -> LocalNode {
        let address = Ipv4Net::new(Ipv4Addr::from(ip), 24).unwrap();
        LocalNode::new(address, 7000, [0x42; 32], Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_establish_registers_both_sides() {
        let a = node([10, 0, 0, 1]);
        let b = node([10, 0, 0, 2]);
        let (ca, cb) = duplex(4096);

        let (pa, pb) = tokio::join!(
            a.establish(Box::new(ca), Role::Initiator),
            b.establish(Box::new(cb), Role::Responder)
        );
        let (pa, pb) = (pa.unwrap(), pb.unwrap());

        assert_eq!(pa.private_ip(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(pb.private_ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(pa.key_fingerprint(), pb.key_fingerprint());
        assert!(a.table().lookup(Ipv4Addr::new(10, 0, 0, 2)).is_some());
        assert!(b.table().lookup(Ipv4Addr::new(10, 0, 0, 1)).is_some());
    }

    #[tokio::test]
    async fn test_establish_times_out() {
        let address = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 1), 24).unwrap();
        let a = LocalNode::new(address, 7000, [0; 32], Duration::from_millis(50));
        let (ca, _silent) = duplex(4096);

        let result = a.establish(Box::new(ca), Role::Responder).await;
        assert!(matches!(
            result,
            Err(MeshError::Protocol(ProtocolError::HandshakeTimeout { .. }))
        ));
        assert!(a.table().is_empty());
    }

    #[tokio::test]
    async fn test_self_connection_not_registered() {
        let a = node([10, 0, 0, 1]);
        let twin = node([10, 0, 0, 1]);
        let (ca, cb) = duplex(4096);

        let (ra, rb) = tokio::join!(
            a.establish(Box::new(ca), Role::Initiator),
            twin.establish(Box::new(cb), Role::Responder)
        );
        assert!(ra.is_err());
        assert!(rb.is_err());
        assert!(a.table().is_empty());
        assert!(twin.table().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_finishing_after_close_is_not_registered() {
        let b = Arc::new(node([10, 0, 0, 2]));
        let (mut far, cb) = duplex(4096);

        let responder = b.clone();
        let task = tokio::spawn(async move { responder.establish(Box::new(cb), Role::Responder).await });

        // Drive the initiator side by hand and stop just before the last message
        messages::write_handshake(&mut far, &HandshakeMessage::new(vec![1u8; 32]))
            .await
            .unwrap();
        messages::read_ok(&mut far).await.unwrap();
        messages::read_peer_info(&mut far).await.unwrap();

        b.close();
        messages::write_peer_info(&mut far, Ipv4Addr::new(10, 0, 0, 9))
            .await
            .unwrap();

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(MeshError::Tunnel(TunnelError::ShuttingDown))
        ));
        assert!(b.table().is_empty());

        let mut rest = Vec::new();
        far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_establish_refused_once_closed() {
        let a = node([10, 0, 0, 1]);
        a.close();
        let (ca, _cb) = duplex(64);
        assert!(matches!(
            a.establish(Box::new(ca), Role::Initiator).await,
            Err(MeshError::Tunnel(TunnelError::ShuttingDown))
        ));
    }

    #[tokio::test]
    async fn test_open_tunnel_forwards() {
        let a = node([10, 0, 0, 1]);
        let b = node([10, 0, 0, 2]);
        let (dev_a, _inject_a, _delivered_a) = MemoryDevice::new(4);
        let (dev_b, _inject_b, mut delivered_b) = MemoryDevice::new(4);
        let (ca, cb) = duplex(64 * 1024);

        let (pa, pb) = tokio::join!(
            a.open_tunnel(Box::new(ca), Role::Initiator, Arc::new(dev_a)),
            b.open_tunnel(Box::new(cb), Role::Responder, Arc::new(dev_b))
        );
        let pa = pa.unwrap();
        pb.unwrap();

        pa.send(b"over the tunnel".to_vec()).unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(2), delivered_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet, b"over the tunnel");
    }
}
