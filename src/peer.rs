//! Remote peer (tunnel endpoint)
//!
//! A `RemotePeer` owns one keyed connection. Its `forward` loop runs two
//! directions until the link dies:
//!   - inbound: read frame, decrypt, deliver to the packet device
//!   - outbound: take packets queued by the router, encrypt, write frame
//!
//! Either direction failing, or `close()`, tears down the whole peer and
//! removes it from the peer table.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

use crate::crypto::aead::KEY_LEN;
use crate::device::PacketDevice;
use crate::error::{MeshError, TunnelError};
use crate::net::BoxConnection;
use crate::protocol::handshake::Role;
use crate::protocol::session::Session;
use crate::protocol::transport::{self, TransportReceiver, TransportSender, TransportState};
use crate::table::PeerTable;

/// Packets queued for one peer before new ones are dropped
pub const OUTBOUND_QUEUE_LEN: usize = 256;

/// Per-peer traffic counters
#[derive(Debug, Default)]
pub struct TrafficStats {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    rx_packets: AtomicU64,
}

impl TrafficStats {
    pub fn add_sent(&self, bytes: u64) {
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn tx_packets(&self) -> u64 {
        self.tx_packets.load(Ordering::Relaxed)
    }

    pub fn rx_packets(&self) -> u64 {
        self.rx_packets.load(Ordering::Relaxed)
    }
}

/// Everything `forward` consumes; held by the peer until forwarding starts
struct PeerLink {
    conn: BoxConnection,
    transport: TransportState,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
}

/// One live, keyed tunnel to another node
pub struct RemotePeer {
    private_ip: Ipv4Addr,
    remote_addr: Option<SocketAddr>,
    role: Role,
    key_fingerprint: String,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    link: Mutex<Option<PeerLink>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    stats: TrafficStats,
    established_at: Instant,
}

impl RemotePeer {
    /// Build a peer from a connection that just completed the handshake
    pub fn new(conn: BoxConnection, session: Session, network_key: &[u8; KEY_LEN]) -> Arc<Self> {
        let remote_addr = conn.remote_addr();
        let private_ip = session.peer_ip;
        let role = session.role;
        let (keys, transport) = session.into_transport(network_key);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            private_ip,
            remote_addr,
            role,
            key_fingerprint: keys.fingerprint(),
            outbound_tx,
            link: Mutex::new(Some(PeerLink {
                conn,
                transport,
                outbound_rx,
            })),
            closed: AtomicBool::new(false),
            shutdown,
            stats: TrafficStats::default(),
            established_at: Instant::now(),
        })
    }

    /// Private IP this peer owns; its key in the peer table
    pub fn private_ip(&self) -> Ipv4Addr {
        self.private_ip
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn key_fingerprint(&self) -> &str {
        &self.key_fingerprint
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue an IP packet for this peer without waiting.
    ///
    /// A full queue drops the packet; only a closed peer is an error.
    pub fn send(&self, packet: Vec<u8>) -> Result<(), MeshError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        match self.outbound_tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("Outbound queue to {} full, dropping packet", self.private_ip);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.closed_error()),
        }
    }

    /// Close the tunnel. Idempotent.
    ///
    /// Returns true if this call performed the close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Dropping an unstarted link closes the connection right here
        drop(self.take_link());
        self.shutdown.send_replace(true);
        tracing::debug!("Closed tunnel to {}", self.private_ip);
        true
    }

    /// Run the tunnel until it fails or is closed, then deregister.
    pub async fn forward(self: Arc<Self>, table: PeerTable, device: Arc<dyn PacketDevice>) {
        if let Some(link) = self.take_link() {
            let mut shutdown = self.shutdown.subscribe();
            // close() may have raced with take_link; the flag is authoritative
            if !self.is_closed() {
                tracing::info!(
                    "Forwarding to {} as {:?} ({:?}, key {})",
                    self.private_ip,
                    self.role,
                    self.remote_addr,
                    self.key_fingerprint
                );
                match self.pump(link, &mut shutdown, device.as_ref()).await {
                    Ok(()) => tracing::info!("Tunnel to {} closed", self.private_ip),
                    Err(e) => tracing::warn!("Tunnel to {} failed: {}", self.private_ip, e),
                }
            }
        }

        self.close();
        if table.remove_peer(&self) {
            tracing::info!(
                "Removed peer {} after {:?} (tx {} B, rx {} B)",
                self.private_ip,
                self.age(),
                self.stats.tx_bytes(),
                self.stats.rx_bytes()
            );
        }
    }

    async fn pump(
        &self,
        link: PeerLink,
        shutdown: &mut watch::Receiver<bool>,
        device: &dyn PacketDevice,
    ) -> Result<(), MeshError> {
        let PeerLink {
            conn,
            transport,
            mut outbound_rx,
        } = link;
        let (sender, receiver) = transport.split();
        let (mut reader, mut writer) = tokio::io::split(conn);

        let result = {
            let inbound = self.pump_inbound(&mut reader, receiver, device);
            let outbound = self.pump_outbound(&mut writer, sender, &mut outbound_rx);

            tokio::select! {
                result = inbound => result,
                result = outbound => result,
                _ = shutdown.changed() => Ok(()),
            }
        };

        let _ = writer.shutdown().await;
        result
    }

    /// Connection -> device
    async fn pump_inbound(
        &self,
        reader: &mut ReadHalf<BoxConnection>,
        mut receiver: TransportReceiver,
        device: &dyn PacketDevice,
    ) -> Result<(), MeshError> {
        while let Some(frame) = transport::read_frame(reader).await? {
            // Integrity failures end the tunnel here
            let packet = receiver.decrypt(&frame)?;
            self.stats.add_received(packet.len() as u64);

            if packet.is_empty() {
                continue;
            }
            // A device that cannot take packets ends the tunnel too
            device.write_packet(&packet).await?;
        }
        Ok(())
    }

    /// Router queue -> connection
    async fn pump_outbound(
        &self,
        writer: &mut WriteHalf<BoxConnection>,
        mut sender: TransportSender,
        outbound_rx: &mut mpsc::Receiver<Vec<u8>>,
    ) -> Result<(), MeshError> {
        while let Some(packet) = outbound_rx.recv().await {
            let frame = sender.encrypt(&packet)?;
            transport::write_frame(writer, &frame).await?;
            self.stats.add_sent(packet.len() as u64);
        }
        Ok(())
    }

    fn take_link(&self) -> Option<PeerLink> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn closed_error(&self) -> MeshError {
        TunnelError::TunnelClosed {
            ip: self.private_ip,
        }
        .into()
    }
}

impl std::fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeer")
            .field("private_ip", &self.private_ip)
            .field("remote_addr", &self.remote_addr)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    use crate::device::MemoryDevice;
    use crate::protocol::transport::{encrypt_frame, read_frame};

    const NETWORK_KEY: [u8; 32] = [0x11; 32];
    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    /// Peer at B as seen from A (A initiated), plus the raw far end
    fn peer_with_raw_end(session_key: &[u8]) -> (Arc<RemotePeer>, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let session = Session::new(Role::Initiator, session_key.to_vec(), B);
        (RemotePeer::new(Box::new(local), session, &NETWORK_KEY), remote)
    }

    /// Transport state of the far (responder) end for the same session
    fn far_end(session_key: &[u8]) -> TransportState {
        Session::new(Role::Responder, session_key.to_vec(), A)
            .into_transport(&NETWORK_KEY)
            .1
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (peer, mut remote) = peer_with_raw_end(&[1; 32]);

        assert!(peer.close());
        assert!(!peer.close());
        assert!(peer.is_closed());

        // Unstarted link was dropped: the far end sees EOF
        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        assert!(matches!(
            peer.send(vec![1, 2, 3]),
            Err(MeshError::Tunnel(TunnelError::TunnelClosed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_forward_both_directions() {
        let key = [2u8; 32];
        let (peer, mut remote) = peer_with_raw_end(&key);
        let (mut far_sender, mut far_receiver) = far_end(&key).split();

        let table = PeerTable::new();
        table.add(peer.clone());
        let (device, _inject, mut delivered) = MemoryDevice::new(8);
        let task = tokio::spawn(peer.clone().forward(table.clone(), Arc::new(device)));

        // Outbound: router hands a packet to the peer, far end decrypts it
        peer.send(b"to B".to_vec()).unwrap();
        let frame = read_frame(&mut remote).await.unwrap().unwrap();
        assert_eq!(far_receiver.decrypt(&frame).unwrap(), b"to B");

        // Inbound: far end sends a frame, device receives the packet
        let frame = far_sender.encrypt(b"from B").unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut remote, &frame).await.unwrap();
        let packet = timeout(Duration::from_secs(2), delivered.recv()).await.unwrap().unwrap();
        assert_eq!(packet, b"from B");

        assert_eq!(peer.stats().tx_packets(), 1);
        assert_eq!(peer.stats().rx_packets(), 1);

        peer.close();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(table.lookup(B).is_none());
    }

    #[tokio::test]
    async fn test_tampered_frame_tears_down_peer() {
        let key = [3u8; 32];
        let (peer, mut remote) = peer_with_raw_end(&key);
        let (mut far_sender, _) = far_end(&key).split();

        let table = PeerTable::new();
        table.add(peer.clone());
        let (device, _inject, mut delivered) = MemoryDevice::new(8);
        let task = tokio::spawn(peer.clone().forward(table.clone(), Arc::new(device)));

        let mut frame = far_sender.encrypt(b"tampered in transit").unwrap();
        frame[12] ^= 0x01;
        tokio::io::AsyncWriteExt::write_all(&mut remote, &frame).await.unwrap();

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(peer.is_closed());
        assert!(table.lookup(B).is_none());
        assert!(delivered.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_close_tears_down_peer() {
        let (peer, remote) = peer_with_raw_end(&[4; 32]);
        let table = PeerTable::new();
        table.add(peer.clone());
        let (device, _inject, _delivered) = MemoryDevice::new(8);
        let task = tokio::spawn(peer.clone().forward(table.clone(), Arc::new(device)));

        drop(remote);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(peer.is_closed());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key_frame_is_fatal() {
        let (peer, mut remote) = peer_with_raw_end(&[5; 32]);
        let table = PeerTable::new();
        table.add(peer.clone());
        let (device, _inject, _delivered) = MemoryDevice::new(8);
        let task = tokio::spawn(peer.clone().forward(table.clone(), Arc::new(device)));

        let frame = encrypt_frame(&[0u8; 32], 0, b"forged").unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut remote, &frame).await.unwrap();

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(table.lookup(B).is_none());
    }

    #[tokio::test]
    async fn test_device_failure_tears_down_peer() {
        let key = [7u8; 32];
        let (peer, mut remote) = peer_with_raw_end(&key);
        let (mut far_sender, _) = far_end(&key).split();

        let table = PeerTable::new();
        table.add(peer.clone());
        let (device, _inject, delivered) = MemoryDevice::new(8);
        drop(delivered);
        let task = tokio::spawn(peer.clone().forward(table.clone(), Arc::new(device)));

        let frame = far_sender.encrypt(b"nowhere to go").unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut remote, &frame).await.unwrap();

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(peer.is_closed());
        assert!(table.lookup(B).is_none());
    }

    #[tokio::test]
    async fn test_forward_after_close_returns() {
        let (peer, _remote) = peer_with_raw_end(&[6; 32]);
        peer.close();
        let (device, _inject, _delivered) = MemoryDevice::new(1);
        timeout(
            Duration::from_secs(2),
            peer.clone().forward(PeerTable::new(), Arc::new(device)),
        )
        .await
        .unwrap();
    }
}
