//! Inbound connection acceptor
//!
//! Accepts connections on the node's listening socket and hands each one
//! to its own task: responder handshake under the node's deadline,
//! registration in the peer table, then forwarding.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::device::PacketDevice;
use crate::error::{MeshError, ProtocolError, TunnelError};
use crate::net::{Acceptor, BoxConnection};
use crate::node::LocalNode;
use crate::protocol::handshake::Role;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct ListenerService {
    local: Arc<LocalNode>,
    acceptor: Mutex<Option<Box<dyn Acceptor>>>,
    local_addr: Option<SocketAddr>,
    device: Arc<dyn PacketDevice>,
    stop: watch::Sender<bool>,
}

impl ListenerService {
    pub fn new(
        local: Arc<LocalNode>,
        acceptor: Box<dyn Acceptor>,
        device: Arc<dyn PacketDevice>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            local,
            local_addr: acceptor.local_addr(),
            acceptor: Mutex::new(Some(acceptor)),
            device,
            stop,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Accept until `stop()`; the listening socket is closed on return.
    pub async fn run(&self) -> Result<(), MeshError> {
        let mut stop = self.stop.subscribe();
        let Some(acceptor) = self.take_acceptor() else {
            return Ok(());
        };
        if *stop.borrow() {
            return Ok(());
        }

        tracing::info!("Listening on {:?}", self.local_addr);

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                result = acceptor.accept() => match result {
                    Ok(conn) => self.spawn_session(conn),
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }

        drop(acceptor);
        tracing::info!("Listener on {:?} stopped", self.local_addr);
        Ok(())
    }

    /// Signal the accept loop to exit
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    fn spawn_session(&self, conn: BoxConnection) {
        let local = self.local.clone();
        let device = self.device.clone();
        let remote = conn.remote_addr();
        tracing::debug!("Accepted connection from {:?}", remote);

        tokio::spawn(async move {
            match local.open_tunnel(conn, Role::Responder, device).await {
                Ok(_) => {}
                // Not one of ours: drop without a word
                Err(MeshError::Protocol(ProtocolError::InvalidMagic)) => {
                    tracing::debug!("Dropped connection from {:?}: bad magic", remote);
                }
                Err(MeshError::Tunnel(TunnelError::ShuttingDown)) => {
                    tracing::debug!("Dropped connection from {:?}: node shutting down", remote);
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("Handshake with {:?} failed: {}", remote, e);
                }
                Err(e) => {
                    tracing::error!("Could not set up tunnel for {:?}: {}", remote, e);
                }
            }
        });
    }

    fn take_acceptor(&self) -> Option<Box<dyn Acceptor>> {
        self.acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use ipnet::Ipv4Net;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use crate::device::MemoryDevice;
    use crate::net::{TcpTransport, Transport};
    use crate::protocol::handshake::handshake;

    const LISTENER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    async fn start(handshake_timeout: Duration) -> (Arc<ListenerService>, Arc<LocalNode>, SocketAddr) {
        let local = Arc::new(LocalNode::new(
            Ipv4Net::new(LISTENER_IP, 24).unwrap(),
            0,
            [0x5a; 32],
            handshake_timeout,
        ));
        let acceptor = TcpTransport.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (device, _inject, _delivered) = MemoryDevice::new(4);
        let listener = Arc::new(ListenerService::new(local.clone(), acceptor, Arc::new(device)));
        let addr = listener.local_addr().unwrap();

        let service = listener.clone();
        tokio::spawn(async move { service.run().await });
        (listener, local, addr)
    }

    async fn wait_for_peer(local: &LocalNode, ip: Ipv4Addr) {
        timeout(Duration::from_secs(2), async {
            while local.table().lookup(ip).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_accepts_and_registers_peer() {
        let (listener, local, addr) = start(Duration::from_secs(2)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let session = handshake(&mut stream, Role::Initiator, Ipv4Addr::new(10, 0, 0, 7))
            .await
            .unwrap();
        assert_eq!(session.peer_ip, LISTENER_IP);

        wait_for_peer(&local, Ipv4Addr::new(10, 0, 0, 7)).await;
        listener.stop();
    }

    #[tokio::test]
    async fn test_bad_magic_gets_no_reply() {
        let (listener, local, addr) = start(Duration::from_secs(2)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut bogus = b"XXXX".to_vec();
        bogus.extend_from_slice(&[1, 1, 0, 32]);
        bogus.extend_from_slice(&[0u8; 32]);
        stream.write_all(&bogus).await.unwrap();

        let mut reply = Vec::new();
        timeout(Duration::from_secs(2), stream.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_empty());
        assert!(local.table().is_empty());
        listener.stop();
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let (listener, local, addr) = start(Duration::from_millis(100)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut reply = Vec::new();
        timeout(Duration::from_secs(2), stream.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_empty());
        assert!(local.table().is_empty());
        listener.stop();
    }

    #[tokio::test]
    async fn test_stop_closes_socket() {
        let (listener, _local, addr) = start(Duration::from_secs(2)).await;
        listener.stop();

        timeout(Duration::from_secs(2), async {
            while TcpStream::connect(addr).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
