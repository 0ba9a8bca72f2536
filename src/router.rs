//! Outbound packet routing
//!
//! Reads packets the local stack sends into the overlay and queues each
//! one on the peer owning its destination address.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio::sync::watch;

use crate::device::PacketDevice;
use crate::error::{MeshError, ProtocolError};
use crate::table::PeerTable;

/// Minimum IPv4 header size
const IPV4_HEADER_LEN: usize = 20;

/// Largest packet read from the device
const READ_BUFFER_LEN: usize = u16::MAX as usize;

pub struct Router {
    table: PeerTable,
    device: Arc<dyn PacketDevice>,
    /// Directed broadcast address of the overlay network
    broadcast: Ipv4Addr,
    stop: watch::Sender<bool>,
}

impl Router {
    pub fn new(table: PeerTable, device: Arc<dyn PacketDevice>, network: Ipv4Net) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            table,
            device,
            broadcast: network.broadcast(),
            stop,
        }
    }

    /// Route packets until `stop()` or a device failure
    pub async fn run(&self) -> Result<(), MeshError> {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return Ok(());
        }
        let mut buf = vec![0u8; READ_BUFFER_LEN];

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                result = self.device.read_packet(&mut buf) => {
                    let len = result?;
                    self.route(&buf[..len]);
                }
            }
        }

        tracing::debug!("Router stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Queue one packet for its destination peer(s).
    ///
    /// Returns how many peers accepted it.
    pub fn route(&self, packet: &[u8]) -> usize {
        let dest = match parse_ipv4_dest(packet) {
            Ok(dest) => dest,
            Err(e) => {
                tracing::trace!("Dropping unroutable packet: {}", e);
                return 0;
            }
        };

        if dest == self.broadcast || dest == Ipv4Addr::BROADCAST {
            let mut sent = 0;
            self.table.for_each(|peer| {
                if peer.send(packet.to_vec()).is_ok() {
                    sent += 1;
                }
            });
            return sent;
        }

        let Some(peer) = self.table.lookup(dest) else {
            tracing::trace!("No peer for {}, dropping packet", dest);
            return 0;
        };

        match peer.send(packet.to_vec()) {
            Ok(()) => 1,
            Err(e) => {
                tracing::trace!("Dropping packet for {}: {}", dest, e);
                0
            }
        }
    }
}

/// Parse destination IPv4 address from an IP packet
fn parse_ipv4_dest(packet: &[u8]) -> Result<Ipv4Addr, MeshError> {
    if packet.len() < IPV4_HEADER_LEN {
        return Err(ProtocolError::InvalidMessageLength {
            expected: IPV4_HEADER_LEN,
            got: packet.len(),
        }
        .into());
    }

    let version = packet[0] >> 4;
    if version != 4 {
        return Err(ProtocolError::malformed(format!("IP version {}", version)).into());
    }

    // IPv4 destination is bytes 16-19
    Ok(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}
